use anyhow::Result;
use fox_store::CalibrationProfile;

use crate::ScanConfig;

pub fn check_scan(cfg: &ScanConfig) -> Result<()> {
    anyhow::ensure!(
        cfg.max_calibration_s.is_finite() && cfg.max_calibration_s >= 1.0 && cfg.max_calibration_s <= 3600.0,
        "scan.max_calibration_s should be 1..3600"
    );
    anyhow::ensure!(
        (1..=10_000).contains(&cfg.readings_per_tick),
        "scan.readings_per_tick should be 1..10000"
    );
    anyhow::ensure!(
        cfg.move_pulse_s.is_finite() && cfg.move_pulse_s > 0.0 && cfg.move_pulse_s <= 10.0,
        "scan.move_pulse_s should be in (0, 10]"
    );
    Ok(())
}

/// Sanity of the profile a scan would start with.
pub fn check_profile(p: &CalibrationProfile) -> Result<()> {
    p.validate()?;
    anyhow::ensure!(
        p.measurement_time_s <= p.rotation_duration_s,
        "measurement_time_s ({}) longer than rotation_duration_s ({}); a scan would take one reading",
        p.measurement_time_s,
        p.rotation_duration_s
    );
    anyhow::ensure!(p.speed_pct > 0, "speed is 0; the rover would not turn");
    Ok(())
}
