use anyhow::Result;

use crate::RadioConfig;

pub fn check_radio(cfg: &RadioConfig) -> Result<()> {
    // R820T tuning range
    anyhow::ensure!(cfg.frequency_mhz >= 24.0 && cfg.frequency_mhz <= 1766.0, "radio.frequency_mhz outside 24..1766 MHz");
    anyhow::ensure!(
        (225_001..=300_000).contains(&cfg.sample_rate_hz) || (900_001..=3_200_000).contains(&cfg.sample_rate_hz),
        "radio.sample_rate_hz not supported by rtl-sdr: {}", cfg.sample_rate_hz
    );
    anyhow::ensure!(cfg.samples_per_reading >= 256, "radio.samples_per_reading too small; set >= 256");
    if let Some(g) = cfg.gain_db {
        anyhow::ensure!((0.0..=50.0).contains(&g), "radio.gain_db should be 0..50");
    }
    anyhow::ensure!(cfg.read_timeout_ms >= 100, "radio.read_timeout_ms too small");
    Ok(())
}

/// Is the capture tool on PATH (or an existing path)?
pub fn check_tool(bin: &str) -> Result<()> {
    let p = std::path::Path::new(bin);
    if p.components().count() > 1 {
        anyhow::ensure!(p.exists(), "radio.rtl_sdr_bin not found: {}", bin);
        return Ok(());
    }
    let path = std::env::var_os("PATH").unwrap_or_default();
    let found = std::env::split_paths(&path).any(|dir| dir.join(bin).is_file());
    anyhow::ensure!(found, "{} not on PATH (install rtl-sdr tools)", bin);
    Ok(())
}
