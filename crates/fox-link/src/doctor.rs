use anyhow::Result;

use crate::LinkConfig;

pub fn check_link(cfg: &LinkConfig) -> Result<()> {
    if !cfg.autodetect {
        anyhow::ensure!(
            cfg.serial_dev.as_ref().map(|s| !s.is_empty()).unwrap_or(false),
            "link.serial_dev missing (autodetect=false)"
        );
    }
    anyhow::ensure!(cfg.baud > 0, "link.baud invalid");
    anyhow::ensure!(cfg.ack_timeout_ms >= 50 && cfg.ack_timeout_ms <= 5000, "link.ack_timeout_ms should be 50..5000");
    anyhow::ensure!(cfg.settle_ms <= 10_000, "link.settle_ms longer than 10s");
    if !cfg.require_echo {
        anyhow::ensure!(cfg.frame_gap_ms >= 5, "link.frame_gap_ms too small without echo; firmware would merge frames");
    }
    Ok(())
}
