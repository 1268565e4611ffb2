use tokio::time::Instant;
use tracing::{info, warn};

use crate::rover::SerialRover;
use crate::{LinkConfig, SerialLink};

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub dev: String,
    pub baud: u32,
    pub answered: bool,
    pub elapsed_ms: u64,
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct AutodetectResult {
    pub chosen: Option<String>,
    pub probes: Vec<ProbeResult>,
}

pub fn default_candidate_devs() -> Vec<String> {
    vec![
        "/dev/ttyUSB0".into(),
        "/dev/ttyUSB1".into(),
        "/dev/ttyACM0".into(),
        "/dev/ttyACM1".into(),
        "/dev/rfcomm0".into(),
        "/dev/serial0".into(),
        "/dev/ttyS0".into(),
    ]
}

/// Probe each candidate with a stop frame; the first port whose firmware
/// echoes it back wins. Probing a port that drives a rover is harmless since
/// the only frame sent is a stop.
pub async fn autodetect_rover(candidate_devs: Vec<String>, cfg: &LinkConfig) -> AutodetectResult {
    let mut probes = Vec::new();

    for dev in candidate_devs {
        let start = Instant::now();
        let probe_cfg = LinkConfig {
            autodetect: false,
            serial_dev: Some(dev.clone()),
            require_echo: true,
            ..cfg.clone()
        };
        let mut rover = SerialRover::new(probe_cfg);

        let (answered, note) = match rover.connect().await {
            Ok(()) => (true, "echo".to_string()),
            Err(e) => {
                warn!("link autodetect: probe failed dev={} baud={} err={}", dev, cfg.baud, e);
                (false, e.to_string())
            }
        };
        rover.disconnect().await;

        probes.push(ProbeResult {
            dev: dev.clone(),
            baud: cfg.baud,
            answered,
            elapsed_ms: start.elapsed().as_millis() as u64,
            note,
        });

        if answered {
            info!("link autodetect: OK {} @ {}", dev, cfg.baud);
            return AutodetectResult { chosen: Some(dev), probes };
        }
    }

    AutodetectResult { chosen: None, probes }
}
