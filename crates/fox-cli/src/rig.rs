use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use fox_link::mock::MockRover;
use fox_link::rover::SerialRover;
use fox_link::LinkConfig;
use fox_radio::rtl::RtlSdrSampler;
use fox_radio::sim::{BeaconConfig, BeaconSampler};
use fox_radio::RadioConfig;
use fox_scan::{ScanConfig, ScanController};
use fox_store::{CalibrationStore, TomlFileStore};

/// Bench mode: a simulated rover spinning in front of a simulated beacon.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub enable: bool,

    /// Real seconds the simulated rover needs for a full turn.
    #[serde(default = "default_full_turn_s")]
    pub full_turn_s: f64,

    #[serde(default)]
    pub beacon: BeaconConfig,
}

fn default_full_turn_s() -> f64 { 6.0 }

pub fn build_controller(
    link: &LinkConfig,
    radio: &RadioConfig,
    scan: &ScanConfig,
    store_path: &Path,
    sim: Option<&SimulationConfig>,
) -> ScanController {
    let store: Arc<dyn CalibrationStore> = Arc::new(TomlFileStore::new(store_path));

    match sim.filter(|s| s.enable) {
        Some(s) => {
            let rover = MockRover::new(s.full_turn_s);
            let heading = rover.clone();
            let sampler = BeaconSampler::new(s.beacon.clone(), Arc::new(move || heading.heading()));
            info!(
                "rig: simulated rover ({:.1}s per turn), beacon at {:.0} deg",
                s.full_turn_s, s.beacon.bearing_deg
            );
            ScanController::new(Box::new(rover), Box::new(sampler), store, scan.clone())
        }
        None => {
            info!(
                "rig: rover on {}, rtl_sdr at {:.3} MHz",
                link.serial_dev.as_deref().unwrap_or("autodetect"),
                radio.frequency_mhz
            );
            ScanController::new(
                Box::new(SerialRover::new(link.clone())),
                Box::new(RtlSdrSampler::new(radio.clone())),
                store,
                scan.clone(),
            )
        }
    }
}
