pub mod controller;
pub mod doctor;
pub mod error;
pub mod publisher;
pub mod session;

use fox_link::Intent;
use serde::Deserialize;

pub use controller::{CalibrationOutcome, ScanController};
pub use error::ControlError;
pub use publisher::{ControllerState, DeviceState, StatusPublisher, StatusSnapshot};
pub use session::{Reading, ScanSession};

/// Which way the rover spins while calibrating and scanning. Angles are
/// reported in the direction of travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanDirection {
    Left,
    #[default]
    Right,
}

impl ScanDirection {
    pub fn intent(self) -> Intent {
        match self {
            ScanDirection::Left => Intent::Left,
            ScanDirection::Right => Intent::Right,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    #[serde(default)]
    pub direction: ScanDirection,

    /// Longest accepted calibration turn.
    #[serde(default = "default_max_calibration_s")]
    pub max_calibration_s: f64,

    /// Each recorded sample is the mean of the readings taken during its
    /// measurement window, at most this many.
    #[serde(default = "default_readings_per_tick")]
    pub readings_per_tick: usize,

    /// How long a manual move runs before the rover is stopped again.
    #[serde(default = "default_move_pulse_s")]
    pub move_pulse_s: f64,
}

fn default_max_calibration_s() -> f64 { 120.0 }
fn default_readings_per_tick() -> usize { 32 }
fn default_move_pulse_s() -> f64 { 1.0 }

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            direction: ScanDirection::default(),
            max_calibration_s: default_max_calibration_s(),
            readings_per_tick: default_readings_per_tick(),
            move_pulse_s: default_move_pulse_s(),
        }
    }
}
