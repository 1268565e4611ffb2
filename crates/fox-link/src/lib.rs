pub mod autodetect;
pub mod doctor;
pub mod mock;
pub mod protocol;
pub mod rover;
pub mod state;

use async_trait::async_trait;
use serde::Deserialize;

pub use protocol::{Frame, Intent};

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// If true, probe candidate serial ports and pick the first one whose
    /// firmware echoes a stop frame.
    #[serde(default)]
    pub autodetect: bool,

    /// When autodetect=false: fixed port, e.g. /dev/ttyUSB0 or /dev/rfcomm0
    pub serial_dev: Option<String>,

    /// The sketch runs its UART at 9600.
    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Autodetect candidates (paths).
    pub candidate_devs: Option<Vec<String>>,

    /// Wait after opening the port; most boards reset on DTR.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// How long to wait for the firmware to echo a frame back.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Require the echo for every frame. Some BLE bridges swallow it.
    #[serde(default = "default_true")]
    pub require_echo: bool,

    /// Minimum spacing between frames when echoes are not awaited, so the
    /// firmware does not read two frames as one buffer.
    #[serde(default = "default_frame_gap_ms")]
    pub frame_gap_ms: u64,
}

fn default_baud() -> u32 { 9600 }
fn default_settle_ms() -> u64 { 2000 }
fn default_ack_timeout_ms() -> u64 { 500 }
fn default_frame_gap_ms() -> u64 { 20 }
fn default_true() -> bool { true }

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            autodetect: false,
            serial_dev: None,
            baud: default_baud(),
            candidate_devs: None,
            settle_ms: default_settle_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            require_echo: true,
            frame_gap_ms: default_frame_gap_ms(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("rover not connected")]
    NotConnected,

    #[error("open {dev}: {reason}")]
    Open { dev: String, reason: String },

    #[error("no acknowledgment for {frame} within {timeout_ms}ms")]
    Timeout { frame: String, timeout_ms: u64 },

    #[error("malformed acknowledgment for {frame}: {got:?}")]
    Malformed { frame: String, got: String },

    #[error("rover closed the link")]
    Closed,

    #[error("link i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Command channel to the rover.
///
/// Implementations translate intents into frames and track link health. Any
/// failure leaves the link unhealthy until the next successful `connect`.
#[async_trait]
pub trait SerialLink: Send {
    async fn connect(&mut self) -> Result<(), LinkError>;

    async fn send(&mut self, intent: Intent, speed_pct: u8) -> Result<(), LinkError>;

    /// Speed-only frame: latches the speed without moving.
    async fn set_speed(&mut self, speed_pct: u8) -> Result<(), LinkError>;

    fn is_healthy(&self) -> bool;

    async fn disconnect(&mut self);
}
