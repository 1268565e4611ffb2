use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::session::ScanSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    /// A manual move pulse is driving the rover.
    Moving,
    Calibrating,
    Scanning,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ControllerState::Uninitialized => "uninitialized",
            ControllerState::Initializing => "initializing",
            ControllerState::Ready => "ready",
            ControllerState::Moving => "moving",
            ControllerState::Calibrating => "calibrating",
            ControllerState::Scanning => "scanning",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceState {
    pub car_connected: bool,
    pub sdr_ready: bool,
}

/// What a status poll sees. Always published whole.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub state: ControllerState,
    pub devices: DeviceState,
    pub running: bool,
    pub session: ScanSession,
    pub current_db: Option<f64>,
    pub rotation_duration_s: f64,
}

impl StatusSnapshot {
    fn new(rotation_duration_s: f64) -> Self {
        Self {
            state: ControllerState::Uninitialized,
            devices: DeviceState::default(),
            running: false,
            session: ScanSession::default(),
            current_db: None,
            rotation_duration_s,
        }
    }
}

/// Latest-value channel between the controller and status readers.
///
/// Readers only ever clone the current snapshot; they never wait on the
/// controller or on a device.
#[derive(Clone)]
pub struct StatusPublisher {
    tx: Arc<watch::Sender<StatusSnapshot>>,
}

impl StatusPublisher {
    pub fn new(rotation_duration_s: f64) -> Self {
        let (tx, _) = watch::channel(StatusSnapshot::new(rotation_duration_s));
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn devices(&self) -> DeviceState {
        self.tx.borrow().devices
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        self.tx.send_modify(f);
    }
}
