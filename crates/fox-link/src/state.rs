use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct LinkStatus {
    pub connected: bool,
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub last_ack: Option<Instant>,
    pub last_frame: Option<String>,
    pub faults: u32,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            connected: false,
            port: None,
            baud: None,
            last_ack: None,
            last_frame: None,
            faults: 0,
        }
    }
}

impl LinkStatus {
    pub fn ack_age(&self) -> Option<Duration> {
        self.last_ack.map(|t| t.elapsed())
    }

    pub(crate) fn on_ack(&mut self, frame: &str) {
        self.connected = true;
        self.last_ack = Some(Instant::now());
        self.last_frame = Some(frame.to_string());
    }

    pub(crate) fn on_fault(&mut self) {
        self.connected = false;
        self.faults = self.faults.saturating_add(1);
    }
}
