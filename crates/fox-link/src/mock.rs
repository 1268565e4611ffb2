//! Simulated rover for bench runs and tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;

use crate::protocol::{interpret, Action, Frame, Intent};
use crate::{LinkError, SerialLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    /// Firmware answers with a line that is not the echo.
    Garbled,
    /// Firmware never answers.
    Silent,
    /// Port disappears.
    Unplugged,
}

/// Records every frame and integrates a heading from turn time.
///
/// Clones share state, so a test (or the simulated radio) can keep a handle
/// while the controller owns the boxed link.
#[derive(Clone)]
pub struct MockRover {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    connected: bool,
    refuse_connect: bool,
    frames: Vec<(Instant, Frame)>,
    rejected: Vec<Frame>,
    faults: VecDeque<MockFault>,
    full_turn_s: f64,
    heading_deg: f64,
    // the sketch boots at 60
    speed: i32,
    motion: Option<(Intent, i32, Instant)>,
}

impl Inner {
    fn settle_heading(&mut self, now: Instant) {
        if let Some((intent, speed, since)) = self.motion {
            self.heading_deg = heading_after(self.heading_deg, intent, speed, since, now, self.full_turn_s);
            self.motion = Some((intent, speed, now));
        }
    }

    fn apply(&mut self, frame: Frame) -> Result<(), LinkError> {
        if !self.connected {
            self.rejected.push(frame);
            return Err(LinkError::NotConnected);
        }
        let text = frame.encode();
        if let Some(fault) = self.faults.pop_front() {
            self.connected = false;
            self.rejected.push(frame);
            return Err(match fault {
                MockFault::Garbled => LinkError::Malformed { frame: text, got: "%?\u{fffd}".into() },
                MockFault::Silent => LinkError::Timeout { frame: text, timeout_ms: 0 },
                MockFault::Unplugged => LinkError::Closed,
            });
        }

        let now = Instant::now();
        self.settle_heading(now);
        self.frames.push((now, frame));

        let got = interpret(&text);
        if let Some(speed) = got.speed {
            self.speed = speed;
        }
        match got.action {
            Action::SpeedOnly => {}
            Action::Turn(intent) | Action::Drive(intent) => self.motion = Some((intent, self.speed, now)),
            Action::Stop => self.motion = None,
        }
        Ok(())
    }
}

fn heading_after(start: f64, intent: Intent, speed: i32, since: Instant, now: Instant, full_turn_s: f64) -> f64 {
    if speed <= 0 || full_turn_s <= 0.0 {
        return start;
    }
    let turned = now.duration_since(since).as_secs_f64() / full_turn_s * 360.0;
    let h = match intent {
        Intent::Right => start + turned,
        Intent::Left => start - turned,
        _ => start,
    };
    h.rem_euclid(360.0)
}

impl MockRover {
    /// `full_turn_s`: seconds for one full turn at any non-zero speed.
    pub fn new(full_turn_s: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                connected: false,
                refuse_connect: false,
                frames: Vec::new(),
                rejected: Vec::new(),
                faults: VecDeque::new(),
                full_turn_s,
                heading_deg: 0.0,
                speed: 60,
                motion: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.lock().refuse_connect = refuse;
    }

    /// Fail the next frame with `fault`.
    pub fn inject(&self, fault: MockFault) {
        self.lock().faults.push_back(fault);
    }

    /// Drop the link between frames, as a pulled cable or a dead radio
    /// bridge would. The next frame fails.
    pub fn unplug(&self) {
        self.lock().connected = false;
    }

    /// Frames the rover never acknowledged.
    pub fn rejected(&self) -> Vec<Frame> {
        self.lock().rejected.clone()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.lock().frames.iter().map(|(_, f)| *f).collect()
    }

    pub fn timed_frames(&self) -> Vec<(Instant, Frame)> {
        self.lock().frames.clone()
    }

    pub fn last_frame(&self) -> Option<Frame> {
        self.lock().frames.last().map(|(_, f)| *f)
    }

    pub fn moving(&self) -> Option<Intent> {
        self.lock().motion.map(|(intent, _, _)| intent)
    }

    pub fn heading(&self) -> f64 {
        let mut inner = self.lock();
        inner.settle_heading(Instant::now());
        inner.heading_deg
    }
}

#[async_trait]
impl SerialLink for MockRover {
    async fn connect(&mut self) -> Result<(), LinkError> {
        let mut inner = self.lock();
        if inner.refuse_connect {
            return Err(LinkError::Open { dev: "mock".into(), reason: "refused".into() });
        }
        inner.connected = true;
        inner.apply(Frame::halt())
    }

    async fn send(&mut self, intent: Intent, speed_pct: u8) -> Result<(), LinkError> {
        self.lock().apply(Frame::motion(intent, speed_pct))
    }

    async fn set_speed(&mut self, speed_pct: u8) -> Result<(), LinkError> {
        self.lock().apply(Frame::speed(speed_pct))
    }

    fn is_healthy(&self) -> bool {
        self.lock().connected
    }

    async fn disconnect(&mut self) {
        let mut inner = self.lock();
        if inner.connected {
            let _ = inner.apply(Frame::halt());
        }
        inner.connected = false;
    }
}
