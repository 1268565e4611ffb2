//! Scan orchestration.
//!
//! The controller owns the rover link and the radio sampler. A short phase
//! tag decides which command may touch them; the devices themselves sit
//! behind an async mutex that is held for one device call at a time, so a
//! command racing a transition waits for at most one call and then sees the
//! new phase. Status readers never take either lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use fox_link::{Intent, LinkError, SerialLink};
use fox_radio::{RadioSampler, SamplerError};
use fox_store::{CalibrationProfile, CalibrationStore};

use crate::error::ControlError;
use crate::publisher::{ControllerState, DeviceState, StatusPublisher, StatusSnapshot};
use crate::session::{angle_at, ScanSession};
use crate::ScanConfig;

struct Rig {
    link: Box<dyn SerialLink>,
    sampler: Box<dyn RadioSampler>,
}

struct ScanHandle {
    cancel: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

enum Phase {
    Uninitialized,
    Initializing,
    Ready,
    Moving,
    Calibrating,
    Scanning(ScanHandle),
}

impl Phase {
    fn state(&self) -> ControllerState {
        match self {
            Phase::Uninitialized => ControllerState::Uninitialized,
            Phase::Initializing => ControllerState::Initializing,
            Phase::Ready => ControllerState::Ready,
            Phase::Moving => ControllerState::Moving,
            Phase::Calibrating => ControllerState::Calibrating,
            Phase::Scanning(_) => ControllerState::Scanning,
        }
    }
}

/// Profile values a scan runs with, fixed when it starts.
struct ScanPlan {
    turn: Intent,
    speed: u8,
    rotation: Duration,
    period: Duration,
    readings: usize,
}

enum ScanEnd {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationOutcome {
    pub duration_s: f64,
    pub saved: bool,
    pub speed_pct: u8,
}

struct Shared {
    cfg: ScanConfig,
    phase: Mutex<Phase>,
    rig: tokio::sync::Mutex<Rig>,
    profile: Mutex<CalibrationProfile>,
    store: Arc<dyn CalibrationStore>,
    status: StatusPublisher,
    sessions: AtomicU64,
}

/// Returns the controller to a resting phase if a task unwinds half way.
struct Restore<'a> {
    shared: &'a Shared,
    to: Option<Phase>,
}

impl<'a> Restore<'a> {
    fn new(shared: &'a Shared, to: Phase) -> Self {
        Self { shared, to: Some(to) }
    }

    fn disarm(&mut self) {
        self.to = None;
    }
}

impl Drop for Restore<'_> {
    fn drop(&mut self) {
        if let Some(to) = self.to.take() {
            warn!("scan: task ended abnormally; returning to {}", to.state());
            self.shared.enter(to);
        }
    }
}

fn gate(state: ControllerState, what: &str) -> ControlError {
    match state {
        ControllerState::Uninitialized => ControlError::not_initialized(),
        other => ControlError::busy(what, other),
    }
}

async fn join<T>(task: JoinHandle<Result<T, ControlError>>) -> Result<T, ControlError> {
    match task.await {
        Ok(res) => res,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(ControlError::LinkUnavailable("operation aborted".into())),
    }
}

async fn open_rig(rig: &mut Rig, speed: u8) -> Result<(), ControlError> {
    rig.sampler.open().await?;
    rig.link.connect().await?;
    rig.link.set_speed(speed).await?;
    Ok(())
}

impl Shared {
    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_profile(&self) -> MutexGuard<'_, CalibrationProfile> {
        self.profile.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn state(&self) -> ControllerState {
        self.lock_phase().state()
    }

    fn profile(&self) -> CalibrationProfile {
        *self.lock_profile()
    }

    fn transition(&self, phase: &mut Phase, next: Phase) {
        let state = next.state();
        *phase = next;
        self.status.update(|s| {
            s.state = state;
            s.running = state == ControllerState::Scanning;
        });
    }

    fn enter(&self, next: Phase) {
        let mut phase = self.lock_phase();
        self.transition(&mut phase, next);
    }

    fn set_devices(&self, devices: DeviceState) {
        self.status.update(|s| s.devices = devices);
    }

    fn link_err(&self, e: LinkError) -> ControlError {
        warn!("scan: rover link fault: {}", e);
        self.status.update(|s| s.devices.car_connected = false);
        e.into()
    }

    fn sampler_err(&self, e: SamplerError) -> ControlError {
        warn!("scan: radio fault: {}", e);
        self.status.update(|s| s.devices.sdr_ready = false);
        e.into()
    }

    async fn send(&self, rig: &mut Rig, intent: Intent, speed: u8) -> Result<(), ControlError> {
        if !rig.link.is_healthy() {
            self.status.update(|s| s.devices.car_connected = false);
            return Err(ControlError::LinkUnavailable("rover not connected".into()));
        }
        rig.link.send(intent, speed).await.map_err(|e| self.link_err(e))
    }

    /// Best effort: a failure is recorded but not returned.
    async fn halt(&self, rig: &mut Rig) {
        if let Err(e) = rig.link.send(Intent::Stop, 0).await {
            self.link_err(e);
        }
    }

    /// Validate, persist, then adopt. The in-memory profile only changes
    /// once the store has accepted the new one. A running scan keeps showing
    /// the rotation its readings were taken with.
    fn commit(&self, f: impl FnOnce(&mut CalibrationProfile)) -> Result<CalibrationProfile, ControlError> {
        let next = {
            let mut current = self.lock_profile();
            let mut next = *current;
            f(&mut next);
            next.validate()?;
            self.store.save(&next)?;
            *current = next;
            next
        };
        // phase before profile, as in start_detection
        let phase = self.lock_phase();
        if !matches!(*phase, Phase::Scanning(_)) {
            let rotation = self.profile().rotation_duration_s;
            self.status.update(|s| s.rotation_duration_s = rotation);
        }
        Ok(next)
    }

    async fn init(&self) -> Result<(), ControlError> {
        let mut restore = Restore::new(self, Phase::Uninitialized);
        let speed = self.profile().speed_pct;
        let mut rig = self.rig.lock().await;
        rig.sampler.close().await;
        rig.link.disconnect().await;

        let res = open_rig(&mut rig, speed).await;
        match &res {
            Ok(()) => {
                self.set_devices(DeviceState { car_connected: true, sdr_ready: true });
                self.enter(Phase::Ready);
                info!("scan: drivers ready, speed {}%", speed);
            }
            Err(e) => {
                rig.sampler.close().await;
                rig.link.disconnect().await;
                self.set_devices(DeviceState::default());
                self.enter(Phase::Uninitialized);
                warn!("scan: driver init failed: {}", e);
            }
        }
        restore.disarm();
        res
    }

    async fn calibrate(&self, duration: Duration, save: bool) -> Result<CalibrationOutcome, ControlError> {
        let mut restore = Restore::new(self, Phase::Ready);
        let speed = self.profile().speed_pct;

        let res = match self.timed_motion(self.cfg.direction.intent(), speed, duration).await {
            Ok(()) if save => self
                .commit(|p| p.rotation_duration_s = duration.as_secs_f64())
                .map(|_| true),
            Ok(()) => Ok(false),
            Err(e) => Err(e),
        };
        self.enter(Phase::Ready);
        restore.disarm();

        let saved = res?;
        info!(
            "scan: calibration turn of {:.2}s done ({})",
            duration.as_secs_f64(),
            if saved { "saved" } else { "test only" }
        );
        Ok(CalibrationOutcome {
            duration_s: duration.as_secs_f64(),
            saved,
            speed_pct: self.profile().speed_pct,
        })
    }

    async fn pulse(&self, intent: Intent, speed: u8, duration: Duration) -> Result<(), ControlError> {
        let mut restore = Restore::new(self, Phase::Ready);
        let res = self.timed_motion(intent, speed, duration).await;
        self.enter(Phase::Ready);
        restore.disarm();
        res
    }

    async fn timed_motion(&self, intent: Intent, speed: u8, duration: Duration) -> Result<(), ControlError> {
        {
            let mut rig = self.rig.lock().await;
            if let Err(e) = self.send(&mut rig, intent, speed).await {
                self.halt(&mut rig).await;
                return Err(e);
            }
        }
        let started = Instant::now();
        tokio::time::sleep(duration).await;
        let mut rig = self.rig.lock().await;
        self.send(&mut rig, Intent::Stop, speed).await?;
        debug!("scan: moved {} for {:?}", intent, started.elapsed());
        Ok(())
    }

    async fn scan(&self, id: u64, plan: ScanPlan, mut cancel: watch::Receiver<bool>, done: watch::Sender<bool>) {
        let mut restore = Restore::new(self, Phase::Ready);
        let end = self.sweep(id, &plan, &mut cancel).await;
        {
            let mut rig = self.rig.lock().await;
            self.halt(&mut rig).await;
        }
        let n = self.status.snapshot().session.readings().len();
        match end {
            Ok(ScanEnd::Completed) => info!("scan: session {} complete, {} readings", id, n),
            Ok(ScanEnd::Cancelled) => info!("scan: session {} stopped, {} readings", id, n),
            Err(e) => warn!("scan: session {} aborted after {} readings: {}", id, n, e),
        }
        self.enter(Phase::Ready);
        restore.disarm();
        let _ = done.send(true);
    }

    async fn sweep(&self, id: u64, plan: &ScanPlan, cancel: &mut watch::Receiver<bool>) -> Result<ScanEnd, ControlError> {
        let started = Instant::now();
        let mut ticker = interval_at(started, plan.period);
        // a window that overran by one reading must not shift later angles
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let tick = tokio::select! {
                biased;
                _ = cancel.changed() => return Ok(ScanEnd::Cancelled),
                t = ticker.tick() => t,
            };
            let elapsed = tick.saturating_duration_since(started);
            if elapsed >= plan.rotation {
                return Ok(ScanEnd::Completed);
            }
            let power = tokio::select! {
                biased;
                _ = cancel.changed() => return Ok(ScanEnd::Cancelled),
                r = self.measure(plan, tick + plan.period) => r?,
            };
            let angle = angle_at(elapsed, plan.rotation);
            self.status.update(|s| {
                if s.session.id() == id {
                    s.session.record(angle, power);
                    s.current_db = Some(power);
                }
            });
        }
    }

    /// One tick. The turn frame goes out again first, so a rover that
    /// stopped answering since the last tick fails here; the firmware treats
    /// a repeated frame as a no-op. Then readings are averaged until `until`
    /// or the per-tick cap.
    async fn measure(&self, plan: &ScanPlan, until: Instant) -> Result<f64, ControlError> {
        {
            let mut rig = self.rig.lock().await;
            self.send(&mut rig, plan.turn, plan.speed).await?;
        }
        let mut sum = 0.0;
        let mut taken = 0usize;
        while taken < plan.readings {
            let mut rig = self.rig.lock().await;
            sum += rig.sampler.sample().await.map_err(|e| self.sampler_err(e))?;
            taken += 1;
            if Instant::now() >= until {
                break;
            }
        }
        Ok(sum / taken as f64)
    }
}

/// Handle to the scan orchestrator. Clones share one controller.
#[derive(Clone)]
pub struct ScanController {
    shared: Arc<Shared>,
}

impl ScanController {
    pub fn new(
        link: Box<dyn SerialLink>,
        sampler: Box<dyn RadioSampler>,
        store: Arc<dyn CalibrationStore>,
        cfg: ScanConfig,
    ) -> Self {
        let profile = store.load();
        let status = StatusPublisher::new(profile.rotation_duration_s);
        Self {
            shared: Arc::new(Shared {
                cfg,
                phase: Mutex::new(Phase::Uninitialized),
                rig: tokio::sync::Mutex::new(Rig { link, sampler }),
                profile: Mutex::new(profile),
                store,
                status,
                sessions: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.shared.state()
    }

    pub fn profile(&self) -> CalibrationProfile {
        self.shared.profile()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.shared.status.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.shared.status.subscribe()
    }

    /// Open the radio, then the rover, and push the active speed.
    pub async fn init_drivers(&self) -> Result<(), ControlError> {
        {
            let mut phase = self.shared.lock_phase();
            match phase.state() {
                ControllerState::Uninitialized | ControllerState::Ready => {}
                other => return Err(ControlError::busy("initialize drivers", other)),
            }
            self.shared.transition(&mut phase, Phase::Initializing);
        }
        let shared = self.shared.clone();
        join(tokio::spawn(async move { shared.init().await })).await
    }

    /// Manual motion for `move_pulse_s`, then stop. Waits for the pulse to
    /// end; a dropped caller does not cut it short or skip the stop. `Stop`
    /// is sent at once, also in the middle of a pulse.
    pub async fn drive(&self, intent: Intent) -> Result<(), ControlError> {
        let sh = &self.shared;
        if intent == Intent::Stop {
            let mut rig = sh.rig.lock().await;
            match sh.state() {
                ControllerState::Ready | ControllerState::Moving => {}
                other => return Err(gate(other, "stop the rover")),
            }
            sh.send(&mut rig, Intent::Stop, 0).await?;
            debug!("scan: stop");
            return Ok(());
        }

        let pulse = Duration::try_from_secs_f64(sh.cfg.move_pulse_s)
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| {
                ControlError::InvalidParameter(format!("scan.move_pulse_s must be > 0, got {}", sh.cfg.move_pulse_s))
            })?;
        let speed = sh.profile().speed_pct;
        {
            let mut phase = sh.lock_phase();
            let state = phase.state();
            if state != ControllerState::Ready {
                return Err(gate(state, "move"));
            }
            if !sh.status.devices().car_connected {
                return Err(ControlError::LinkUnavailable("rover not connected".into()));
            }
            sh.transition(&mut phase, Phase::Moving);
        }
        debug!("scan: move {} at {}% for {:?}", intent, speed, pulse);
        let shared = sh.clone();
        join(tokio::spawn(async move { shared.pulse(intent, speed, pulse).await })).await
    }

    /// Clamp to 0..=100 and make it the active speed. The rover hears about
    /// it right away only when nothing else is driving it.
    pub async fn set_speed(&self, value: i64) -> Result<u8, ControlError> {
        let sh = &self.shared;
        let speed = value.clamp(0, 100) as u8;
        let mut rig = sh.rig.lock().await;
        match sh.state() {
            ControllerState::Ready => {
                if !rig.link.is_healthy() {
                    return Err(ControlError::LinkUnavailable("rover not connected".into()));
                }
                rig.link.set_speed(speed).await.map_err(|e| sh.link_err(e))?;
            }
            ControllerState::Moving | ControllerState::Calibrating | ControllerState::Scanning => {
                if !sh.status.devices().car_connected {
                    return Err(ControlError::LinkUnavailable("rover not connected".into()));
                }
            }
            other => return Err(gate(other, "set speed")),
        }
        sh.lock_profile().speed_pct = speed;
        info!("scan: speed set to {}%", speed);
        Ok(speed)
    }

    /// Turn for `duration_s` and stop. With `save` the duration becomes the
    /// stored time of a full turn.
    pub async fn calibrate(&self, duration_s: f64, save: bool) -> Result<CalibrationOutcome, ControlError> {
        let sh = &self.shared;
        let duration = Duration::try_from_secs_f64(duration_s)
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| ControlError::InvalidParameter(format!("duration must be > 0 seconds, got {}", duration_s)))?;
        if duration_s > sh.cfg.max_calibration_s {
            return Err(ControlError::InvalidParameter(format!(
                "duration longer than {}s",
                sh.cfg.max_calibration_s
            )));
        }
        {
            let mut phase = sh.lock_phase();
            let state = phase.state();
            if state != ControllerState::Ready {
                return Err(gate(state, "calibrate"));
            }
            if !sh.status.devices().car_connected {
                return Err(ControlError::LinkUnavailable("rover not connected".into()));
            }
            sh.transition(&mut phase, Phase::Calibrating);
        }
        let shared = sh.clone();
        join(tokio::spawn(async move { shared.calibrate(duration, save).await })).await
    }

    /// Start a fresh scan in the background and return its session id.
    pub fn start_detection(&self) -> Result<u64, ControlError> {
        let sh = &self.shared;
        let mut phase = sh.lock_phase();
        let state = phase.state();
        if state != ControllerState::Ready {
            return Err(gate(state, "start a scan"));
        }
        let devices = sh.status.devices();
        if !devices.car_connected {
            return Err(ControlError::LinkUnavailable("rover not connected".into()));
        }
        if !devices.sdr_ready {
            return Err(ControlError::SamplerUnavailable("radio not ready".into()));
        }

        let profile = sh.profile();
        let secs = |s: f64| {
            Duration::try_from_secs_f64(s).map_err(|e| ControlError::InvalidParameter(format!("{}: {}", s, e)))
        };
        let plan = ScanPlan {
            turn: sh.cfg.direction.intent(),
            speed: profile.speed_pct,
            rotation: secs(profile.rotation_duration_s)?,
            period: secs(profile.measurement_time_s)?,
            readings: sh.cfg.readings_per_tick.max(1),
        };

        let id = sh.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        sh.transition(&mut phase, Phase::Scanning(ScanHandle { cancel: cancel_tx, done: done_rx }));
        sh.status.update(|s| {
            s.session = ScanSession::new(id);
            s.current_db = None;
            s.rotation_duration_s = profile.rotation_duration_s;
        });
        drop(phase);

        info!(
            "scan: session {} started, {:.2}s turn, reading every {:.2}s",
            id, profile.rotation_duration_s, profile.measurement_time_s
        );
        let shared = sh.clone();
        tokio::spawn(async move { shared.scan(id, plan, cancel_rx, done_tx).await });
        Ok(id)
    }

    /// Cancel a running scan and wait until the rover has been told to stop.
    /// Returns false when no scan was running.
    pub async fn stop_detection(&self) -> Result<bool, ControlError> {
        let mut done = {
            let phase = self.shared.lock_phase();
            match &*phase {
                Phase::Scanning(h) => {
                    let _ = h.cancel.send(true);
                    h.done.clone()
                }
                _ => return Ok(false),
            }
        };
        if done.wait_for(|d| *d).await.is_err() {
            let mut phase = self.shared.lock_phase();
            if matches!(&*phase, Phase::Scanning(h) if h.done.same_channel(&done)) {
                warn!("scan: scan task vanished; forcing ready");
                self.shared.transition(&mut phase, Phase::Ready);
            }
        }
        Ok(true)
    }

    /// Persist new timing. A running scan keeps the values it started with.
    pub fn update_settings(&self, rotation_duration_s: f64, measurement_time_s: f64) -> Result<CalibrationProfile, ControlError> {
        let p = self.shared.commit(|p| {
            p.rotation_duration_s = rotation_duration_s;
            p.measurement_time_s = measurement_time_s;
        })?;
        info!(
            "scan: settings saved, rotation {:.2}s, measurement {:.2}s",
            p.rotation_duration_s, p.measurement_time_s
        );
        Ok(p)
    }

    /// Stop any scan, halt the rover and release both devices.
    pub async fn shutdown(&self) {
        let _ = self.stop_detection().await;
        let sh = &self.shared;
        let mut rig = sh.rig.lock().await;
        rig.link.disconnect().await;
        rig.sampler.close().await;
        sh.set_devices(DeviceState::default());
        let mut phase = sh.lock_phase();
        if matches!(*phase, Phase::Ready) {
            sh.transition(&mut phase, Phase::Uninitialized);
        }
        info!("scan: shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fox_link::mock::{MockFault, MockRover};
    use fox_link::rover::SerialRover;
    use fox_link::{Frame, LinkConfig};
    use fox_radio::sim::ScriptedSampler;
    use fox_store::MemoryStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    const PROFILE: CalibrationProfile = CalibrationProfile {
        rotation_duration_s: 4.0,
        measurement_time_s: 1.0,
        speed_pct: 20,
    };

    /// One scripted reading per sample.
    fn single_reading() -> ScanConfig {
        ScanConfig { readings_per_tick: 1, ..ScanConfig::default() }
    }

    fn rig(readings: &[f64]) -> (ScanController, MockRover, ScriptedSampler, MemoryStore) {
        let rover = MockRover::new(4.0);
        let radio = ScriptedSampler::new(readings.iter().copied());
        let store = MemoryStore::with_profile(PROFILE);
        let ctl = ScanController::new(
            Box::new(rover.clone()),
            Box::new(radio.clone()),
            Arc::new(store.clone()),
            single_reading(),
        );
        (ctl, rover, radio, store)
    }

    /// Firmware that echoes the first `answer` frames and then hangs up.
    fn hang_up_after(mut io: DuplexStream, answer: usize) {
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            for _ in 0..answer {
                let n = match io.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                let mut reply = buf[..n].to_vec();
                reply.extend_from_slice(b"\r\n");
                if io.write_all(&reply).await.is_err() {
                    return;
                }
            }
        });
    }

    async fn ready(readings: &[f64]) -> (ScanController, MockRover, ScriptedSampler, MemoryStore) {
        let parts = rig(readings);
        parts.0.init_drivers().await.unwrap();
        parts
    }

    async fn scan_finished(ctl: &ScanController) -> StatusSnapshot {
        let mut rx = ctl.subscribe();
        let snap = rx.wait_for(|s| !s.running).await.unwrap().clone();
        snap
    }

    #[tokio::test]
    async fn uninitialized_refuses_device_commands() {
        let (ctl, rover, _, _) = rig(&[]);
        assert!(matches!(ctl.drive(Intent::Left).await, Err(ControlError::LinkUnavailable(_))));
        assert!(matches!(ctl.start_detection(), Err(ControlError::LinkUnavailable(_))));
        assert!(matches!(ctl.calibrate(1.0, true).await, Err(ControlError::LinkUnavailable(_))));
        assert!(matches!(ctl.set_speed(30).await, Err(ControlError::LinkUnavailable(_))));
        assert!(!ctl.stop_detection().await.unwrap());
        assert!(rover.frames().is_empty());
        assert_eq!(ctl.state(), ControllerState::Uninitialized);
    }

    #[tokio::test]
    async fn init_opens_both_and_pushes_speed() {
        let (ctl, rover, radio, _) = ready(&[]).await;
        assert_eq!(ctl.state(), ControllerState::Ready);
        assert_eq!(ctl.snapshot().devices, DeviceState { car_connected: true, sdr_ready: true });
        assert_eq!(rover.frames(), vec![Frame::halt(), Frame::speed(20)]);
        assert!(radio.is_ready());
    }

    #[tokio::test]
    async fn failed_init_closes_what_it_opened() {
        let (ctl, rover, radio, _) = rig(&[]);
        rover.refuse_connect(true);
        assert!(matches!(ctl.init_drivers().await, Err(ControlError::LinkUnavailable(_))));
        assert!(!radio.is_ready());
        assert_eq!(ctl.state(), ControllerState::Uninitialized);
        assert_eq!(ctl.snapshot().devices, DeviceState::default());

        rover.refuse_connect(false);
        radio.refuse_open(true);
        assert!(matches!(ctl.init_drivers().await, Err(ControlError::SamplerUnavailable(_))));
        assert!(rover.frames().is_empty());

        radio.refuse_open(false);
        ctl.init_drivers().await.unwrap();
        assert_eq!(ctl.state(), ControllerState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn calibrate_stops_after_duration_and_saves() {
        let (ctl, rover, _, store) = ready(&[]).await;
        let out = ctl.calibrate(2.5, true).await.unwrap();
        assert_eq!(out, CalibrationOutcome { duration_s: 2.5, saved: true, speed_pct: 20 });

        let frames = rover.timed_frames();
        let (t_turn, turn) = frames[frames.len() - 2];
        let (t_stop, stop) = frames[frames.len() - 1];
        assert_eq!(turn, Frame::motion(Intent::Right, 20));
        assert_eq!(stop, Frame::halt());
        let gap = t_stop - t_turn;
        assert!(gap >= Duration::from_millis(2500) && gap < Duration::from_millis(2510), "{gap:?}");

        assert_eq!(store.saved().map(|p| p.rotation_duration_s), Some(2.5));
        assert_eq!(ctl.profile().rotation_duration_s, 2.5);
        assert_eq!(ctl.snapshot().rotation_duration_s, 2.5);
        assert_eq!(ctl.state(), ControllerState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_does_not_save() {
        let (ctl, rover, _, store) = ready(&[]).await;
        let out = ctl.calibrate(1.0, false).await.unwrap();
        assert!(!out.saved);
        assert_eq!(store.save_count(), 0);
        assert_eq!(ctl.profile(), PROFILE);
        assert_eq!(rover.last_frame(), Some(Frame::halt()));
    }

    #[tokio::test]
    async fn calibrate_rejects_bad_durations() {
        let (ctl, rover, _, _) = ready(&[]).await;
        let before = rover.frames().len();
        for d in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e6] {
            assert!(matches!(ctl.calibrate(d, true).await, Err(ControlError::InvalidParameter(_))), "{d}");
        }
        assert_eq!(rover.frames().len(), before);
        assert_eq!(ctl.state(), ControllerState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn calibration_excludes_other_commands() {
        let (ctl, _, _, _) = ready(&[]).await;
        let c = ctl.clone();
        let task = tokio::spawn(async move { c.calibrate(3.0, true).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(ctl.state(), ControllerState::Calibrating);
        assert!(matches!(ctl.start_detection(), Err(ControlError::Busy(_))));
        assert!(matches!(ctl.drive(Intent::Forward).await, Err(ControlError::Busy(_))));
        assert!(matches!(ctl.calibrate(1.0, true).await, Err(ControlError::Busy(_))));
        assert!(matches!(ctl.init_drivers().await, Err(ControlError::Busy(_))));

        task.await.unwrap().unwrap();
        assert_eq!(ctl.state(), ControllerState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_calibrate_request_still_stops_the_rover() {
        let (ctl, rover, _, _) = ready(&[]).await;
        let res = tokio::time::timeout(Duration::from_millis(500), ctl.calibrate(2.0, false)).await;
        assert!(res.is_err());
        assert_eq!(rover.moving(), Some(Intent::Right));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(rover.moving(), None);
        assert_eq!(rover.last_frame(), Some(Frame::halt()));
        assert_eq!(ctl.state(), ControllerState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_records_quarter_turns_and_peak() {
        let (ctl, rover, _, _) = ready(&[-80.0, -55.0, -55.0, -100.0]).await;
        let id = ctl.start_detection().unwrap();
        assert!(ctl.snapshot().running);

        let snap = scan_finished(&ctl).await;
        assert_eq!(snap.session.id(), id);
        let angles: Vec<f64> = snap.session.readings().iter().map(|r| r.angle_deg).collect();
        assert_eq!(angles, vec![0.0, 90.0, 180.0, 270.0]);
        let peak = snap.session.peak().unwrap();
        assert_eq!((peak.angle_deg, peak.power_db), (90.0, -55.0));
        assert_eq!(snap.current_db, Some(-100.0));
        assert_eq!(snap.state, ControllerState::Ready);

        let frames = rover.frames();
        assert_eq!(frames[frames.len() - 2], Frame::motion(Intent::Right, 20));
        assert_eq!(frames[frames.len() - 1], Frame::halt());
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_busy_and_leaves_readings() {
        let (ctl, _, _, _) = ready(&[-70.0, -60.0, -50.0, -40.0]).await;
        let id = ctl.start_detection().unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let before = ctl.snapshot();
        assert_eq!(before.session.readings().len(), 2);
        assert!(matches!(ctl.start_detection(), Err(ControlError::Busy(_))));
        assert!(matches!(ctl.drive(Intent::Left).await, Err(ControlError::Busy(_))));
        assert!(matches!(ctl.init_drivers().await, Err(ControlError::Busy(_))));
        let after = ctl.snapshot();
        assert_eq!(after.session.id(), id);
        assert_eq!(after.session.readings(), before.session.readings());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_keeps_readings_until_next_start() {
        let (ctl, rover, _, _) = ready(&[-70.0, -60.0]).await;
        let first = ctl.start_detection().unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let t = Instant::now();
        assert!(ctl.stop_detection().await.unwrap());
        assert!(t.elapsed() < Duration::from_secs(1));
        assert_eq!(rover.moving(), None);
        assert_eq!(rover.last_frame(), Some(Frame::halt()));

        let snap = ctl.snapshot();
        assert!(!snap.running);
        assert_eq!(snap.state, ControllerState::Ready);
        assert_eq!(snap.session.id(), first);
        assert_eq!(snap.session.readings().len(), 2);

        let second = ctl.start_detection().unwrap();
        assert!(second > first);
        let snap = ctl.snapshot();
        assert!(snap.session.readings().is_empty());
        assert_eq!(snap.current_db, None);
        ctl.stop_detection().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn settings_during_scan_apply_to_the_next_one() {
        let (ctl, _, _, store) = ready(&[-60.0]).await;
        ctl.start_detection().unwrap();
        ctl.update_settings(8.0, 2.0).unwrap();
        assert_eq!(ctl.snapshot().rotation_duration_s, 4.0);
        let snap = scan_finished(&ctl).await;
        assert_eq!(snap.session.readings().len(), 4);
        assert_eq!(snap.rotation_duration_s, 4.0);
        assert_eq!(store.saved().map(|p| p.rotation_duration_s), Some(8.0));

        ctl.start_detection().unwrap();
        assert_eq!(ctl.snapshot().rotation_duration_s, 8.0);
        let snap = scan_finished(&ctl).await;
        let angles: Vec<f64> = snap.session.readings().iter().map(|r| r.angle_deg).collect();
        assert_eq!(angles, vec![0.0, 90.0, 180.0, 270.0]);
    }

    #[tokio::test]
    async fn settings_round_trip_and_failed_save() {
        let (ctl, _, _, store) = rig(&[]);
        let p = ctl.update_settings(5.0, 0.2).unwrap();
        assert_eq!((p.rotation_duration_s, p.measurement_time_s), (5.0, 0.2));
        assert_eq!(ctl.profile(), p);
        assert_eq!(store.saved(), Some(p));

        assert!(matches!(ctl.update_settings(0.0, 0.2), Err(ControlError::InvalidParameter(_))));
        store.fail_saves(true);
        assert!(matches!(ctl.update_settings(6.0, 0.3), Err(ControlError::Io(_))));
        assert_eq!(ctl.profile(), p);
    }

    #[tokio::test(start_paused = true)]
    async fn garbled_reply_marks_rover_disconnected() {
        let (ctl, rover, _, _) = ready(&[]).await;
        rover.inject(MockFault::Garbled);
        assert!(matches!(ctl.drive(Intent::Left).await, Err(ControlError::LinkUnavailable(_))));
        let snap = ctl.snapshot();
        assert!(!snap.devices.car_connected);
        assert!(snap.devices.sdr_ready);
        assert!(matches!(ctl.drive(Intent::Left).await, Err(ControlError::LinkUnavailable(_))));
        assert!(matches!(ctl.start_detection(), Err(ControlError::LinkUnavailable(_))));

        ctl.init_drivers().await.unwrap();
        ctl.drive(Intent::Left).await.unwrap();
        let frames = rover.frames();
        assert_eq!(frames[frames.len() - 2], Frame::motion(Intent::Left, 20));
    }

    #[tokio::test(start_paused = true)]
    async fn radio_fault_ends_scan_and_stops_rover() {
        let (ctl, rover, radio, _) = ready(&[-70.0, -65.0, -60.0]).await;
        radio.fail_after(2);
        ctl.start_detection().unwrap();
        let snap = scan_finished(&ctl).await;
        assert_eq!(snap.session.readings().len(), 2);
        assert!(!snap.devices.sdr_ready);
        assert!(snap.devices.car_connected);
        assert_eq!(snap.state, ControllerState::Ready);
        assert_eq!(rover.moving(), None);
        assert!(matches!(ctl.start_detection(), Err(ControlError::SamplerUnavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn speed_is_clamped_and_deferred_while_scanning() {
        let (ctl, rover, _, _) = ready(&[-60.0]).await;
        assert_eq!(ctl.set_speed(150).await.unwrap(), 100);
        assert_eq!(rover.last_frame(), Some(Frame::speed(100)));
        assert_eq!(ctl.set_speed(-5).await.unwrap(), 0);
        assert_eq!(ctl.set_speed(35).await.unwrap(), 35);

        ctl.start_detection().unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let sent = rover.frames().len();
        assert_eq!(ctl.set_speed(60).await.unwrap(), 60);
        assert_eq!(rover.frames().len(), sent);
        assert_eq!(rover.frames()[sent - 1], Frame::motion(Intent::Right, 35));

        scan_finished(&ctl).await;
        ctl.drive(Intent::Forward).await.unwrap();
        assert!(rover.frames().contains(&Frame::motion(Intent::Forward, 60)));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_halts_and_releases() {
        let (ctl, rover, radio, _) = ready(&[-60.0]).await;
        ctl.start_detection().unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        ctl.shutdown().await;
        assert_eq!(rover.moving(), None);
        assert!(!radio.is_ready());
        assert_eq!(ctl.state(), ControllerState::Uninitialized);
        assert_eq!(ctl.snapshot().devices, DeviceState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn left_scans_turn_left() {
        let rover = MockRover::new(4.0);
        let ctl = ScanController::new(
            Box::new(rover.clone()),
            Box::new(ScriptedSampler::new([-60.0])),
            Arc::new(MemoryStore::with_profile(PROFILE)),
            ScanConfig { direction: crate::ScanDirection::Left, ..ScanConfig::default() },
        );
        ctl.init_drivers().await.unwrap();
        ctl.start_detection().unwrap();
        scan_finished(&ctl).await;
        assert!(rover.frames().contains(&Frame::motion(Intent::Left, 20)));
    }

    #[tokio::test(start_paused = true)]
    async fn rover_lost_mid_scan_ends_it() {
        let (ctl, rover, radio, _) = ready(&[-70.0, -60.0, -50.0, -40.0]).await;
        let t = Instant::now();
        ctl.start_detection().unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        rover.unplug();

        let snap = scan_finished(&ctl).await;
        assert_eq!(snap.session.readings().len(), 2);
        assert!(!snap.devices.car_connected);
        assert!(snap.devices.sdr_ready);
        assert_eq!(snap.state, ControllerState::Ready);
        assert_eq!(radio.taken(), 2);
        assert_eq!(rover.rejected().last(), Some(&Frame::halt()));
        assert_eq!(t.elapsed(), Duration::from_secs(2));
        assert!(matches!(ctl.start_detection(), Err(ControlError::LinkUnavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn serial_rover_hanging_up_mid_scan_ends_it() {
        let (ours, theirs) = tokio::io::duplex(256);
        // handshake, speed, first turn frame
        hang_up_after(theirs, 3);
        let rover = SerialRover::attached(ours, LinkConfig { settle_ms: 0, ..LinkConfig::default() });
        let radio = ScriptedSampler::new([-60.0]);
        let ctl = ScanController::new(
            Box::new(rover),
            Box::new(radio.clone()),
            Arc::new(MemoryStore::with_profile(PROFILE)),
            single_reading(),
        );
        ctl.init_drivers().await.unwrap();
        ctl.start_detection().unwrap();

        let snap = scan_finished(&ctl).await;
        assert_eq!(snap.session.readings().len(), 1);
        assert_eq!(radio.taken(), 1);
        assert!(!snap.devices.car_connected);
        assert_eq!(snap.state, ControllerState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn each_sample_averages_its_window() {
        let rover = MockRover::new(2.0);
        let radio = ScriptedSampler::new([-60.0, -62.0, -64.0, -66.0, -80.0]);
        radio.pace(Duration::from_millis(250));
        let ctl = ScanController::new(
            Box::new(rover),
            Box::new(radio.clone()),
            Arc::new(MemoryStore::with_profile(CalibrationProfile { rotation_duration_s: 2.0, ..PROFILE })),
            ScanConfig::default(),
        );
        ctl.init_drivers().await.unwrap();
        ctl.start_detection().unwrap();

        let snap = scan_finished(&ctl).await;
        let got: Vec<(f64, f64)> = snap.session.readings().iter().map(|r| (r.angle_deg, r.power_db)).collect();
        assert_eq!(got, vec![(0.0, -63.0), (180.0, -80.0)]);
        assert_eq!(radio.taken(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn readings_per_sample_are_capped() {
        let rover = MockRover::new(4.0);
        let radio = ScriptedSampler::new([-60.0, -70.0, -50.0]);
        let ctl = ScanController::new(
            Box::new(rover),
            Box::new(radio.clone()),
            Arc::new(MemoryStore::with_profile(PROFILE)),
            ScanConfig { readings_per_tick: 2, ..ScanConfig::default() },
        );
        ctl.init_drivers().await.unwrap();
        ctl.start_detection().unwrap();

        let snap = scan_finished(&ctl).await;
        let powers: Vec<f64> = snap.session.readings().iter().map(|r| r.power_db).collect();
        assert_eq!(powers, vec![-65.0, -50.0, -50.0, -50.0]);
        assert_eq!(radio.taken(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn move_runs_for_one_pulse_then_stops() {
        let (ctl, rover, _, _) = ready(&[]).await;
        ctl.drive(Intent::Forward).await.unwrap();

        let frames = rover.timed_frames();
        let (t_go, go) = frames[frames.len() - 2];
        let (t_stop, stop) = frames[frames.len() - 1];
        assert_eq!(go, Frame::motion(Intent::Forward, 20));
        assert_eq!(stop, Frame::halt());
        let gap = t_stop - t_go;
        assert!(gap >= Duration::from_secs(1) && gap < Duration::from_millis(1010), "{gap:?}");
        assert_eq!(rover.moving(), None);
        assert_eq!(ctl.state(), ControllerState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cuts_a_move_short() {
        let (ctl, rover, _, _) = ready(&[]).await;
        let c = ctl.clone();
        let task = tokio::spawn(async move { c.drive(Intent::Left).await });
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(ctl.state(), ControllerState::Moving);
        assert_eq!(rover.moving(), Some(Intent::Left));
        assert!(matches!(ctl.drive(Intent::Right).await, Err(ControlError::Busy(_))));
        assert!(matches!(ctl.start_detection(), Err(ControlError::Busy(_))));
        assert!(matches!(ctl.calibrate(1.0, true).await, Err(ControlError::Busy(_))));

        ctl.drive(Intent::Stop).await.unwrap();
        assert_eq!(rover.moving(), None);
        task.await.unwrap().unwrap();
        assert_eq!(ctl.state(), ControllerState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_move_request_still_stops_the_rover() {
        let (ctl, rover, _, _) = ready(&[]).await;
        let res = tokio::time::timeout(Duration::from_millis(200), ctl.drive(Intent::Backward)).await;
        assert!(res.is_err());
        assert_eq!(rover.moving(), Some(Intent::Backward));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rover.moving(), None);
        assert_eq!(ctl.state(), ControllerState::Ready);
    }
}
