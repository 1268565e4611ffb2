//! Simulated samplers: a beacon seen through a directional antenna, and a
//! scripted sampler for driving the controller through exact readings.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::{RadioSampler, SamplerError};

/// Where the antenna points right now, in degrees.
pub type HeadingSource = Arc<dyn Fn() -> f64 + Send + Sync>;

#[derive(Debug, Clone, Deserialize)]
pub struct BeaconConfig {
    #[serde(default = "default_bearing_deg")]
    pub bearing_deg: f64,
    #[serde(default = "default_peak_db")]
    pub peak_db: f64,
    #[serde(default = "default_floor_db")]
    pub floor_db: f64,
    /// Half-power beamwidth of the antenna.
    #[serde(default = "default_beamwidth_deg")]
    pub beamwidth_deg: f64,
    /// Uniform noise amplitude, +/- dB.
    #[serde(default = "default_noise_db")]
    pub noise_db: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_bearing_deg() -> f64 { 135.0 }
fn default_peak_db() -> f64 { -45.0 }
fn default_floor_db() -> f64 { -95.0 }
fn default_beamwidth_deg() -> f64 { 60.0 }
fn default_noise_db() -> f64 { 1.5 }
fn default_seed() -> u64 { 7 }

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            bearing_deg: default_bearing_deg(),
            peak_db: default_peak_db(),
            floor_db: default_floor_db(),
            beamwidth_deg: default_beamwidth_deg(),
            noise_db: default_noise_db(),
            seed: default_seed(),
        }
    }
}

/// Smallest angle between two bearings, 0..=180.
pub fn bearing_offset(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}

/// Parabolic main lobe: -3 dB at half the beamwidth off axis, never below
/// the floor.
pub fn lobe_db(cfg: &BeaconConfig, heading_deg: f64) -> f64 {
    let off = bearing_offset(heading_deg, cfg.bearing_deg);
    let bw = cfg.beamwidth_deg.max(1.0);
    (cfg.peak_db - 12.0 * (off / bw).powi(2)).max(cfg.floor_db)
}

pub struct BeaconSampler {
    cfg: BeaconConfig,
    heading: HeadingSource,
    rng: StdRng,
    open: bool,
}

impl BeaconSampler {
    pub fn new(cfg: BeaconConfig, heading: HeadingSource) -> Self {
        let rng = StdRng::seed_from_u64(cfg.seed);
        Self { cfg, heading, rng, open: false }
    }
}

#[async_trait]
impl RadioSampler for BeaconSampler {
    async fn open(&mut self) -> Result<(), SamplerError> {
        self.open = true;
        Ok(())
    }

    async fn sample(&mut self) -> Result<f64, SamplerError> {
        if !self.open {
            return Err(SamplerError::NotReady);
        }
        let mut db = lobe_db(&self.cfg, (self.heading)());
        if self.cfg.noise_db > 0.0 {
            db += self.rng.gen_range(-self.cfg.noise_db..=self.cfg.noise_db);
        }
        Ok(db)
    }

    fn is_ready(&self) -> bool {
        self.open
    }

    async fn close(&mut self) {
        self.open = false;
    }
}

/// Plays back a fixed list of readings. Clones share state.
#[derive(Clone, Default)]
pub struct ScriptedSampler {
    inner: Arc<Mutex<Script>>,
}

#[derive(Default)]
struct Script {
    readings: VecDeque<f64>,
    last: Option<f64>,
    open: bool,
    refuse_open: bool,
    fail_after: Option<usize>,
    taken: usize,
    pace: Option<Duration>,
}

impl ScriptedSampler {
    /// Once the list runs out the last reading repeats.
    pub fn new(readings: impl IntoIterator<Item = f64>) -> Self {
        let s = Self::default();
        s.lock().readings = readings.into_iter().collect();
        s
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn refuse_open(&self, refuse: bool) {
        self.lock().refuse_open = refuse;
    }

    /// Fail every reading after the first `n` successful ones.
    pub fn fail_after(&self, n: usize) {
        self.lock().fail_after = Some(n);
    }

    pub fn taken(&self) -> usize {
        self.lock().taken
    }

    /// Make every reading take `per_reading`, like a dongle filling a block.
    pub fn pace(&self, per_reading: Duration) {
        self.lock().pace = Some(per_reading);
    }
}

#[async_trait]
impl RadioSampler for ScriptedSampler {
    async fn open(&mut self) -> Result<(), SamplerError> {
        let mut s = self.lock();
        if s.refuse_open {
            return Err(SamplerError::Spawn {
                bin: "scripted".into(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no dongle"),
            });
        }
        s.open = true;
        Ok(())
    }

    async fn sample(&mut self) -> Result<f64, SamplerError> {
        let pace = self.lock().pace;
        if let Some(d) = pace {
            tokio::time::sleep(d).await;
        }
        let mut s = self.lock();
        if !s.open {
            return Err(SamplerError::NotReady);
        }
        if s.fail_after.is_some_and(|n| s.taken >= n) {
            s.open = false;
            return Err(SamplerError::Ended);
        }
        let v = match s.readings.pop_front() {
            Some(v) => v,
            None => s.last.unwrap_or(-100.0),
        };
        s.last = Some(v);
        s.taken += 1;
        Ok(v)
    }

    fn is_ready(&self) -> bool {
        self.lock().open
    }

    async fn close(&mut self) {
        self.lock().open = false;
    }
}
