pub mod doctor;

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Timing and speed learned by calibrating the rover.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    /// Seconds for one full 360° turn.
    pub rotation_duration_s: f64,
    /// Seconds between power readings during a scan.
    pub measurement_time_s: f64,
    pub speed_pct: u8,
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self { rotation_duration_s: 1.0, measurement_time_s: 0.5, speed_pct: 15 }
    }
}

impl CalibrationProfile {
    pub fn validate(&self) -> Result<(), StoreError> {
        if !(self.rotation_duration_s.is_finite() && self.rotation_duration_s > 0.0) {
            return Err(StoreError::Invalid(format!("rotation_duration_s must be > 0, got {}", self.rotation_duration_s)));
        }
        if !(self.measurement_time_s.is_finite() && self.measurement_time_s > 0.0) {
            return Err(StoreError::Invalid(format!("measurement_time_s must be > 0, got {}", self.measurement_time_s)));
        }
        if self.speed_pct > 100 {
            return Err(StoreError::Invalid(format!("speed_pct must be 0..=100, got {}", self.speed_pct)));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid calibration: {0}")]
    Invalid(String),

    #[error("encode calibration: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("calibration store i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable home of the calibration profile.
pub trait CalibrationStore: Send + Sync {
    /// Defaults when nothing usable was saved before.
    fn load(&self) -> CalibrationProfile;

    /// All-or-nothing: on error the previous profile stays on disk.
    fn save(&self, profile: &CalibrationProfile) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredFile {
    saved_unix_ms: Option<i64>,
    calibration: CalibrationProfile,
}

/// TOML file replaced atomically (temp file, fsync, rename).
pub struct TomlFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TomlFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()) }
    }

    fn read(&self) -> anyhow::Result<Option<CalibrationProfile>> {
        use anyhow::Context;

        if !self.path.exists() {
            return Ok(None);
        }
        let s = fs::read_to_string(&self.path)
            .with_context(|| format!("read calibration {}", self.path.display()))?;
        let stored: StoredFile = toml::from_str(&s).context("parse calibration toml")?;
        stored.calibration.validate()?;
        Ok(Some(stored.calibration))
    }
}

impl CalibrationStore for TomlFileStore {
    fn load(&self) -> CalibrationProfile {
        match self.read() {
            Ok(Some(p)) => {
                info!("store: loaded calibration from {}", self.path.display());
                p
            }
            Ok(None) => {
                info!("store: no calibration at {}; using defaults", self.path.display());
                CalibrationProfile::default()
            }
            Err(e) => {
                warn!("store: ignoring unusable calibration: {:#}", e);
                CalibrationProfile::default()
            }
        }
    }

    fn save(&self, profile: &CalibrationProfile) -> Result<(), StoreError> {
        profile.validate()?;
        let body = toml::to_string_pretty(&StoredFile {
            saved_unix_ms: Some((time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64),
            calibration: *profile,
        })?;

        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(p) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(p)?;
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(body.as_bytes())?;
            f.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, &self.path) {
            fs::remove_file(&tmp).ok();
            return Err(e.into());
        }
        info!("store: saved calibration to {}", self.path.display());
        Ok(())
    }
}

/// Volatile store for simulation and tests. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    saved: Option<CalibrationProfile>,
    fail_saves: bool,
    saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(profile: CalibrationProfile) -> Self {
        let s = Self::default();
        s.lock().saved = Some(profile);
        s
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Make every following save fail with an i/o error.
    pub fn fail_saves(&self, fail: bool) {
        self.lock().fail_saves = fail;
    }

    pub fn saved(&self) -> Option<CalibrationProfile> {
        self.lock().saved
    }

    pub fn save_count(&self) -> usize {
        self.lock().saves
    }
}

impl CalibrationStore for MemoryStore {
    fn load(&self) -> CalibrationProfile {
        self.lock().saved.unwrap_or_default()
    }

    fn save(&self, profile: &CalibrationProfile) -> Result<(), StoreError> {
        profile.validate()?;
        let mut inner = self.lock();
        if inner.fail_saves {
            return Err(StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")));
        }
        inner.saved = Some(*profile);
        inner.saves += 1;
        Ok(())
    }
}
