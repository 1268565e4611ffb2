pub mod doctor;
pub mod power;
pub mod rtl;
pub mod sim;

use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RadioConfig {
    /// Watched frequency, e.g. a 433 MHz ISM beacon.
    #[serde(default = "default_frequency_mhz")]
    pub frequency_mhz: f64,
    #[serde(default = "default_sample_rate_hz")]
    pub sample_rate_hz: u32,
    /// Tuner gain in dB; unset means automatic gain.
    pub gain_db: Option<f64>,
    #[serde(default)]
    pub device_index: u32,
    /// IQ pairs averaged into one power reading.
    #[serde(default = "default_samples_per_reading")]
    pub samples_per_reading: usize,
    #[serde(default = "default_rtl_sdr_bin")]
    pub rtl_sdr_bin: String,
    /// Give up on a reading that takes longer than this.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_frequency_mhz() -> f64 { 433.4 }
fn default_sample_rate_hz() -> u32 { 1_024_000 }
fn default_samples_per_reading() -> usize { 4096 }
fn default_rtl_sdr_bin() -> String { "rtl_sdr".into() }
fn default_read_timeout_ms() -> u64 { 2000 }

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            frequency_mhz: default_frequency_mhz(),
            sample_rate_hz: default_sample_rate_hz(),
            gain_db: None,
            device_index: 0,
            samples_per_reading: default_samples_per_reading(),
            rtl_sdr_bin: default_rtl_sdr_bin(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[error("sampler not open")]
    NotReady,

    #[error("start {bin}: {source}")]
    Spawn { bin: String, source: std::io::Error },

    #[error("no samples within {0}ms")]
    Timeout(u64),

    #[error("sample stream ended")]
    Ended,

    #[error("sampler i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Instantaneous received power.
///
/// Readings are relative dB, typically -120 (noise floor) to -40 (strong
/// signal); callers must not assume that range.
#[async_trait]
pub trait RadioSampler: Send {
    async fn open(&mut self) -> Result<(), SamplerError>;

    async fn sample(&mut self) -> Result<f64, SamplerError>;

    fn is_ready(&self) -> bool;

    async fn close(&mut self);
}
