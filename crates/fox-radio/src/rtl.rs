use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::power::iq_power_db;
use crate::{RadioConfig, RadioSampler, SamplerError};

/// IQ pairs thrown away after start-up while the tuner gain settles.
const SETTLE_PAIRS: usize = 256;

/// RTL-SDR dongle read through the stock `rtl_sdr` tool.
///
/// `rtl_sdr ... -` streams raw unsigned 8-bit interleaved IQ to stdout; one
/// long-lived child is kept per open sampler and each reading pulls the next
/// `samples_per_reading` pairs. Going through the tool keeps librtlsdr out of
/// the build.
pub struct RtlSdrSampler {
    cfg: RadioConfig,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    buf: Vec<u8>,
}

impl RtlSdrSampler {
    pub fn new(cfg: RadioConfig) -> Self {
        let buf = vec![0u8; cfg.samples_per_reading.max(1) * 2];
        Self { cfg, child: None, stdout: None, buf }
    }

    async fn read_block(&mut self, len: usize) -> Result<(), SamplerError> {
        let stdout = self.stdout.as_mut().ok_or(SamplerError::NotReady)?;
        let timeout_ms = self.cfg.read_timeout_ms;
        let res = tokio::time::timeout(Duration::from_millis(timeout_ms), stdout.read_exact(&mut self.buf[..len]))
            .await
            .map_err(|_| SamplerError::Timeout(timeout_ms))?;
        match res {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(SamplerError::Ended),
            Err(e) => Err(e.into()),
        }
    }

    async fn fail(&mut self, e: SamplerError) -> SamplerError {
        warn!("radio: {} ({}); closing", e, self.cfg.rtl_sdr_bin);
        self.close().await;
        e
    }
}

pub fn rtl_sdr_args(cfg: &RadioConfig) -> Vec<String> {
    let mut args = vec![
        "-f".to_string(),
        format!("{:.0}", cfg.frequency_mhz * 1e6),
        "-s".to_string(),
        cfg.sample_rate_hz.to_string(),
        "-d".to_string(),
        cfg.device_index.to_string(),
    ];
    if let Some(gain) = cfg.gain_db {
        args.push("-g".to_string());
        args.push(format!("{:.1}", gain));
    }
    args.push("-".to_string());
    args
}

#[async_trait]
impl RadioSampler for RtlSdrSampler {
    async fn open(&mut self) -> Result<(), SamplerError> {
        if self.child.is_some() {
            return Ok(());
        }
        let args = rtl_sdr_args(&self.cfg);
        debug!("radio: {} {}", self.cfg.rtl_sdr_bin, args.join(" "));
        let mut child = Command::new(&self.cfg.rtl_sdr_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SamplerError::Spawn { bin: self.cfg.rtl_sdr_bin.clone(), source })?;

        self.stdout = child.stdout.take();
        self.child = Some(child);

        let settle = (SETTLE_PAIRS * 2).min(self.buf.len());
        if let Err(e) = self.read_block(settle).await {
            return Err(self.fail(e).await);
        }
        info!(
            "radio: watching {:.3} MHz @ {} S/s (gain {})",
            self.cfg.frequency_mhz,
            self.cfg.sample_rate_hz,
            self.cfg.gain_db.map(|g| format!("{:.1} dB", g)).unwrap_or_else(|| "auto".into())
        );
        Ok(())
    }

    async fn sample(&mut self) -> Result<f64, SamplerError> {
        let len = self.buf.len();
        match self.read_block(len).await {
            Ok(()) => Ok(iq_power_db(&self.buf)),
            Err(SamplerError::NotReady) => Err(SamplerError::NotReady),
            Err(e) => Err(self.fail(e).await),
        }
    }

    fn is_ready(&self) -> bool {
        self.stdout.is_some()
    }

    async fn close(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!("radio: kill {}: {}", self.cfg.rtl_sdr_bin, e);
            }
        }
    }
}
