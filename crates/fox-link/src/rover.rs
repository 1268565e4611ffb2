use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::autodetect::{autodetect_rover, default_candidate_devs};
use crate::protocol::{classify_echo, Echo, Frame, Intent};
use crate::state::LinkStatus;
use crate::{LinkConfig, LinkError, SerialLink};

/// Any byte stream the rover can sit behind: a serial port, an rfcomm
/// device, or an in-memory pipe.
///
/// Must be `Sync`: link futures hold `&SerialRover` across awaits.
pub trait Port: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> Port for T {}

enum Endpoint {
    Device,
    Attached(Option<Box<dyn Port>>),
}

pub struct SerialRover {
    cfg: LinkConfig,
    endpoint: Endpoint,
    port: Option<BufReader<Box<dyn Port>>>,
    status: LinkStatus,
    // input may hold leftovers of a failed exchange
    dirty: bool,
}

impl SerialRover {
    pub fn new(cfg: LinkConfig) -> Self {
        Self {
            cfg,
            endpoint: Endpoint::Device,
            port: None,
            status: LinkStatus::default(),
            dirty: false,
        }
    }

    /// Rover behind an already-open stream.
    pub fn attached(port: impl Port + 'static, cfg: LinkConfig) -> Self {
        Self {
            cfg,
            endpoint: Endpoint::Attached(Some(Box::new(port))),
            port: None,
            status: LinkStatus::default(),
            dirty: false,
        }
    }

    pub fn status(&self) -> &LinkStatus {
        &self.status
    }

    async fn open_port(&mut self) -> Result<Box<dyn Port>, LinkError> {
        match &mut self.endpoint {
            Endpoint::Attached(slot) => slot.take().ok_or_else(|| LinkError::Open {
                dev: "attached stream".into(),
                reason: "stream already closed".into(),
            }),
            Endpoint::Device => {
                let dev = self.resolve_dev().await?;
                let stream = tokio_serial::new(&dev, self.cfg.baud)
                    .open_native_async()
                    .map_err(|e| LinkError::Open { dev: dev.clone(), reason: e.to_string() })?;
                info!("link: opened {} @ {}", dev, self.cfg.baud);
                self.status.port = Some(dev);
                self.status.baud = Some(self.cfg.baud);
                Ok(Box::new(stream))
            }
        }
    }

    async fn resolve_dev(&self) -> Result<String, LinkError> {
        if !self.cfg.autodetect {
            return self
                .cfg
                .serial_dev
                .clone()
                .filter(|d| !d.is_empty())
                .ok_or_else(|| LinkError::Open {
                    dev: "<unset>".into(),
                    reason: "link.serial_dev missing (autodetect=false)".into(),
                });
        }
        let devs = self.cfg.candidate_devs.clone().unwrap_or_else(default_candidate_devs);
        let res = autodetect_rover(devs, &self.cfg).await;
        res.chosen.ok_or_else(|| LinkError::Open {
            dev: "<autodetect>".into(),
            reason: format!("no rover answered on {} candidate ports", res.probes.len()),
        })
    }

    async fn drain(&mut self) {
        let Some(port) = self.port.as_mut() else { return };
        loop {
            match timeout(Duration::from_millis(20), port.fill_buf()).await {
                Ok(Ok(buf)) if !buf.is_empty() => {
                    let n = buf.len();
                    debug!("link: discarding {} stale bytes", n);
                    port.consume(n);
                }
                _ => break,
            }
        }
        self.dirty = false;
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<(), LinkError> {
        if self.port.is_none() {
            return Err(LinkError::NotConnected);
        }
        if self.dirty {
            self.drain().await;
        }
        let text = frame.encode();
        let Some(port) = self.port.as_mut() else { return Err(LinkError::NotConnected) };

        match exchange(port, frame, &text, &self.cfg).await {
            Ok(()) => {
                debug!("link: ack {}", text);
                self.status.on_ack(&text);
                Ok(())
            }
            Err(e) => {
                warn!("link: frame {} failed: {}", text, e);
                self.status.on_fault();
                self.dirty = true;
                if matches!(e, LinkError::Io(_) | LinkError::Closed) {
                    self.port = None;
                }
                Err(e)
            }
        }
    }
}

async fn exchange(
    port: &mut BufReader<Box<dyn Port>>,
    frame: &Frame,
    text: &str,
    cfg: &LinkConfig,
) -> Result<(), LinkError> {
    port.write_all(text.as_bytes()).await?;
    port.flush().await?;

    if !cfg.require_echo {
        tokio::time::sleep(Duration::from_millis(cfg.frame_gap_ms)).await;
        return Ok(());
    }

    let deadline = Instant::now() + Duration::from_millis(cfg.ack_timeout_ms);
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = timeout_at(deadline, port.read_until(b'\n', &mut line))
            .await
            .map_err(|_| LinkError::Timeout { frame: text.to_string(), timeout_ms: cfg.ack_timeout_ms })??;
        if n == 0 {
            return Err(LinkError::Closed);
        }
        match classify_echo(frame, &String::from_utf8_lossy(&line)) {
            Echo::Match => return Ok(()),
            Echo::Chatter => continue,
            Echo::Garbled(got) => {
                return Err(LinkError::Malformed { frame: text.to_string(), got });
            }
        }
    }
}

#[async_trait]
impl SerialLink for SerialRover {
    async fn connect(&mut self) -> Result<(), LinkError> {
        if self.port.is_none() {
            let port = self.open_port().await?;
            self.port = Some(BufReader::new(port));
        }
        tokio::time::sleep(Duration::from_millis(self.cfg.settle_ms)).await;
        self.drain().await;
        self.write_frame(&Frame::halt()).await?;
        info!("link: rover answered handshake");
        Ok(())
    }

    async fn send(&mut self, intent: Intent, speed_pct: u8) -> Result<(), LinkError> {
        self.write_frame(&Frame::motion(intent, speed_pct)).await
    }

    async fn set_speed(&mut self, speed_pct: u8) -> Result<(), LinkError> {
        self.write_frame(&Frame::speed(speed_pct)).await
    }

    fn is_healthy(&self) -> bool {
        self.port.is_some() && self.status.connected
    }

    async fn disconnect(&mut self) {
        if self.port.is_some() {
            if let Err(e) = self.write_frame(&Frame::halt()).await {
                warn!("link: stop before disconnect failed: {}", e);
            }
        }
        self.port = None;
        self.status.connected = false;
        info!("link: disconnected");
    }
}
