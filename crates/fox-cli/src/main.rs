mod api;
mod rig;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};

use fox_link::autodetect::{autodetect_rover, default_candidate_devs};
use fox_link::rover::SerialRover;
use fox_link::{LinkConfig, SerialLink};
use fox_radio::rtl::RtlSdrSampler;
use fox_radio::{RadioConfig, RadioSampler};
use fox_scan::ScanConfig;
use fox_store::{CalibrationStore, TomlFileStore};

use rig::SimulationConfig;

#[derive(Debug, Parser)]
#[command(name = "foxhunt", version, about = "foxhunt - rover-mounted radio direction finding")]
struct Cli {
    #[arg(long, default_value = "foxhunt.toml")]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and the saved calibration.
    Doctor,
    /// Run the HTTP API (and the dashboard, if server.web_dir is set).
    Serve,
    Link { #[command(subcommand)] cmd: LinkCmd },
    Radio { #[command(subcommand)] cmd: RadioCmd },
}

#[derive(Debug, Subcommand)]
enum LinkCmd {
    /// Probe serial ports for rover firmware that echoes a stop frame.
    Autodetect,
    /// Connect, handshake and print link status.
    Ping,
}

#[derive(Debug, Subcommand)]
enum RadioCmd {
    /// Take a few power readings and print them.
    Probe {
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    #[serde(default)]
    server: ServerCfg,
    #[serde(default)]
    link: LinkConfig,
    #[serde(default)]
    radio: RadioConfig,
    #[serde(default)]
    store: StoreCfg,
    #[serde(default)]
    scan: ScanConfig,

    simulation: Option<SimulationConfig>,
}

#[derive(Debug, serde::Deserialize)]
struct ServerCfg {
    #[serde(default = "default_bind")]
    bind: String,
    /// Dashboard files served at `/`.
    web_dir: Option<PathBuf>,
    /// Run init_drivers once at startup.
    #[serde(default)]
    init_on_start: bool,
}

fn default_bind() -> String { "0.0.0.0:5000".into() }

impl Default for ServerCfg {
    fn default() -> Self {
        Self { bind: default_bind(), web_dir: None, init_on_start: false }
    }
}

#[derive(Debug, serde::Deserialize)]
struct StoreCfg {
    #[serde(default = "default_store_path")]
    path: PathBuf,
}

fn default_store_path() -> PathBuf { "foxhunt-calibration.toml".into() }

impl Default for StoreCfg {
    fn default() -> Self {
        Self { path: default_store_path() }
    }
}

impl Config {
    fn simulated(&self) -> bool {
        self.simulation.as_ref().is_some_and(|s| s.enable)
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg).await?,
        Command::Serve => serve(&cfg).await?,
        Command::Link { cmd } => link_cmd(&cfg, cmd).await?,
        Command::Radio { cmd } => radio_cmd(&cfg, cmd).await?,
    }
    Ok(())
}

async fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    if cfg.simulated() {
        info!("doctor: simulation enabled; skipping rover and radio checks");
    } else {
        fox_link::doctor::check_link(&cfg.link)?;
        fox_radio::doctor::check_radio(&cfg.radio)?;
        fox_radio::doctor::check_tool(&cfg.radio.rtl_sdr_bin).or_else(|e| {
            warn!("doctor: {:#}", e);
            Ok::<(), anyhow::Error>(())
        })?;
    }

    cfg.server
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("server.bind invalid: {}", cfg.server.bind))?;
    if let Some(dir) = &cfg.server.web_dir {
        anyhow::ensure!(dir.is_dir(), "server.web_dir not a directory: {}", dir.display());
    }

    fox_store::doctor::check_store(&cfg.store.path)?;
    fox_scan::doctor::check_scan(&cfg.scan)?;
    let profile = TomlFileStore::new(&cfg.store.path).load();
    fox_scan::doctor::check_profile(&profile).or_else(|e| {
        warn!("doctor: calibration looks off: {:#}", e);
        Ok::<(), anyhow::Error>(())
    })?;

    info!("doctor: OK");
    Ok(())
}

async fn serve(cfg: &Config) -> Result<()> {
    let addr: SocketAddr = cfg
        .server
        .bind
        .parse()
        .with_context(|| format!("server.bind invalid: {}", cfg.server.bind))?;

    let ctl = rig::build_controller(
        &cfg.link,
        &cfg.radio,
        &cfg.scan,
        &cfg.store.path,
        cfg.simulation.as_ref(),
    );
    if cfg.server.init_on_start {
        if let Err(e) = ctl.init_drivers().await {
            warn!("serve: startup init failed ({}); dashboard can retry", e);
        }
    }

    let routes = api::routes(ctl.clone(), cfg.server.web_dir.clone());
    let (bound, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("serve: ctrl-c handler failed: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .context("bind http server")?;
    info!("serve: listening on http://{}", bound);
    server.await;

    info!("serve: shutting down");
    ctl.shutdown().await;
    Ok(())
}

async fn link_cmd(cfg: &Config, cmd: LinkCmd) -> Result<()> {
    match cmd {
        LinkCmd::Autodetect => {
            let devs = cfg.link.candidate_devs.clone().unwrap_or_else(default_candidate_devs);
            let res = autodetect_rover(devs, &cfg.link).await;
            match &res.chosen {
                Some(dev) => println!("CHOSEN: {} @ {}", dev, cfg.link.baud),
                None => println!("CHOSEN: none"),
            }
            for p in res.probes {
                println!("probe dev={} baud={} echo={} {}ms note={}", p.dev, p.baud, p.answered, p.elapsed_ms, p.note);
            }
            Ok(())
        }
        LinkCmd::Ping => {
            let mut rover = SerialRover::new(cfg.link.clone());
            rover.connect().await.context("connect rover")?;
            let st = rover.status().clone();
            rover.disconnect().await;
            println!("connected={}", st.connected);
            println!("port={:?} baud={:?}", st.port, st.baud);
            println!("last_ack_age={:?}", st.ack_age());
            println!("last_frame={:?}", st.last_frame);
            println!("faults={}", st.faults);
            Ok(())
        }
    }
}

async fn radio_cmd(cfg: &Config, cmd: RadioCmd) -> Result<()> {
    match cmd {
        RadioCmd::Probe { count } => {
            let mut sampler = RtlSdrSampler::new(cfg.radio.clone());
            sampler.open().await.context("open radio")?;
            for n in 0..count {
                match sampler.sample().await {
                    Ok(db) => println!("reading {}: {:.2} dB", n + 1, db),
                    Err(e) => {
                        sampler.close().await;
                        return Err(e).context("read radio");
                    }
                }
            }
            sampler.close().await;
            Ok(())
        }
    }
}
