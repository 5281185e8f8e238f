use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use camrelay::config::MediaConfig;
use camrelay::logging::{JsonLinesSink, LogConfig, SinkLayer};
use camrelay::{Config, ControlService, OnvifCamera, Relay, SessionManager};
use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Config file picked up from the working directory when `--config` is absent.
const DEFAULT_CONFIG_FILE: &str = "camrelay.toml";

#[derive(Debug, Parser)]
#[command(
    name = "camrelay-server",
    version,
    about = "Relay ONVIF camera streams to RTP destinations over a gRPC control endpoint"
)]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, short, env = "CAMRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address (host:port), overrides `server.bind`
    #[arg(long, short, env = "CAMRELAY_BIND")]
    bind: Option<String>,

    /// Log filter, overrides `logging.level` (RUST_LOG still wins)
    #[arg(long, env = "CAMRELAY_LOG_LEVEL")]
    log_level: Option<String>,

    /// JSON-lines file receiving INFO/WARNING/ERROR records
    #[arg(long, env = "CAMRELAY_LOG_SINK")]
    log_sink: Option<PathBuf>,

    /// JSON console output
    #[arg(long)]
    json_logs: bool,
}

/// File configuration with command-line overrides applied.
fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            Config::load(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => Config::default(),
    };

    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(path) = &args.log_sink {
        config.logging.sink_path = Some(path.clone());
    }
    if args.json_logs {
        config.logging.json = true;
    }
    Ok(config)
}

fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("invalid log filter {:?}", config.level))?;

    let console = if config.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().compact().with_target(false).boxed()
    };

    let sink = match &config.sink_path {
        Some(path) => {
            let sink = JsonLinesSink::open(path)
                .with_context(|| format!("failed to open log sink {}", path.display()))?;
            Some(SinkLayer::new(Arc::new(sink)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(sink)
        .init();
    Ok(())
}

#[cfg(feature = "ffmpeg")]
fn relay_engine(media: &MediaConfig) -> anyhow::Result<Arc<dyn Relay>> {
    use camrelay::RelayEngine;
    use camrelay::relay::ffmpeg::FfmpegBackend;

    let backend = FfmpegBackend::new(media.io_timeout, media.rtsp_transport.clone())
        .context("failed to initialize FFmpeg")?;
    Ok(Arc::new(RelayEngine::new(backend).with_mapping(media.mapping)))
}

#[cfg(not(feature = "ffmpeg"))]
fn relay_engine(_media: &MediaConfig) -> anyhow::Result<Arc<dyn Relay>> {
    anyhow::bail!("no media backend: rebuild camrelay-server with `--features ffmpeg`")
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config.logging)?;

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {:?}", config.server.bind))?;

    let camera = OnvifCamera::new(config.camera.clone()).context("failed to build ONVIF client")?;
    let relay = relay_engine(&config.media)?;
    let sessions = Arc::new(
        SessionManager::new(Arc::new(camera), relay, config.sessions.clone())
            .with_profile_token(config.camera.profile_token.clone()),
    );
    tracing::info!(
        max_sessions = ?config.sessions.max_sessions,
        mapping = ?config.media.mapping,
        profile_token = %config.camera.profile_token,
        "session manager ready"
    );

    // The blocking ONVIF client must not be dropped inside the async
    // runtime; `sessions` keeps it alive until the runtime is gone.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let served = runtime.block_on(camrelay_grpc::serve(
        addr,
        ControlService::new(sessions.clone()),
        async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown requested");
        },
    ));
    drop(runtime);

    let lingering = sessions.shutdown();
    if lingering > 0 {
        tracing::warn!(lingering, "exiting with sessions still running");
    }
    served.with_context(|| format!("gRPC server on {addr} failed"))?;
    tracing::info!("stopped");
    Ok(())
}
