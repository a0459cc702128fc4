use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use camwatch::{build_source, load_detector, AppConfig, AppContext};
use camwatch_server::{start_server, AppState, ServerConfig};

/// Streams annotated object-detection video from network cameras.
#[derive(Parser, Debug)]
#[command(name = "camwatch", version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "CAMWATCH_CONFIG", default_value = "camwatch.toml")]
    config: PathBuf,

    /// Overrides `[server] bind_addr`.
    #[arg(long, env = "CAMWATCH_BIND")]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = AppConfig::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    info!(config = %args.config.display(), cameras = config.cameras.len(), "configuration loaded");

    let server_cfg = ServerConfig {
        bind_addr: config.server.bind_addr.clone(),
    };
    let model = config.model.clone();
    let source = build_source(&config.source)?;
    let context = AppContext::from_config(config).context("failed to load class table")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pipelines = context
        .spawn_pipelines(
            source,
            |camera| {
                info!(camera_id = camera.id, weights = %model.weights_path.display(), "loading detection model");
                load_detector(&model)
            },
            shutdown_rx.clone(),
        )
        .context("failed to load detection model")?;

    let state = AppState::new(context.broadcaster().clone(), pipelines.states(), shutdown_rx);
    let server = start_server(state, server_cfg).await?;

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown requested");
    shutdown_tx.send_replace(true);

    pipelines.join().await;
    server.await.context("server task panicked")?;
    info!("camwatch stopped");
    Ok(())
}
