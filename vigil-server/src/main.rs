//! Service entrypoint.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::reload;

use vigil_server::api;
use vigil_server::config::ServerConfig;
use vigil_server::log::{self, LogControl};
use vigil_server::secrets::Secrets;
use vigil_server::state::ApiState;
use vigil_server::upstream::spawn_map_bootstrap;

/// Cluster status aggregation service.
#[derive(Parser)]
#[command(name = "vigil", version, about)]
struct Cli {
    /// Listen port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Base URL of the management platform API.
    #[arg(long)]
    upstream_url: Option<String>,

    /// Path to the secrets file.
    #[arg(long)]
    secrets: Option<PathBuf>,

    /// Log level (DEBUG, INFO, WARNING, ERROR or CRITICAL); overrides
    /// STATUS_LOG_LEVEL / LOG_LEVEL.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::default();
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(url) = cli.upstream_url {
        config.upstream.url = url;
    }
    if let Some(path) = cli.secrets {
        config.server.secrets_path = path.display().to_string();
    }

    let (mut filter, mut level_name) = log::level_from_env();
    if let Some(flag) = cli.log_level.as_deref() {
        match log::decode_level(flag) {
            Some((f, name)) => {
                filter = f;
                level_name = name;
            }
            None => bail!("unknown log level '{flag}'"),
        }
    }
    let (filter_layer, reload_handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    let log_control = Arc::new(LogControl::new(level_name, reload_handle));

    let secrets = Secrets::load(Path::new(&config.server.secrets_path))?;
    let state = ApiState::build(&config, secrets, log_control)?;

    // Pull the topology until the platform answers; it also pushes fresh
    // maps on every change, so one successful pull is enough.
    spawn_map_bootstrap(
        Arc::clone(&state.upstream),
        state.sources.topology.clone(),
        config.upstream.reload_interval(),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("listening on {addr}");
    axum::serve(listener, api::build_router(state))
        .await
        .context("serving HTTP")?;
    Ok(())
}
