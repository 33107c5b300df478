//! powerd - privileged power, clock, backup and update control for the
//! gateway's settings page.

use anyhow::Result;
use clap::Parser;
use powerd::config::{running_as_root, Config};
use powerd::server::{self, AppState};
use powerd::startup;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

#[derive(Parser)]
#[command(name = "powerd")]
#[command(about = "Power settings daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (overrides the standard locations)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address (overrides the config)
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging is set up before the config is read, so the config's own
    // warnings are visible; RUST_LOG wins over the debug flag.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, reload) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load(cli.config.as_deref());
    if let Some(listen) = cli.listen {
        config.daemon.listen_addr = listen;
    }
    if config.debug() && std::env::var_os("RUST_LOG").is_none() {
        reload.modify(|f| *f = EnvFilter::new("debug"))?;
    }

    info!("powerd v{} starting", env!("CARGO_PKG_VERSION"));
    if let Err(e) = server::require_root(running_as_root()) {
        error!("{}", e);
        return Err(e);
    }

    let state = Arc::new(AppState::from_config(config)?);
    startup::run(&state).await;
    server::run(state).await
}
