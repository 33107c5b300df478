//! HTTP server for powerd

use crate::backup::BackupManager;
use crate::clock::ClockControl;
use crate::config::Config;
use crate::mqtt::MqttControl;
use crate::power::PowerControl;
use crate::registry::OperationRegistry;
use crate::routes;
use crate::telemetry::Telemetry;
use crate::update::{HttpScriptFetcher, ScriptFetcher, UpdateOrchestrator, UpdateSources};
use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::Router;
use power_common::{
    CommandRunner, HostCommandRunner, Layout, MarkerStore, ProcessProbe, ProcessTable,
    SysinfoProcessTable,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Restore uploads arrive base64-encoded in the body
pub const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

/// Application state shared across handlers
pub struct AppState {
    pub config: Config,
    pub layout: Layout,
    pub registry: OperationRegistry,
    pub backups: BackupManager,
    pub updates: UpdateOrchestrator,
    pub clock: ClockControl,
    pub power: PowerControl,
    pub telemetry: Telemetry,
    pub mqtt: MqttControl,
    pub start_time: Instant,
}

impl AppState {
    /// Wire everything up over the given system seams.
    pub fn new(
        config: Config,
        runner: Arc<dyn CommandRunner>,
        table: Arc<dyn ProcessTable>,
        fetcher: Arc<dyn ScriptFetcher>,
    ) -> Self {
        let layout = config.paths.clone();
        let probe = ProcessProbe::new(table, config.probe_timeout());
        let registry = OperationRegistry::new(MarkerStore::new(&layout.boot_dir), probe);
        let sources = UpdateSources {
            system_update_url: config.update.system_update_url.clone(),
            live_update_url: config.update.live_update_url.clone(),
        };

        Self {
            backups: BackupManager::new(layout.clone(), registry.clone()),
            updates: UpdateOrchestrator::new(
                registry.clone(),
                Arc::clone(&runner),
                fetcher,
                layout.clone(),
                sources,
                config.reboot_grace(),
            ),
            clock: ClockControl::new(Arc::clone(&runner), registry.clone()),
            power: PowerControl::new(Arc::clone(&runner)),
            telemetry: Telemetry::new(
                Arc::clone(&runner),
                registry.clone(),
                layout.files_check_script.clone(),
            ),
            mqtt: MqttControl::new(runner, layout.mosquitto_conf.clone()),
            registry,
            layout,
            config,
            start_time: Instant::now(),
        }
    }

    /// State backed by the real host. Markers, the boot action slot and
    /// mosquitto.conf are written in process, so this needs root.
    pub fn from_config(config: Config) -> Result<Self> {
        let runner = HostCommandRunner::new(
            config.daemon.privilege_wrapper.clone(),
            config.command_timeout(),
        );
        let fetcher =
            HttpScriptFetcher::new(Duration::from_secs(config.update.fetch_timeout_secs))
                .context("update script fetcher")?;
        Ok(Self::new(
            config,
            Arc::new(runner),
            Arc::new(SysinfoProcessTable),
            Arc::new(fetcher),
        ))
    }
}

/// The daemon writes the boot partition itself; only commands go through the
/// privilege wrapper.
pub fn require_root(is_root: bool) -> Result<()> {
    if !is_root {
        anyhow::bail!("powerd must run as root: it writes /boot and mosquitto.conf directly");
    }
    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::status_routes())
        .merge(routes::clock_routes())
        .merge(routes::power_routes())
        .merge(routes::ajax_routes())
        .merge(routes::restore_routes())
        .fallback(routes::not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server until SIGINT or SIGTERM, then unload.
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let addr = state.config.daemon.listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    unload(&state).await;
    info!("Stopped after {}s", state.start_time.elapsed().as_secs());
    Ok(())
}

/// Leave the system as a stopped add-on should: network time on, no
/// backup download exposed.
pub async fn unload(state: &AppState) {
    if let Err(e) = state.clock.set_ntp(true).await {
        warn!("Could not turn network time back on: {}", e);
    }
    if let Err(e) = state.backups.unlink_download_dir() {
        warn!("Could not remove backup download link: {}", e);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler failed: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler failed: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutting down gracefully");
}
