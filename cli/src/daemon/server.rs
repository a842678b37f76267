// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon HTTP server implementation

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info, warn};

use lodge_core::{
    application::{
        IdmapAllocator, InstanceService, MigrationController, MigrationSettings, OperationRegistry,
        TransportSet,
    },
    domain::node_config::DaemonConfigManifest,
    infrastructure::{
        event_bus::{EventBus, EventBusError},
        host_idmap::discover_host_pool,
        process::HostExecRunner,
        repositories::instance_repository,
        rsync::RsyncTransport,
        websocket::WebsocketDialer,
    },
    presentation::api::{app, AppState},
};

use super::{remove_pid_file, write_pid_file};

pub async fn start_daemon(config_path: Option<PathBuf>, port: Option<u16>) -> Result<()> {
    let mut config = DaemonConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;
    if let Some(port) = port {
        config.spec.server.port = port;
    }
    config
        .validate()
        .context("Configuration validation failed")?;

    let pid = std::process::id();
    write_pid_file(pid)?;
    let _guard = PidFileGuard;

    info!("Lodge daemon starting (PID: {}, host: {})", pid, config.metadata.name);

    install_metrics(&config)?;

    let spec = &config.spec;
    let events = EventBus::with_default_capacity();
    spawn_event_logger(&events);
    let registry = OperationRegistry::with_pending_timeout(
        events,
        spec.operations.retention(),
        spec.operations.pending_timeout(),
    );

    let allocator = Arc::new(IdmapAllocator::new(discover_host_pool(&spec.idmap)));

    let instances_dir = spec.storage.instances_dir.clone();
    tokio::fs::create_dir_all(&instances_dir)
        .await
        .with_context(|| format!("Failed to create instances directory {:?}", instances_dir))?;
    let repo = instance_repository(&spec.storage.repository_backend(), &instances_dir);

    if which::which(&spec.migration.rsync_binary).is_err() {
        warn!(
            "rsync binary '{}' not found; migrations will fail",
            spec.migration.rsync_binary
        );
    }
    let netcat_exe = std::env::current_exe().context("Failed to get current executable path")?;
    let rsync = RsyncTransport::new(spec.migration.rsync_binary.clone(), netcat_exe)
        .with_bwlimit(spec.migration.bwlimit.clone());
    let controller = MigrationController::new(
        MigrationSettings::from(&spec.migration),
        TransportSet::new(Arc::new(rsync)),
        Arc::new(WebsocketDialer::new()),
    );

    let instances = Arc::new(InstanceService::new(
        repo,
        allocator,
        registry.clone(),
        Arc::new(controller),
        Arc::new(HostExecRunner::new()),
        instances_dir,
    ));
    let restored = instances
        .restore_reservations()
        .await
        .context("Failed to load instances")?;
    info!("Restored {} isolated id reservations", restored);

    let state = AppState {
        registry: registry.clone(),
        instances,
        default_wait: spec.operations.default_wait(),
        start_time: Instant::now(),
    };
    let router = app(Arc::new(state));

    let addr = format!("{}:{}", spec.server.bind_address, spec.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Daemon listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Daemon shutting down, cancelling outstanding operations");
    registry.shutdown().await;

    Ok(())
}

fn install_metrics(config: &DaemonConfigManifest) -> Result<()> {
    let Some(metrics) = config
        .spec
        .observability
        .as_ref()
        .and_then(|o| o.metrics.as_ref())
        .filter(|m| m.enabled)
    else {
        return Ok(());
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], metrics.port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    metrics::describe_counter!("lodge_operations_created_total", "Operations created, by class");
    metrics::describe_counter!("lodge_operations_finished_total", "Operations reaching a final status");
    metrics::describe_counter!("lodge_idmap_allocations_total", "Idmap allocation attempts, by result");
    metrics::describe_counter!("lodge_remap_files_changed_total", "Files whose ownership was rewritten");

    info!("Prometheus metrics exposed on {}", addr);
    Ok(())
}

fn spawn_event_logger(events: &EventBus) {
    let mut receiver = events.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => debug!(?event, "Domain event"),
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
}

struct PidFileGuard;

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let _ = remove_pid_file();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
