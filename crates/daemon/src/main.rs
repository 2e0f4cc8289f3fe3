// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Registry Contributors

// Tunnel Registry - Daemon
// Keeps provider tunnels alive and their public URLs in a durable registry

mod api;
mod auth;
mod config;
mod pidfile;
mod provider;
mod reconcile;
mod service;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunnel_registry_common::{Protocol, ReconcileReport, RegistryStore, TunnelEvent};

use api::{create_router, AppState};
use config::DaemonConfig;
use provider::{build_provider, close_quietly, Gateway, Listener, ListenerSpec};
use service::TunnelService;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tunnel_registry_daemon=debug,tunnel_registry_common=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Tunnel Registry Daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        "Build: {} ({})",
        option_env!("BUILD_DATE").unwrap_or("unknown"),
        option_env!("GIT_HASH").unwrap_or("unknown")
    );

    let _pid_guard = pidfile::PidFileGuard::create()
        .context("Failed to create PID file - another daemon may already be running")?;

    let daemon_config = DaemonConfig::load()?;
    info!("Registry file: {}", daemon_config.registry_path.display());
    info!("Provider: {}", daemon_config.provider);
    info!("Authentication required: {}", daemon_config.require_auth);

    let auth_token = if daemon_config.require_auth {
        let (token, was_new) = auth::load_or_generate_token(&daemon_config.auth_token_path)?;
        if was_new {
            config::write_cli_config_snippet(&daemon_config.bind_address, Some(&token))?;
        }
        Some(token)
    } else {
        info!("Authentication disabled - API endpoints are publicly accessible");
        None
    };

    let provider = build_provider(&daemon_config.provider, &daemon_config.session_metadata)?;
    let gateway = Gateway::new(
        provider,
        daemon_config.connect_timeout(),
        daemon_config.open_timeout(),
    );
    let store = RegistryStore::new(
        daemon_config.registry_path.clone(),
        daemon_config.corrupt_state_policy,
    );
    let service = TunnelService::new(store, gateway);

    // Log events from here on, including those of the startup pass
    let mut event_rx = service.subscribe();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => log_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event logger skipped {} events", n)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // The API only starts once persisted tunnels are re-established
    let report = service
        .initialize()
        .await
        .context("Failed to restore tunnel registry")?;
    log_report(&report);
    info!("{} tunnel(s) live", service.live_urls().await.len());

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let state = Arc::new(AppState {
        service: service.clone(),
        shutdown_tx: shutdown_tx.clone(),
    });

    let app = if let Some(token) = auth_token {
        let auth_state = auth::AuthState::new(token);
        create_router(state).layer(axum::middleware::from_fn_with_state(
            auth_state,
            auth::auth_middleware,
        ))
    } else {
        create_router(state)
    };

    let listener = tokio::net::TcpListener::bind(&daemon_config.bind_address)
        .await
        .context(format!("Failed to bind to {}", daemon_config.bind_address))?;
    info!("Daemon listening on {}", daemon_config.bind_address);

    let api_listener = if daemon_config.expose_api {
        expose_api(&service, &daemon_config).await
    } else {
        None
    };

    info!("Daemon started successfully");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("HTTP server error")?;

    if let Some(listener) = api_listener {
        close_quietly(listener).await;
    }
    service.close_all().await;
    info!("All tunnels closed");

    info!("Daemon shut down");
    Ok(())
}

/// Publish the API through the provider; the listener is not registered
async fn expose_api(service: &TunnelService, config: &DaemonConfig) -> Option<Box<dyn Listener>> {
    let spec = ListenerSpec {
        protocol: Protocol::Http,
        forwards_to: config.bind_address.clone(),
        domain: None,
        metadata: Some(config.api_listener_metadata.clone()),
    };

    match service.gateway().open(&spec).await {
        Ok(listener) => {
            info!("API exposed publicly at {}", listener.url());
            Some(listener)
        }
        Err(e) => {
            error!("Failed to expose API through {}: {}", service.gateway().provider_name(), e);
            None
        }
    }
}

fn log_report(report: &ReconcileReport) {
    info!(
        "Startup reconciliation: {} unchanged, {} migrated, {} failed",
        report.unchanged.len(),
        report.migrated.len(),
        report.failed.len()
    );
    for migration in &report.migrated {
        info!("  {} -> {}", migration.from, migration.to);
    }
    for failure in &report.failed {
        warn!("  {} not restored: {}", failure.url, failure.error);
    }
}

fn log_event(event: &TunnelEvent) {
    match event {
        TunnelEvent::Created { entry } => info!("Tunnel event: created {}", entry.url),
        TunnelEvent::Deleted { url } => info!("Tunnel event: deleted {}", url),
        TunnelEvent::Migrated { from, to } => info!("Tunnel event: migrated {} -> {}", from, to),
        TunnelEvent::ReconcileFailed { url, error } => {
            warn!("Tunnel event: {} failed to reconcile: {}", url, error)
        }
        TunnelEvent::Heartbeat { .. } => {}
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    wait_for_shutdown().await;
    // Signal all SSE streams to close
    let _ = shutdown_tx.send(());
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down");
                    }
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down");
    }
}
