//! Isle server binary.
//!
//! Starts an axum HTTP server with structured logging, database
//! initialization, the bus connection, replica listeners and the outbox
//! relay, and shuts all of them down on SIGTERM/SIGINT.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use isle_bus::{ListenerConfig, ListenerStats, MessageBus, NatsBus, Publisher};
use isle_graph::IslandService;
use isle_server::{app, background, config, AppState};
use isle_types::DeliveryMode;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("ISLE_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let pool = isle_db::create_pool(
        &config.database.path,
        isle_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
            ..Default::default()
        },
    )
    .expect("failed to create database pool, check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied = isle_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    let bus: Arc<dyn MessageBus> = Arc::new(
        NatsBus::connect(&config.bus.url, &config.bus.stream)
            .await
            .expect("failed to connect to the event bus, check bus.url in config"),
    );
    tracing::info!(url = %config.bus.url, stream = %config.bus.stream, "connected to event bus");

    let mode = config.bus.delivery_mode;
    let islands = IslandService::new(pool.clone(), Publisher::new(bus.clone()), mode);
    let listener_stats = Arc::new(ListenerStats::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();
    if config.service.replicate {
        tasks.extend(background::spawn_replica_listeners(
            bus.clone(),
            pool.clone(),
            &config.service.name,
            ListenerConfig {
                max_deliveries: config.bus.max_deliveries,
                ..ListenerConfig::default()
            },
            listener_stats.clone(),
            shutdown_rx.clone(),
        ));
    }
    if mode == DeliveryMode::Outbox {
        tasks.push(background::spawn_outbox_relay(
            islands.relay().clone(),
            Duration::from_millis(config.bus.relay_interval_ms),
            shutdown_rx.clone(),
        ));
    }

    let state = AppState {
        pool,
        islands,
        service_name: config.service.name.clone(),
        listener_stats,
    };

    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, service = %config.service.name, ?mode, "starting isle server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address, is another process using this port?");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }

    tracing::info!("isle server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
