//! Background tasks for an isle service.
//!
//! Includes:
//! - One replica listener per subscription set the service shadows.
//! - The periodic outbox relay (outbox delivery mode only).

use std::sync::Arc;
use std::time::Duration;

use isle_bus::{
    run_listener, start_outbox_relay, DeadLetterSink, ListenerConfig, ListenerStats, MessageBus,
    OutboxRelay,
};
use isle_db::DbPool;
use isle_replica::{replica_handlers, SqliteDeadLetterStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Spawns the replica listeners of `service`.
///
/// Each listener runs until `shutdown` flips to `true`. A listener whose
/// subscription fails is logged and not restarted.
pub fn spawn_replica_listeners(
    bus: Arc<dyn MessageBus>,
    pool: DbPool,
    service: &str,
    config: ListenerConfig,
    stats: Arc<ListenerStats>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let dead_letters: Arc<dyn DeadLetterSink> = Arc::new(SqliteDeadLetterStore::new(pool.clone()));
    let handlers = replica_handlers(&pool, service);

    tracing::info!(service, listeners = handlers.len(), "starting replica listeners");

    handlers
        .into_iter()
        .map(|handler| {
            let bus = bus.clone();
            let dead_letters = dead_letters.clone();
            let stats = stats.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let subjects = handler.subjects().to_vec();
                if let Err(e) = run_listener(bus, handler, dead_letters, config, stats, shutdown).await
                {
                    tracing::error!(?subjects, error = %e, "replica listener exited");
                }
            })
        })
        .collect()
}

/// Spawns the outbox relay loop, stopping it on shutdown.
pub fn spawn_outbox_relay(
    relay: OutboxRelay,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            () = start_outbox_relay(relay.clone(), interval) => {}
            () = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                // Flush what the last requests left behind.
                if let Err(e) = relay.relay_pending().await {
                    tracing::warn!(error = %e, "final outbox relay pass failed");
                }
                tracing::info!("outbox relay stopped");
            }
        }
    })
}
