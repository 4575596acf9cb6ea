//! Transactional outbox.
//!
//! In outbox mode the owning service writes its events into the `outbox`
//! table inside the same transaction as the state change. A relay then
//! publishes pending rows in insertion order and marks them relayed. A row
//! is relayed at least once; a crash between publish and mark produces a
//! duplicate, which idempotent subscribers absorb.

use std::sync::Arc;
use std::time::Duration;

use isle_db::DbPool;
use isle_events::{Envelope, EnvelopeError, EventPayload, Subject};
use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use crate::publisher::Publisher;

/// Errors raised while writing or relaying the outbox.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("outbox task failed: {0}")]
    Join(String),
}

/// One row of the `outbox` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRow {
    pub id: i64,
    pub subject: String,
    pub delivery_token: String,
    pub envelope_json: String,
    pub attempts: i64,
    pub last_error: Option<String>,
}

/// Summary of one relay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub relayed: usize,
    /// `true` when the pass stopped at a row it could not publish.
    pub stalled: bool,
}

/// Writes `events` into the outbox using the caller's transaction.
///
/// Returns the envelopes in the order they will be relayed.
pub fn enqueue(conn: &Connection, events: &[EventPayload]) -> Result<Vec<Envelope>, OutboxError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO outbox (subject, delivery_token, envelope_json) VALUES (?1, ?2, ?3)",
    )?;

    let mut envelopes = Vec::with_capacity(events.len());
    for event in events {
        let envelope = Envelope::new(event.clone());
        let json = String::from_utf8_lossy(&envelope.encode()?).into_owned();
        stmt.execute(params![
            envelope.subject().as_str(),
            envelope.delivery_token(),
            json
        ])?;
        envelopes.push(envelope);
    }
    Ok(envelopes)
}

/// Returns up to `limit` unrelayed rows, oldest first.
pub fn pending(conn: &Connection, limit: usize) -> Result<Vec<OutboxRow>, OutboxError> {
    let mut stmt = conn.prepare(
        "SELECT id, subject, delivery_token, envelope_json, attempts, last_error
         FROM outbox
         WHERE relayed_at IS NULL
         ORDER BY id ASC
         LIMIT ?1",
    )?;

    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok(OutboxRow {
                id: row.get(0)?,
                subject: row.get(1)?,
                delivery_token: row.get(2)?,
                envelope_json: row.get(3)?,
                attempts: row.get(4)?,
                last_error: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Number of rows still waiting for the relay.
pub fn pending_count(conn: &Connection) -> Result<i64, OutboxError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM outbox WHERE relayed_at IS NULL",
        [],
        |row| row.get(0),
    )?)
}

pub fn mark_relayed(conn: &Connection, ids: &[i64]) -> Result<(), OutboxError> {
    let mut stmt = conn.prepare_cached(
        "UPDATE outbox SET relayed_at = datetime('now'), attempts = attempts + 1 WHERE id = ?1",
    )?;
    for id in ids {
        stmt.execute(params![id])?;
    }
    Ok(())
}

pub fn mark_failed(conn: &Connection, id: i64, error: &str) -> Result<(), OutboxError> {
    conn.execute(
        "UPDATE outbox SET attempts = attempts + 1, last_error = ?2 WHERE id = ?1",
        params![id, error],
    )?;
    Ok(())
}

/// Publishes pending outbox rows through a [`Publisher`].
///
/// Passes are serialised per relay so two concurrent triggers (a service
/// call and the background loop) cannot publish the same rows out of order.
#[derive(Clone)]
pub struct OutboxRelay {
    pool: DbPool,
    publisher: Publisher,
    batch_size: usize,
    gate: Arc<Mutex<()>>,
}

impl OutboxRelay {
    pub fn new(pool: DbPool, publisher: Publisher, batch_size: usize) -> Self {
        Self {
            pool,
            publisher,
            batch_size: batch_size.max(1),
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Relays pending rows until the outbox is drained or a publish fails.
    ///
    /// Stops at the first failure so rows keep their relative order; the
    /// failed row is retried by the next pass.
    pub async fn relay_pending(&self) -> Result<RelayReport, OutboxError> {
        let _guard = self.gate.lock().await;
        let mut report = RelayReport::default();

        loop {
            let pool = self.pool.clone();
            let limit = self.batch_size;
            let rows = tokio::task::spawn_blocking(move || {
                let conn = pool.get()?;
                pending(&conn, limit)
            })
            .await
            .map_err(|e| OutboxError::Join(e.to_string()))??;

            if rows.is_empty() {
                return Ok(report);
            }
            let fetched = rows.len();

            let mut relayed = Vec::with_capacity(rows.len());
            let mut failure: Option<(i64, String)> = None;
            for row in &rows {
                let result = match row.subject.parse::<Subject>() {
                    Ok(subject) => match Envelope::decode_for(subject, row.envelope_json.as_bytes())
                    {
                        Ok(envelope) => self
                            .publisher
                            .publish_envelope(&envelope)
                            .await
                            .map_err(|e| e.to_string()),
                        Err(e) => Err(e.to_string()),
                    },
                    Err(e) => Err(e.to_string()),
                };

                match result {
                    Ok(()) => relayed.push(row.id),
                    Err(e) => {
                        tracing::warn!(
                            outbox_id = row.id,
                            subject = %row.subject,
                            delivery_token = %row.delivery_token,
                            error = %e,
                            "outbox relay stalled"
                        );
                        failure = Some((row.id, e));
                        break;
                    }
                }
            }

            let pool = self.pool.clone();
            let done = relayed.clone();
            let failed = failure.clone();
            tokio::task::spawn_blocking(move || {
                let conn = pool.get()?;
                mark_relayed(&conn, &done)?;
                if let Some((id, error)) = failed {
                    mark_failed(&conn, id, &error)?;
                }
                Ok::<(), OutboxError>(())
            })
            .await
            .map_err(|e| OutboxError::Join(e.to_string()))??;

            self.publisher.metrics().record_relayed(relayed.len() as u64);
            report.relayed += relayed.len();

            if failure.is_some() {
                self.publisher.metrics().record_relay_failure();
                report.stalled = true;
                return Ok(report);
            }
            if fetched < self.batch_size {
                return Ok(report);
            }
        }
    }
}

/// Starts the periodic outbox relay.
///
/// This task runs indefinitely. Each tick drains whatever the post-commit
/// triggers left behind, for example rows written while the bus was down.
pub async fn start_outbox_relay(relay: OutboxRelay, interval: Duration) {
    tracing::info!(
        interval_ms = interval.as_millis() as u64,
        "starting outbox relay task"
    );

    loop {
        tokio::time::sleep(interval).await;

        match relay.relay_pending().await {
            Ok(report) if report.relayed > 0 => {
                tracing::info!(relayed = report.relayed, stalled = report.stalled, "relayed outbox rows");
            }
            Ok(report) if report.stalled => {
                tracing::debug!("outbox relay still stalled");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "outbox relay pass failed");
            }
        }
    }
}
