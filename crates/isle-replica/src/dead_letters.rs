//! SQLite-backed dead-letter log.

use async_trait::async_trait;
use isle_bus::{BusError, DeadLetter, DeadLetterReason, DeadLetterSink};
use isle_db::DbPool;
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use crate::error::ReplicaError;

/// A recorded dead letter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDeadLetter {
    pub id: i64,
    pub subject: String,
    pub queue_group: String,
    pub delivery_token: Option<String>,
    pub reason: String,
    pub detail: String,
    pub payload: String,
    pub attempt: i64,
    pub recorded_at: String,
}

/// Narrows [`list_dead_letters`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterFilter {
    pub subject: Option<String>,
    pub reason: Option<DeadLetterReason>,
    pub limit: Option<i64>,
}

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

pub fn insert_dead_letter(conn: &Connection, letter: &DeadLetter) -> Result<i64, ReplicaError> {
    conn.execute(
        "INSERT INTO dead_letters (subject, queue_group, delivery_token, reason, detail, payload, attempt)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            letter.subject.as_str(),
            letter.queue_group,
            letter.delivery_token,
            letter.reason.as_str(),
            letter.detail,
            letter.payload,
            letter.attempt as i64,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Lists dead letters, newest first.
pub fn list_dead_letters(
    conn: &Connection,
    filter: &DeadLetterFilter,
) -> Result<Vec<StoredDeadLetter>, ReplicaError> {
    let mut sql = String::from(
        "SELECT id, subject, queue_group, delivery_token, reason, detail, payload, attempt, recorded_at
         FROM dead_letters WHERE 1=1",
    );
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    let mut idx = 1usize;

    if let Some(subject) = &filter.subject {
        sql.push_str(&format!(" AND subject = ?{idx}"));
        values.push(Box::new(subject.clone()));
        idx += 1;
    }
    if let Some(reason) = filter.reason {
        sql.push_str(&format!(" AND reason = ?{idx}"));
        values.push(Box::new(reason.as_str()));
        idx += 1;
    }

    let limit = filter.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    sql.push_str(&format!(" ORDER BY id DESC LIMIT ?{idx}"));
    values.push(Box::new(limit));

    let params: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params.as_slice(), map_row_to_dead_letter)?;

    let mut letters = Vec::new();
    for row in rows {
        letters.push(row?);
    }
    Ok(letters)
}

fn map_row_to_dead_letter(row: &Row) -> rusqlite::Result<StoredDeadLetter> {
    Ok(StoredDeadLetter {
        id: row.get(0)?,
        subject: row.get(1)?,
        queue_group: row.get(2)?,
        delivery_token: row.get(3)?,
        reason: row.get(4)?,
        detail: row.get(5)?,
        payload: row.get(6)?,
        attempt: row.get(7)?,
        recorded_at: row.get(8)?,
    })
}

/// [`DeadLetterSink`] writing to the `dead_letters` table.
#[derive(Clone)]
pub struct SqliteDeadLetterStore {
    pool: DbPool,
}

impl SqliteDeadLetterStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterSink for SqliteDeadLetterStore {
    async fn record(&self, letter: DeadLetter) -> Result<(), BusError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| BusError::Store(e.to_string()))?;
            insert_dead_letter(&conn, &letter).map_err(|e| BusError::Store(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| BusError::Store(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isle_events::Subject;

    fn letter(subject: Subject, reason: DeadLetterReason) -> DeadLetter {
        DeadLetter {
            subject,
            queue_group: "progress-service".to_string(),
            delivery_token: Some("t-1".to_string()),
            reason,
            detail: "missing level l-1".to_string(),
            payload: "{}".to_string(),
            attempt: 1,
        }
    }

    #[test]
    fn filters_by_subject_and_reason() {
        let conn = Connection::open_in_memory().unwrap();
        isle_db::run_migrations(&conn).unwrap();

        insert_dead_letter(
            &conn,
            &letter(Subject::AttemptCreated, DeadLetterReason::MissingReference),
        )
        .unwrap();
        insert_dead_letter(
            &conn,
            &letter(Subject::LevelCreated, DeadLetterReason::MissingReference),
        )
        .unwrap();
        insert_dead_letter(
            &conn,
            &letter(Subject::LevelCreated, DeadLetterReason::MalformedPayload),
        )
        .unwrap();

        let all = list_dead_letters(&conn, &DeadLetterFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].reason, "MALFORMED_PAYLOAD", "newest first");

        let levels = list_dead_letters(
            &conn,
            &DeadLetterFilter {
                subject: Some("level:created".to_string()),
                reason: Some(DeadLetterReason::MissingReference),
                limit: None,
            },
        )
        .unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].detail, "missing level l-1");

        let limited = list_dead_letters(
            &conn,
            &DeadLetterFilter {
                limit: Some(2),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(limited.len(), 2);
    }
}
