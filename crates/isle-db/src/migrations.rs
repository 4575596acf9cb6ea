//! Embedded SQL migrations.
//!
//! Every isle database carries the same schema: the owner-side authoring
//! tables, the outbox, the `replica_*` shadow tables and the dead-letter
//! log. Applied migrations are recorded by name in `_isle_migrations`.

use std::collections::HashSet;

use rusqlite::Connection;
use thiserror::Error;

macro_rules! migration {
    ($name:literal) => {
        ($name, include_str!(concat!("migrations/", $name, ".sql")))
    };
}

/// `(name, sql)` pairs in application order. Append only.
const MIGRATIONS: &[(&str, &str)] = &[
    migration!("000_courses"),
    migration!("001_islands"),
    migration!("002_island_prerequisites"),
    migration!("003_outbox"),
    migration!("004_replica_entities"),
    migration!("005_replica_prerequisites"),
    migration!("006_dead_letters"),
];

const BOOTSTRAP: &str = "CREATE TABLE IF NOT EXISTS _isle_migrations (
    name TEXT PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        source: rusqlite::Error,
    },

    #[error("failed to read applied migrations: {0}")]
    StateQuery(rusqlite::Error),
}

/// Applies every migration not yet recorded and returns how many ran.
///
/// Each migration and its bookkeeping row commit together, so a failure
/// leaves no partial schema behind.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply(conn, MIGRATIONS)
}

/// Names of the migrations recorded in `conn`, in application order.
pub fn applied_migrations(conn: &Connection) -> Result<Vec<String>, MigrationError> {
    let mut stmt = conn
        .prepare("SELECT name FROM _isle_migrations ORDER BY name")
        .map_err(MigrationError::StateQuery)?;
    let names = stmt
        .query_map([], |row| row.get(0))
        .and_then(|rows| rows.collect::<Result<Vec<String>, _>>())
        .map_err(MigrationError::StateQuery)?;
    Ok(names)
}

fn apply(conn: &Connection, migrations: &[(&'static str, &'static str)]) -> Result<usize, MigrationError> {
    conn.execute_batch(BOOTSTRAP)
        .map_err(|source| MigrationError::ExecutionFailed {
            name: "_isle_migrations".to_string(),
            source,
        })?;

    let done: HashSet<String> = applied_migrations(conn)?.into_iter().collect();
    let mut count = 0;

    for &(name, sql) in migrations.iter().filter(|(name, _)| !done.contains(*name)) {
        let failed = |source| MigrationError::ExecutionFailed {
            name: name.to_string(),
            source,
        };

        let tx = conn.unchecked_transaction().map_err(failed)?;
        tx.execute_batch(sql).map_err(failed)?;
        tx.execute("INSERT INTO _isle_migrations (name) VALUES (?1)", [name])
            .map_err(failed)?;
        tx.commit().map_err(failed)?;

        tracing::info!(migration = name, "applied migration");
        count += 1;
    }

    Ok(count)
}
