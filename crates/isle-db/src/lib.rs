//! Database layer for the isle services.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization
//! and embedded SQL migrations. Each service owns its own database file; the
//! schema carries both the authoring tables (courses, islands, prerequisite
//! edges, outbox) and the `replica_*` shadow tables, so any service can act
//! as owner, replica, or both.
//!
//! The relational store is the only shared mutable resource inside a
//! service. No application-level locks are layered on top of SQLite's own
//! transaction isolation.

mod migrations;
mod pool;

pub use migrations::{applied_migrations, run_migrations, MigrationError};
pub use pool::{configure_connection, create_pool, DbPool, DbRuntimeSettings, PoolError, MEMORY_PATH};
