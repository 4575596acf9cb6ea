/// Errors raised while applying events to the replica store.
///
/// All of them are transient from the listener's point of view: the
/// delivery is left unacknowledged and redelivered.
#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("stored value is invalid: {0}")]
    InvalidData(String),

    #[error("replica task failed: {0}")]
    Join(String),
}
