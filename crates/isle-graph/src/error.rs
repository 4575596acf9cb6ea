use isle_bus::OutboxError;

use crate::dag::CycleError;

/// Errors returned by the graph engine.
///
/// `NotFound`, `NotOwner` and `Validation` are raised before anything is
/// written. `Cycle` is raised after the call's field updates have been
/// committed; the edge set is left exactly as it was. Everything else rolls
/// the whole transaction back.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("user {actor_id} does not own course {course_id}")]
    NotOwner { course_id: String, actor_id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("graph task failed: {0}")]
    Join(String),
}

impl GraphError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}
