//! Operator endpoints: delivery health and the dead-letter log.

use std::sync::Arc;

use axum::extract::{Extension, Query};
use axum::response::Json;
use isle_bus::{DeadLetterReason, DeliverySnapshot, ListenerStatsSnapshot};
use isle_replica::{list_dead_letters, DeadLetterFilter, StoredDeadLetter};
use isle_types::DeliveryMode;
use serde::{Deserialize, Serialize};

use crate::api_islands::ApiError;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResponse {
    pub service: String,
    pub delivery_mode: DeliveryMode,
    pub publisher: DeliverySnapshot,
    pub listeners: ListenerStatsSnapshot,
    /// Outbox rows not yet relayed.
    pub outbox_pending: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeadLetterParams {
    pub subject: Option<String>,
    pub reason: Option<String>,
    pub limit: Option<i64>,
}

/// GET /api/ops/delivery
pub async fn delivery_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<DeliveryResponse>, ApiError> {
    let pool = state.pool.clone();
    let outbox_pending = tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| ApiError::InternalServerError(e.to_string()))?;
        isle_bus::outbox::pending_count(&conn)
            .map_err(|e| ApiError::InternalServerError(e.to_string()))
    })
    .await
    .map_err(|e| ApiError::InternalServerError(e.to_string()))??;

    Ok(Json(DeliveryResponse {
        service: state.service_name.clone(),
        delivery_mode: state.islands.mode(),
        publisher: state.islands.publisher().metrics().snapshot(),
        listeners: state.listener_stats.snapshot(),
        outbox_pending,
    }))
}

/// GET /api/ops/dead-letters?subject=&reason=&limit=
pub async fn dead_letters_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<DeadLetterParams>,
) -> Result<Json<Vec<StoredDeadLetter>>, ApiError> {
    let reason = match params.reason.as_deref() {
        Some(label) => Some(DeadLetterReason::parse(label).ok_or_else(|| {
            ApiError::BadRequest(format!("unknown dead-letter reason: {label}"))
        })?),
        None => None,
    };
    if let Some(subject) = params.subject.as_deref() {
        subject
            .parse::<isle_events::Subject>()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    }

    let filter = DeadLetterFilter {
        subject: params.subject,
        reason,
        limit: params.limit,
    };

    let pool = state.pool.clone();
    let letters = tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| ApiError::InternalServerError(e.to_string()))?;
        list_dead_letters(&conn, &filter).map_err(|e| ApiError::InternalServerError(e.to_string()))
    })
    .await
    .map_err(|e| ApiError::InternalServerError(e.to_string()))??;

    Ok(Json(letters))
}
