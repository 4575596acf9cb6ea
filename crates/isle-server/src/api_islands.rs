//! Course and island authoring endpoints.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use isle_graph::{
    Course, EdgeChange, GraphError, Island, NewCourse, NewIsland, UpdateIslandParams,
    UpdateIslandRequest,
};
use serde::{Deserialize, Serialize};

use crate::middleware::ActorContext;
use crate::AppState;

const MAX_NAME_LEN: usize = 256;
const MAX_DESCRIPTION_LEN: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unprocessable: {0}")]
    Unprocessable(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<GraphError> for ApiError {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            GraphError::NotOwner { .. } => ApiError::Forbidden(e.to_string()),
            GraphError::Validation(_) | GraphError::Cycle(_) => ApiError::Unprocessable(e.to_string()),
            ref err => {
                tracing::error!(error = %err, "island operation failed");
                ApiError::InternalServerError("internal error".to_string())
            }
        }
    }
}

fn check_lengths(name: Option<&str>, description: Option<&str>) -> Result<(), ApiError> {
    if name.is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(ApiError::BadRequest(format!(
            "name must be at most {MAX_NAME_LEN} bytes"
        )));
    }
    if description.is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
        return Err(ApiError::BadRequest(format!(
            "description must be at most {MAX_DESCRIPTION_LEN} bytes"
        )));
    }
    Ok(())
}

/// Body of `PATCH /api/courses/{courseId}/islands/{islandId}`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateIslandBody {
    #[serde(flatten)]
    pub fields: UpdateIslandParams,
    /// Full replacement list; omit to leave edges alone.
    pub prerequisite_island_ids: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovedIsland {
    pub island_id: String,
    pub from: i64,
    pub to: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateIslandResponse {
    pub island: Island,
    /// The stored prerequisite list, present when it was replaced.
    pub prerequisite_island_ids: Option<Vec<String>>,
    pub moved_islands: Vec<MovedIsland>,
    /// Subjects of the events emitted for this change, in order.
    pub events: Vec<String>,
}

/// POST /api/courses
pub async fn create_course_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(ActorContext(actor)): Extension<ActorContext>,
    Json(payload): Json<NewCourse>,
) -> Result<(StatusCode, Json<Course>), ApiError> {
    check_lengths(Some(&payload.name), Some(&payload.description))?;
    let course = state.islands.create_course(&actor, payload).await?;
    Ok((StatusCode::CREATED, Json(course)))
}

/// POST /api/courses/{courseId}/islands
pub async fn create_island_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(ActorContext(actor)): Extension<ActorContext>,
    Path(course_id): Path<String>,
    Json(payload): Json<NewIsland>,
) -> Result<(StatusCode, Json<Island>), ApiError> {
    check_lengths(Some(&payload.name), Some(&payload.description))?;
    let island = state
        .islands
        .create_island(&course_id, &actor, payload)
        .await?;
    Ok((StatusCode::CREATED, Json(island)))
}

/// GET /api/courses/{courseId}/islands
pub async fn list_islands_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(course_id): Path<String>,
) -> Result<Json<Vec<Island>>, ApiError> {
    Ok(Json(state.islands.list_islands(&course_id).await?))
}

/// PATCH /api/courses/{courseId}/islands/{islandId}
pub async fn update_island_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(ActorContext(actor)): Extension<ActorContext>,
    Path((course_id, island_id)): Path<(String, String)>,
    Json(body): Json<UpdateIslandBody>,
) -> Result<Json<UpdateIslandResponse>, ApiError> {
    check_lengths(body.fields.name.as_deref(), body.fields.description.as_deref())?;

    let request = UpdateIslandRequest {
        course_id,
        island_id,
        actor_id: actor,
        fields: body.fields,
        prerequisite_island_ids: body.prerequisite_island_ids,
    };
    let outcome = state.islands.update_island(request).await?;

    let (prerequisite_island_ids, moved_islands) = match outcome.edges {
        EdgeChange::Replaced {
            prerequisites,
            moved,
        } => (
            Some(prerequisites),
            moved
                .into_iter()
                .map(|m| MovedIsland {
                    island_id: m.island_id,
                    from: m.from,
                    to: m.to,
                })
                .collect(),
        ),
        _ => (None, Vec::new()),
    };

    Ok(Json(UpdateIslandResponse {
        island: outcome.island,
        prerequisite_island_ids,
        moved_islands,
        events: outcome
            .dispatch
            .subjects()
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect(),
    }))
}
