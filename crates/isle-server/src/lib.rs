//! HTTP surface and process wiring for an isle service.

pub mod api_islands;
pub mod api_ops;
pub mod background;
pub mod config;
pub mod middleware;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, patch, post},
    Extension, Json, Router,
};
use isle_bus::ListenerStats;
use isle_db::DbPool;
use isle_graph::IslandService;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Owner-side course and island operations.
    pub islands: IslandService,
    /// Name of this service on the bus.
    pub service_name: String,
    /// Counters shared by every replica listener of this process.
    pub listener_stats: Arc<ListenerStats>,
}

/// Maximum request body size (1 MiB).
const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let authoring_routes = Router::new()
        .route("/api/courses", post(api_islands::create_course_handler))
        .route(
            "/api/courses/{courseId}/islands",
            post(api_islands::create_island_handler).get(api_islands::list_islands_handler),
        )
        .route(
            "/api/courses/{courseId}/islands/{islandId}",
            patch(api_islands::update_island_handler),
        )
        .layer(axum::middleware::from_fn(middleware::actor_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/api/ops/delivery", get(api_ops::delivery_handler))
        .route("/api/ops/dead-letters", get(api_ops::dead_letters_handler))
        .merge(authoring_routes)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
