use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use isle_bus::{InMemoryBus, ListenerStats, Publisher};
use isle_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use isle_graph::IslandService;
use isle_server::{app, AppState};
use isle_types::DeliveryMode;
use serde_json::Value;
use tower::ServiceExt;

pub const OWNER: &str = "author-1";

pub struct TestApp {
    _dir: tempfile::TempDir,
    pub pool: DbPool,
    pub bus: InMemoryBus,
    pub router: Router,
}

impl TestApp {
    pub fn new(mode: DeliveryMode) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.db");
        let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
        run_migrations(&pool.get().unwrap()).unwrap();

        let bus = InMemoryBus::new();
        let state = AppState {
            pool: pool.clone(),
            islands: IslandService::new(pool.clone(), Publisher::new(Arc::new(bus.clone())), mode),
            service_name: "course-authoring".to_string(),
            listener_stats: Arc::new(ListenerStats::default()),
        };

        Self {
            _dir: dir,
            pool,
            bus,
            router: app(state),
        }
    }

    pub async fn send(
        &self,
        method: &str,
        uri: &str,
        actor: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(actor) = actor {
            builder = builder.header("X-Isle-Actor", actor);
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    pub async fn create_course(&self) -> String {
        let (status, body) = self
            .send(
                "POST",
                "/api/courses",
                Some(OWNER),
                Some(serde_json::json!({ "name": "Rust" })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_str().unwrap().to_string()
    }

    pub async fn create_island(&self, course_id: &str, name: &str) -> String {
        let (status, body) = self
            .send(
                "POST",
                &format!("/api/courses/{course_id}/islands"),
                Some(OWNER),
                Some(serde_json::json!({ "name": name })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_str().unwrap().to_string()
    }
}
