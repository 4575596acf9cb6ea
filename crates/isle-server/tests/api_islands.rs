mod common;

use axum::http::StatusCode;
use common::{TestApp, OWNER};
use isle_types::DeliveryMode;
use serde_json::json;

#[tokio::test]
async fn health_check_returns_ok() {
    let app = TestApp::new(DeliveryMode::Direct);
    let (status, body) = app.send("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn authoring_requires_actor() {
    let app = TestApp::new(DeliveryMode::Direct);
    let (status, _) = app
        .send("POST", "/api/courses", None, Some(json!({ "name": "Rust" })))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn patch_replaces_prerequisites_and_reports_events() {
    let app = TestApp::new(DeliveryMode::Direct);
    let course = app.create_course().await;
    let a = app.create_island(&course, "A").await;
    let b = app.create_island(&course, "B").await;
    let d = app.create_island(&course, "D").await;

    let (status, body) = app
        .send(
            "PATCH",
            &format!("/api/courses/{course}/islands/{d}"),
            Some(OWNER),
            Some(json!({ "name": "Finale", "prerequisiteIslandIds": [a, b] })),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["island"]["name"], "Finale");
    assert_eq!(body["island"]["position"], 1);
    assert_eq!(body["prerequisiteIslandIds"].as_array().unwrap().len(), 2);
    assert_eq!(
        body["events"],
        json!([
            "island:updated",
            "prerequisites:deleted",
            "prerequisite:created",
            "prerequisite:created"
        ])
    );
    assert!(body["island"].get("templateId").is_some());

    let (status, list) = app
        .send("GET", &format!("/api/courses/{course}/islands"), Some(OWNER), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = list
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![a.as_str(), b.as_str(), d.as_str()]);
}

#[tokio::test]
async fn cycle_is_unprocessable() {
    let app = TestApp::new(DeliveryMode::Direct);
    let course = app.create_course().await;
    let a = app.create_island(&course, "A").await;
    let d = app.create_island(&course, "D").await;

    let (status, _) = app
        .send(
            "PATCH",
            &format!("/api/courses/{course}/islands/{d}"),
            Some(OWNER),
            Some(json!({ "prerequisiteIslandIds": [a] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .send(
            "PATCH",
            &format!("/api/courses/{course}/islands/{a}"),
            Some(OWNER),
            Some(json!({ "prerequisiteIslandIds": [d] })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("cycle"));
}

#[tokio::test]
async fn errors_map_to_statuses() {
    let app = TestApp::new(DeliveryMode::Direct);
    let course = app.create_course().await;
    let a = app.create_island(&course, "A").await;

    let (status, body) = app
        .send(
            "PATCH",
            &format!("/api/courses/{course}/islands/{a}"),
            Some("someone-else"),
            Some(json!({ "name": "Hijacked" })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["error"].is_string());

    let (status, _) = app
        .send(
            "PATCH",
            &format!("/api/courses/{course}/islands/missing"),
            Some(OWNER),
            Some(json!({ "name": "Ghost" })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .send(
            "PATCH",
            &format!("/api/courses/{course}/islands/{a}"),
            Some(OWNER),
            Some(json!({ "prerequisiteIslandIds": [a] })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = app
        .send("GET", "/api/courses/nope/islands", Some(OWNER), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn oversized_name_is_rejected() {
    let app = TestApp::new(DeliveryMode::Direct);
    let course = app.create_course().await;
    let (status, _) = app
        .send(
            "POST",
            &format!("/api/courses/{course}/islands"),
            Some(OWNER),
            Some(json!({ "name": "x".repeat(300) })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
