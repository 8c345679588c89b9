mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use common::Fleet;
use fleetdeck::model::ArtefactModel;
use fleetdeck::operator::Operator;
use fleetdeck::operator_api::router;

fn operator_app(fleet: &Fleet) -> Router {
    router(Arc::new(Operator::new(
        fleet.controller.clone(),
        fleet.runtime.clone(),
        fleet.executor.clone(),
        fleet.downloads.clone(),
    )))
}

async fn post(app: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    // extractor rejections answer in plain text
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn cache_clear_evicts_by_age() {
    let fleet = Fleet::new(true);
    let app = operator_app(&fleet);
    let cache = fleet.dir.path().join("cache");
    std::fs::create_dir_all(&cache).unwrap();
    std::fs::write(cache.join("stale.tar.gz"), b"old archive").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (status, body) = post(&app, "/cron/cache/clear?age=1000000years").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], 0);

    let (status, body) = post(&app, "/cron/cache/clear?age=1ms").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], 1);
    assert!(!cache.join("stale.tar.gz").exists());

    std::fs::write(cache.join("fresh.tar.gz"), b"new archive").unwrap();
    let (_, body) = post(&app, "/cron/cache/clear?age=1h").await;
    assert_eq!(body["removed"], 0);
    assert!(cache.join("fresh.tar.gz").exists());
}

#[tokio::test]
async fn cache_clear_rejects_unparsable_age() {
    let fleet = Fleet::new(true);
    let app = operator_app(&fleet);

    let (status, body) = post(&app, "/cron/cache/clear?age=eventually").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    let (status, _) = post(&app, "/cron/cache/clear").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn update_with_failed_mismatch_is_a_server_error() {
    let fleet = Fleet::new(true);
    let app = operator_app(&fleet);
    let installed = fleet.upload("lobby-maps", "3.2.0", false, &[("maps/lobby.dat", b"lobby")]);
    fleet.set_target(&installed);
    // registered on the controller, but its archive never arrived
    let missing = fleet
        .store
        .insert_artefact(ArtefactModel {
            uuid: Uuid::new_v4(),
            identifier: "spellcore".to_string(),
            version: semver::Version::new(1, 0, 0),
            uploaded_at: Utc::now(),
            hash: "0".repeat(64),
            requires_restart: true,
        })
        .unwrap();
    fleet.set_target(&missing);

    let (status, body) = post(&app, &format!("/server/{}/update", fleet.server)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "UPDATE_FAILED");
    let message = body["message"].as_str().unwrap();
    assert!(message.contains("1 applied, 1 failed"));
    assert!(message.contains("spellcore"));
    assert_eq!(fleet.installed("lobby-maps"), Some(installed.uuid));
    assert_eq!(fleet.installed("spellcore"), None);
}

#[tokio::test]
async fn update_of_a_container_that_will_not_stop_conflicts() {
    let fleet = Fleet::new(true);
    let app = operator_app(&fleet);
    let v1 = fleet.upload("spellcore", "1.0.0", true, &[("plugins/spellcore.jar", b"jar")]);
    fleet.set_target(&v1);
    fleet.runtime.running.store(true, Ordering::SeqCst);
    fleet.runtime.stuck.store(true, Ordering::SeqCst);

    let (status, body) = post(&app, &format!("/server/{}/update", fleet.server)).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "SERVER_RUNNING");
    assert_eq!(fleet.runtime.stops.load(Ordering::SeqCst), 1);
    assert_eq!(fleet.installed("spellcore"), None);
    assert!(fleet.read("plugins/spellcore.jar").is_none());
}

#[tokio::test]
async fn start_and_unknown_actions() {
    let fleet = Fleet::new(true);
    let app = operator_app(&fleet);

    let (status, body) = post(&app, &format!("/server/{}/start", fleet.server)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action"], "start");
    assert!(fleet.runtime.running.load(Ordering::SeqCst));

    let (status, _) = post(&app, &format!("/server/{}/explode", fleet.server)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
