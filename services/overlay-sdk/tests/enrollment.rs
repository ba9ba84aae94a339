mod common;

use axum::http::StatusCode;
use chrono::{Duration, Utc};
use common::{jwt, spawn_broker, CountingExchange};
use overlay_sdk::bootstrap::{acquire_from, IdentitySource};
use overlay_sdk::identity::store;
use overlay_sdk::{EnrollmentClient, LoopbackFabric, OverlayConfig, OverlayError, Shutdown, Stage};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn issued(exp: i64) -> serde_json::Value {
    json!({
        "name": "tasty-identity",
        "jwt": jwt("https://ctrl.example.test:1280", exp),
        "validUntil": "2031-05-01T12:00:00Z"
    })
}

#[tokio::test]
async fn absent_identity_is_enrolled_and_persisted() {
    let exp = (Utc::now() + Duration::hours(1)).timestamp();
    let (broker, seen) = spawn_broker(StatusCode::OK, issued(exp)).await;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("taste_of_ziti.json");
    let config = OverlayConfig::default()
        .with_broker_url(broker)
        .with_default_identity_file(&path)
        .with_option("modbus");
    let exchange = CountingExchange::default();

    let contexts = acquire_from(
        IdentitySource::Default(path.clone()),
        &config,
        Arc::new(LoopbackFabric::new()),
        &exchange,
        &Shutdown::new(),
    )
    .await
    .unwrap();

    assert_eq!(contexts.len(), 1);
    assert_eq!(exchange.calls(), 1);
    assert_eq!(seen.lock().unwrap().as_slice(), &[json!({ "options": ["modbus"] })]);

    let loaded = store::load(&path).unwrap();
    assert_eq!(loaded.name, "tasty-identity");
    assert_eq!(loaded.controllers, vec!["https://ctrl.example.test:1280".to_string()]);
    assert_eq!(loaded.valid_until.unwrap().to_rfc3339(), "2031-05-01T12:00:00+00:00");
}

#[tokio::test]
async fn broker_503_surfaces_body_and_writes_nothing() {
    let (broker, _) =
        spawn_broker(StatusCode::SERVICE_UNAVAILABLE, json!("maintenance window")).await;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("taste_of_ziti.json");
    let client = EnrollmentClient::new(&OverlayConfig::default().with_broker_url(broker)).unwrap();
    let exchange = CountingExchange::default();

    let err = client.provision(&path, &exchange).await.unwrap_err();
    match &err {
        OverlayError::Broker { status, body } => {
            assert_eq!(*status, 503);
            assert!(body.contains("maintenance window"));
        }
        other => panic!("expected broker error, got {:?}", other),
    }
    assert_eq!(err.stage(), Stage::Enrollment);
    assert!(!path.exists());
    assert_eq!(exchange.calls(), 0);
}

#[tokio::test]
async fn expired_token_never_reaches_the_controller() {
    let exp = (Utc::now() - Duration::minutes(1)).timestamp();
    let (broker, _) = spawn_broker(StatusCode::OK, issued(exp)).await;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("taste_of_ziti.json");
    let client = EnrollmentClient::new(&OverlayConfig::default().with_broker_url(broker)).unwrap();
    let exchange = CountingExchange::default();

    let err = client.provision(&path, &exchange).await.unwrap_err();
    assert!(matches!(err, OverlayError::TokenExpired(_)));
    assert_eq!(exchange.calls(), 0);
    assert!(!path.exists());
}

#[tokio::test]
async fn unreachable_broker_is_reported() {
    let client =
        EnrollmentClient::new(&OverlayConfig::default().with_broker_url("http://127.0.0.1:9"))
            .unwrap();

    let err = client.request_identity(&[]).await.unwrap_err();
    assert!(matches!(err, OverlayError::BrokerUnreachable(_)));
    assert!(!err.is_recoverable());
}
