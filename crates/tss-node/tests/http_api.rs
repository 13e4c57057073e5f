//! Control-plane surface checks

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use k256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tower::util::ServiceExt;
use tss_core::party::sim::SimProvider;
use tss_core::TssConfig;
use tss_node::http::router;
use tss_node::TssServer;

async fn single_node() -> (Arc<TssServer>, tempfile::TempDir) {
    let home = tempfile::tempdir().unwrap();
    let server = TssServer::new(
        vec![],
        0,
        SigningKey::random(&mut OsRng),
        "httptest",
        home.path(),
        TssConfig::default(),
        None,
        Arc::new(SimProvider),
    )
    .await
    .unwrap();
    server.start();
    (server, home)
}

#[tokio::test]
async fn ping_and_identity() {
    let (server, _home) = single_node().await;
    let app = router(Arc::clone(&server));

    let resp = app
        .clone()
        .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .oneshot(Request::builder().uri("/p2pid").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
    assert_eq!(body, server.local_peer_id().to_string().as_bytes());
}

#[tokio::test]
async fn status_reports_counters() {
    let (server, _home) = single_node().await;
    let app = router(server);

    let resp = app
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), 4096).await.unwrap();
    let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(status["successful_keygen"], 0);
    assert_eq!(status["failed_keysign"], 0);
    assert!(status["start_time"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn keygen_rejects_wrong_method_and_empty_body() {
    let (server, _home) = single_node().await;
    let app = router(server);

    let resp = app
        .clone()
        .oneshot(Request::builder().uri("/keygen").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

    let resp = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/keygen")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn keysign_without_pool_state_is_an_internal_error() {
    let (server, _home) = single_node().await;
    let local_key = server.local_pub_key().to_string();
    let app = router(server);

    let digest = Sha256::digest(b"no state");
    let body = serde_json::json!({
        "pool_pub_key": local_key,
        "message": BASE64.encode(digest),
        "signer_pub_keys": [local_key],
    });
    let resp = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/keysign")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
