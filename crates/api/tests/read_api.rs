#![forbid(unsafe_code)]

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use genlog_api::router;
use genlog_store::{HistoryStore, MemoryStore};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn route_doc(gen: i64) -> Value {
    json!({
        "apiVersion": "gateway.networking.k8s.io/v1",
        "kind": "HTTPRoute",
        "metadata": {
            "name": "r",
            "namespace": "default",
            "generation": gen,
            "creationTimestamp": "2024-03-01T10:00:00Z",
            "managedFields": [
                {"manager": "kubectl", "operation": "Apply",
                 "time": format!("2024-03-0{}T10:00:00Z", gen.min(9)),
                 "fieldsV1": {"f:spec": {}}}
            ],
        },
        "spec": {"hostnames": [format!("v{}.example.com", gen)]},
        "status": {"parents": []},
    })
}

/// Store seeded with generations 1..=n for HTTPRoute/r/default.
async fn seeded_store(max: usize, upto: i64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new(max));
    let id = genlog_core::ResourceIdentity::new("HTTPRoute", "r", "default");
    for g in 1..=upto {
        store.append(&id, &route_doc(g)).await.unwrap();
    }
    store
}

async fn get(app: &axum::Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn history_lists_generations_newest_first() {
    let app = router(seeded_store(100, 2).await);
    let (status, body) =
        get(&app, "/api/history?kind=HTTPRoute&name=r&namespace=default").await;
    assert_eq!(status, StatusCode::OK);
    let entries: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        entries,
        json!([
            {"generation": 2, "timestamp": "2024-03-02T10:00:00Z"},
            {"generation": 1, "timestamp": "2024-03-01T10:00:00Z"}
        ])
    );
}

#[tokio::test]
async fn history_of_single_added_generation_uses_creation_timestamp() {
    let app = router(seeded_store(100, 1).await);
    let (status, body) =
        get(&app, "/api/history?kind=HTTPRoute&name=r&namespace=default").await;
    assert_eq!(status, StatusCode::OK);
    let entries: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(entries, json!([{"generation": 1, "timestamp": "2024-03-01T10:00:00Z"}]));
}

#[tokio::test]
async fn history_requires_all_parameters() {
    let app = router(seeded_store(100, 1).await);
    let (status, body) = get(&app, "/api/history?kind=HTTPRoute&name=r").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let err: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(err["success"], json!(false));
    assert!(err["error"].as_str().unwrap().contains("namespace"));
}

#[tokio::test]
async fn history_of_unknown_identity_is_not_found() {
    let app = router(seeded_store(100, 1).await);
    let (status, body) =
        get(&app, "/api/history?kind=Unknown&name=x&namespace=default").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let err: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(err["success"], json!(false));
}

#[tokio::test]
async fn generation_returns_the_matching_snapshot_as_yaml() {
    let app = router(seeded_store(100, 3).await);
    let (status, body) = get(
        &app,
        "/api/generation?kind=HTTPRoute&name=r&namespace=default&generation=2",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.starts_with("timestamp: 2024-03-02T10:00:00Z\ngeneration: 2\n---\n"));

    let parsed: Value = serde_yaml::from_str(text.splitn(2, "---\n").nth(1).unwrap()).unwrap();
    assert_eq!(parsed["apiVersion"], "gateway.networking.k8s.io/v1");
    assert_eq!(parsed["kind"], "HTTPRoute");
    assert_eq!(parsed["spec"], json!({"hostnames": ["v2.example.com"]}));
    assert_eq!(parsed["status"], json!({"parents": []}));
    assert!(parsed["metadata"].get("managedFields").is_none());
}

#[tokio::test]
async fn evicted_generation_is_not_found() {
    // Cap 3, generations 1..=4 recorded: 1 has been trimmed away.
    let store = seeded_store(3, 4).await;
    let app = router(store);

    let (status, body) =
        get(&app, "/api/history?kind=HTTPRoute&name=r&namespace=default").await;
    assert_eq!(status, StatusCode::OK);
    let entries: Value = serde_json::from_slice(&body).unwrap();
    let gens: Vec<i64> =
        entries.as_array().unwrap().iter().map(|e| e["generation"].as_i64().unwrap()).collect();
    assert_eq!(gens, vec![4, 3, 2]);

    let (status, _) = get(
        &app,
        "/api/generation?kind=HTTPRoute&name=r&namespace=default&generation=1",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn generation_parameter_must_be_an_integer() {
    let app = router(seeded_store(100, 1).await);
    let (status, _) = get(
        &app,
        "/api/generation?kind=HTTPRoute&name=r&namespace=default&generation=two",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) =
        get(&app, "/api/generation?kind=HTTPRoute&name=r&namespace=default").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn generation_of_unknown_identity_is_not_found() {
    let app = router(seeded_store(100, 1).await);
    let (status, body) = get(
        &app,
        "/api/generation?kind=Unknown&name=x&namespace=default&generation=1",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let err: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(err["success"], json!(false));
    assert!(err["error"].is_string());
}

#[tokio::test]
async fn resources_enumerate_every_tracked_identity() {
    let store = seeded_store(100, 1).await;
    let other = genlog_core::ResourceIdentity::new("Gateway", "gw", "edge");
    store
        .append(&other, &json!({"kind": "Gateway", "metadata": {"name": "gw", "namespace": "edge", "generation": 1}}))
        .await
        .unwrap();
    let app = router(store);

    let (status, body) = get(&app, "/api/resources").await;
    assert_eq!(status, StatusCode::OK);
    let rows: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        rows,
        json!([
            {"kind": "Gateway", "name": "gw", "namespace": "edge"},
            {"kind": "HTTPRoute", "name": "r", "namespace": "default"}
        ])
    );
}

#[tokio::test]
async fn health_reports_success() {
    let app = router(Arc::new(MemoryStore::new(100)));
    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health, json!({"success": true, "message": "Server is healthy"}));
}

#[tokio::test]
async fn non_get_methods_are_rejected() {
    let app = router(seeded_store(100, 1).await);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/resources")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let err: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(err["success"], json!(false));
}
