#![cfg(feature = "server")]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use keypool::pool::http::router;
use keypool::pool::{MemoryStore, PoolHttpState, PoolStores};
use keypool::{
    Credential, CredentialOrigin, CredentialStore, KeyPool, PoolConfig, ValidationOutcome,
    Validator,
};
use serde_json::{Value, json};
use tower::util::ServiceExt;

const GOOD_KEY: &str = "AIzaSyHttpGoodKey0001";
const BAD_KEY: &str = "AIzaSyHttpBadKey00002";

#[derive(Default)]
struct DenyListValidator {
    denied: Mutex<HashSet<String>>,
}

impl DenyListValidator {
    fn deny(self, key: &str) -> Self {
        self.denied.lock().unwrap().insert(key.to_string());
        self
    }
}

#[async_trait]
impl Validator for DenyListValidator {
    async fn validate(&self, key: &str) -> ValidationOutcome {
        if self.denied.lock().unwrap().contains(key) {
            ValidationOutcome::unhealthy("API key not valid. Please pass a valid API key.")
        } else {
            ValidationOutcome::healthy()
        }
    }
}

fn pool(store: &MemoryStore) -> KeyPool {
    KeyPool::new(
        &PoolConfig::default(),
        PoolStores::shared(store.clone()),
        Arc::new(DenyListValidator::default().deny(BAD_KEY)),
    )
}

async fn seed_admin_key(store: &MemoryStore, key: &str) -> String {
    let mut credential = Credential::new(key, CredentialOrigin::Admin, 1);
    credential.validated = true;
    store.insert(credential).await.expect("insert")
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn json_request(method: &str, uri: &str, payload: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

#[tokio::test]
async fn allocation_returns_credential_or_503() {
    let store = MemoryStore::new();
    let app = router(PoolHttpState::new(pool(&store)));

    let request = Request::builder()
        .uri("/v1/credential")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body, json!({ "error": "no credentials available, retry later" }));

    seed_admin_key(&store, GOOD_KEY).await;
    let request = Request::builder()
        .uri("/v1/credential")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = body_json(response).await;
    assert_eq!(body["credential"], GOOD_KEY);

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["healthy_credentials"], 1);
    assert_eq!(body["instance_id"], "http://127.0.0.1:8080");
}

#[tokio::test]
async fn donation_statuses() {
    let store = MemoryStore::new();
    let app = router(PoolHttpState::new(pool(&store)));

    let response = app
        .clone()
        .oneshot(json_request("POST", "/v1/donate", json!({ "key": GOOD_KEY })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert!(body["id"].as_str().unwrap().starts_with("key-"));

    let response = app
        .clone()
        .oneshot(json_request("POST", "/v1/donate", json!({ "key": GOOD_KEY })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "this credential has already been donated");

    let response = app
        .clone()
        .oneshot(json_request("POST", "/v1/donate", json!({ "key": BAD_KEY })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "invalid credential");
    assert!(
        body["details"]
            .as_str()
            .unwrap()
            .contains("API key not valid")
    );

    let response = app
        .oneshot(json_request("POST", "/v1/donate", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "credential key is required");

    assert_eq!(store.list_credentials().await.expect("list").len(), 1);
}

#[tokio::test]
async fn donation_keeps_camel_case_donor_contact() {
    let store = MemoryStore::new();
    let app = router(PoolHttpState::new(pool(&store)));

    let response = app
        .oneshot(json_request(
            "POST",
            "/v1/donate",
            json!({ "key": GOOD_KEY, "donorContact": "donor@example.com" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let credentials = store.list_credentials().await.expect("list");
    assert_eq!(credentials.len(), 1);
    assert_eq!(
        credentials[0].donor_contact.as_deref(),
        Some("donor@example.com")
    );
}

#[tokio::test]
async fn malformed_donation_body_is_a_json_400() {
    let store = MemoryStore::new();
    let app = router(PoolHttpState::new(pool(&store)));

    let request = Request::builder()
        .method("POST")
        .uri("/v1/donate")
        .header("content-type", "application/json")
        .body(Body::from("{\"key\": "))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "invalid request body");

    let request = Request::builder()
        .method("POST")
        .uri("/v1/donate")
        .body(Body::from(json!({ "key": GOOD_KEY }).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].is_string());

    assert!(store.list_credentials().await.expect("list").is_empty());
}

#[tokio::test]
async fn admin_routes_are_absent_without_tokens() {
    let store = MemoryStore::new();
    let app = router(PoolHttpState::new(pool(&store)));

    let request = Request::builder()
        .uri("/admin/credentials")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_requires_token_and_manages_credentials() {
    let store = MemoryStore::new();
    let state = PoolHttpState::new(pool(&store))
        .with_admin_token("admin-token")
        .with_admin_read_token("read-token");
    let app = router(state);

    let request = Request::builder()
        .uri("/admin/credentials")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let mut add = json_request(
        "POST",
        "/admin/credentials",
        json!({ "key": GOOD_KEY, "label": "primary" }),
    );
    add.headers_mut()
        .insert("authorization", "Bearer read-token".parse().unwrap());
    let response = app.clone().oneshot(add).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let mut add = json_request(
        "POST",
        "/admin/credentials",
        json!({ "key": GOOD_KEY, "label": "primary" }),
    );
    add.headers_mut()
        .insert("x-admin-token", "admin-token".parse().unwrap());
    let response = app.clone().oneshot(add).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["validation"]["healthy"], true);
    let id = body["credential"]["id"].as_str().unwrap().to_string();
    assert_ne!(body["credential"]["key"], GOOD_KEY);

    let mut add = json_request("POST", "/admin/credentials", json!({ "key": BAD_KEY }));
    add.headers_mut()
        .insert("x-admin-token", "admin-token".parse().unwrap());
    let response = app.clone().oneshot(add).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["credential"]["health"], "quarantined");

    let request = Request::builder()
        .uri("/admin/credentials?health=healthy")
        .header("authorization", "Bearer read-token")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let listed = body.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], id.as_str());
    assert_ne!(listed[0]["key"], GOOD_KEY);

    let request = Request::builder()
        .uri("/admin/credentials?origin=martian")
        .header("authorization", "Bearer read-token")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("POST")
        .uri("/admin/validate-all?scope=all")
        .header("authorization", "Bearer admin-token")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["validated"], 2);
    assert_eq!(body["healthy"], 1);
    assert_eq!(body["quarantined"], 1);

    let mut patch = json_request(
        "PATCH",
        &format!("/admin/credentials/{id}"),
        json!({ "label": "renamed", "health": "quarantined" }),
    );
    patch
        .headers_mut()
        .insert("authorization", "Bearer read-token".parse().unwrap());
    let response = app.clone().oneshot(patch).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let mut patch = json_request(
        "PATCH",
        &format!("/admin/credentials/{id}"),
        json!({ "label": "renamed", "health": "quarantined" }),
    );
    patch
        .headers_mut()
        .insert("authorization", "Bearer admin-token".parse().unwrap());
    let response = app.clone().oneshot(patch).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["label"], "renamed");
    assert_eq!(body["health"], "quarantined");
    assert_ne!(body["key"], GOOD_KEY);

    let mut patch = json_request(
        "PATCH",
        "/admin/credentials/key-missing",
        json!({ "health": "healthy" }),
    );
    patch
        .headers_mut()
        .insert("authorization", "Bearer admin-token".parse().unwrap());
    let response = app.clone().oneshot(patch).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/admin/credentials/{id}"))
        .header("authorization", "Bearer admin-token")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let request = Request::builder()
        .method("POST")
        .uri(format!("/admin/credentials/{id}/validate"))
        .header("authorization", "Bearer admin-token")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_reports_stats_and_usage() {
    let store = MemoryStore::new();
    seed_admin_key(&store, GOOD_KEY).await;
    let app = router(PoolHttpState::new(pool(&store)).with_admin_read_token("read-token"));

    for _ in 0..3 {
        let request = Request::builder()
            .uri("/v1/credential")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let request = Request::builder()
        .uri("/admin/stats")
        .header("authorization", "Bearer read-token")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["credentials"]["total"], 1);
    assert_eq!(body["credentials"]["admin"]["allocation_count"], 3);
    assert_eq!(body["instance"]["total_allocations"], 3);
    assert_eq!(body["all_instances"]["instances"], 1);

    let request = Request::builder()
        .uri("/admin/usage?days=7")
        .header("authorization", "Bearer read-token")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["days"], 7);
    let daily = body["daily"].as_array().unwrap();
    assert_eq!(daily.len(), 7);
    assert_eq!(daily[6]["allocations"], 3);
    assert_eq!(body["summary"]["admin_usage"], 3);
    assert_eq!(body["summary"]["donated_usage"], 0);

    let request = Request::builder()
        .uri("/admin/ledger")
        .header("authorization", "Bearer read-token")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["hourly"].as_array().unwrap().len(), 1);
    assert_eq!(body["hourly"][0]["allocations"], 3);

    let request = Request::builder()
        .uri("/admin/activity?limit=5")
        .header("authorization", "Bearer read-token")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let events = body.as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["kind"], "key_used");
    assert_eq!(events[0]["details"], "3 calls, 3 allocations");
    assert_eq!(events[1]["kind"], "key_created");
    assert!(events.iter().all(|event| event["masked_key"] != GOOD_KEY));

    let request = Request::builder()
        .method("POST")
        .uri("/admin/validate-all")
        .header("authorization", "Bearer read-token")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
