use httpmock::{Method::POST, MockServer};
use keypool::pool::{GeminiValidator, ValidatorConfig};
use keypool::Validator;

const KEY: &str = "AIzaSyValidatorKey0001";

fn can_bind_localhost() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(err) => panic!("failed to bind localhost for httpmock tests: {err}"),
    }
}

fn validator_for(server: &MockServer) -> GeminiValidator {
    GeminiValidator::new(&ValidatorConfig {
        base_url: server.url("/v1beta"),
        model: "gemini-2.5-flash".to_string(),
        timeout_seconds: 5,
    })
    .expect("validator")
}

#[tokio::test]
async fn healthy_key_sends_test_prompt_with_key_header() {
    if !can_bind_localhost() {
        return;
    }

    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1beta/models/gemini-2.5-flash:generateContent")
                .header("x-goog-api-key", KEY)
                .body_includes("\"text\":\"Test\"")
                .body_includes("\"maxOutputTokens\":10");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"candidates":[{"content":{"parts":[{"text":"ok"}]}}]}"#);
        })
        .await;

    let outcome = validator_for(&server).validate(KEY).await;
    assert!(outcome.healthy);
    assert!(outcome.error.is_none());
    mock.assert_async().await;
}

#[tokio::test]
async fn upstream_error_message_becomes_the_reason() {
    if !can_bind_localhost() {
        return;
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1beta/models/gemini-2.5-flash:generateContent");
            then.status(400)
                .header("content-type", "application/json")
                .body(
                    r#"{"error":{"code":400,"message":"API key expired. Please renew the API key.","status":"INVALID_ARGUMENT"}}"#,
                );
        })
        .await;

    let outcome = validator_for(&server).validate(KEY).await;
    assert!(!outcome.healthy);
    assert_eq!(
        outcome.reason(),
        "API key expired. Please renew the API key."
    );
}

#[tokio::test]
async fn status_text_is_used_without_an_error_body() {
    if !can_bind_localhost() {
        return;
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1beta/models/gemini-2.5-flash:generateContent");
            then.status(429).body("slow down");
        })
        .await;

    let outcome = validator_for(&server).validate(KEY).await;
    assert!(!outcome.healthy);
    assert_eq!(outcome.reason(), "HTTP 429: Too Many Requests");
}

#[tokio::test]
async fn unreachable_upstream_is_an_unhealthy_outcome() {
    let validator = GeminiValidator::new(&ValidatorConfig {
        base_url: "http://127.0.0.1:9/v1beta".to_string(),
        model: "gemini-2.5-flash".to_string(),
        timeout_seconds: 2,
    })
    .expect("validator");

    let outcome = validator.validate(KEY).await;
    assert!(!outcome.healthy);
    assert!(outcome.reason().starts_with("network error"));
}
