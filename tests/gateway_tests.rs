//! End-to-end gateway tests against mocked upstreams.
//!
//! These tests drive the full router with wiremock providers: failover
//! ordering, terminal 4xx handling, circuit gating across requests, header
//! policy on the wire, and streaming passthrough.

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use llm_gateway_rust::{
    api::{auth::ClientKey, build_router, AppState, CircuitBreakerConfig, Upstream},
    core::{
        config::{AppConfig, RecorderConfig},
        rate_limiter::RateLimiter,
        secrets::hash_key,
    },
    services::{
        billing::MemoryPriceStore, circuit_breaker::MemoryCircuitStateStore,
        compensation::builtin_rules, BillingService, CircuitBreaker, CompensationService,
        TrafficRecorder, UpstreamService,
    },
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CLIENT_KEY: &str = "sk-test-client";

fn test_upstream(id: &str, base_url: &str, priority: i32) -> Upstream {
    Upstream {
        id: id.to_string(),
        name: id.to_string(),
        base_url: base_url.trim_end_matches('/').to_string(),
        api_key: format!("sk-upstream-{}", id),
        timeout_secs: 10,
        is_active: true,
        priority,
        weight: 1,
        capabilities: vec![
            "openai".to_string(),
            "openai_responses".to_string(),
            "anthropic".to_string(),
        ],
        allowed_models: None,
        model_redirects: HashMap::new(),
        billing_input_multiplier: 1.0,
        billing_output_multiplier: 1.0,
        circuit_config: CircuitBreakerConfig::default(),
    }
}

fn build_app(upstreams: Vec<Upstream>) -> (Router, Arc<AppState>) {
    let state = Arc::new(AppState {
        config: AppConfig::default(),
        http_client: reqwest::Client::new(),
        upstreams: Arc::new(UpstreamService::new(upstreams, Duration::from_secs(600))),
        circuit: Arc::new(CircuitBreaker::new(Arc::new(
            MemoryCircuitStateStore::new(),
        ))),
        compensation: Arc::new(CompensationService::with_static_rules(builtin_rules())),
        billing: Arc::new(BillingService::new(Arc::new(MemoryPriceStore::default()))),
        recorder: Arc::new(TrafficRecorder::new(RecorderConfig::default())),
        rate_limiter: Arc::new(RateLimiter::new()),
        client_keys: ArcSwap::from_pointee(vec![ClientKey {
            id: "key-1".to_string(),
            name: "test-key".to_string(),
            key_hash: hash_key(CLIENT_KEY),
            enabled: true,
            rate_limit: None,
        }]),
    });
    (build_router(state.clone()), state)
}

fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {}", CLIENT_KEY))
        .header("content-type", "application/json")
        .header("x-forwarded-for", "203.0.113.9")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

fn chat_completion_body() -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": "test-gpt-4",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 10, "completion_tokens": 9, "total_tokens": 19}
    })
}

#[tokio::test]
async fn test_successful_chat_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_body()))
        .mount(&server)
        .await;

    let (app, _) = build_app(vec![test_upstream("primary", &server.uri(), 0)]);
    let response = app
        .oneshot(chat_request(json!({"model": "gpt-4", "messages": []})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["usage"]["total_tokens"], 19);
}

#[tokio::test]
async fn test_upstream_receives_substituted_secret_and_stripped_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_body()))
        .mount(&server)
        .await;

    let (app, _) = build_app(vec![test_upstream("primary", &server.uri(), 0)]);
    app.oneshot(chat_request(json!({"model": "gpt-4", "messages": []})))
        .await
        .unwrap();

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let request = &received[0];
    assert_eq!(
        request.headers.get("authorization").unwrap().to_str().unwrap(),
        "Bearer sk-upstream-primary"
    );
    // Infrastructure headers never reach the upstream
    assert!(request.headers.get("x-forwarded-for").is_none());
}

#[tokio::test]
async fn test_failover_to_next_upstream_on_5xx() {
    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&broken)
        .await;

    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_body()))
        .mount(&healthy)
        .await;

    let (app, _) = build_app(vec![
        test_upstream("broken", &broken.uri(), 0),
        test_upstream("healthy", &healthy.uri(), 1),
    ]);
    let response = app
        .oneshot(chat_request(json!({"model": "gpt-4", "messages": []})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(broken.received_requests().await.unwrap().len(), 1);
    assert_eq!(healthy.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_429_is_retried_on_next_upstream() {
    let limited = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "30")
                .set_body_json(json!({"error": {"message": "rate limited"}})),
        )
        .mount(&limited)
        .await;

    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_body()))
        .mount(&healthy)
        .await;

    let (app, _) = build_app(vec![
        test_upstream("limited", &limited.uri(), 0),
        test_upstream("healthy", &healthy.uri(), 1),
    ]);
    let response = app
        .oneshot(chat_request(json!({"model": "gpt-4", "messages": []})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_4xx_is_terminal_and_passed_through() {
    let rejecting = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({"error": {"message": "bad schema", "type": "invalid_request_error"}})),
        )
        .mount(&rejecting)
        .await;

    let fallback = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_body()))
        .mount(&fallback)
        .await;

    let (app, _) = build_app(vec![
        test_upstream("rejecting", &rejecting.uri(), 0),
        test_upstream("fallback", &fallback.uri(), 1),
    ]);
    let response = app
        .oneshot(chat_request(json!({"model": "gpt-4", "messages": []})))
        .await
        .unwrap();

    // The client error comes straight back; the second upstream is never tried
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["error"]["message"], "bad schema");
    assert_eq!(fallback.received_requests().await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_exhausted_candidates_relay_last_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502).set_body_json(json!({"error": "bad gateway"})))
        .mount(&server)
        .await;

    let (app, _) = build_app(vec![test_upstream("only", &server.uri(), 0)]);
    let response = app
        .oneshot(chat_request(json!({"model": "gpt-4", "messages": []})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_missing_api_key_rejected() {
    let (app, _) = build_app(vec![]);
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_wrong_api_key_rejected() {
    let (app, _) = build_app(vec![]);
    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("authorization", "Bearer sk-nope")
        .body(Body::from("{}"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_no_matching_upstream_is_service_unavailable() {
    let (app, _) = build_app(vec![]);
    let response = app
        .oneshot(chat_request(json!({"model": "gpt-4", "messages": []})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_circuit_opens_after_consecutive_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let mut upstream = test_upstream("flaky", &server.uri(), 0);
    upstream.circuit_config = CircuitBreakerConfig {
        failure_threshold: 2,
        success_threshold: 1,
        open_duration_secs: 3600,
        probe_interval_secs: 1,
    };
    let (app, _) = build_app(vec![upstream]);

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(chat_request(json!({"model": "gpt-4", "messages": []})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    // Circuit is open now: the candidate is skipped without being contacted
    let response = app
        .oneshot(chat_request(json!({"model": "gpt-4", "messages": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_model_redirect_applied_and_restored() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-2",
            "model": "provider-gpt-4",
            "choices": [],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1}
        })))
        .mount(&server)
        .await;

    let mut upstream = test_upstream("redirecting", &server.uri(), 0);
    upstream.model_redirects =
        HashMap::from([("gpt-4".to_string(), "provider-gpt-4".to_string())]);
    let (app, _) = build_app(vec![upstream]);

    let response = app
        .oneshot(chat_request(json!({"model": "gpt-4", "messages": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Outbound body carried the redirect target
    let received = server.received_requests().await.unwrap();
    let sent: Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(sent["model"], "provider-gpt-4");

    // Client sees the name it asked for
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["model"], "gpt-4");
}

#[tokio::test]
async fn test_session_id_compensated_from_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_body()))
        .mount(&server)
        .await;

    let (app, _) = build_app(vec![test_upstream("primary", &server.uri(), 0)]);
    app.oneshot(chat_request(json!({
        "model": "gpt-4",
        "messages": [],
        "prompt_cache_key": "sess-abc"
    })))
    .await
    .unwrap();

    let received = server.received_requests().await.unwrap();
    assert_eq!(
        received[0].headers.get("session_id").unwrap().to_str().unwrap(),
        "sess-abc"
    );
}

#[tokio::test]
async fn test_streaming_bytes_relayed_unchanged() {
    let sse = "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{\"content\":\"hello\"}}]}\n\n\
               data: {\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":7}}\n\n\
               data: [DONE]\n\n";
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(sse, "text/event-stream"),
        )
        .mount(&server)
        .await;

    let (app, _) = build_app(vec![test_upstream("primary", &server.uri(), 0)]);
    let response = app
        .oneshot(chat_request(json!({"model": "gpt-4", "messages": [], "stream": true})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap(),
        "text/event-stream"
    );
    assert_eq!(body_bytes(response).await, sse.as_bytes());
}

#[tokio::test]
async fn test_response_carries_request_id() {
    let (app, _) = build_app(vec![]);
    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}
