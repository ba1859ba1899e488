//! HTTP surface: application state, proxy route handlers, and the router.

use arc_swap::ArcSwap;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::api::auth::ClientKey;
use crate::api::proxy::handle_proxy_request;
use crate::core::config::AppConfig;
use crate::core::logging::generate_request_id;
use crate::core::metrics::render_metrics;
use crate::core::rate_limiter::RateLimiter;
use crate::services::billing::BillingService;
use crate::services::circuit_breaker::CircuitBreaker;
use crate::services::compensation::CompensationService;
use crate::services::recorder::TrafficRecorder;
use crate::services::upstream_service::UpstreamService;

/// Shared application state.
pub struct AppState {
    pub config: AppConfig,
    pub http_client: reqwest::Client,
    pub upstreams: Arc<UpstreamService>,
    pub circuit: Arc<CircuitBreaker>,
    pub compensation: Arc<CompensationService>,
    pub billing: Arc<BillingService>,
    pub recorder: Arc<TrafficRecorder>,
    pub rate_limiter: Arc<RateLimiter>,
    /// Hot-swapped client key snapshot
    pub client_keys: ArcSwap<Vec<ClientKey>>,
}

impl AppState {
    pub fn reload_client_keys(&self, keys: Vec<ClientKey>) {
        let live_hashes = keys
            .iter()
            .filter(|k| k.enabled)
            .map(|k| k.key_hash.clone())
            .collect();
        for key in keys.iter().filter(|k| k.enabled) {
            if let Some(limit) = &key.rate_limit {
                self.rate_limiter.register_key(&key.key_hash, limit);
            }
        }
        self.rate_limiter.retain_keys(&live_hashes);
        self.client_keys.store(Arc::new(keys));
    }
}

async fn proxy_or_error(
    state: Arc<AppState>,
    path: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match handle_proxy_request(state, path, headers, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

/// `POST /v1/chat/completions` (OpenAI Chat Completions protocol).
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_or_error(state, "/v1/chat/completions", headers, body).await
}

/// `POST /v1/responses` (OpenAI Responses protocol).
pub async fn responses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_or_error(state, "/v1/responses", headers, body).await
}

/// `POST /v1/messages` (Anthropic Messages protocol).
pub async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_or_error(state, "/v1/messages", headers, body).await
}

/// Liveness check.
pub async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Prometheus metrics in text exposition format.
pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render_metrics(),
    )
}

/// Every response carries an `x-request-id`, minted here unless the client
/// sent one.
pub async fn request_id_middleware(request: Request<axum::body::Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Build the full router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/responses", post(responses))
        .route("/v1/messages", post(messages))
        .with_state(state)
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
