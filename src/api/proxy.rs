//! The request pipeline: authentication, header compensation, failover
//! routing, response relay, and out-of-band accounting.
//!
//! Billing, request logging, and fixture writing run after the response bytes
//! are already flowing to the client, driven by the stream handles' usage
//! future.

use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::api::auth::{key_name, verify_auth};
use crate::api::forward::{forward, ForwardContext, ForwardOutcome, OutboundSnapshot};
use crate::api::handlers::AppState;
use crate::api::models::{Capability, FailoverAttempt, TokenUsage, Upstream};
use crate::api::streaming::StreamHandles;
use crate::core::error::{AppError, Result};
use crate::core::error_types::FailoverErrorType;
use crate::core::header_policy::redact_header_map;
use crate::core::logging::generate_request_id;
use crate::core::metrics::get_metrics;
use crate::core::request_logger::{log_request_record, RequestLogRecord};
use crate::core::utils::{non_empty_trimmed, truncate_string};
use crate::services::compensation::Compensation;
use crate::services::recorder::{
    Fixture, FixtureMeta, FixtureOutbound, FixtureRequest, FixtureResponse, StreamCapture,
    FIXTURE_VERSION,
};
use crate::with_request_context;

const ATTEMPT_BODY_SNAPSHOT_LIMIT: usize = 2048;
const FIXTURE_BODY_SNAPSHOT_LIMIT: usize = 64 * 1024;

/// Handle one proxied request end to end.
pub async fn handle_proxy_request(
    state: Arc<AppState>,
    path: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let started = Instant::now();
    let request_id = generate_request_id();

    let capability = Capability::from_path(path)
        .ok_or_else(|| AppError::BadRequest(format!("unsupported path: {}", path)))?;

    let client_key = {
        let keys = state.client_keys.load();
        verify_auth(&headers, keys.as_slice(), &state.rate_limiter)?
    };
    let client_key_name = key_name(&client_key);

    let path = path.to_string();
    with_request_context!(request_id.clone(), client_key_name.clone(), async move {
        let body_json: Option<Value> = serde_json::from_slice(&body).ok();
        let model_requested = extract_model(body_json.as_ref());
        let is_streaming = extract_stream_flag(body_json.as_ref());

        let compensations = state
            .compensation
            .build_compensations(capability, &headers, body_json.as_ref())
            .await;
        let session_id = extract_session_id(&headers, &compensations);

        tracing::debug!(
            capability = %capability,
            model = model_requested.as_deref().unwrap_or("-"),
            streaming = is_streaming,
            session = session_id.as_deref().unwrap_or("-"),
            compensations = compensations.len(),
            "Routing request"
        );

        let candidates = state.upstreams.candidates(
            capability,
            model_requested.as_deref(),
            session_id.as_deref(),
        );
        if candidates.is_empty() {
            return Err(AppError::NoUpstreamAvailable {
                capability: capability.to_string(),
                last_error: "no active upstream matches the request".to_string(),
            });
        }

        let request = PipelineRequest {
            state: state.clone(),
            request_id,
            path,
            capability,
            headers,
            body,
            body_json,
            model_requested,
            is_streaming,
            session_id,
            compensations,
            client_key_name,
            started,
        };

        run_failover_loop(request, candidates).await
    })
}

/// Everything one request carries through the failover loop.
struct PipelineRequest {
    state: Arc<AppState>,
    request_id: String,
    path: String,
    capability: Capability,
    headers: HeaderMap,
    body: Bytes,
    body_json: Option<Value>,
    model_requested: Option<String>,
    is_streaming: bool,
    session_id: Option<String>,
    compensations: Vec<Compensation>,
    client_key_name: String,
    started: Instant,
}

/// Walk the ordered candidates until one succeeds or the list is exhausted.
async fn run_failover_loop(
    request: PipelineRequest,
    candidates: Vec<Upstream>,
) -> Result<Response> {
    let state = request.state.clone();
    let mut attempts: Vec<FailoverAttempt> = Vec::new();
    let mut circuit_open_skips: u32 = 0;

    let capture_ceiling = state
        .recorder
        .enabled()
        .then(|| state.recorder.max_stream_capture_bytes());

    for upstream in candidates {
        if !state.circuit.can_route(&upstream).await {
            // Pre-attempt skip: the upstream was never contacted, so this is
            // not part of the attempt trail
            tracing::info!(upstream = %upstream.name, "Skipping upstream, circuit open");
            get_metrics()
                .failover_attempts
                .with_label_values(&[&upstream.name, FailoverErrorType::CircuitOpen.as_str()])
                .inc();
            circuit_open_skips += 1;
            continue;
        }

        let (outbound_body, model_effective) = apply_model_redirect(
            &request.body,
            request.body_json.as_ref(),
            &upstream,
            request.model_requested.as_deref(),
        );

        let outcome = forward(
            &state.http_client,
            &upstream,
            &request.path,
            ForwardContext {
                client_headers: &request.headers,
                body: &outbound_body,
                compensations: &request.compensations,
                capture_ceiling,
                started: request.started,
            },
        )
        .await;

        match outcome {
            Err(failure) => {
                tracing::warn!(
                    upstream = %upstream.name,
                    error_type = %failure.error_type,
                    "Forward attempt failed: {}",
                    failure.message
                );
                record_attempt_metrics(&upstream, failure.error_type);
                attempts.push(FailoverAttempt::new(
                    &upstream,
                    failure.error_type,
                    failure.message,
                ));
                state
                    .circuit
                    .record_failure(&upstream, failure.error_type)
                    .await;
                continue;
            }
            Ok(forwarded) => {
                let status = forwarded.status();
                match FailoverErrorType::from_status(status) {
                    None => {
                        return Ok(succeed(request, upstream, model_effective, forwarded).await);
                    }
                    Some(error_type) if !error_type.is_retryable() => {
                        // 4xx (≠429): a client-request defect, not upstream
                        // unavailability. Recorded on the trail, passed
                        // through, never retried.
                        let attempt = attempt_from_response(&upstream, error_type, &forwarded);
                        record_attempt_metrics(&upstream, error_type);
                        attempts.push(attempt);
                        let response = passthrough_response(forwarded);
                        finalize_failure(request, attempts, circuit_open_skips, Some(status));
                        return Ok(response);
                    }
                    Some(error_type) => {
                        tracing::warn!(
                            upstream = %upstream.name,
                            status = status,
                            error_type = %error_type,
                            retry_after_secs = retry_after_of(&forwarded)
                                .map(|d| d.as_secs())
                                .unwrap_or(0),
                            "Upstream returned retryable error"
                        );
                        let attempt = attempt_from_response(&upstream, error_type, &forwarded);
                        record_attempt_metrics(&upstream, error_type);
                        attempts.push(attempt);
                        state.circuit.record_failure(&upstream, error_type).await;
                        if error_type == FailoverErrorType::Http429 {
                            tokio::time::sleep(failover_backoff(attempts.len() as u32)).await;
                        }
                        continue;
                    }
                }
            }
        }
    }

    // Exhausted: surface the last failure
    let response = exhausted_response(request.capability, &attempts, circuit_open_skips);
    finalize_failure(request, attempts, circuit_open_skips, None);
    response
}

/// The winning attempt: record success, refresh affinity, relay the response,
/// and push accounting off the hot path.
async fn succeed(
    request: PipelineRequest,
    upstream: Upstream,
    model_effective: Option<String>,
    forwarded: ForwardOutcome,
) -> Response {
    let state = request.state.clone();
    state.circuit.record_success(&upstream).await;
    if let Some(session_id) = &request.session_id {
        state.upstreams.bind_session(session_id, &upstream.id);
    }

    match forwarded {
        ForwardOutcome::Streaming {
            status,
            response_headers,
            body,
            handles,
            outbound,
        } => {
            let response = relay_response(status, &response_headers, body);
            spawn_streaming_finalize(request, upstream, model_effective, outbound, handles, status);
            response
        }
        ForwardOutcome::Buffered {
            status,
            response_headers,
            body,
            usage,
            outbound,
        } => {
            // Restore the client-requested model name on redirected responses;
            // non-redirected bodies pass through byte-identical
            let client_body = if model_effective.as_deref() != request.model_requested.as_deref() {
                restore_model_in_body(&body, request.model_requested.as_deref())
            } else {
                body.clone()
            };
            let response = relay_response(status, &response_headers, Body::from(client_body));
            spawn_buffered_finalize(
                request,
                upstream,
                model_effective,
                outbound,
                status,
                body,
                usage,
            );
            response
        }
    }
}

fn relay_response(status: u16, headers: &[(String, String)], body: Body) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(body).unwrap_or_else(|err| {
        tracing::error!(error = %err, "Failed to build relay response");
        axum::response::IntoResponse::into_response(AppError::Internal(
            "failed to build relay response".to_string(),
        ))
    })
}

/// Relay a terminal upstream error body to the client as-is.
fn passthrough_response(forwarded: ForwardOutcome) -> Response {
    match forwarded {
        ForwardOutcome::Buffered {
            status,
            response_headers,
            body,
            ..
        } => relay_response(status, &response_headers, Body::from(body)),
        ForwardOutcome::Streaming {
            status,
            response_headers,
            body,
            ..
        } => relay_response(status, &response_headers, body),
    }
}

/// Build the client response when every candidate failed.
fn exhausted_response(
    capability: Capability,
    attempts: &[FailoverAttempt],
    circuit_open_skips: u32,
) -> Result<Response> {
    let Some(last) = attempts.last() else {
        return Err(AppError::NoUpstreamAvailable {
            capability: capability.to_string(),
            last_error: format!(
                "all {} eligible upstreams skipped, circuits open",
                circuit_open_skips
            ),
        });
    };

    match last.status_code {
        Some(status) => {
            let body = last
                .response_body_json
                .as_ref()
                .map(|v| v.to_string())
                .or_else(|| last.response_body_text.clone())
                .unwrap_or_else(|| {
                    serde_json::json!({
                        "error": {
                            "message": last.error_message,
                            "type": crate::core::error_types::ERROR_TYPE_API,
                            "code": status
                        }
                    })
                    .to_string()
                });
            Ok(relay_response(
                status,
                &[("content-type".to_string(), "application/json".to_string())],
                Body::from(body),
            ))
        }
        None if last.error_type == FailoverErrorType::Timeout.as_str() => {
            Err(AppError::NoUpstreamAvailable {
                capability: capability.to_string(),
                last_error: last.error_message.clone(),
            })
        }
        None => Err(AppError::NoUpstreamAvailable {
            capability: capability.to_string(),
            last_error: last.error_message.clone(),
        }),
    }
}

/// Pause before the next candidate after a 429. The rejected upstream's
/// Retry-After applies to itself, not the next candidate, so the pause is a
/// short linear backoff only.
fn failover_backoff(attempt_index: u32) -> std::time::Duration {
    let ms = 80u64.saturating_mul(attempt_index.max(1) as u64).min(800);
    std::time::Duration::from_millis(ms)
}

fn retry_after_of(forwarded: &ForwardOutcome) -> Option<std::time::Duration> {
    let ForwardOutcome::Buffered {
        response_headers, ..
    } = forwarded
    else {
        return None;
    };
    let value = response_headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
        .map(|(_, value)| value.as_str());
    crate::core::error_types::parse_retry_after(value)
}

fn record_attempt_metrics(upstream: &Upstream, error_type: FailoverErrorType) {
    get_metrics()
        .failover_attempts
        .with_label_values(&[&upstream.name, error_type.as_str()])
        .inc();
}

fn attempt_from_response(
    upstream: &Upstream,
    error_type: FailoverErrorType,
    forwarded: &ForwardOutcome,
) -> FailoverAttempt {
    let mut attempt = FailoverAttempt::new(
        upstream,
        error_type,
        format!("upstream returned HTTP {}", forwarded.status()),
    );
    attempt.status_code = Some(forwarded.status());

    if let ForwardOutcome::Buffered {
        response_headers,
        body,
        ..
    } = forwarded
    {
        attempt.response_headers = Some(crate::core::header_policy::redact_headers(
            response_headers.iter().map(|(n, v)| (n.as_str(), v.as_str())),
        ));
        match serde_json::from_slice::<Value>(body) {
            Ok(json) => attempt.response_body_json = Some(json),
            Err(_) => {
                let text = String::from_utf8_lossy(body);
                attempt.response_body_text =
                    Some(truncate_string(&text, ATTEMPT_BODY_SNAPSHOT_LIMIT));
            }
        }
    }

    attempt
}

// ============================================================================
// Request parsing helpers
// ============================================================================

fn extract_model(body: Option<&Value>) -> Option<String> {
    body?
        .get("model")
        .and_then(Value::as_str)
        .and_then(non_empty_trimmed)
        .map(str::to_string)
}

fn extract_stream_flag(body: Option<&Value>) -> bool {
    body.and_then(|b| b.get("stream"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// The session id the router keys affinity on: a client-sent header first,
/// else whatever the compensator recovered for `session_id`.
fn extract_session_id(headers: &HeaderMap, compensations: &[Compensation]) -> Option<String> {
    for name in ["session_id", "session-id", "x-session-id"] {
        if let Some(value) = headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(non_empty_trimmed)
        {
            return Some(value.to_string());
        }
    }
    compensations
        .iter()
        .find(|c| c.header.eq_ignore_ascii_case("session_id"))
        .map(|c| c.value.clone())
}

/// Rewrite the outbound body's model field when the upstream redirects it.
/// Returns the bytes to send and the effective model name.
fn apply_model_redirect(
    body: &Bytes,
    body_json: Option<&Value>,
    upstream: &Upstream,
    model: Option<&str>,
) -> (Bytes, Option<String>) {
    let Some(model) = model else {
        return (body.clone(), None);
    };
    let redirected = upstream.redirect_model(model);
    if redirected == model {
        return (body.clone(), Some(model.to_string()));
    }

    let Some(json) = body_json else {
        return (body.clone(), Some(model.to_string()));
    };
    let mut rewritten = json.clone();
    if let Some(obj) = rewritten.as_object_mut() {
        obj.insert("model".to_string(), Value::String(redirected.to_string()));
    }
    match serde_json::to_vec(&rewritten) {
        Ok(bytes) => (Bytes::from(bytes), Some(redirected.to_string())),
        Err(_) => (body.clone(), Some(model.to_string())),
    }
}

/// Restore the client-requested model name in a buffered JSON response.
fn restore_model_in_body(body: &Bytes, model_requested: Option<&str>) -> Bytes {
    let Some(model) = model_requested else {
        return body.clone();
    };
    let Ok(mut json) = serde_json::from_slice::<Value>(body) else {
        return body.clone();
    };
    let Some(obj) = json.as_object_mut() else {
        return body.clone();
    };
    if !obj.contains_key("model") {
        return body.clone();
    }
    obj.insert("model".to_string(), Value::String(model.to_string()));
    serde_json::to_vec(&json)
        .map(Bytes::from)
        .unwrap_or_else(|_| body.clone())
}

// ============================================================================
// Off-hot-path finalization: billing, logging, fixtures
// ============================================================================

fn spawn_buffered_finalize(
    request: PipelineRequest,
    upstream: Upstream,
    model_effective: Option<String>,
    outbound: OutboundSnapshot,
    status: u16,
    response_body: Bytes,
    usage: Option<TokenUsage>,
) {
    tokio::spawn(async move {
        let duration_ms = request.started.elapsed().as_millis() as u64;
        let response_snapshot = buffered_response_snapshot(status, &response_body);
        finalize_request(
            request,
            upstream,
            model_effective,
            outbound,
            status,
            usage,
            None,
            duration_ms,
            Some(response_snapshot),
        )
        .await;
    });
}

fn spawn_streaming_finalize(
    request: PipelineRequest,
    upstream: Upstream,
    model_effective: Option<String>,
    outbound: OutboundSnapshot,
    handles: StreamHandles,
    status: u16,
) {
    tokio::spawn(async move {
        // The usage future resolves only once the extraction branch has fully
        // drained; drain errors surface as a plain None
        let StreamHandles {
            usage,
            outcome,
            capture,
        } = handles;
        let usage = usage.await.unwrap_or(None);
        let outcome = outcome.await.ok();
        let capture = match capture {
            Some(rx) => rx.await.ok(),
            None => None,
        };

        let (ttft_ms, duration_ms) = outcome
            .as_ref()
            .map(|o| (o.ttft_ms, o.duration_ms))
            .unwrap_or((None, request.started.elapsed().as_millis() as u64));

        if let Some(ttft) = ttft_ms {
            get_metrics()
                .ttft
                .with_label_values(&[
                    request.model_requested.as_deref().unwrap_or("unknown"),
                    &upstream.name,
                ])
                .observe(ttft as f64 / 1000.0);
        }

        let response_snapshot = capture.map(|c| stream_response_snapshot(status, c));
        finalize_request(
            request,
            upstream,
            model_effective,
            outbound,
            status,
            usage,
            ttft_ms,
            duration_ms,
            response_snapshot,
        )
        .await;
    });
}

fn buffered_response_snapshot(status: u16, body: &Bytes) -> FixtureResponse {
    let body_value = match serde_json::from_slice::<Value>(body) {
        Ok(json) => Some(json),
        Err(_) => {
            let text = String::from_utf8_lossy(body);
            Some(Value::String(truncate_string(
                &text,
                FIXTURE_BODY_SNAPSHOT_LIMIT,
            )))
        }
    };
    FixtureResponse {
        status,
        headers: serde_json::Map::new(),
        body: body_value,
        truncated: false,
    }
}

fn stream_response_snapshot(status: u16, capture: StreamCapture) -> FixtureResponse {
    let (body, truncated) = capture.into_body();
    FixtureResponse {
        status,
        headers: serde_json::Map::new(),
        body,
        truncated,
    }
}

#[allow(clippy::too_many_arguments)]
async fn finalize_request(
    request: PipelineRequest,
    upstream: Upstream,
    model_effective: Option<String>,
    outbound: OutboundSnapshot,
    status: u16,
    usage: Option<TokenUsage>,
    ttft_ms: Option<u64>,
    duration_ms: u64,
    response_snapshot: Option<FixtureResponse>,
) {
    let state = &request.state;
    let model_for_billing = model_effective
        .as_deref()
        .or(request.model_requested.as_deref());

    let billing = state
        .billing
        .bill(model_for_billing, usage.as_ref(), &upstream)
        .await;

    record_request_metrics(&request, &upstream, status, duration_ms, usage.as_ref());
    if let Some(snapshot) = billing.snapshot.as_ref() {
        get_metrics()
            .billed_cost_usd
            .with_label_values(&[
                model_for_billing.unwrap_or("unknown"),
                &upstream.name,
            ])
            .observe(snapshot.total_cost_usd());
    }

    let usage_record = usage.unwrap_or_default();
    log_request_record(RequestLogRecord {
        request_id: request.request_id.clone(),
        endpoint: Some(request.path.clone()),
        key_name: Some(request.client_key_name.clone()),
        capability: Some(request.capability.to_string()),
        model_requested: request.model_requested.clone(),
        model_effective,
        upstream_id: Some(upstream.id.clone()),
        upstream_name: Some(upstream.name.clone()),
        is_streaming: request.is_streaming,
        status_code: Some(status as i32),
        prompt_tokens: usage_record.prompt_tokens as i64,
        completion_tokens: usage_record.completion_tokens as i64,
        total_tokens: usage_record.total_tokens as i64,
        cached_tokens: usage_record.cached_tokens as i64,
        reasoning_tokens: usage_record.reasoning_tokens as i64,
        cache_creation_tokens: usage_record.cache_creation_tokens as i64,
        cache_read_tokens: usage_record.cache_read_tokens as i64,
        total_duration_ms: Some(duration_ms as i64),
        ttft_ms: ttft_ms.map(|t| t as i64),
        error_type: None,
        error_message: None,
        failover_attempts: None,
        billing_status: Some(billing.status.to_string()),
        unbilled_reason: billing.unbilled_reason.map(|r| r.as_str().to_string()),
        price_source: billing
            .snapshot
            .as_ref()
            .map(|s| s.price_source.as_str().to_string()),
        cost_femto_usd: billing.snapshot.as_ref().map(|s| s.total_cost_femto_usd),
        timestamp: Utc::now(),
    });

    if state.recorder.should_record(Some(status)) {
        let fixture = build_fixture(
            &request,
            &upstream,
            outbound,
            status,
            duration_ms,
            response_snapshot,
            None,
        );
        state.recorder.write_fixture(fixture).await;
    }
}

/// Log and (when configured) record a request that never succeeded.
fn finalize_failure(
    request: PipelineRequest,
    attempts: Vec<FailoverAttempt>,
    circuit_open_skips: u32,
    terminal_status: Option<u16>,
) {
    tokio::spawn(async move {
        let state = &request.state;
        let duration_ms = request.started.elapsed().as_millis() as u64;
        let last = attempts.last();
        let status = terminal_status.or_else(|| last.and_then(|a| a.status_code));

        if circuit_open_skips > 0 {
            tracing::info!(
                skips = circuit_open_skips,
                "Candidates skipped with open circuits"
            );
        }

        let attempts_json = if attempts.is_empty() {
            None
        } else {
            serde_json::to_string(&attempts).ok()
        };

        log_request_record(RequestLogRecord {
            request_id: request.request_id.clone(),
            endpoint: Some(request.path.clone()),
            key_name: Some(request.client_key_name.clone()),
            capability: Some(request.capability.to_string()),
            model_requested: request.model_requested.clone(),
            model_effective: None,
            upstream_id: last.map(|a| a.upstream_id.clone()),
            upstream_name: last.map(|a| a.upstream_name.clone()),
            is_streaming: request.is_streaming,
            status_code: status.map(|s| s as i32),
            total_duration_ms: Some(duration_ms as i64),
            error_type: last.map(|a| a.error_type.clone()),
            error_message: last.map(|a| a.error_message.clone()),
            failover_attempts: attempts_json,
            billing_status: Some(
                crate::core::error_types::BILLING_STATUS_UNBILLED.to_string(),
            ),
            unbilled_reason: Some(
                crate::core::error_types::UnbilledReason::UsageMissing
                    .as_str()
                    .to_string(),
            ),
            timestamp: Utc::now(),
            ..Default::default()
        });

        if state.recorder.should_record(status) {
            let upstream_name = last
                .map(|a| a.upstream_name.clone())
                .unwrap_or_else(|| "none".to_string());
            let fixture = Fixture {
                meta: FixtureMeta {
                    request_id: request.request_id.clone(),
                    created_at: Utc::now(),
                    provider_type: request.capability.to_string(),
                    route: request.path.clone(),
                    model: request.model_requested.clone(),
                    duration_ms,
                    version: FIXTURE_VERSION,
                },
                inbound: inbound_snapshot(&request),
                outbound: FixtureOutbound {
                    upstream: upstream_name,
                    request: FixtureRequest {
                        method: "POST".to_string(),
                        url: String::new(),
                        headers: serde_json::Map::new(),
                        body: None,
                    },
                    response: FixtureResponse {
                        status: status.unwrap_or(0),
                        headers: serde_json::Map::new(),
                        body: None,
                        truncated: false,
                    },
                },
                downstream: None,
                failover: (!attempts.is_empty()).then_some(attempts),
            };
            state.recorder.write_fixture(fixture).await;
        }
    });
}

fn inbound_snapshot(request: &PipelineRequest) -> FixtureRequest {
    FixtureRequest {
        method: "POST".to_string(),
        url: request.path.clone(),
        headers: redact_header_map(&request.headers),
        body: request.body_json.clone(),
    }
}

fn build_fixture(
    request: &PipelineRequest,
    upstream: &Upstream,
    outbound: OutboundSnapshot,
    status: u16,
    duration_ms: u64,
    response: Option<FixtureResponse>,
    failover: Option<Vec<FailoverAttempt>>,
) -> Fixture {
    Fixture {
        meta: FixtureMeta {
            request_id: request.request_id.clone(),
            created_at: Utc::now(),
            provider_type: request.capability.to_string(),
            route: request.path.clone(),
            model: request.model_requested.clone(),
            duration_ms,
            version: FIXTURE_VERSION,
        },
        inbound: inbound_snapshot(request),
        outbound: FixtureOutbound {
            upstream: upstream.name.clone(),
            request: FixtureRequest {
                method: outbound.method,
                url: crate::services::recorder::redact_url(&outbound.url),
                headers: outbound.headers,
                body: None,
            },
            response: response.unwrap_or(FixtureResponse {
                status,
                headers: serde_json::Map::new(),
                body: None,
                truncated: false,
            }),
        },
        downstream: None,
        failover,
    }
}

fn record_request_metrics(
    request: &PipelineRequest,
    upstream: &Upstream,
    status: u16,
    duration_ms: u64,
    usage: Option<&TokenUsage>,
) {
    let metrics = get_metrics();
    metrics
        .request_count
        .with_label_values(&[
            &request.path,
            request.capability.as_str(),
            &upstream.name,
            &status.to_string(),
        ])
        .inc();
    metrics
        .request_duration
        .with_label_values(&[&request.path, request.capability.as_str(), &upstream.name])
        .observe(duration_ms as f64 / 1000.0);

    if let Some(usage) = usage {
        let model = request.model_requested.as_deref().unwrap_or("unknown");
        for (category, count) in [
            ("prompt", usage.prompt_tokens),
            ("completion", usage.completion_tokens),
            ("total", usage.total_tokens),
            ("cache_read", usage.cache_read_tokens),
            ("cache_creation", usage.cache_creation_tokens),
        ] {
            if count > 0 {
                metrics
                    .token_usage
                    .with_label_values(&[model, &upstream.name, category])
                    .inc_by(count);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::CircuitBreakerConfig;
    use serde_json::json;
    use std::collections::HashMap;

    fn upstream_with_redirect() -> Upstream {
        Upstream {
            id: "up-1".to_string(),
            name: "primary".to_string(),
            base_url: "https://api.example.com".to_string(),
            api_key: String::new(),
            timeout_secs: 30,
            is_active: true,
            priority: 0,
            weight: 1,
            capabilities: vec!["openai".to_string()],
            allowed_models: None,
            model_redirects: HashMap::from([("gpt-4".to_string(), "gpt-4-turbo".to_string())]),
            billing_input_multiplier: 1.0,
            billing_output_multiplier: 1.0,
            circuit_config: CircuitBreakerConfig::default(),
        }
    }

    #[test]
    fn test_extract_model() {
        assert_eq!(
            extract_model(Some(&json!({"model": "gpt-4"}))),
            Some("gpt-4".to_string())
        );
        assert_eq!(extract_model(Some(&json!({"model": "  "}))), None);
        assert_eq!(extract_model(Some(&json!({}))), None);
        assert_eq!(extract_model(None), None);
    }

    #[test]
    fn test_extract_stream_flag() {
        assert!(extract_stream_flag(Some(&json!({"stream": true}))));
        assert!(!extract_stream_flag(Some(&json!({"stream": false}))));
        assert!(!extract_stream_flag(Some(&json!({}))));
        assert!(!extract_stream_flag(None));
    }

    #[test]
    fn test_extract_session_id_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-session-id", "from-header".parse().unwrap());
        let comps = vec![Compensation {
            header: "session_id".to_string(),
            value: "from-comp".to_string(),
            source: "body.prompt_cache_key".to_string(),
        }];
        assert_eq!(
            extract_session_id(&headers, &comps),
            Some("from-header".to_string())
        );
        assert_eq!(
            extract_session_id(&HeaderMap::new(), &comps),
            Some("from-comp".to_string())
        );
        assert_eq!(extract_session_id(&HeaderMap::new(), &[]), None);
    }

    #[test]
    fn test_apply_model_redirect_rewrites_body() {
        let body_json = json!({"model": "gpt-4", "stream": false});
        let body = Bytes::from(serde_json::to_vec(&body_json).unwrap());
        let upstream = upstream_with_redirect();

        let (out, effective) =
            apply_model_redirect(&body, Some(&body_json), &upstream, Some("gpt-4"));
        assert_eq!(effective, Some("gpt-4-turbo".to_string()));
        let rewritten: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(rewritten["model"], "gpt-4-turbo");
        assert_eq!(rewritten["stream"], false);
    }

    #[test]
    fn test_apply_model_redirect_no_redirect() {
        let body_json = json!({"model": "gpt-3.5"});
        let body = Bytes::from(serde_json::to_vec(&body_json).unwrap());
        let upstream = upstream_with_redirect();

        let (out, effective) =
            apply_model_redirect(&body, Some(&body_json), &upstream, Some("gpt-3.5"));
        assert_eq!(effective, Some("gpt-3.5".to_string()));
        assert_eq!(out, body);
    }

    #[test]
    fn test_restore_model_in_body() {
        let body = Bytes::from(r#"{"id":"1","model":"gpt-4-turbo","choices":[]}"#);
        let restored = restore_model_in_body(&body, Some("gpt-4"));
        let json: Value = serde_json::from_slice(&restored).unwrap();
        assert_eq!(json["model"], "gpt-4");
    }

    #[test]
    fn test_failover_backoff_is_linear_and_capped() {
        assert_eq!(failover_backoff(0).as_millis(), 80);
        assert_eq!(failover_backoff(1).as_millis(), 80);
        assert_eq!(failover_backoff(3).as_millis(), 240);
        assert_eq!(failover_backoff(100).as_millis(), 800);
    }

    #[test]
    fn test_restore_model_leaves_modelless_body() {
        let body = Bytes::from(r#"{"ok":true}"#);
        assert_eq!(restore_model_in_body(&body, Some("gpt-4")), body);

        let non_json = Bytes::from("plain");
        assert_eq!(restore_model_in_body(&non_json, Some("gpt-4")), non_json);
    }
}
