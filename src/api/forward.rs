//! Request forwarding: builds and issues the upstream HTTP call, demultiplexes
//! streaming vs. buffered responses, and applies usage extraction inline.

use axum::http::HeaderMap;
use bytes::Bytes;
use std::time::Instant;

use crate::api::models::{TokenUsage, Upstream};
use crate::api::streaming::{spawn_stream_fanout, StreamHandles};
use crate::core::error_types::{classify_transport_error, FailoverErrorType};
use crate::core::header_policy::{
    build_upstream_headers, detect_auth_scheme, inject_missing, redact_headers, AuthScheme,
};
use crate::core::utils::join_url;
use crate::services::compensation::Compensation;
use crate::services::usage::extract_usage;

/// Inputs for one forwarding attempt.
pub struct ForwardContext<'a> {
    pub client_headers: &'a HeaderMap,
    /// Outbound body bytes (model redirect already applied)
    pub body: &'a Bytes,
    pub compensations: &'a [Compensation],
    /// When recording, the SSE capture byte ceiling
    pub capture_ceiling: Option<usize>,
    /// Request start; the upstream timeout is measured from here
    pub started: Instant,
}

/// The outbound request as it went on the wire, kept for fixtures and the
/// failover trail. Headers are pre-redacted.
#[derive(Debug, Clone)]
pub struct OutboundSnapshot {
    pub method: String,
    pub url: String,
    pub headers: serde_json::Map<String, serde_json::Value>,
}

/// A completed upstream exchange.
#[derive(Debug)]
pub enum ForwardOutcome {
    /// `text/event-stream`: the client body is returned immediately and
    /// unmodified; usage arrives later through the handles
    Streaming {
        status: u16,
        response_headers: Vec<(String, String)>,
        body: axum::body::Body,
        handles: StreamHandles,
        outbound: OutboundSnapshot,
    },
    /// Everything else, fully buffered, with usage extracted inline when the
    /// body parses as JSON
    Buffered {
        status: u16,
        response_headers: Vec<(String, String)>,
        body: Bytes,
        usage: Option<TokenUsage>,
        outbound: OutboundSnapshot,
    },
}

impl ForwardOutcome {
    pub fn status(&self) -> u16 {
        match self {
            Self::Streaming { status, .. } | Self::Buffered { status, .. } => *status,
        }
    }
}

/// A transport-level failure: the upstream never produced a usable response.
#[derive(Debug)]
pub struct ForwardFailure {
    pub error_type: FailoverErrorType,
    pub message: String,
}

/// Forward one request to one upstream.
///
/// Header handling: hop-by-hop and infrastructure headers are stripped, the
/// client's auth scheme is preserved with the upstream's own secret
/// substituted, and compensations are injected missing-only. The whole attempt
/// runs under the upstream's configured timeout; hitting it cancels any
/// stream tee in progress.
pub async fn forward(
    http_client: &reqwest::Client,
    upstream: &Upstream,
    path: &str,
    ctx: ForwardContext<'_>,
) -> Result<ForwardOutcome, ForwardFailure> {
    let scheme = detect_auth_scheme(ctx.client_headers).unwrap_or(AuthScheme::Bearer);
    let mut headers = build_upstream_headers(ctx.client_headers, scheme, &upstream.api_key);

    for compensation in ctx.compensations {
        if inject_missing(&mut headers, &compensation.header, &compensation.value) {
            tracing::debug!(
                header = %compensation.header,
                source = %compensation.source,
                "Header compensated"
            );
        }
    }

    let url = join_url(&upstream.base_url, path);
    let deadline = ctx.started + std::time::Duration::from_secs(upstream.timeout_secs);

    let outbound = OutboundSnapshot {
        method: "POST".to_string(),
        url: url.clone(),
        headers: redact_headers(headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))),
    };

    let mut request = http_client.post(&url);
    for (name, value) in &headers {
        request = request.header(name.as_str(), value.as_str());
    }
    let request = request.body(ctx.body.clone());

    let remaining = deadline.saturating_duration_since(Instant::now());
    let response = match tokio::time::timeout(remaining, request.send()).await {
        Err(_) => return Err(timeout_failure(upstream)),
        Ok(Err(err)) => {
            let error_type = classify_transport_error(&err);
            let message = match error_type {
                FailoverErrorType::Timeout => timeout_failure(upstream).message,
                _ => format!("connection to {} failed: {}", upstream.name, err),
            };
            return Err(ForwardFailure {
                error_type,
                message,
            });
        }
        Ok(Ok(response)) => response,
    };

    let status = response.status().as_u16();
    let response_headers = relay_response_headers(&response);
    let is_event_stream = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("text/event-stream"))
        .unwrap_or(false);

    if is_event_stream {
        let deadline = tokio::time::Instant::now()
            + deadline.saturating_duration_since(Instant::now());
        let (body, handles) = spawn_stream_fanout(
            Box::pin(response.bytes_stream()),
            deadline,
            ctx.started,
            ctx.capture_ceiling,
        );
        return Ok(ForwardOutcome::Streaming {
            status,
            response_headers,
            body,
            handles,
            outbound,
        });
    }

    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("json"))
        .unwrap_or(false);

    let remaining = deadline.saturating_duration_since(Instant::now());
    let body = match tokio::time::timeout(remaining, response.bytes()).await {
        Err(_) => return Err(timeout_failure(upstream)),
        Ok(Err(err)) => {
            return Err(ForwardFailure {
                error_type: classify_transport_error(&err),
                message: format!("reading response from {} failed: {}", upstream.name, err),
            })
        }
        Ok(Ok(body)) => body,
    };

    // Parse failures degrade to "no usage" silently
    let usage = if is_json {
        serde_json::from_slice::<serde_json::Value>(&body)
            .ok()
            .as_ref()
            .and_then(extract_usage)
    } else {
        None
    };

    Ok(ForwardOutcome::Buffered {
        status,
        response_headers,
        body,
        usage,
        outbound,
    })
}

fn timeout_failure(upstream: &Upstream) -> ForwardFailure {
    ForwardFailure {
        error_type: FailoverErrorType::Timeout,
        message: format!(
            "upstream request timed out after {}s",
            upstream.timeout_secs
        ),
    }
}

/// Response headers worth relaying to the client. Hop-by-hop headers are the
/// gateway's own concern; content-length is recomputed by axum.
fn relay_response_headers(response: &reqwest::Response) -> Vec<(String, String)> {
    const RELAYED: &[&str] = &["content-type", "cache-control", "retry-after", "x-request-id"];
    response
        .headers()
        .iter()
        .filter(|(name, _)| RELAYED.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}
