//! Traffic fixture recording for deterministic replay testing.
//!
//! The recorder observes the same data the pipeline handles, non-invasively:
//! the inbound body is cloned before forwarding, streaming responses feed an
//! SSE-event-bounded capture up to a byte ceiling, and the fixture is written
//! off the hot path after the outcome is known. A recording failure can never
//! surface on the live request/response path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::api::models::FailoverAttempt;
use crate::core::config::{RecorderConfig, RecorderMode};
use crate::core::header_policy;

/// Fixture schema version, bumped whenever the JSON layout changes.
pub const FIXTURE_VERSION: u32 = 1;

pub const TRUNCATION_SENTINEL: &str = "[capture truncated]";

const REDACTED_HOST: &str = "redacted.invalid";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureMeta {
    pub request_id: String,
    pub created_at: DateTime<Utc>,
    pub provider_type: String,
    pub route: String,
    pub model: Option<String>,
    pub duration_ms: u64,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureRequest {
    pub method: String,
    pub url: String,
    pub headers: serde_json::Map<String, Value>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureResponse {
    pub status: u16,
    pub headers: serde_json::Map<String, Value>,
    /// Buffered body, or SSE events joined at event boundaries
    pub body: Option<Value>,
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureOutbound {
    pub upstream: String,
    pub request: FixtureRequest,
    pub response: FixtureResponse,
}

/// Write-once replay artifact. Not referenced by the live pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fixture {
    pub meta: FixtureMeta,
    pub inbound: FixtureRequest,
    pub outbound: FixtureOutbound,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downstream: Option<FixtureResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failover: Option<Vec<FailoverAttempt>>,
}

/// SSE events captured from a tee'd stream branch, bounded by a byte ceiling.
#[derive(Debug, Clone, Default)]
pub struct StreamCapture {
    pub events: Vec<String>,
    pub bytes_seen: usize,
    pub truncated: bool,
}

impl StreamCapture {
    /// Record one SSE event. Returns `false` once the ceiling is hit, at
    /// which point the feeding branch should cancel.
    pub fn push_event(&mut self, event: &str, ceiling: usize) -> bool {
        if self.truncated {
            return false;
        }
        if self.bytes_seen + event.len() > ceiling {
            self.truncated = true;
            self.events.push(TRUNCATION_SENTINEL.to_string());
            return false;
        }
        self.bytes_seen += event.len();
        self.events.push(compact_sse_event(event));
        true
    }

    pub fn into_body(self) -> (Option<Value>, bool) {
        if self.events.is_empty() {
            (None, self.truncated)
        } else {
            (Some(Value::String(self.events.join("\n\n"))), self.truncated)
        }
    }
}

/// Strip repeated `instructions`/`tools` fields out of snapshot-type SSE
/// events; they duplicate the inbound body on every response.* snapshot.
pub fn compact_sse_event(event: &str) -> String {
    let Some(data) = event.strip_prefix("data:").map(str::trim_start) else {
        return event.to_string();
    };
    let Ok(mut payload) = serde_json::from_str::<Value>(data) else {
        return event.to_string();
    };

    let mut changed = false;
    if let Some(obj) = payload.get_mut("response").and_then(Value::as_object_mut) {
        changed |= obj.remove("instructions").is_some();
        changed |= obj.remove("tools").is_some();
    }
    if let Some(obj) = payload.as_object_mut() {
        changed |= obj.remove("instructions").is_some();
        changed |= obj.remove("tools").is_some();
    }

    if !changed {
        return event.to_string();
    }
    match serde_json::to_string(&payload) {
        Ok(compacted) => format!("data: {}", compacted),
        Err(_) => event.to_string(),
    }
}

/// Replace the host of a URL, keeping scheme and path. Hosts are redacted by
/// default so fixtures can be shared.
pub fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let after_scheme = &url[scheme_end + 3..];
    let path_start = after_scheme.find('/').unwrap_or(after_scheme.len());
    format!(
        "{}://{}{}",
        &url[..scheme_end],
        REDACTED_HOST,
        &after_scheme[path_start..]
    )
}

pub struct TrafficRecorder {
    config: RecorderConfig,
}

impl TrafficRecorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn max_stream_capture_bytes(&self) -> usize {
        self.config.max_stream_capture_bytes
    }

    /// Whether a finished request with this outcome should produce a fixture.
    pub fn should_record(&self, status: Option<u16>) -> bool {
        if !self.config.enabled {
            return false;
        }
        let success = status.map(|s| (200..300).contains(&s)).unwrap_or(false);
        match self.config.mode {
            RecorderMode::All => true,
            RecorderMode::Success => success,
            RecorderMode::Failure => !success,
        }
    }

    /// Redact headers for fixture output (shared policy with logging).
    pub fn redact_headers<'a, I>(&self, headers: I) -> serde_json::Map<String, Value>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        header_policy::redact_headers(headers)
    }

    fn fixture_path(&self, fixture: &Fixture) -> PathBuf {
        let route = fixture.meta.route.trim_matches('/').replace('/', "_");
        self.config
            .dir
            .join(&fixture.meta.provider_type)
            .join(route)
            .join(format!(
                "{}-{}.json",
                fixture.meta.created_at.format("%Y%m%dT%H%M%S%3f"),
                fixture.meta.request_id
            ))
    }

    /// Write a fixture to its keyed path. Write-once: an existing file is left
    /// untouched. Errors are logged and swallowed.
    pub async fn write_fixture(&self, fixture: Fixture) {
        if !self.config.enabled {
            return;
        }
        let path = self.fixture_path(&fixture);
        if let Err(err) = self.try_write(&path, &fixture).await {
            tracing::warn!(path = %path.display(), error = %err, "Fixture write failed");
        } else {
            tracing::debug!(path = %path.display(), "Fixture recorded");
        }
    }

    async fn try_write(&self, path: &PathBuf, fixture: &Fixture) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(fixture)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        let mut file = options.open(path).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &json).await
    }
}
