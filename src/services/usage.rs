//! Token-usage normalization across provider response formats.
//!
//! Vendors report usage in three divergent shapes; this module folds them into
//! one [`TokenUsage`] record through an ordered list of duck-typed matchers.
//! Detection is by key presence, not value, so legitimate zero-token payloads
//! still match. Adding a vendor format is additive: write a matcher, append it.

use serde_json::Value;

use crate::api::models::TokenUsage;

type UsageMatcher = fn(&Value) -> Option<TokenUsage>;

/// Ordered format matchers; first match wins.
const MATCHERS: &[UsageMatcher] = &[match_openai_chat, match_input_output_family];

/// Normalize a vendor usage payload found anywhere in a response object.
///
/// Checks the nested locations vendors use: top-level `usage`,
/// `message.usage` (Anthropic streaming `message_start`), and
/// `response.usage` inside a `response.completed` event (OpenAI Responses
/// streaming), then the object itself. Unmatched payloads yield `None`,
/// never an error.
pub fn extract_usage(payload: &Value) -> Option<TokenUsage> {
    for candidate in usage_candidates(payload) {
        for matcher in MATCHERS {
            if let Some(usage) = matcher(candidate) {
                return Some(usage);
            }
        }
    }
    None
}

fn usage_candidates(payload: &Value) -> Vec<&Value> {
    let mut candidates = Vec::with_capacity(4);

    if let Some(usage) = payload.get("usage") {
        candidates.push(usage);
    }
    if let Some(usage) = payload.get("message").and_then(|m| m.get("usage")) {
        candidates.push(usage);
    }
    if payload.get("type").and_then(Value::as_str) == Some("response.completed") {
        if let Some(usage) = payload.get("response").and_then(|r| r.get("usage")) {
            candidates.push(usage);
        }
    }
    candidates.push(payload);
    candidates
}

fn field(value: &Value, key: &str) -> Option<u64> {
    value.get(key).and_then(Value::as_u64)
}

fn nested_field(value: &Value, outer: &str, inner: &str) -> u64 {
    value
        .get(outer)
        .and_then(|d| d.get(inner))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// OpenAI Chat Completions shape: `prompt_tokens` present.
///
/// `cached_tokens` counts a subset of `prompt_tokens` (cache hits are included
/// in the prompt figure), so `cache_read_tokens` mirrors it.
fn match_openai_chat(value: &Value) -> Option<TokenUsage> {
    if !value.is_object() {
        return None;
    }
    let prompt = field(value, "prompt_tokens")?;
    let completion = field(value, "completion_tokens").unwrap_or(0);
    let total = field(value, "total_tokens").unwrap_or(prompt + completion);
    let cached = nested_field(value, "prompt_tokens_details", "cached_tokens");
    let reasoning = nested_field(value, "completion_tokens_details", "reasoning_tokens");

    Some(TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
        cached_tokens: cached,
        reasoning_tokens: reasoning,
        cache_creation_tokens: 0,
        cache_read_tokens: cached,
        raw_input_tokens: prompt,
    })
}

/// OpenAI Responses API / Anthropic shape: the `input_tokens` family.
///
/// Anthropic streaming deltas can report `input_tokens: 0` alongside non-zero
/// cache fields; the prompt figure then falls back to
/// `cache_creation + cache_read`. When both Anthropic cache fields are zero,
/// the OpenAI-style `input_tokens_details.cached_tokens` location is consulted
/// instead.
fn match_input_output_family(value: &Value) -> Option<TokenUsage> {
    if !value.is_object() {
        return None;
    }
    let obj = value.as_object()?;
    let present = obj.contains_key("input_tokens")
        || obj.contains_key("output_tokens")
        || obj.contains_key("cache_creation_input_tokens")
        || obj.contains_key("cache_read_input_tokens");
    if !present {
        return None;
    }

    let raw_input = field(value, "input_tokens").unwrap_or(0);
    let completion = field(value, "output_tokens").unwrap_or(0);
    let cache_creation = field(value, "cache_creation_input_tokens").unwrap_or(0);
    let mut cache_read = field(value, "cache_read_input_tokens").unwrap_or(0);
    let reasoning = nested_field(value, "output_tokens_details", "reasoning_tokens");

    let mut cached = 0;
    if cache_creation == 0 && cache_read == 0 {
        cached = nested_field(value, "input_tokens_details", "cached_tokens");
        cache_read = cached;
    }

    let prompt = if raw_input == 0 && (cache_creation > 0 || cache_read > 0) {
        cache_creation + cache_read
    } else {
        raw_input
    };
    let total = field(value, "total_tokens").unwrap_or(prompt + completion);

    Some(TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
        cached_tokens: cached,
        reasoning_tokens: reasoning,
        cache_creation_tokens: cache_creation,
        cache_read_tokens: cache_read,
        raw_input_tokens: raw_input,
    })
}

/// Extract usage from one SSE `data:` payload.
///
/// `[DONE]` and non-JSON lines are ignored without error.
pub fn extract_usage_from_sse_payload(data: &str) -> Option<TokenUsage> {
    let trimmed = data.trim();
    if trimmed.is_empty() || trimmed == "[DONE]" {
        return None;
    }
    let payload: Value = serde_json::from_str(trimmed).ok()?;
    extract_usage(&payload)
}

/// Accumulates usage across the events of one SSE stream.
///
/// Vendors split usage across events (Anthropic reports input on
/// `message_start` and cumulative output on `message_delta`), so fields merge
/// by maximum and the total is reconciled once at the end.
#[derive(Debug, Default)]
pub struct SseUsageTracker {
    current: Option<TokenUsage>,
}

impl SseUsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one SSE `data:` payload.
    pub fn observe_payload(&mut self, data: &str) {
        if let Some(usage) = extract_usage_from_sse_payload(data) {
            self.merge(usage);
        }
    }

    fn merge(&mut self, usage: TokenUsage) {
        let merged = match self.current.take() {
            None => usage,
            Some(prev) => TokenUsage {
                prompt_tokens: prev.prompt_tokens.max(usage.prompt_tokens),
                completion_tokens: prev.completion_tokens.max(usage.completion_tokens),
                total_tokens: prev.total_tokens.max(usage.total_tokens),
                cached_tokens: prev.cached_tokens.max(usage.cached_tokens),
                reasoning_tokens: prev.reasoning_tokens.max(usage.reasoning_tokens),
                cache_creation_tokens: prev.cache_creation_tokens.max(usage.cache_creation_tokens),
                cache_read_tokens: prev.cache_read_tokens.max(usage.cache_read_tokens),
                raw_input_tokens: prev.raw_input_tokens.max(usage.raw_input_tokens),
            },
        };
        self.current = Some(merged);
    }

    /// Final usage for the stream, with the total reconciled against the
    /// merged prompt/completion counts.
    pub fn finalize(self) -> Option<TokenUsage> {
        self.current.map(|mut usage| {
            let sum = usage.prompt_tokens + usage.completion_tokens;
            if usage.total_tokens < sum {
                usage.total_tokens = sum;
            }
            usage
        })
    }
}
