//! Domain types shared across the gateway: upstream records, token usage,
//! failover attempts, and billing snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::core::database::UpstreamRow;
use crate::core::error_types::FailoverErrorType;

/// Provider-protocol capability a request routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// OpenAI Chat Completions protocol
    OpenAiChat,
    /// OpenAI Responses API protocol
    OpenAiResponses,
    /// Anthropic Messages protocol
    Anthropic,
}

impl Capability {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenAiChat => "openai",
            Self::OpenAiResponses => "openai_responses",
            Self::Anthropic => "anthropic",
        }
    }

    /// Resolve the capability a request path speaks.
    pub fn from_path(path: &str) -> Option<Self> {
        if path.ends_with("/chat/completions") {
            Some(Self::OpenAiChat)
        } else if path.ends_with("/responses") {
            Some(Self::OpenAiResponses)
        } else if path.ends_with("/messages") {
            Some(Self::Anthropic)
        } else {
            None
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-upstream circuit breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration_secs: u64,
    pub probe_interval_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration_secs: 60,
            probe_interval_secs: 10,
        }
    }
}

/// One configured provider endpoint with its own credentials and limits.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub id: String,
    pub name: String,
    pub base_url: String,
    /// Decrypted secret for the upstream's own authentication
    pub api_key: String,
    pub timeout_secs: u64,
    pub is_active: bool,
    /// Lower routes first
    pub priority: i32,
    /// Intra-tier selection weight
    pub weight: u32,
    pub capabilities: Vec<String>,
    /// When set, only these models (or redirect targets) route here
    pub allowed_models: Option<Vec<String>>,
    /// Source model name → target model name
    pub model_redirects: HashMap<String, String>,
    pub billing_input_multiplier: f64,
    pub billing_output_multiplier: f64,
    pub circuit_config: CircuitBreakerConfig,
}

impl Upstream {
    /// Build the domain record from a directory row plus the decrypted secret.
    pub fn from_row(row: UpstreamRow, api_key: String) -> Self {
        Self {
            id: row.id,
            name: row.name,
            base_url: row.base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout_secs: row.timeout_secs.max(1) as u64,
            is_active: row.is_active,
            priority: row.priority,
            weight: row.weight.max(0) as u32,
            capabilities: row.capabilities.0,
            allowed_models: row.allowed_models.map(|j| j.0),
            model_redirects: row.model_redirects.0,
            billing_input_multiplier: row.billing_input_multiplier,
            billing_output_multiplier: row.billing_output_multiplier,
            circuit_config: CircuitBreakerConfig {
                failure_threshold: row.cb_failure_threshold.max(1) as u32,
                success_threshold: row.cb_success_threshold.max(1) as u32,
                open_duration_secs: row.cb_open_duration_secs.max(1) as u64,
                probe_interval_secs: row.cb_probe_interval_secs.max(1) as u64,
            },
        }
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.eq_ignore_ascii_case(capability.as_str()))
    }

    /// Apply the upstream's model redirect, if any.
    pub fn redirect_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_redirects
            .get(model)
            .map(String::as_str)
            .unwrap_or(model)
    }

    /// Whether this upstream accepts the given client model name.
    ///
    /// An empty allowlist accepts everything; otherwise either the requested
    /// name or its redirect target must be listed.
    pub fn supports_model(&self, model: &str) -> bool {
        match &self.allowed_models {
            None => true,
            Some(allowed) if allowed.is_empty() => true,
            Some(allowed) => {
                let redirected = self.redirect_model(model);
                allowed.iter().any(|m| m == model || m == redirected)
            }
        }
    }
}

/// Normalized token usage for one response.
///
/// Computed once per response and never mutated after creation. All counts are
/// non-negative; `total_tokens` is the vendor-reported total when present, else
/// `prompt_tokens + completion_tokens`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cached_tokens: u64,
    pub reasoning_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    /// Vendor-reported input count before any prompt fallback was applied
    pub raw_input_tokens: u64,
}

/// One failed forwarding attempt in a request's routing trail.
/// Appended, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverAttempt {
    pub upstream_id: String,
    pub upstream_name: String,
    pub attempted_at: DateTime<Utc>,
    pub error_type: String,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body_json: Option<serde_json::Value>,
}

impl FailoverAttempt {
    pub fn new(upstream: &Upstream, error_type: FailoverErrorType, message: String) -> Self {
        Self {
            upstream_id: upstream.id.clone(),
            upstream_name: upstream.name.clone(),
            attempted_at: Utc::now(),
            error_type: error_type.as_str().to_string(),
            error_message: message,
            status_code: None,
            response_headers: None,
            response_body_text: None,
            response_body_json: None,
        }
    }
}

/// Where a resolved price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    Manual,
    Catalog,
    None,
}

impl PriceSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Catalog => "catalog",
            Self::None => "none",
        }
    }
}

/// Immutable priced outcome of one request. Written at most once.
///
/// Costs are integer femto-USD (1e-15 USD) so repeated accumulation cannot
/// drift; prices are USD per million tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingSnapshot {
    pub price_source: PriceSource,
    pub input_price: f64,
    pub output_price: f64,
    pub cache_read_price: f64,
    pub cache_write_price: f64,
    pub input_multiplier: f64,
    pub output_multiplier: f64,
    pub input_cost_femto_usd: i64,
    pub output_cost_femto_usd: i64,
    pub cache_read_cost_femto_usd: i64,
    pub cache_write_cost_femto_usd: i64,
    pub total_cost_femto_usd: i64,
    pub currency: String,
    pub billed_at: DateTime<Utc>,
}

impl BillingSnapshot {
    pub fn total_cost_usd(&self) -> f64 {
        self.total_cost_femto_usd as f64 / 1e15
    }
}
