//! Header compensation: rule-driven recovery of missing protocol headers from
//! alternate header/body locations.
//!
//! Rules are loaded read-only per request through a TTL cache owned by this
//! service and injected into the pipeline, so tests construct isolated
//! instances instead of sharing process-wide state. A cache miss triggers
//! idempotent creation of the builtin rules. Every failure here is soft: the
//! request proceeds with no compensation, never an error.

use axum::http::HeaderMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::api::models::Capability;
use crate::core::database::{CompensationRuleRow, Database};
use crate::core::utils::non_empty_trimmed;

/// `headers.<name>` or `body.<dotted.path>`
static SOURCE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(headers|body)\..+$").expect("source pattern is valid"));

pub const MODE_MISSING_ONLY: &str = "missing_only";

/// A compensation rule. Builtins are seeded by the gateway; custom rules are
/// admin-managed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationRule {
    pub name: String,
    pub is_builtin: bool,
    pub enabled: bool,
    pub capabilities: Vec<String>,
    pub target_header: String,
    /// Ordered resolution sources; first to resolve wins
    pub sources: Vec<String>,
    pub mode: String,
}

impl CompensationRule {
    fn from_row(row: CompensationRuleRow) -> Self {
        Self {
            name: row.name,
            is_builtin: row.is_builtin,
            enabled: row.enabled,
            capabilities: row.capabilities.0,
            target_header: row.target_header,
            sources: row.sources.0,
            mode: row.mode,
        }
    }

    fn applies_to(&self, capability: Capability) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.eq_ignore_ascii_case(capability.as_str()))
    }
}

/// The builtin rule set, seeded idempotently on cache miss.
pub fn builtin_rules() -> Vec<CompensationRule> {
    vec![CompensationRule {
        name: "recover-session-id".to_string(),
        is_builtin: true,
        enabled: true,
        capabilities: vec![
            Capability::OpenAiChat.as_str().to_string(),
            Capability::OpenAiResponses.as_str().to_string(),
            Capability::Anthropic.as_str().to_string(),
        ],
        target_header: "session_id".to_string(),
        sources: vec![
            "headers.session_id".to_string(),
            "headers.session-id".to_string(),
            "headers.x-session-id".to_string(),
            "body.prompt_cache_key".to_string(),
            "body.metadata.session_id".to_string(),
            "body.previous_response_id".to_string(),
        ],
        mode: MODE_MISSING_ONLY.to_string(),
    }]
}

/// One recovered header value, with the source that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compensation {
    pub header: String,
    pub value: String,
    pub source: String,
}

/// Outcome of reconciling one builtin rule name against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleReconcileOutcome {
    /// Builtin present (seeded now or previously)
    Ok,
    /// A custom rule owns the name; seeding is blocked, never overwritten
    Blocked,
    /// Store unavailable; try again next cycle
    RetryAfter,
}

struct RuleCache {
    rules: Vec<CompensationRule>,
    loaded_at: Instant,
}

/// Rule loading + source resolution for the forwarding pipeline.
pub struct CompensationService {
    db: Option<Arc<Database>>,
    cache: RwLock<Option<RuleCache>>,
    ttl: Duration,
}

impl CompensationService {
    pub fn new(db: Arc<Database>, ttl: Duration) -> Self {
        Self {
            db: Some(db),
            cache: RwLock::new(None),
            ttl,
        }
    }

    /// A service with a fixed rule set and no store behind it.
    pub fn with_static_rules(rules: Vec<CompensationRule>) -> Self {
        Self {
            db: None,
            cache: RwLock::new(Some(RuleCache {
                rules,
                loaded_at: Instant::now(),
            })),
            ttl: Duration::from_secs(u64::MAX / 2),
        }
    }

    /// Drop the cache so the next request reloads.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    /// Build the compensations for one request.
    ///
    /// Resolution failures of any kind degrade to "no compensation this
    /// cycle" and are logged.
    pub async fn build_compensations(
        &self,
        capability: Capability,
        headers: &HeaderMap,
        body: Option<&Value>,
    ) -> Vec<Compensation> {
        let rules = self.load_rules().await;
        let mut compensations = Vec::new();

        for rule in rules.iter().filter(|r| r.enabled) {
            if rule.mode != MODE_MISSING_ONLY {
                tracing::warn!(rule = %rule.name, mode = %rule.mode, "Unknown compensation mode, skipping");
                continue;
            }
            if !rule.applies_to(capability) {
                continue;
            }

            for source in &rule.sources {
                match resolve_source(source, headers, body) {
                    Ok(Some(value)) => {
                        compensations.push(Compensation {
                            header: rule.target_header.clone(),
                            value,
                            source: source.clone(),
                        });
                        break;
                    }
                    Ok(None) => continue,
                    Err(reason) => {
                        tracing::warn!(
                            rule = %rule.name,
                            source = %source,
                            reason = %reason,
                            "Malformed compensation source, skipping"
                        );
                    }
                }
            }
        }

        compensations
    }

    async fn load_rules(&self) -> Vec<CompensationRule> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if self.db.is_none() || cached.loaded_at.elapsed() < self.ttl {
                    return cached.rules.clone();
                }
            }
        }

        let Some(db) = self.db.as_ref() else {
            return Vec::new();
        };

        // Cache miss: make sure builtins exist before reading. Seeding is
        // idempotent, so concurrent reloads are harmless.
        for rule in builtin_rules() {
            if self.reconcile_builtin_rule(db, &rule).await == RuleReconcileOutcome::RetryAfter {
                break;
            }
        }

        match db.list_enabled_rules().await {
            Ok(rows) => {
                let rules: Vec<CompensationRule> =
                    rows.into_iter().map(CompensationRule::from_row).collect();
                *self.cache.write().await = Some(RuleCache {
                    rules: rules.clone(),
                    loaded_at: Instant::now(),
                });
                rules
            }
            Err(err) => {
                tracing::warn!(error = %err, "Compensation rule load failed");
                // Staleness is tolerated; a dead store falls back to the last
                // good snapshot, or to nothing
                let cache = self.cache.read().await;
                cache
                    .as_ref()
                    .map(|c| c.rules.clone())
                    .unwrap_or_default()
            }
        }
    }

    /// Reconcile one builtin rule name against the store.
    ///
    /// A custom row already owning the name blocks the builtin. It is
    /// reported, never silently overwritten.
    pub async fn reconcile_builtin_rule(
        &self,
        db: &Database,
        rule: &CompensationRule,
    ) -> RuleReconcileOutcome {
        match db.find_rule_by_name(&rule.name).await {
            Ok(Some(existing)) => {
                if existing.is_builtin {
                    RuleReconcileOutcome::Ok
                } else {
                    tracing::warn!(
                        rule = %rule.name,
                        "Custom rule owns a builtin name; builtin seeding blocked"
                    );
                    RuleReconcileOutcome::Blocked
                }
            }
            Ok(None) => {
                match db
                    .insert_builtin_rule(
                        &rule.name,
                        &rule.capabilities,
                        &rule.target_header,
                        &rule.sources,
                        &rule.mode,
                    )
                    .await
                {
                    Ok(_) => RuleReconcileOutcome::Ok,
                    Err(err) => {
                        tracing::warn!(rule = %rule.name, error = %err, "Builtin rule seed failed");
                        RuleReconcileOutcome::RetryAfter
                    }
                }
            }
            Err(err) => {
                tracing::warn!(rule = %rule.name, error = %err, "Rule lookup failed");
                RuleReconcileOutcome::RetryAfter
            }
        }
    }
}

/// Resolve one rule source against the request.
///
/// `headers.<name>` resolves to the trimmed header value when non-empty;
/// `body.<a.b.c>` walks the parsed JSON body by dotted path, rejecting
/// arrays and other non-objects mid-path, and returns the first non-empty
/// string leaf.
fn resolve_source(
    source: &str,
    headers: &HeaderMap,
    body: Option<&Value>,
) -> Result<Option<String>, &'static str> {
    if !SOURCE_PATTERN.is_match(source) {
        return Err("source must match ^(headers|body)\\..+$");
    }

    if let Some(name) = source.strip_prefix("headers.") {
        let value = headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(non_empty_trimmed);
        return Ok(value.map(str::to_string));
    }

    let path = source.strip_prefix("body.").expect("pattern guarantees prefix");
    let Some(body) = body else {
        return Ok(None);
    };

    let mut cursor = body;
    for segment in path.split('.') {
        let Some(obj) = cursor.as_object() else {
            // Arrays and scalar intermediates end the walk
            return Ok(None);
        };
        match obj.get(segment) {
            Some(next) => cursor = next,
            None => return Ok(None),
        }
    }

    Ok(cursor
        .as_str()
        .and_then(non_empty_trimmed)
        .map(str::to_string))
}
