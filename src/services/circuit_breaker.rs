//! Per-upstream circuit breaker.
//!
//! A small repository-backed state machine: state rows are loaded on demand and
//! written after each transition so multiple gateway instances converge on the
//! same gating. There is no cross-process lock: a racing pair of requests can
//! at most admit one extra half-open probe or delay an open transition, which
//! is accepted.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

use crate::api::models::Upstream;
use crate::core::database::{CircuitStateRow, Database};
use crate::core::error::Result;
use crate::core::error_types::FailoverErrorType;
use crate::core::metrics::get_metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "open" => Self::Open,
            "half_open" => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    const fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fault state for one upstream, 1:1 with the upstream's lifetime.
/// Auto-created closed on first observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub upstream_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_probe_at: Option<DateTime<Utc>>,
}

impl CircuitBreakerState {
    pub fn new(upstream_id: &str) -> Self {
        Self {
            upstream_id: upstream_id.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            opened_at: None,
            last_probe_at: None,
        }
    }

    fn from_row(row: CircuitStateRow) -> Self {
        Self {
            upstream_id: row.upstream_id,
            state: CircuitState::parse(&row.state),
            failure_count: row.failure_count.max(0) as u32,
            success_count: row.success_count.max(0) as u32,
            last_failure_at: row.last_failure_at,
            opened_at: row.opened_at,
            last_probe_at: row.last_probe_at,
        }
    }

    fn to_row(&self) -> CircuitStateRow {
        CircuitStateRow {
            upstream_id: self.upstream_id.clone(),
            state: self.state.as_str().to_string(),
            failure_count: self.failure_count as i32,
            success_count: self.success_count as i32,
            last_failure_at: self.last_failure_at,
            opened_at: self.opened_at,
            last_probe_at: self.last_probe_at,
        }
    }
}

/// Persistence seam for circuit state. Production uses Postgres; tests and
/// DB-less deployments use the in-memory store.
#[async_trait]
pub trait CircuitStateStore: Send + Sync {
    async fn load(&self, upstream_id: &str) -> Result<Option<CircuitBreakerState>>;
    async fn save(&self, state: &CircuitBreakerState) -> Result<()>;
}

pub struct PgCircuitStateStore {
    db: Arc<Database>,
}

impl PgCircuitStateStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CircuitStateStore for PgCircuitStateStore {
    async fn load(&self, upstream_id: &str) -> Result<Option<CircuitBreakerState>> {
        let row = self.db.get_circuit_state(upstream_id).await?;
        Ok(row.map(CircuitBreakerState::from_row))
    }

    async fn save(&self, state: &CircuitBreakerState) -> Result<()> {
        self.db.upsert_circuit_state(&state.to_row()).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCircuitStateStore {
    states: DashMap<String, CircuitBreakerState>,
}

impl MemoryCircuitStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload a state row, for tests and warm starts.
    pub fn preload(&self, state: CircuitBreakerState) {
        self.states.insert(state.upstream_id.clone(), state);
    }
}

#[async_trait]
impl CircuitStateStore for MemoryCircuitStateStore {
    async fn load(&self, upstream_id: &str) -> Result<Option<CircuitBreakerState>> {
        Ok(self.states.get(upstream_id).map(|s| s.clone()))
    }

    async fn save(&self, state: &CircuitBreakerState) -> Result<()> {
        self.states.insert(state.upstream_id.clone(), state.clone());
        Ok(())
    }
}

/// Gate deciding whether an upstream may receive traffic, fed by attempt
/// outcomes from the router.
pub struct CircuitBreaker {
    store: Arc<dyn CircuitStateStore>,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn CircuitStateStore>) -> Self {
        Self { store }
    }

    async fn load_or_default(&self, upstream_id: &str) -> Option<CircuitBreakerState> {
        match self.store.load(upstream_id).await {
            Ok(Some(state)) => Some(state),
            Ok(None) => Some(CircuitBreakerState::new(upstream_id)),
            Err(err) => {
                tracing::warn!(upstream_id = %upstream_id, error = %err, "Circuit state load failed");
                None
            }
        }
    }

    async fn save(&self, state: &CircuitBreakerState) {
        if let Err(err) = self.store.save(state).await {
            tracing::warn!(
                upstream_id = %state.upstream_id,
                error = %err,
                "Circuit state save failed"
            );
        }
        get_metrics()
            .circuit_state
            .with_label_values(&[&state.upstream_id])
            .set(state.state.as_gauge());
    }

    /// Whether the upstream is currently eligible for traffic.
    ///
    /// An elapsed open window transitions to half-open here, and half-open
    /// probes are paced to one per `probe_interval`. A storage outage fails
    /// open: routing must not depend on circuit-state availability.
    pub async fn can_route(&self, upstream: &Upstream) -> bool {
        let Some(mut state) = self.load_or_default(&upstream.id).await else {
            return true;
        };
        let config = &upstream.circuit_config;
        let now = Utc::now();

        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|t| now - t >= ChronoDuration::seconds(config.open_duration_secs as i64))
                    .unwrap_or(true);
                if !elapsed {
                    return false;
                }
                tracing::info!(upstream = %upstream.name, "Circuit open window elapsed, probing");
                state.state = CircuitState::HalfOpen;
                state.success_count = 0;
                state.last_probe_at = Some(now);
                self.save(&state).await;
                true
            }
            CircuitState::HalfOpen => {
                let probe_due = state
                    .last_probe_at
                    .map(|t| now - t >= ChronoDuration::seconds(config.probe_interval_secs as i64))
                    .unwrap_or(true);
                if !probe_due {
                    return false;
                }
                state.last_probe_at = Some(now);
                self.save(&state).await;
                true
            }
        }
    }

    /// Record a successful attempt against the upstream.
    pub async fn record_success(&self, upstream: &Upstream) {
        let Some(mut state) = self.load_or_default(&upstream.id).await else {
            return;
        };
        let config = &upstream.circuit_config;

        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            // An `Open` read here is a stale-snapshot race: the probe that
            // produced this success went through half-open on another path.
            CircuitState::Open | CircuitState::HalfOpen => {
                state.state = CircuitState::HalfOpen;
                state.success_count = state.success_count.saturating_add(1);
                if state.success_count >= config.success_threshold {
                    tracing::info!(upstream = %upstream.name, "Circuit closed after recovery");
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.opened_at = None;
                }
            }
        }

        self.save(&state).await;
    }

    /// Record a failed attempt against the upstream.
    pub async fn record_failure(&self, upstream: &Upstream, error_type: FailoverErrorType) {
        if !error_type.counts_as_failure() {
            return;
        }
        let Some(mut state) = self.load_or_default(&upstream.id).await else {
            return;
        };
        let config = &upstream.circuit_config;
        let now = Utc::now();
        state.last_failure_at = Some(now);

        match state.state {
            CircuitState::Closed => {
                state.failure_count = state.failure_count.saturating_add(1);
                if state.failure_count >= config.failure_threshold {
                    tracing::warn!(
                        upstream = %upstream.name,
                        failures = state.failure_count,
                        error_type = %error_type,
                        "Circuit opened"
                    );
                    state.state = CircuitState::Open;
                    state.opened_at = Some(now);
                    state.success_count = 0;
                }
            }
            CircuitState::HalfOpen => {
                // A single half-open failure reopens immediately and discards
                // any partial success count
                tracing::warn!(upstream = %upstream.name, "Half-open probe failed, reopening");
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
                state.success_count = 0;
            }
            CircuitState::Open => {}
        }

        self.save(&state).await;
    }
}
