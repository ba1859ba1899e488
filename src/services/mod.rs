//! Business logic: circuit breaking, upstream selection, header compensation,
//! usage normalization, billing, and traffic recording.

pub mod billing;
pub mod circuit_breaker;
pub mod compensation;
pub mod recorder;
pub mod upstream_service;
pub mod usage;

pub use billing::{BillingOutcome, BillingService, MemoryPriceStore, PgPriceStore, ResolvedPrice};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerState, CircuitState, CircuitStateStore, MemoryCircuitStateStore,
    PgCircuitStateStore,
};
pub use compensation::{
    builtin_rules, Compensation, CompensationRule, CompensationService, RuleReconcileOutcome,
};
pub use recorder::{Fixture, StreamCapture, TrafficRecorder, FIXTURE_VERSION};
pub use upstream_service::UpstreamService;
pub use usage::{extract_usage, extract_usage_from_sse_payload, SseUsageTracker};
