//! HTTP handlers, authentication, forwarding, and streaming fan-out.

pub mod auth;
pub mod forward;
pub mod handlers;
pub mod models;
pub mod proxy;
pub mod streaming;

pub use auth::{verify_auth, ClientKey};
pub use forward::{forward, ForwardContext, ForwardFailure, ForwardOutcome};
pub use handlers::{build_router, AppState};
pub use models::{
    BillingSnapshot, Capability, CircuitBreakerConfig, FailoverAttempt, PriceSource, TokenUsage,
    Upstream,
};
pub use proxy::handle_proxy_request;
pub use streaming::{spawn_stream_fanout, SseEventScanner, StreamHandles, StreamOutcome};
