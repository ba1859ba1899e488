//! LLM Gateway - a reverse proxy fronting multiple AI providers
//!
//! This library provides a gateway that authenticates client API keys, selects
//! a healthy upstream provider, and forwards requests while preserving
//! streaming semantics. Features include:
//!
//! - **Failover Routing**: Priority tiers with weighted selection and
//!   per-upstream circuit breaking
//! - **Streaming Support**: SSE fan-out with out-of-band usage extraction;
//!   client byte delivery is never blocked by accounting
//! - **Usage Normalization**: One token-usage record across the OpenAI Chat,
//!   OpenAI Responses, and Anthropic usage formats
//! - **Billing**: Manual-override/catalog price resolution with femto-USD cost
//!   computation
//! - **Header Compensation**: Rule-driven recovery of missing protocol headers
//! - **Traffic Recording**: Optional redacted request/response fixtures for
//!   replay testing
//!
//! # Architecture
//!
//! The codebase is organized into three main layers:
//!
//! - [`core`]: Core functionality (config, database, errors, metrics, logging)
//! - [`api`]: HTTP handlers, forwarding, and streaming fan-out
//! - [`services`]: Business logic (routing, circuit breaking, usage, billing)
//!
//! # Configuration
//!
//! The server requires `DB_URL` (PostgreSQL). Optional environment variables:
//! - `HOST` / `PORT`: bind address (default 0.0.0.0:18000)
//! - `REQUEST_TIMEOUT_SECS`: default upstream timeout (default 300)
//! - `RECORDER_ENABLED` / `RECORDER_MODE` / `RECORDER_DIR`: traffic fixtures

pub mod api;
pub mod core;
pub mod services;

// Re-export commonly used types for convenience
pub use api::{build_router, AppState, Capability, TokenUsage, Upstream};
pub use core::{AppConfig, AppError, Database, DatabaseConfig, Result};
pub use services::{
    BillingService, CircuitBreaker, CompensationService, TrafficRecorder, UpstreamService,
};
