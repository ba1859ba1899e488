//! Core functionality: configuration, database, errors, logging, metrics.

pub mod config;
pub mod database;
pub mod error;
pub mod error_types;
pub mod header_policy;
pub mod logging;
pub mod metrics;
pub mod rate_limiter;
pub mod request_logger;
pub mod secrets;
pub mod utils;

pub use config::{AppConfig, RecorderConfig, RecorderMode, ServerConfig};
pub use database::{Database, DatabaseConfig};
pub use error::{AppError, Result};
pub use error_types::{FailoverErrorType, UnbilledReason};
pub use metrics::{get_metrics, init_metrics};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use request_logger::{
    init_request_logger, log_request_record, shutdown_request_logger, RequestLogRecord,
};
