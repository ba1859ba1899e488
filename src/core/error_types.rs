//! Shared constants for failover classification and billing outcome semantics.

use std::fmt;
use std::time::Duration;

pub const ERROR_TYPE_API: &str = "api_error";
pub const ERROR_TYPE_TIMEOUT: &str = "timeout_error";
pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_AUTHENTICATION: &str = "authentication_error";
pub const ERROR_TYPE_RATE_LIMIT: &str = "rate_limit_error";
pub const ERROR_TYPE_OVERLOADED: &str = "overloaded_error";

pub const BILLING_STATUS_BILLED: &str = "billed";
pub const BILLING_STATUS_UNBILLED: &str = "unbilled";

/// Classification of one forwarding attempt's failure.
///
/// `CircuitOpen` is a pre-attempt skip: the upstream was never contacted, so it
/// is recorded as a skip rather than a `FailoverAttempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverErrorType {
    Timeout,
    Http5xx,
    Http4xx,
    Http429,
    ConnectionError,
    CircuitOpen,
}

impl FailoverErrorType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Http5xx => "http_5xx",
            Self::Http4xx => "http_4xx",
            Self::Http429 => "http_429",
            Self::ConnectionError => "connection_error",
            Self::CircuitOpen => "circuit_open",
        }
    }

    /// Whether the upstream was actually contacted.
    pub const fn is_attempt(self) -> bool {
        !matches!(self, Self::CircuitOpen)
    }

    /// Whether the router should continue to the next candidate.
    ///
    /// 4xx (other than 429) indicates a client-request defect, not upstream
    /// unavailability, so retrying another upstream would just repeat it.
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Http5xx | Self::Http429 | Self::ConnectionError
        )
    }

    /// Whether this failure should count against the upstream's circuit breaker.
    pub const fn counts_as_failure(self) -> bool {
        self.is_attempt() && !matches!(self, Self::Http4xx)
    }

    /// Classify an HTTP status code. Returns `None` for non-error statuses.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            429 => Some(Self::Http429),
            s if s >= 500 => Some(Self::Http5xx),
            s if (400..500).contains(&s) => Some(Self::Http4xx),
            _ => None,
        }
    }
}

impl fmt::Display for FailoverErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classify a reqwest transport error into a failover error type.
///
/// Timeouts surface distinctly; everything else that never produced a status
/// line is a connection error.
pub fn classify_transport_error(err: &reqwest::Error) -> FailoverErrorType {
    if err.is_timeout() {
        FailoverErrorType::Timeout
    } else {
        FailoverErrorType::ConnectionError
    }
}

/// Why a request could not be billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnbilledReason {
    ModelMissing,
    UsageMissing,
    PriceNotFound,
    CalculationError,
}

impl UnbilledReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ModelMissing => "model_missing",
            Self::UsageMissing => "usage_missing",
            Self::PriceNotFound => "price_not_found",
            Self::CalculationError => "calculation_error",
        }
    }
}

impl fmt::Display for UnbilledReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parse a `Retry-After` header value into a bounded backoff duration.
///
/// Only the delta-seconds form is honored; HTTP-date values and garbage
/// return `None`.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    let secs = value?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs.min(300)))
}
