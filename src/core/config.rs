//! Configuration management for the gateway.
//!
//! All runtime records (upstreams, client keys, compensation rules, prices) live
//! in the database; this module only covers process-level settings loaded from
//! environment variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration (host, port)
    #[serde(default)]
    pub server: ServerConfig,

    /// Default request timeout in seconds for upstreams without their own
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Whether to verify SSL certificates for upstream requests
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,

    /// TTL of the compensation-rule cache in seconds
    #[serde(default = "default_rule_cache_ttl")]
    pub rule_cache_ttl_secs: u64,

    /// TTL of session-affinity bindings in seconds
    #[serde(default = "default_session_affinity_ttl")]
    pub session_affinity_ttl_secs: u64,

    /// Traffic fixture recorder settings
    #[serde(default)]
    pub recorder: RecorderConfig,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Which final outcomes the traffic recorder captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderMode {
    All,
    Success,
    Failure,
}

impl RecorderMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "all" => Some(Self::All),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

/// Traffic fixture recorder configuration. Disabled unless `RECORDER_ENABLED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_recorder_mode")]
    pub mode: RecorderMode,

    /// Root directory fixtures are written under
    #[serde(default = "default_recorder_dir")]
    pub dir: PathBuf,

    /// Ceiling on captured SSE bytes per response; past it the capture is
    /// truncated with a sentinel and the capture branch cancels
    #[serde(default = "default_max_stream_capture_bytes")]
    pub max_stream_capture_bytes: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: default_recorder_mode(),
            dir: default_recorder_dir(),
            max_stream_capture_bytes: default_max_stream_capture_bytes(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    18000
}

fn default_request_timeout() -> u64 {
    300
}

fn default_verify_ssl() -> bool {
    true
}

fn default_rule_cache_ttl() -> u64 {
    60
}

fn default_session_affinity_ttl() -> u64 {
    3600
}

fn default_recorder_mode() -> RecorderMode {
    RecorderMode::All
}

fn default_recorder_dir() -> PathBuf {
    PathBuf::from("fixtures")
}

fn default_max_stream_capture_bytes() -> usize {
    256 * 1024
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            request_timeout_secs: default_request_timeout(),
            verify_ssl: default_verify_ssl(),
            rule_cache_ttl_secs: default_rule_cache_ttl(),
            session_affinity_ttl_secs: default_session_affinity_ttl(),
            recorder: RecorderConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("HOST") {
            config.server.host = host;
        }
        if let Some(port) = env_parse::<u16>("PORT") {
            config.server.port = port;
        }
        if let Ok(value) = std::env::var("VERIFY_SSL") {
            config.verify_ssl = str_to_bool(&value);
        }
        if let Some(timeout) = env_parse::<u64>("REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = timeout;
        }
        if let Some(ttl) = env_parse::<u64>("RULE_CACHE_TTL_SECS") {
            config.rule_cache_ttl_secs = ttl;
        }
        if let Some(ttl) = env_parse::<u64>("SESSION_AFFINITY_TTL_SECS") {
            config.session_affinity_ttl_secs = ttl;
        }

        if let Ok(value) = std::env::var("RECORDER_ENABLED") {
            config.recorder.enabled = str_to_bool(&value);
        }
        if let Ok(value) = std::env::var("RECORDER_MODE") {
            if let Some(mode) = RecorderMode::parse(&value) {
                config.recorder.mode = mode;
            } else {
                tracing::warn!(mode = %value, "Unknown RECORDER_MODE, keeping default");
            }
        }
        if let Ok(dir) = std::env::var("RECORDER_DIR") {
            config.recorder.dir = PathBuf::from(dir);
        }
        if let Some(bytes) = env_parse::<usize>("RECORDER_MAX_STREAM_BYTES") {
            config.recorder.max_stream_capture_bytes = bytes;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Convert string to boolean.
///
/// Accepts: "true", "1", "yes", "on" (case-insensitive)
pub fn str_to_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "HOST",
            "PORT",
            "VERIFY_SSL",
            "REQUEST_TIMEOUT_SECS",
            "RULE_CACHE_TTL_SECS",
            "SESSION_AFFINITY_TTL_SECS",
            "RECORDER_ENABLED",
            "RECORDER_MODE",
            "RECORDER_DIR",
            "RECORDER_MAX_STREAM_BYTES",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_str_to_bool() {
        assert!(str_to_bool("true"));
        assert!(str_to_bool("TRUE"));
        assert!(str_to_bool("1"));
        assert!(str_to_bool("yes"));
        assert!(str_to_bool("on"));
        assert!(!str_to_bool("false"));
        assert!(!str_to_bool("0"));
        assert!(!str_to_bool("nope"));
    }

    #[test]
    fn test_recorder_mode_parse() {
        assert_eq!(RecorderMode::parse("all"), Some(RecorderMode::All));
        assert_eq!(RecorderMode::parse("SUCCESS"), Some(RecorderMode::Success));
        assert_eq!(RecorderMode::parse("failure"), Some(RecorderMode::Failure));
        assert_eq!(RecorderMode::parse("sometimes"), None);
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = AppConfig::from_env();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 18000);
        assert_eq!(config.request_timeout_secs, 300);
        assert_eq!(config.rule_cache_ttl_secs, 60);
        assert!(!config.recorder.enabled);
        assert_eq!(config.recorder.mode, RecorderMode::All);
        assert_eq!(config.recorder.max_stream_capture_bytes, 256 * 1024);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("PORT", "9000");
        std::env::set_var("REQUEST_TIMEOUT_SECS", "45");
        std::env::set_var("RECORDER_ENABLED", "1");
        std::env::set_var("RECORDER_MODE", "success");
        std::env::set_var("RECORDER_DIR", "/tmp/fixtures");

        let config = AppConfig::from_env();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.request_timeout_secs, 45);
        assert!(config.recorder.enabled);
        assert_eq!(config.recorder.mode, RecorderMode::Success);
        assert_eq!(config.recorder.dir, PathBuf::from("/tmp/fixtures"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_recorder_mode_keeps_default() {
        clear_env();
        std::env::set_var("RECORDER_MODE", "sometimes");
        let config = AppConfig::from_env();
        assert_eq!(config.recorder.mode, RecorderMode::All);
        clear_env();
    }
}
