//! Outbound header policy: hop-by-hop/infrastructure stripping, client auth
//! scheme preservation, and sensitive-header redaction.

use axum::http::HeaderMap;
use serde_json::{Map, Value};

/// Hop-by-hop headers that must never be forwarded upstream.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-port",
    "x-forwarded-proto",
];

/// Infrastructure/edge headers injected by CDNs and load balancers.
const INFRASTRUCTURE_HEADERS: &[&str] = &[
    "cf-connecting-ip",
    "cf-connecting-ipv6",
    "cf-ipcountry",
    "cf-ray",
    "cf-visitor",
    "cf-worker",
    "cdn-loop",
    "forwarded",
    "remote-host",
    "true-client-ip",
    "via",
    "x-client-ip",
    "x-cluster-client-ip",
    "x-forwarded-client-cert",
    "x-real-ip",
];

const INFRASTRUCTURE_PREFIXES: &[&str] = &["x-envoy-", "x-vercel-"];

/// Headers the forwarder owns and always rewrites itself.
const FORWARDER_OWNED_HEADERS: &[&str] = &["authorization", "x-api-key", "content-length"];

/// Headers whose values never appear in logs or fixtures.
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "cookie",
    "set-cookie",
    "session_id",
    "session-id",
    "x-session-id",
];

pub const REDACTED_VALUE: &str = "***";

/// Whether a header must not be copied onto the outbound upstream request.
pub fn should_strip(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP_HEADERS.contains(&lower.as_str())
        || INFRASTRUCTURE_HEADERS.contains(&lower.as_str())
        || FORWARDER_OWNED_HEADERS.contains(&lower.as_str())
        || INFRASTRUCTURE_PREFIXES
            .iter()
            .any(|prefix| lower.starts_with(prefix))
}

/// Which credential scheme the client used. Preserved on the outbound request
/// with the upstream's own secret substituted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// `x-api-key: <key>` (Anthropic style)
    ApiKey,
    /// `Authorization: Bearer <key>` (OpenAI style)
    Bearer,
}

/// Detect the client's auth scheme from the inbound headers.
pub fn detect_auth_scheme(headers: &HeaderMap) -> Option<AuthScheme> {
    if headers.contains_key("x-api-key") {
        return Some(AuthScheme::ApiKey);
    }
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("bearer "))
        .unwrap_or(false);
    if bearer {
        Some(AuthScheme::Bearer)
    } else {
        None
    }
}

/// Extract the client-supplied API key regardless of scheme.
pub fn extract_client_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Build the outbound header list for an upstream request.
///
/// Copies every forwardable client header, then sets the auth header in the
/// client's own scheme with the upstream secret. Returned as string pairs
/// because the axum and reqwest header types are from different `http` major
/// versions.
pub fn build_upstream_headers(
    client_headers: &HeaderMap,
    scheme: AuthScheme,
    upstream_secret: &str,
) -> Vec<(String, String)> {
    let mut out = Vec::with_capacity(client_headers.len() + 1);

    for (name, value) in client_headers.iter() {
        if should_strip(name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.push((name.as_str().to_string(), value.to_string()));
        }
    }

    match scheme {
        AuthScheme::ApiKey => out.push(("x-api-key".to_string(), upstream_secret.to_string())),
        AuthScheme::Bearer => out.push((
            "authorization".to_string(),
            format!("Bearer {}", upstream_secret),
        )),
    }

    out
}

/// Apply a compensation in `missing_only` mode.
///
/// Returns `true` when the header was injected, `false` when an existing value
/// (any casing) made the compensation a no-op.
pub fn inject_missing(headers: &mut Vec<(String, String)>, name: &str, value: &str) -> bool {
    if headers
        .iter()
        .any(|(existing, _)| existing.eq_ignore_ascii_case(name))
    {
        return false;
    }
    headers.push((name.to_string(), value.to_string()));
    true
}

/// Render headers as a JSON object with sensitive values masked.
///
/// Matching is case-insensitive regardless of the original header casing.
pub fn redact_headers<'a, I>(headers: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut map = Map::new();
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        let rendered = if SENSITIVE_HEADERS.contains(&lower.as_str()) {
            REDACTED_VALUE
        } else {
            value
        };
        map.insert(lower, Value::String(rendered.to_string()));
    }
    map
}

/// Convenience adapter for axum header maps.
pub fn redact_header_map(headers: &HeaderMap) -> Map<String, Value> {
    redact_headers(
        headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_should_strip_hop_by_hop() {
        assert!(should_strip("connection"));
        assert!(should_strip("Transfer-Encoding"));
        assert!(should_strip("host"));
        assert!(should_strip("x-forwarded-for"));
        assert!(should_strip("X-Forwarded-Proto"));
    }

    #[test]
    fn test_should_strip_infrastructure() {
        assert!(should_strip("cf-ray"));
        assert!(should_strip("CF-Connecting-IP"));
        assert!(should_strip("true-client-ip"));
        assert!(should_strip("x-envoy-expected-rq-timeout-ms"));
        assert!(should_strip("x-vercel-id"));
    }

    #[test]
    fn test_should_not_strip_protocol_headers() {
        assert!(!should_strip("content-type"));
        assert!(!should_strip("anthropic-version"));
        assert!(!should_strip("accept"));
        assert!(!should_strip("user-agent"));
        assert!(!should_strip("session_id"));
    }

    #[test]
    fn test_detect_auth_scheme() {
        let h = headers(&[("x-api-key", "sk-client")]);
        assert_eq!(detect_auth_scheme(&h), Some(AuthScheme::ApiKey));

        let h = headers(&[("authorization", "Bearer sk-client")]);
        assert_eq!(detect_auth_scheme(&h), Some(AuthScheme::Bearer));

        let h = headers(&[("authorization", "Basic dXNlcg==")]);
        assert_eq!(detect_auth_scheme(&h), None);

        let h = headers(&[]);
        assert_eq!(detect_auth_scheme(&h), None);
    }

    #[test]
    fn test_x_api_key_wins_when_both_present() {
        let h = headers(&[
            ("x-api-key", "sk-client"),
            ("authorization", "Bearer sk-client"),
        ]);
        assert_eq!(detect_auth_scheme(&h), Some(AuthScheme::ApiKey));
    }

    #[test]
    fn test_extract_client_key() {
        let h = headers(&[("x-api-key", "sk-abc")]);
        assert_eq!(extract_client_key(&h), Some("sk-abc"));

        let h = headers(&[("authorization", "Bearer sk-def")]);
        assert_eq!(extract_client_key(&h), Some("sk-def"));

        let h = headers(&[("authorization", "Bearer ")]);
        assert_eq!(extract_client_key(&h), None);
    }

    #[test]
    fn test_build_upstream_headers_replaces_secret() {
        let h = headers(&[
            ("authorization", "Bearer sk-client"),
            ("content-type", "application/json"),
            ("x-forwarded-for", "1.2.3.4"),
            ("cf-ray", "abc"),
        ]);
        let out = build_upstream_headers(&h, AuthScheme::Bearer, "sk-upstream");

        assert!(out.contains(&(
            "authorization".to_string(),
            "Bearer sk-upstream".to_string()
        )));
        assert!(out.contains(&("content-type".to_string(), "application/json".to_string())));
        assert!(!out.iter().any(|(name, _)| name == "x-forwarded-for"));
        assert!(!out.iter().any(|(name, _)| name == "cf-ray"));
        // Client secret must not leak through in any header
        assert!(!out.iter().any(|(_, value)| value.contains("sk-client")));
    }

    #[test]
    fn test_build_upstream_headers_preserves_api_key_scheme() {
        let h = headers(&[("x-api-key", "sk-client")]);
        let out = build_upstream_headers(&h, AuthScheme::ApiKey, "sk-upstream");
        assert!(out.contains(&("x-api-key".to_string(), "sk-upstream".to_string())));
        assert!(!out.iter().any(|(name, _)| name == "authorization"));
    }

    #[test]
    fn test_inject_missing() {
        let mut out = vec![("content-type".to_string(), "application/json".to_string())];
        assert!(inject_missing(&mut out, "session_id", "abc"));
        assert_eq!(out.len(), 2);

        // Second injection is a no-op, case-insensitively
        assert!(!inject_missing(&mut out, "Session_ID", "xyz"));
        assert!(out
            .iter()
            .any(|(name, value)| name == "session_id" && value == "abc"));
    }

    #[test]
    fn test_redact_headers_case_insensitive() {
        let map = redact_headers(vec![
            ("Authorization", "Bearer sk-secret"),
            ("X-API-Key", "sk-secret"),
            ("Cookie", "session=abc"),
            ("content-type", "application/json"),
        ]);
        assert_eq!(map["authorization"], REDACTED_VALUE);
        assert_eq!(map["x-api-key"], REDACTED_VALUE);
        assert_eq!(map["cookie"], REDACTED_VALUE);
        assert_eq!(map["content-type"], "application/json");
    }

    #[test]
    fn test_redact_session_tokens() {
        let map = redact_headers(vec![("x-session-id", "sess-1"), ("session_id", "sess-2")]);
        assert_eq!(map["x-session-id"], REDACTED_VALUE);
        assert_eq!(map["session_id"], REDACTED_VALUE);
    }
}
