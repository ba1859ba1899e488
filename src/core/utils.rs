//! Utility functions shared across the gateway.

/// Join an upstream base URL and a request path without doubling slashes.
///
/// # Examples
///
/// ```
/// use llm_gateway_rust::core::utils::join_url;
///
/// assert_eq!(join_url("https://api.example.com", "/v1/messages"), "https://api.example.com/v1/messages");
/// assert_eq!(join_url("https://api.example.com/", "v1/messages"), "https://api.example.com/v1/messages");
/// assert_eq!(join_url("https://api.example.com/", "/v1/messages"), "https://api.example.com/v1/messages");
/// ```
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Truncate a string on a char boundary, appending a byte-count note.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated, {} bytes total]", &s[..end], s.len())
}

/// Trim a header/body value, returning `None` for empty results.
pub fn non_empty_trimmed(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
