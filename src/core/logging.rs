//! Logging utilities with request/upstream context support.
//!
//! Task-local context lets HTTP logs carry the request id, client key name and
//! upstream name without threading them through every call.

tokio::task_local! {
    /// Task-local storage for the current upstream name.
    pub static UPSTREAM_CONTEXT: String;
}

tokio::task_local! {
    /// Task-local storage for the current request ID.
    pub static REQUEST_ID: String;
}

tokio::task_local! {
    /// Task-local storage for the current client key name.
    pub static CLIENT_KEY_NAME: String;
}

/// Get the current upstream name from context, if set.
///
/// Returns an empty string if no upstream context is set.
pub fn get_upstream_context() -> String {
    UPSTREAM_CONTEXT
        .try_with(|ctx| ctx.clone())
        .unwrap_or_default()
}

/// Get the current request ID from context, if set.
pub fn get_request_id() -> String {
    REQUEST_ID.try_with(|id| id.clone()).unwrap_or_default()
}

/// Get the current client key name from context, if set.
///
/// Returns "anonymous" if no key name is set.
pub fn get_client_key_name() -> String {
    CLIENT_KEY_NAME
        .try_with(|name| name.clone())
        .unwrap_or_else(|_| "anonymous".to_string())
}

/// Generate a new unique request ID using UUID v4.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Execute an async block with request context (request_id, key_name, upstream).
#[macro_export]
macro_rules! with_request_context {
    ($request_id:expr, $key_name:expr, $upstream_name:expr, $body:expr) => {
        $crate::core::logging::REQUEST_ID
            .scope($request_id, async {
                $crate::core::logging::CLIENT_KEY_NAME
                    .scope($key_name, async {
                        $crate::core::logging::UPSTREAM_CONTEXT
                            .scope($upstream_name, $body)
                            .await
                    })
                    .await
            })
            .await
    };
    // Version without upstream context
    ($request_id:expr, $key_name:expr, $body:expr) => {
        $crate::core::logging::REQUEST_ID
            .scope($request_id, async {
                $crate::core::logging::CLIENT_KEY_NAME
                    .scope($key_name, $body)
                    .await
            })
            .await
    };
}
