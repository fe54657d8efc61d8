//! Request-rejection taxonomy.
//!
//! These are the classified failures a request can hit before or instead of
//! reaching an upstream. Upstream failures themselves are handled inside the
//! pool (retried, then surfaced as the real upstream response or a
//! synthesized 500), so they never appear here.

use axum::http::StatusCode;

/// A request that was rejected without an upstream exchange.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Pool queue is at capacity; the request was rejected, not queued.
    #[error("Proxy queue is full: {pending} requests pending")]
    QueueFull { pending: usize },

    /// No pool claimed the request and static fallback is disabled.
    #[error("Proxy pool not found for request: {method} {uri}")]
    NoPoolMatched { method: String, uri: String },

    /// New request arrived after the shutdown signal.
    #[error("Proxy is shutting down")]
    Draining,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::NoPoolMatched { .. } => StatusCode::BAD_REQUEST,
            ProxyError::Draining => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::QueueFull { pending: 5 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ProxyError::NoPoolMatched {
                method: "GET".into(),
                uri: "/x".into()
            }
            .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ProxyError::Draining.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
