//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Pool definitions, in match-scan order. A pool named `default`
    /// is the fallback when no other pool claims a request.
    pub pools: Vec<PoolConfig>,

    /// When no pool matches, report "not handled" so the web layer can
    /// serve a static file instead of failing with 400.
    pub serve_static_files: bool,

    /// Regex matched against the request path to serve the internal
    /// per-pool stats snapshot as JSON.
    pub stats_uri_match: Option<String>,

    /// Headers inserted into every upstream request, for all pools.
    /// Pool-level entries win on key collision.
    pub insert_request_headers: HashMap<String, String>,

    /// Headers inserted into every client response, for all pools.
    pub insert_response_headers: HashMap<String, String>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// One upstream pool: matching rules, limits, retry policy, header rules.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool name. Used by the `X-Pool` selector header and for logging.
    pub name: String,

    /// Regex matched against the request method (case-insensitive).
    pub method_match: String,

    /// Regex matched against the Host header, port stripped (case-insensitive).
    pub host_match: String,

    /// Regex matched against the request URI.
    pub uri_match: String,

    /// Only reachable via the `X-Pool` selector header; skipped by the
    /// pattern scan entirely.
    pub explicit_only: bool,

    /// Upstream protocol. Only "http" is accepted; TLS toward the
    /// upstream belongs to a terminating hop in front of it.
    pub target_protocol: String,

    /// Upstream hostname.
    pub target_hostname: String,

    /// Upstream port. 0 means the protocol default (elided from the URL).
    pub target_port: u16,

    /// Concurrency ceiling: number of worker slots. 0 is treated as 1.
    pub max_concurrent: usize,

    /// Queue-depth ceiling over pending + executing. 0 = unbounded.
    pub max_queue_length: usize,

    /// Per-second rate ceiling on forwarded requests. 0 = unlimited.
    pub max_per_sec: u64,

    /// Retry budget per task.
    pub retries: u32,

    /// Delay before requeueing a rate-throttled task.
    pub throttle_requeue_delay_ms: u64,

    /// Retry backoff: base delay.
    pub retry_delay_base_ms: u64,

    /// Retry backoff: added per error counted in the previous second.
    pub retry_delay_mult_ms: u64,

    /// Retry backoff: hard cap. 0 = uncapped.
    pub retry_delay_max_ms: u64,

    /// Upstream request timeout. 0 = none. A timeout counts as a
    /// transport failure (retryable).
    pub http_timeout_ms: u64,

    /// Optional "user:pass" credentials attached as basic auth.
    pub http_basic_auth: Option<String>,

    /// Optional User-Agent for upstream requests.
    pub http_user_agent: String,

    /// Append the client address to X-Forwarded-For.
    pub append_to_x_forwarded_for: bool,

    /// Keep upstream sockets alive between requests.
    pub use_keep_alives: bool,

    /// Log upstream failures with full request/response context.
    pub log_errors: bool,

    /// Log every completed transaction.
    pub log_transactions: bool,

    /// Auto-enable transaction logging for requests slower than this. 0 = off.
    pub log_perf_ms: u64,

    /// Regex a response status must match to count as success.
    pub success_match: String,

    /// Regex selecting request headers dropped before forwarding.
    pub scrub_request_headers: String,

    /// Regex selecting response headers dropped before delivery.
    pub scrub_response_headers: String,

    /// Responses with a declared content-length below this are buffered
    /// rather than streamed.
    pub min_stream_size: u64,

    /// Headers inserted into upstream requests (wins over global).
    pub insert_request_headers: HashMap<String, String>,

    /// Headers inserted into client responses (wins over global).
    pub insert_response_headers: HashMap<String, String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            method_match: ".+".to_string(),
            host_match: ".*".to_string(),
            uri_match: ".+".to_string(),
            explicit_only: false,
            target_protocol: "http".to_string(),
            target_hostname: String::new(),
            target_port: 0,
            max_concurrent: 1,
            max_queue_length: 0,
            max_per_sec: 0,
            retries: 0,
            throttle_requeue_delay_ms: 100,
            retry_delay_base_ms: 0,
            retry_delay_mult_ms: 0,
            retry_delay_max_ms: 0,
            http_timeout_ms: 0,
            http_basic_auth: None,
            http_user_agent: String::new(),
            append_to_x_forwarded_for: true,
            use_keep_alives: true,
            log_errors: true,
            log_transactions: false,
            log_perf_ms: 0,
            success_match: r"^(2\d\d|3\d\d)$".to_string(),
            scrub_request_headers: r"^(host|x-pool|x-pool-\w+|expect|content-length|connection)$"
                .to_string(),
            scrub_response_headers: r"^(connection|transfer-encoding)$".to_string(),
            min_stream_size: 131072,
            insert_request_headers: HashMap::new(),
            insert_response_headers: HashMap::new(),
        }
    }
}

impl PoolConfig {
    /// Upstream URL prefix: protocol, hostname, and port (the protocol
    /// default port is elided).
    pub fn url_prefix(&self) -> String {
        let mut prefix = format!("{}://{}", self.target_protocol, self.target_hostname);
        if self.target_port != 0 && self.target_port != 80 {
            prefix.push_str(&format!(":{}", self.target_port));
        }
        prefix
    }

    /// Worker-slot count: the concurrency ceiling, minimum 1.
    pub fn worker_slots(&self) -> usize {
        self.max_concurrent.max(1)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_prefix_elides_default_port() {
        let mut config = PoolConfig {
            target_hostname: "backend.local".into(),
            target_port: 80,
            ..Default::default()
        };
        assert_eq!(config.url_prefix(), "http://backend.local");

        config.target_port = 8080;
        assert_eq!(config.url_prefix(), "http://backend.local:8080");

        config.target_port = 0;
        assert_eq!(config.url_prefix(), "http://backend.local");
    }

    #[test]
    fn test_worker_slots_minimum_one() {
        let config = PoolConfig {
            max_concurrent: 0,
            ..Default::default()
        };
        assert_eq!(config.worker_slots(), 1);
    }
}
