//! Request matching logic.
//!
//! Each pool carries one compiled matcher: method pattern AND host pattern
//! (port stripped) AND uri pattern. Patterns are compiled at construction so
//! an invalid one fails at startup, not at first match. Method and host
//! matching are case-insensitive, uri matching is case-sensitive.

use regex::{Regex, RegexBuilder};

use crate::config::PoolConfig;
use crate::http::request::ProxyRequest;

/// Compiled method/host/uri matcher for one pool.
#[derive(Debug)]
pub struct RouteMatcher {
    method: Regex,
    host: Regex,
    uri: Regex,
}

impl RouteMatcher {
    pub fn compile(config: &PoolConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            method: case_insensitive(&config.method_match)?,
            host: case_insensitive(&config.host_match)?,
            uri: Regex::new(&config.uri_match)?,
        })
    }

    /// AND of all three conditions.
    pub fn matches(&self, request: &ProxyRequest) -> bool {
        if !self.method.is_match(request.method.as_str()) {
            return false;
        }

        let host = request.header("host").unwrap_or("");
        let host = strip_port(host);
        if !self.host.is_match(host) {
            return false;
        }

        self.uri.is_match(&request.uri)
    }
}

fn case_insensitive(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

fn strip_port(host: &str) -> &str {
    match host.rfind(':') {
        Some(idx) if host[idx + 1..].chars().all(|c| c.is_ascii_digit()) => &host[..idx],
        _ => host,
    }
}
