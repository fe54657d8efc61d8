//! Header transformation policy.
//!
//! Headers cross the proxy boundary case-preserving: the scrub pass drops
//! anything matching the pool's scrub pattern, then configured insert
//! headers are merged on top (pool-level values win over global ones, the
//! merge happens once at pool construction).

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;

use crate::http::request::ProxyRequest;

/// Copy a raw header list, dropping entries matching the scrub pattern.
pub fn scrub(raw: &[(String, String)], pattern: &Regex) -> Vec<(String, String)> {
    raw.iter()
        .filter(|(key, _)| !pattern.is_match(key))
        .cloned()
        .collect()
}

/// Set a header, replacing any existing entries with the same name.
pub fn set(headers: &mut Vec<(String, String)>, name: &str, value: String) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    headers.push((name.to_string(), value));
}

/// First value for a name, case-insensitive.
pub fn get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Apply an insert-header set. Inserted values replace existing ones.
pub fn apply_inserts(headers: &mut Vec<(String, String)>, inserts: &HashMap<String, String>) {
    for (key, value) in inserts {
        set(headers, key, value.clone());
    }
}

/// Merge global and pool-level insert sets; the pool wins on collision.
pub fn merge_inserts(
    global: &HashMap<String, String>,
    pool: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = global.clone();
    merged.extend(pool.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Append the client address to X-Forwarded-For, comma-joined with any
/// value the client already sent.
pub fn append_forwarded_for(headers: &mut Vec<(String, String)>, request: &ProxyRequest) {
    let value = match request.header("x-forwarded-for") {
        Some(existing) => format!("{}, {}", existing, request.remote_addr),
        None => request.remote_addr.to_string(),
    };
    set(headers, "X-Forwarded-For", value);
}

/// Basic-auth header value for "user:pass" credentials.
pub fn basic_auth(credentials: &str) -> String {
    format!("Basic {}", BASE64.encode(credentials))
}
