//! Configuration validation.
//!
//! Semantic validation on top of serde's syntactic checks. All problems are
//! reported at once rather than failing on the first, so a broken config file
//! can be fixed in one pass. Pattern fields are compiled here so an invalid
//! regex fails at startup, never at first match.

use regex::Regex;

use crate::config::schema::ProxyConfig;

/// A single validation problem, with enough context to locate it.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate the full configuration. Returns every error found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if let Some(pattern) = &config.stats_uri_match {
        check_regex(&mut errors, "stats_uri_match", pattern);
    }

    let mut seen = std::collections::HashSet::new();
    for pool in &config.pools {
        let prefix = format!("pools.{}", pool.name);

        if pool.name.is_empty() {
            errors.push(ValidationError {
                field: "pools".into(),
                message: "pool is missing a name".into(),
            });
        } else if !seen.insert(pool.name.clone()) {
            errors.push(ValidationError {
                field: prefix.clone(),
                message: "duplicate pool name".into(),
            });
        }

        if pool.target_hostname.is_empty() {
            errors.push(ValidationError {
                field: format!("{prefix}.target_hostname"),
                message: "target hostname is required".into(),
            });
        }
        if pool.target_protocol != "http" {
            errors.push(ValidationError {
                field: format!("{prefix}.target_protocol"),
                message: format!(
                    "unsupported protocol '{}': upstream connections are plain http; \
                     terminate TLS in front of the target",
                    pool.target_protocol
                ),
            });
        }
        if let Some(auth) = &pool.http_basic_auth {
            if !auth.contains(':') {
                errors.push(ValidationError {
                    field: format!("{prefix}.http_basic_auth"),
                    message: "expected 'user:pass'".into(),
                });
            }
        }

        check_regex(&mut errors, &format!("{prefix}.method_match"), &pool.method_match);
        check_regex(&mut errors, &format!("{prefix}.host_match"), &pool.host_match);
        check_regex(&mut errors, &format!("{prefix}.uri_match"), &pool.uri_match);
        check_regex(&mut errors, &format!("{prefix}.success_match"), &pool.success_match);
        check_regex(
            &mut errors,
            &format!("{prefix}.scrub_request_headers"),
            &pool.scrub_request_headers,
        );
        check_regex(
            &mut errors,
            &format!("{prefix}.scrub_response_headers"),
            &pool.scrub_response_headers,
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_regex(errors: &mut Vec<ValidationError>, field: &str, pattern: &str) {
    if let Err(e) = Regex::new(pattern) {
        errors.push(ValidationError {
            field: field.to_string(),
            message: format!("invalid regex: {e}"),
        });
    }
}
