//! Pool lookup and dispatch.
//!
//! The router owns every configured pool and sends each inbound request to
//! exactly one of them. Precedence: a valid `X-Pool` selector header routes
//! unconditionally (the only way to reach an explicit-only pool), then the
//! pattern scan over non-default pools in configured order, then the
//! default pool, then either the static-file fallback or a routing error.
//! During drain every new request is rejected before any rule runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use regex::Regex;
use serde::Serialize;

use crate::config::validation::ValidationError;
use crate::config::{ConfigError, ProxyConfig};
use crate::error::ProxyError;
use crate::http::request::ProxyRequest;
use crate::http::response::ResponseHandle;
use crate::pool::metrics::PerfSnapshot;
use crate::pool::{headers, Pool};

/// Inbound header naming the target pool explicitly.
pub const POOL_HEADER: &str = "x-pool";

const DEFAULT_POOL: &str = "default";

/// Outcome of a dispatch attempt.
#[derive(Debug)]
pub enum Dispatch {
    /// A pool (or an error response) consumed the handle.
    Handled,
    /// No pool claimed the request; the web layer may serve a static file.
    NotHandled(ResponseHandle),
}

/// Aggregated stats for the optional stats surface.
#[derive(Debug, Serialize)]
pub struct StatsReport {
    /// Last-second snapshot per pool.
    pub pools: BTreeMap<String, PerfSnapshot>,
    /// Generic gauges from the collaborator web layer.
    pub web: serde_json::Value,
}

/// Holds all named pools and dispatches each request to exactly one.
pub struct Router {
    pools: Vec<Arc<Pool>>,
    by_name: HashMap<String, Arc<Pool>>,
    default_pool: Option<Arc<Pool>>,
    serve_static_files: bool,
    stats_uri: Option<Regex>,
    draining: AtomicBool,
}

impl Router {
    /// Build every pool from the validated config. Pattern compilation
    /// failures surface as config errors here, before any traffic.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, ConfigError> {
        let mut pools = Vec::new();
        let mut by_name = HashMap::new();

        for pool_config in &config.pools {
            let name = pool_config.name.clone();
            let pool = Pool::new(pool_config.clone(), config).map_err(|e| {
                ConfigError::Validation(vec![ValidationError {
                    field: format!("pools.{name}"),
                    message: e.to_string(),
                }])
            })?;
            by_name.insert(name, Arc::clone(&pool));
            pools.push(pool);
        }

        let stats_uri = match &config.stats_uri_match {
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                ConfigError::Validation(vec![ValidationError {
                    field: "stats_uri_match".into(),
                    message: e.to_string(),
                }])
            })?),
            None => None,
        };

        Ok(Self {
            default_pool: by_name.get(DEFAULT_POOL).cloned(),
            pools,
            by_name,
            serve_static_files: config.serve_static_files,
            stats_uri,
            draining: AtomicBool::new(false),
        })
    }

    /// Start the worker slots of every pool.
    pub fn start(&self) {
        for pool in &self.pools {
            pool.start();
        }
    }

    pub fn pool(&self, name: &str) -> Option<&Arc<Pool>> {
        self.by_name.get(name)
    }

    /// True when `path` should be answered with the stats snapshot.
    pub fn is_stats_request(&self, path: &str) -> bool {
        self.stats_uri
            .as_ref()
            .map(|re| re.is_match(path))
            .unwrap_or(false)
    }

    /// Route one inbound request to exactly one pool.
    pub fn dispatch(&self, mut request: ProxyRequest, handle: ResponseHandle) -> Dispatch {
        if self.draining.load(Ordering::Relaxed) {
            handle.reject(&ProxyError::Draining);
            return Dispatch::Handled;
        }

        // Explicit selector wins over everything, including the
        // explicit-only flag and the pool's own patterns.
        if let Some(name) = request.header(POOL_HEADER) {
            if let Some(pool) = self.by_name.get(name) {
                pool.admit(request, handle);
                return Dispatch::Handled;
            }
        }

        // Pattern scan in configured order. Explicit-only pools and the
        // default pool never participate here.
        for pool in &self.pools {
            if pool.name() == DEFAULT_POOL || pool.explicit_only() {
                continue;
            }
            if pool.matches(&request) {
                pool.admit(request, handle);
                return Dispatch::Handled;
            }
        }

        if let Some(default) = &self.default_pool {
            // Tag as explicitly selected to the default pool.
            headers::set(&mut request.headers, POOL_HEADER, DEFAULT_POOL.to_string());
            default.admit(request, handle);
            return Dispatch::Handled;
        }

        if self.serve_static_files {
            return Dispatch::NotHandled(handle);
        }

        let err = ProxyError::NoPoolMatched {
            method: request.method.to_string(),
            uri: request.uri.clone(),
        };
        tracing::error!("{err}");
        handle.reject(&err);
        Dispatch::Handled
    }

    /// Aggregate each pool's last-second snapshot plus the web layer's
    /// connection gauges.
    pub fn stats(&self, web: serde_json::Value) -> StatsReport {
        let pools = self
            .pools
            .iter()
            .map(|pool| (pool.name().to_string(), (*pool.last_metrics()).clone()))
            .collect();
        StatsReport { pools, web }
    }

    /// Fan the per-second tick out to every pool.
    pub fn tick(&self) {
        for pool in &self.pools {
            pool.tick();
        }
    }

    /// Stop admitting, then drain every pool to natural completion.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down router");
        self.draining.store(true, Ordering::Relaxed);

        join_all(self.pools.iter().map(|pool| pool.shutdown())).await;
        tracing::info!("All pools drained");
    }
}
