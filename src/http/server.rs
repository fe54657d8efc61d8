//! HTTP front end.
//!
//! Accepts inbound connections, parses each request into a [`ProxyRequest`],
//! and hands it to the router. The handler then waits on the task's response
//! channel and converts whatever comes back into the wire response. A
//! one-second tick loop drives the per-pool metrics rollover for as long as
//! the server runs.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::validation::validate_config;
use crate::config::{ConfigError, ProxyConfig};
use crate::http::request::ProxyRequest;
use crate::http::response::{ProxyResponse, ResponseHandle};
use crate::lifecycle::Shutdown;
use crate::routing::{Dispatch, Router as PoolRouter};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<PoolRouter>,
    /// Requests currently inside the handler, reported on the stats surface.
    pub active_requests: Arc<AtomicU64>,
}

/// HTTP server for the pooling proxy.
pub struct HttpServer {
    config: ProxyConfig,
    router: Arc<PoolRouter>,
}

impl HttpServer {
    /// Validate the configuration and build every pool.
    pub fn new(config: ProxyConfig) -> Result<Self, ConfigError> {
        validate_config(&config).map_err(ConfigError::Validation)?;
        let router = Arc::new(PoolRouter::from_config(&config)?);
        Ok(Self { config, router })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<PoolRouter> {
        &self.router
    }

    /// Run the server until `shutdown` fires, then drain the pools before
    /// returning. Connections are still accepted during the drain so late
    /// callers get a clean rejection instead of a reset.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, pools = self.config.pools.len(), "HTTP server starting");

        self.router.start();

        // Per-second metrics rollover, stopped with the server.
        let tick_router = Arc::clone(&self.router);
        let mut tick_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => tick_router.tick(),
                    _ = tick_shutdown.recv() => break,
                }
            }
        });

        let state = AppState {
            router: Arc::clone(&self.router),
            active_requests: Arc::new(AtomicU64::new(0)),
        };

        let app = Router::new()
            .route("/", any(proxy_handler))
            .route("/{*path}", any(proxy_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        let drain_router = Arc::clone(&self.router);
        let mut drain_shutdown = shutdown.subscribe();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = drain_shutdown.recv().await;
            drain_router.shutdown().await;
        })
        .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Single handler for all inbound traffic: stats surface, then dispatch.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let _guard = RequestGuard::enter(&state.active_requests);

    if state.router.is_stats_request(request.uri().path()) {
        let web = json!({
            "cur_requests": state.active_requests.load(Ordering::Relaxed),
        });
        return Json(state.router.stats(web)).into_response();
    }

    let parsed = match ProxyRequest::from_http(request, addr.ip(), false).await {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::error!(error = %e, "Failed to parse inbound request");
            return ProxyResponse::error_text(StatusCode::BAD_REQUEST, &e.to_string())
                .into_http();
        }
    };

    let (handle, rx) = ResponseHandle::channel();
    if let Dispatch::NotHandled(handle) = state.router.dispatch(parsed, handle) {
        // Static file serving is delegated to a fronting file server; a miss
        // here has nowhere else to go.
        handle.respond(ProxyResponse::error_text(
            StatusCode::NOT_FOUND,
            "File not found",
        ));
    }

    match rx.await {
        Ok(response) => response.into_http(),
        Err(_) => {
            tracing::error!("Task dropped its response channel");
            ProxyResponse::error_text(StatusCode::INTERNAL_SERVER_ERROR, "Internal proxy error")
                .into_http()
        }
    }
}

struct RequestGuard {
    gauge: Arc<AtomicU64>,
}

impl RequestGuard {
    fn enter(gauge: &Arc<AtomicU64>) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self {
            gauge: Arc::clone(gauge),
        }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::Relaxed);
    }
}
