//! Pooling HTTP reverse proxy.
//!
//! Inbound requests are routed to named pools, each with its own upstream
//! target, bounded queue, worker slots, rate limit, and retry policy.
//! Responses are either buffered or streamed back depending on size and
//! retryability.
//!
//! ```text
//!   Client ──▶ http::server ──▶ routing::Router ──▶ pool::Pool ──▶ upstream
//!                  ▲                                    │
//!                  └──────── ResponseHandle ◀───────────┘
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod pool;
pub mod routing;

pub use config::{load_config, ProxyConfig};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
