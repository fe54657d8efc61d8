//! Keep-alive connection agent for one upstream target.
//!
//! Wraps a hyper client whose connector reports socket open/close events
//! into the pool's gauge. The idle pool is sized to the pool's concurrency
//! ceiling, so there is at most one socket per in-flight task.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, Uri};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;
use tower::Service;

use crate::config::PoolConfig;
use crate::pool::metrics::PoolPerf;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug)]
struct AgentShared {
    pool_name: String,
    open_sockets: AtomicU64,
    next_socket_id: AtomicU64,
    perf: Arc<PoolPerf>,
}

/// Owns the keep-alive socket set to one upstream target.
pub struct ConnectionAgent {
    client: Client<TrackingConnector, Body>,
    shared: Arc<AgentShared>,
}

impl ConnectionAgent {
    pub fn new(pool_name: &str, config: &PoolConfig, perf: Arc<PoolPerf>) -> Self {
        let shared = Arc::new(AgentShared {
            pool_name: pool_name.to_string(),
            open_sockets: AtomicU64::new(0),
            next_socket_id: AtomicU64::new(1),
            perf,
        });

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        // Idle pool bounded by the concurrency ceiling; zero disables
        // keep-alives entirely.
        let max_idle = if config.use_keep_alives {
            config.worker_slots()
        } else {
            0
        };
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(max_idle)
            .pool_idle_timeout(Duration::from_secs(60))
            .build(TrackingConnector {
                inner: connector,
                shared: Arc::clone(&shared),
            });

        Self { client, shared }
    }

    /// Forward one request to the upstream. Connection reuse and socket
    /// accounting are handled by the connector.
    pub async fn request(
        &self,
        request: Request<Body>,
    ) -> Result<Response<Incoming>, hyper_util::client::legacy::Error> {
        self.client.request(request).await
    }

    /// Current open-socket gauge.
    pub fn open_sockets(&self) -> u64 {
        self.shared.open_sockets.load(Ordering::Relaxed)
    }

    /// Release the agent. Idle sockets close as the client's pool drops.
    pub fn shutdown(&self) {
        tracing::debug!(pool = %self.shared.pool_name, "Releasing connection agent");
    }
}

/// Connector that counts sockets as they are opened and closed.
#[derive(Clone, Debug)]
struct TrackingConnector {
    inner: HttpConnector,
    shared: Arc<AgentShared>,
}

impl Service<Uri> for TrackingConnector {
    type Response = TrackedIo;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<TrackedIo, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let mut inner = self.inner.clone();
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            let io = inner.call(uri).await.map_err(|e| Box::new(e) as BoxError)?;

            let id = shared.next_socket_id.fetch_add(1, Ordering::Relaxed);
            shared.open_sockets.fetch_add(1, Ordering::Relaxed);
            shared.perf.count("sockets_opened", 1);
            tracing::debug!(pool = %shared.pool_name, socket = id, "Opened upstream socket");

            Ok(TrackedIo {
                inner: io,
                shared,
                id,
            })
        })
    }
}

/// An upstream socket whose lifetime feeds the open-socket gauge.
struct TrackedIo {
    inner: TokioIo<TcpStream>,
    shared: Arc<AgentShared>,
    id: u64,
}

impl Drop for TrackedIo {
    fn drop(&mut self) {
        self.shared.open_sockets.fetch_sub(1, Ordering::Relaxed);
        self.shared.perf.count("sockets_closed", 1);
        tracing::debug!(pool = %self.shared.pool_name, socket = self.id, "Closed upstream socket");
    }
}

impl hyper::rt::Read for TrackedIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl hyper::rt::Write for TrackedIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }
}

impl Connection for TrackedIo {
    fn connected(&self) -> Connected {
        self.inner.connected()
    }
}
