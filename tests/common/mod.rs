//! Shared utilities for integration testing.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use poolgate::config::{PoolConfig, ProxyConfig};
use poolgate::lifecycle::Shutdown;
use poolgate::HttpServer;

/// One raw request as the backend saw it: the head block plus the body.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub head: String,
    pub body: Vec<u8>,
}

impl ReceivedRequest {
    /// First header value matching `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim().eq_ignore_ascii_case(name) {
                Some(value.trim().to_string())
            } else {
                None
            }
        })
    }

    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or("")
    }
}

/// Start a raw-TCP backend that calls `f` with each parsed request and
/// writes back the (status, headers, body) it returns.
pub async fn start_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(ReceivedRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, Vec<(String, String)>, Vec<u8>)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let _ = serve_connection(socket, f).await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

async fn serve_connection<F, Fut>(mut socket: TcpStream, f: Arc<F>) -> std::io::Result<()>
where
    F: Fn(ReceivedRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, Vec<(String, String)>, Vec<u8>)> + Send + 'static,
{
    loop {
        let request = match read_request(&mut socket).await? {
            Some(request) => request,
            None => return Ok(()),
        };

        let (status, headers, body) = f(request).await;
        let status_text = match status {
            200 => "200 OK",
            404 => "404 Not Found",
            429 => "429 Too Many Requests",
            500 => "500 Internal Server Error",
            502 => "502 Bad Gateway",
            503 => "503 Service Unavailable",
            _ => "200 OK",
        };

        let mut response = format!("HTTP/1.1 {}\r\n", status_text);
        let mut has_length = false;
        for (key, value) in &headers {
            if key.eq_ignore_ascii_case("content-length") {
                has_length = true;
            }
            response.push_str(&format!("{}: {}\r\n", key, value));
        }
        if !has_length {
            response.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        response.push_str("\r\n");

        socket.write_all(response.as_bytes()).await?;
        socket.write_all(&body).await?;
        socket.flush().await?;
    }
}

/// Read one request off the socket: head block, then content-length bytes
/// of body. Returns None on a clean close before any bytes.
async fn read_request(socket: &mut TcpStream) -> std::io::Result<Option<ReceivedRequest>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let content_length = head
        .lines()
        .skip(1)
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Ok(Some(ReceivedRequest { head, body }))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Backend that returns a fixed status and body for every request.
#[allow(dead_code)]
pub async fn start_fixed_backend(status: u16, body: &'static str) -> SocketAddr {
    start_backend(move |_| async move { (status, Vec::new(), body.as_bytes().to_vec()) }).await
}

/// Backend that streams a large response in two halves with a pause in
/// between, recording when each request arrived.
#[allow(dead_code)]
pub async fn start_slow_stream_backend(
    len: usize,
    pause: Duration,
) -> (SocketAddr, Arc<Mutex<Vec<Instant>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = hits.clone();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let recorded = recorded.clone();
                    tokio::spawn(async move {
                        match read_request(&mut socket).await {
                            Ok(Some(_)) => {}
                            _ => return,
                        }
                        recorded.lock().unwrap().push(Instant::now());

                        let head =
                            format!("HTTP/1.1 200 OK\r\nContent-Length: {len}\r\n\r\n");
                        let _ = socket.write_all(head.as_bytes()).await;
                        let _ = socket.write_all(&vec![b'x'; len / 2]).await;
                        let _ = socket.flush().await;
                        tokio::time::sleep(pause).await;
                        let _ = socket.write_all(&vec![b'x'; len - len / 2]).await;
                        let _ = socket.flush().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    (addr, hits)
}

/// Pool config pointed at a local backend, everything else default.
pub fn pool(name: &str, backend: SocketAddr) -> PoolConfig {
    PoolConfig {
        name: name.into(),
        target_hostname: backend.ip().to_string(),
        target_port: backend.port(),
        ..Default::default()
    }
}

/// Start the proxy on an ephemeral port. Returns the bound address and the
/// shutdown coordinator.
pub async fn start_proxy(mut config: ProxyConfig) -> (SocketAddr, Shutdown) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    config.listener.bind_address = addr.to_string();

    let shutdown = Shutdown::new();
    let server = HttpServer::new(config).unwrap();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    // Let the accept loop come up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    (addr, shutdown)
}

#[allow(dead_code)]
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
