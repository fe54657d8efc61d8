//! Response delivery boundary.
//!
//! Each admitted request carries exactly one [`ResponseHandle`]; delivering
//! through it consumes it, so a response can never be sent twice. The pool
//! side decides between a fully buffered body and a streamed one, and the
//! web layer converts either into the wire response.

use axum::body::{Body, Bytes};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use tokio::sync::oneshot;

use crate::error::ProxyError;

/// Body of a delivered response: buffered bytes or a live upstream stream.
#[derive(Debug)]
pub enum ResponseBody {
    Buffered(Bytes),
    Stream(Body),
}

/// A response ready for delivery to the caller.
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

impl ProxyResponse {
    /// Classified error rendered in the proxy's wire format.
    pub fn from_error(err: &ProxyError) -> Self {
        Self::error_text(err.status(), &err.to_string())
    }

    /// Error response: text/html body of the form `ERROR: <detail>`.
    pub fn error_text(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "text/html".to_string())],
            body: ResponseBody::Buffered(Bytes::from(format!("ERROR: {message}\n"))),
        }
    }

    /// Small JSON response (used for blind-request acknowledgments).
    pub fn json(value: &serde_json::Value) -> Self {
        Self {
            status: StatusCode::OK,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: ResponseBody::Buffered(Bytes::from(value.to_string())),
        }
    }

    /// Convert into the wire response. Headers that fail HTTP validation
    /// are dropped with a warning rather than poisoning the response.
    pub fn into_http(self) -> axum::response::Response {
        let mut response = axum::response::Response::new(match self.body {
            ResponseBody::Buffered(bytes) => Body::from(bytes),
            ResponseBody::Stream(body) => body,
        });
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        for (key, value) in &self.headers {
            match (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => {
                    tracing::warn!(header = %key, "Dropping invalid response header");
                }
            }
        }
        response
    }
}

/// Single-use response delivery primitive.
///
/// Consumed by value on send. In blind mode the handle is used once for the
/// immediate acknowledgment and the task continues without one.
#[derive(Debug)]
pub struct ResponseHandle {
    tx: oneshot::Sender<ProxyResponse>,
}

impl ResponseHandle {
    pub fn channel() -> (Self, oneshot::Receiver<ProxyResponse>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Deliver the terminal outcome. The caller having gone away is not an
    /// error worth propagating; the task is finished either way.
    pub fn respond(self, response: ProxyResponse) {
        if self.tx.send(response).is_err() {
            tracing::debug!("Caller dropped before response delivery");
        }
    }

    pub fn reject(self, err: &ProxyError) {
        self.respond(ProxyResponse::from_error(err));
    }
}
