//! Inbound request boundary type.
//!
//! The web layer parses each inbound request into a [`ProxyRequest`] before
//! the router sees it: method, url, the header list in original order,
//! remote address, encryption flag, and a classified body (multipart fields
//! plus temp files, urlencoded fields, or raw bytes). Pools own this
//! snapshot outright, so it can outlive the caller in blind mode.

use std::net::IpAddr;
use std::path::PathBuf;

use axum::body::{Body, Bytes};
use axum::extract::{FromRequest, Multipart};
use axum::http::{Method, Request};
use uuid::Uuid;

/// One uploaded file, spooled to a temp path by the web layer.
///
/// Ownership is exclusive: whoever holds the `ProxyRequest` is responsible
/// for deleting the temp file after the task completes.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub field: String,
    pub filename: String,
    pub path: PathBuf,
}

/// Classified request body, reconstructed for forwarding by content-type.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    None,
    Raw(Bytes),
    Form(Vec<(String, String)>),
    Multipart {
        fields: Vec<(String, String)>,
        files: Vec<UploadedFile>,
    },
}

/// A parsed inbound request, owned by its task once admitted.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path plus query string, exactly as received.
    pub uri: String,
    /// Header list in original order. Lookups are case-insensitive.
    pub headers: Vec<(String, String)>,
    pub remote_addr: IpAddr,
    /// True when the inbound connection was TLS-terminated in front of us.
    pub encrypted: bool,
    pub body: RequestBody,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("failed to parse multipart body: {0}")]
    Multipart(String),

    #[error("failed to spool upload: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyRequest {
    /// First header value matching `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Content-Type with any parameters (charset, boundary) stripped.
    pub fn content_type(&self) -> Option<String> {
        self.header("content-type").map(|ct| {
            ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
        })
    }

    /// Uploaded temp files owned by this request, if any.
    pub fn files(&self) -> &[UploadedFile] {
        match &self.body {
            RequestBody::Multipart { files, .. } => files,
            _ => &[],
        }
    }

    /// Parse an axum request into an owned snapshot, spooling any uploaded
    /// files to disk. This is the collaborator web layer's half of the
    /// contract with the pool engine.
    pub async fn from_http(
        request: Request<Body>,
        remote_addr: IpAddr,
        encrypted: bool,
    ) -> Result<Self, RequestError> {
        let method = request.method().clone();
        let uri = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| request.uri().path().to_string());

        let headers: Vec<(String, String)> = request
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();

        let content_type = request
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .unwrap_or_default();

        let body = if method == Method::POST && content_type == "multipart/form-data" {
            parse_multipart(request).await?
        } else if method == Method::POST && content_type == "application/x-www-form-urlencoded" {
            let bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
                .await
                .map_err(|e| RequestError::Body(e.to_string()))?;
            let fields = url::form_urlencoded::parse(&bytes)
                .into_owned()
                .collect::<Vec<_>>();
            RequestBody::Form(fields)
        } else {
            let bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
                .await
                .map_err(|e| RequestError::Body(e.to_string()))?;
            if bytes.is_empty() {
                RequestBody::None
            } else {
                RequestBody::Raw(bytes)
            }
        };

        Ok(Self {
            method,
            uri,
            headers,
            remote_addr,
            encrypted,
            body,
        })
    }
}

async fn parse_multipart(request: Request<Body>) -> Result<RequestBody, RequestError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| RequestError::Multipart(e.to_string()))?;

    let mut fields = Vec::new();
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RequestError::Multipart(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if let Some(filename) = field.file_name().map(|f| f.to_string()) {
            let path = std::env::temp_dir().join(format!("poolgate-upload-{}", Uuid::new_v4()));
            let bytes = field
                .bytes()
                .await
                .map_err(|e| RequestError::Multipart(e.to_string()))?;
            tokio::fs::write(&path, &bytes).await?;
            files.push(UploadedFile {
                field: name,
                filename,
                path,
            });
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| RequestError::Multipart(e.to_string()))?;
            fields.push((name, value));
        }
    }

    Ok(RequestBody::Multipart { fields, files })
}

/// Delete the temp files owned by a completed task. Failures are logged,
/// not propagated: the task already has a terminal outcome.
pub async fn cleanup_upload_files(files: &[UploadedFile]) {
    for file in files {
        if let Err(e) = tokio::fs::remove_file(&file.path).await {
            tracing::warn!(path = %file.path.display(), error = %e, "Failed to delete upload temp file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_headers(headers: &[(&str, &str)]) -> ProxyRequest {
        ProxyRequest {
            method: Method::GET,
            uri: "/".into(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            remote_addr: "127.0.0.1".parse().unwrap(),
            encrypted: false,
            body: RequestBody::None,
        }
    }

    #[test]
    fn test_header_lookup_case_insensitive() {
        let req = request_with_headers(&[("X-Pool", "api"), ("Host", "example.com")]);
        assert_eq!(req.header("x-pool"), Some("api"));
        assert_eq!(req.header("HOST"), Some("example.com"));
        assert_eq!(req.header("missing"), None);
    }

    #[test]
    fn test_content_type_strips_parameters() {
        let req = request_with_headers(&[(
            "Content-Type",
            "multipart/form-data; boundary=xyz",
        )]);
        assert_eq!(req.content_type().as_deref(), Some("multipart/form-data"));
    }

    #[tokio::test]
    async fn test_from_http_urlencoded() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/submit?a=1")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("name=alpha&count=2"))
            .unwrap();
        let parsed = ProxyRequest::from_http(request, "10.0.0.1".parse().unwrap(), false)
            .await
            .unwrap();

        assert_eq!(parsed.uri, "/submit?a=1");
        match parsed.body {
            RequestBody::Form(fields) => {
                assert_eq!(fields[0], ("name".into(), "alpha".into()));
                assert_eq!(fields[1], ("count".into(), "2".into()));
            }
            other => panic!("expected form body, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_from_http_raw_passthrough() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/raw")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"k":"v"}"#))
            .unwrap();
        let parsed = ProxyRequest::from_http(request, "10.0.0.1".parse().unwrap(), false)
            .await
            .unwrap();
        match parsed.body {
            RequestBody::Raw(bytes) => assert_eq!(&bytes[..], br#"{"k":"v"}"#),
            other => panic!("expected raw body, got {other:?}"),
        }
    }
}
