//! The pool engine.
//!
//! A [`Pool`] owns one upstream route: it matches requests, admits or
//! rejects them against its queue bound, runs a fixed set of worker slots,
//! throttles against its per-second rate ceiling, forwards via its
//! [`agent::ConnectionAgent`], decides streaming vs buffering per response,
//! retries with error-count-driven backoff, applies the header policy, and
//! accumulates per-second metrics.

pub mod agent;
pub mod headers;
pub mod metrics;
pub mod task;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::{Method, Request, StatusCode};
use http_body::Body as _;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use regex::{Regex, RegexBuilder};
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use crate::config::{PoolConfig, ProxyConfig};
use crate::error::ProxyError;
use crate::http::request::{cleanup_upload_files, ProxyRequest, RequestBody, UploadedFile};
use crate::http::response::{ProxyResponse, ResponseBody, ResponseHandle};
use crate::routing::matcher::RouteMatcher;

use agent::ConnectionAgent;
use metrics::{PerfSnapshot, PoolPerf};
use task::{Task, TaskQueue};

/// Inbound header requesting fire-and-forget handling.
pub const QUEUE_HEADER: &str = "x-pool-queue";

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A named backend route with its own matching rules, limits, and target.
pub struct Pool {
    name: String,
    config: PoolConfig,
    matcher: RouteMatcher,
    url_prefix: String,
    scrub_request: Regex,
    scrub_response: Regex,
    success_match: Regex,
    insert_request: HashMap<String, String>,
    insert_response: HashMap<String, String>,
    queue: Arc<TaskQueue>,
    perf: Arc<PoolPerf>,
    agent: ConnectionAgent,
    pending: AtomicUsize,
    executing: AtomicUsize,
    stopped: watch::Sender<bool>,
}

impl Pool {
    /// Build a pool from its validated config. Patterns compile here;
    /// failures abort startup.
    pub fn new(config: PoolConfig, global: &ProxyConfig) -> Result<Arc<Self>, regex::Error> {
        let matcher = RouteMatcher::compile(&config)?;
        let scrub_request = header_pattern(&config.scrub_request_headers)?;
        let scrub_response = header_pattern(&config.scrub_response_headers)?;
        let success_match = Regex::new(&config.success_match)?;

        let perf = Arc::new(PoolPerf::new());
        let agent = ConnectionAgent::new(&config.name, &config, Arc::clone(&perf));
        let (stopped, _) = watch::channel(false);

        Ok(Arc::new(Self {
            name: config.name.clone(),
            url_prefix: config.url_prefix(),
            matcher,
            scrub_request,
            scrub_response,
            success_match,
            insert_request: headers::merge_inserts(
                &global.insert_request_headers,
                &config.insert_request_headers,
            ),
            insert_response: headers::merge_inserts(
                &global.insert_response_headers,
                &config.insert_response_headers,
            ),
            queue: Arc::new(TaskQueue::new()),
            perf,
            agent,
            pending: AtomicUsize::new(0),
            executing: AtomicUsize::new(0),
            stopped,
            config,
        }))
    }

    /// Spawn the worker slots. One task per concurrency slot, all feeding
    /// from the shared queue.
    pub fn start(self: &Arc<Self>) {
        for slot in 0..self.config.worker_slots() {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                pool.worker(slot).await;
            });
        }
        tracing::debug!(
            pool = %self.name,
            workers = self.config.worker_slots(),
            upstream = %self.url_prefix,
            "Pool started"
        );
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Skipped by the router's pattern scan; reachable via selector only.
    pub fn explicit_only(&self) -> bool {
        self.config.explicit_only
    }

    /// Method AND host AND uri pattern check.
    pub fn matches(&self, request: &ProxyRequest) -> bool {
        self.matcher.matches(request)
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn executing(&self) -> usize {
        self.executing.load(Ordering::Relaxed)
    }

    /// Last published per-second snapshot.
    pub fn last_metrics(&self) -> Arc<PerfSnapshot> {
        self.perf.snapshot()
    }

    /// Admit a request: reject at the queue bound, acknowledge blind
    /// requests immediately, otherwise enqueue.
    pub fn admit(self: &Arc<Self>, request: ProxyRequest, handle: ResponseHandle) {
        if !self.reserve_slot() {
            let err = ProxyError::QueueFull {
                pending: self.pending() + self.executing(),
            };
            tracing::error!(
                pool = %self.name,
                method = %request.method,
                uri = %request.uri,
                "{err}"
            );
            handle.reject(&err);
            return;
        }

        tracing::debug!(
            pool = %self.name,
            method = %request.method,
            uri = %request.uri,
            "Enqueuing request"
        );

        let mut task = Task::new(request, Some(handle), self.config.retries);

        if task.request.header(QUEUE_HEADER).is_some() {
            // Blind mode: acknowledge now, detach, and keep exclusive
            // ownership of the request snapshot and its temp files.
            let request_id = format!("{}-{}", self.name, Uuid::new_v4().simple());
            let ack = serde_json::json!({
                "code": 0,
                "description": "Proxy request enqueued successfully.",
                "request_id": &request_id,
            });
            if let Some(handle) = task.handle.take() {
                handle.respond(ProxyResponse::json(&ack));
            }
            task.queue_id = Some(request_id);
        }

        self.queue.push(task);
    }

    /// Claim a pending slot against the queue bound in one atomic step, so
    /// admissions racing at capacity cannot overshoot the ceiling.
    fn reserve_slot(&self) -> bool {
        let max = self.config.max_queue_length;
        if max == 0 {
            self.pending.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        self.pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |pending| {
                if pending + self.executing.load(Ordering::Relaxed) >= max {
                    None
                } else {
                    Some(pending + 1)
                }
            })
            .is_ok()
    }

    async fn worker(self: Arc<Self>, slot: usize) {
        let mut stopped = self.stopped.subscribe();
        loop {
            let task = tokio::select! {
                task = self.queue.pop() => match task {
                    Some(task) => task,
                    None => break,
                },
                _ = stopped.changed() => break,
            };
            self.process(task).await;
        }
        tracing::trace!(pool = %self.name, slot, "Worker exited");
    }

    async fn process(self: &Arc<Self>, task: Task) {
        // Rate ceiling: defer, don't drop. The task keeps its pending slot
        // and its retry budget; only a throttle event is recorded.
        let forwarded = self.perf.counter("requests");
        if self.config.max_per_sec > 0 && forwarded >= self.config.max_per_sec {
            if self.perf.count_once("throttles") {
                tracing::warn!(
                    pool = %self.name,
                    "Request rate has exceeded max limit: {}/sec",
                    forwarded + 1
                );
            }
            self.queue.resubmit_after(
                task,
                Duration::from_millis(self.config.throttle_requeue_delay_ms),
            );
            return;
        }

        // Raise executing before dropping pending; the admission bound reads
        // the sum and must never see it dip during the handoff.
        self.executing.fetch_add(1, Ordering::Relaxed);
        self.pending.fetch_sub(1, Ordering::Relaxed);
        self.perf.time_ms(
            "queue",
            task.enqueued_at.elapsed().as_secs_f64() * 1000.0,
        );
        self.execute(task).await;
        self.executing.fetch_sub(1, Ordering::Relaxed);
    }

    /// One forward attempt: build, send, decide streaming, deliver or
    /// schedule a retry.
    async fn execute(self: &Arc<Self>, mut task: Task) {
        let url = format!("{}{}", self.url_prefix, task.request.uri);
        let started = Instant::now();

        let upstream_request = match self.build_upstream_request(&task.request, &url).await {
            Ok(req) => req,
            Err(e) => {
                // Deterministic build failure; retrying cannot help.
                tracing::error!(pool = %self.name, url = %url, error = %e, "Failed to build upstream request");
                self.perf.count("requests", 1);
                self.perf.count("errors", 1);
                self.finish(
                    task,
                    ProxyResponse::error_text(StatusCode::INTERNAL_SERVER_ERROR, &e),
                )
                .await;
                return;
            }
        };
        let bytes_sent = upstream_request.body().size_hint().lower();

        tracing::debug!(pool = %self.name, method = %task.request.method, url = %url, "Proxying request");

        let result = if self.config.http_timeout_ms > 0 {
            match tokio::time::timeout(
                Duration::from_millis(self.config.http_timeout_ms),
                self.agent.request(upstream_request),
            )
            .await
            {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!(
                    "upstream timeout after {} ms",
                    self.config.http_timeout_ms
                )),
            }
        } else {
            self.agent.request(upstream_request).await.map_err(|e| e.to_string())
        };

        match result {
            Ok(response) => {
                let status = response.status();
                let success = self.success_match.is_match(status.as_str());

                // Streaming decision, made once headers arrive and before
                // the body is consumed.
                if task.request.method != Method::HEAD
                    && task.handle.is_some()
                    && (success || task.retries == 0)
                    && !below_stream_threshold(&response, self.config.min_stream_size)
                {
                    self.commit_stream(task, response, success, started, bytes_sent)
                        .await;
                    return;
                }

                // Buffered mode: body needed as diagnostic/retry material,
                // or small enough that buffering is cheaper, or HEAD/blind.
                let (parts, body) = response.into_parts();
                match body.collect().await {
                    Ok(collected) => {
                        let data = collected.to_bytes();
                        self.complete_attempt(
                            task,
                            (parts.status, parts.headers, data),
                            success,
                            started,
                            bytes_sent,
                        )
                        .await;
                    }
                    Err(e) => {
                        self.handle_failure(task, None, e.to_string(), started, bytes_sent)
                            .await;
                    }
                }
            }
            Err(e) => {
                self.handle_failure(task, None, e, started, bytes_sent).await;
            }
        }
    }

    /// Pipe the upstream body straight to the caller. Once committed there
    /// is no retry, no re-buffering, and no transaction body logging; the
    /// worker slot stays held until the caller finishes consuming the
    /// stream, keeping concurrent upstream sockets within the ceiling.
    async fn commit_stream(
        self: &Arc<Self>,
        mut task: Task,
        response: hyper::Response<Incoming>,
        success: bool,
        started: Instant,
        bytes_sent: u64,
    ) {
        let (parts, body) = response.into_parts();
        let headers = self.scrubbed_response_headers(&parts.headers);

        self.import_attempt_metrics(started, bytes_sent, 0);
        if !success {
            // Terminal failing status with no retry budget left; it still
            // streams, but it is counted and logged as an error.
            self.perf.count("errors", 1);
            if self.config.log_errors {
                tracing::error!(
                    pool = %self.name,
                    method = %task.request.method,
                    uri = %task.request.uri,
                    "Proxy request error: HTTP {}",
                    parts.status
                );
            }
        }

        if self.config.log_transactions {
            tracing::info!(
                pool = %self.name,
                status = %parts.status,
                uri = %task.request.uri,
                streamed = true,
                "Proxy request completed"
            );
        }

        let (done_tx, done_rx) = oneshot::channel();
        let metered = MeteredBody {
            inner: body,
            perf: Arc::clone(&self.perf),
            bytes: 0,
            done: Some(done_tx),
        };
        if let Some(handle) = task.handle.take() {
            handle.respond(ProxyResponse {
                status: parts.status,
                headers,
                body: ResponseBody::Stream(Body::new(metered)),
            });
        }
        cleanup_upload_files(task.request.files()).await;

        // Wait for the caller to drain (or abandon) the stream. Fires on
        // the body's drop either way, so a disconnect cannot wedge the slot.
        let _ = done_rx.await;
    }

    /// A fully buffered attempt: decide between delivery and retry.
    async fn complete_attempt(
        self: &Arc<Self>,
        task: Task,
        response: (StatusCode, axum::http::HeaderMap, Bytes),
        success: bool,
        started: Instant,
        bytes_sent: u64,
    ) {
        if !success {
            let detail = format!("HTTP {}", response.0);
            self.handle_failure(task, Some(response), detail, started, bytes_sent)
                .await;
            return;
        }

        let (status, header_map, data) = response;
        self.import_attempt_metrics(started, bytes_sent, data.len() as u64);

        self.log_transaction(&task, status, started, false);

        let headers = self.scrubbed_response_headers(&header_map);
        self.finish(
            task,
            ProxyResponse {
                status,
                headers,
                body: ResponseBody::Buffered(data),
            },
        )
        .await;
    }

    /// Transport error or failing status: retry while budget remains,
    /// otherwise surface the terminal result.
    async fn handle_failure(
        self: &Arc<Self>,
        mut task: Task,
        response: Option<(StatusCode, axum::http::HeaderMap, Bytes)>,
        detail: String,
        started: Instant,
        bytes_sent: u64,
    ) {
        let body_len = response.as_ref().map(|(_, _, b)| b.len() as u64).unwrap_or(0);
        self.import_attempt_metrics(started, bytes_sent, body_len);
        self.perf.count("errors", 1);

        if task.retries > 0 {
            let delay = self.retry_delay();
            tracing::debug!(
                pool = %self.name,
                uri = %task.request.uri,
                retries_remaining = task.retries,
                delay_ms = delay.as_millis() as u64,
                "{detail}, will retry"
            );
            task.retries -= 1;
            // Re-claim a pending slot before the timer starts, so drain
            // cannot observe an idle pool while this task waits.
            self.pending.fetch_add(1, Ordering::Relaxed);
            self.queue.resubmit_after(task, delay);
            return;
        }

        if self.config.log_errors {
            tracing::error!(
                pool = %self.name,
                method = %task.request.method,
                uri = %task.request.uri,
                request_id = task.queue_id.as_deref().unwrap_or(""),
                "Proxy request error: {detail}"
            );
        }

        let terminal = match response {
            Some((status, header_map, data)) => {
                self.log_transaction(&task, status, started, false);
                ProxyResponse {
                    status,
                    headers: self.scrubbed_response_headers(&header_map),
                    body: ResponseBody::Buffered(data),
                }
            }
            // No upstream response was ever obtained; synthesize one.
            None => ProxyResponse::error_text(StatusCode::INTERNAL_SERVER_ERROR, &detail),
        };
        self.finish(task, terminal).await;
    }

    /// Terminal delivery: exactly once via the handle, or temp-file
    /// cleanup for blind tasks that have no handle.
    async fn finish(self: &Arc<Self>, mut task: Task, response: ProxyResponse) {
        match task.handle.take() {
            Some(handle) => handle.respond(response),
            None => {
                tracing::debug!(
                    pool = %self.name,
                    request_id = task.queue_id.as_deref().unwrap_or(""),
                    "Blind request completed"
                );
            }
        }
        cleanup_upload_files(task.request.files()).await;
    }

    fn import_attempt_metrics(&self, started: Instant, bytes_sent: u64, bytes_received: u64) {
        self.perf.count("requests", 1);
        self.perf.count("bytes_sent", bytes_sent);
        self.perf.count("bytes_received", bytes_received);
        self.perf
            .time_ms("total", started.elapsed().as_secs_f64() * 1000.0);
    }

    fn log_transaction(&self, task: &Task, status: StatusCode, started: Instant, streamed: bool) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let log = self.config.log_transactions
            || (self.config.log_perf_ms > 0 && elapsed_ms >= self.config.log_perf_ms);
        if log {
            tracing::info!(
                pool = %self.name,
                status = %status,
                method = %task.request.method,
                uri = %task.request.uri,
                elapsed_ms,
                streamed,
                request_id = task.queue_id.as_deref().unwrap_or(""),
                "Proxy request completed"
            );
        }
    }

    /// Backoff is driven by the previous completed second's error count,
    /// a coarse load-shedding signal, not this task's own history.
    fn retry_delay(&self) -> Duration {
        let mut ms = self.config.retry_delay_base_ms
            + self.perf.last_errors() * self.config.retry_delay_mult_ms;
        if self.config.retry_delay_max_ms > 0 {
            ms = ms.min(self.config.retry_delay_max_ms);
        }
        Duration::from_millis(ms)
    }

    async fn build_upstream_request(
        &self,
        request: &ProxyRequest,
        url: &str,
    ) -> Result<Request<Body>, String> {
        let mut hdrs = headers::scrub(&request.headers, &self.scrub_request);

        if request.encrypted {
            headers::set(&mut hdrs, "X-Forwarded-Proto", "https".to_string());
        }
        headers::apply_inserts(&mut hdrs, &self.insert_request);
        if self.config.append_to_x_forwarded_for {
            headers::append_forwarded_for(&mut hdrs, request);
        }
        if let Some(credentials) = &self.config.http_basic_auth {
            headers::set(&mut hdrs, "Authorization", headers::basic_auth(credentials));
        }
        if !self.config.http_user_agent.is_empty() {
            headers::set(&mut hdrs, "User-Agent", self.config.http_user_agent.clone());
        }

        let body = self.build_body(request, &mut hdrs).await?;

        let mut builder = Request::builder().method(request.method.clone()).uri(url);
        for (key, value) in &hdrs {
            builder = builder.header(key.as_str(), value.as_str());
        }
        builder.body(body).map_err(|e| e.to_string())
    }

    /// Reconstruct the forwarded body. POST bodies are rebuilt by
    /// content-type (parameters stripped); everything else passes raw
    /// bytes through.
    async fn build_body(
        &self,
        request: &ProxyRequest,
        hdrs: &mut Vec<(String, String)>,
    ) -> Result<Body, String> {
        if request.method != Method::POST {
            return Ok(match &request.body {
                RequestBody::Raw(bytes) => Body::from(bytes.clone()),
                _ => Body::empty(),
            });
        }

        match &request.body {
            RequestBody::Multipart { fields, files } => {
                let boundary = format!("poolgate{}", Uuid::new_v4().simple());
                let encoded = encode_multipart(fields, files, &boundary)
                    .await
                    .map_err(|e| e.to_string())?;
                headers::set(
                    hdrs,
                    "Content-Type",
                    format!("multipart/form-data; boundary={boundary}"),
                );
                Ok(Body::from(encoded))
            }
            RequestBody::Form(fields) => {
                let mut serializer = url::form_urlencoded::Serializer::new(String::new());
                for (key, value) in fields {
                    serializer.append_pair(key, value);
                }
                headers::set(
                    hdrs,
                    "Content-Type",
                    "application/x-www-form-urlencoded".to_string(),
                );
                Ok(Body::from(serializer.finish()))
            }
            RequestBody::Raw(bytes) => {
                if let Some(ct) = request.content_type() {
                    headers::set(hdrs, "Content-Type", ct);
                }
                Ok(Body::from(bytes.clone()))
            }
            RequestBody::None => Ok(Body::empty()),
        }
    }

    fn scrubbed_response_headers(
        &self,
        header_map: &axum::http::HeaderMap,
    ) -> Vec<(String, String)> {
        let raw: Vec<(String, String)> = header_map
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let mut headers = headers::scrub(&raw, &self.scrub_response);
        headers::apply_inserts(&mut headers, &self.insert_response);
        headers
    }

    /// Once-per-second roll-up: snapshot gauges, publish, reset.
    pub fn tick(&self) {
        self.perf.tick(
            self.pending() as u64,
            self.executing() as u64,
            self.agent.open_sockets(),
        );
        let snapshot = self.perf.snapshot();
        if snapshot.counters.get("requests").copied().unwrap_or(0) > 0 {
            tracing::debug!(pool = %self.name, averages = ?snapshot.averages, "Average performance metrics");
        }
    }

    /// Drain: wait for queued and in-flight work to finish naturally, then
    /// release the agent and stop the workers. Nothing is cancelled.
    pub async fn shutdown(&self) {
        tracing::info!(
            pool = %self.name,
            pending = self.pending(),
            executing = self.executing(),
            "Shutting down pool"
        );

        while self.pending() > 0 || self.executing() > 0 {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        self.agent.shutdown();
        let _ = self.stopped.send(true);
        tracing::info!(pool = %self.name, "Pool shutdown complete");
    }
}

fn header_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

fn below_stream_threshold(response: &hyper::Response<Incoming>, threshold: u64) -> bool {
    response
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|len| len < threshold)
        .unwrap_or(false)
}

/// Multipart re-encoding for forwarded uploads: text fields first, then
/// file parts read back from their temp paths.
async fn encode_multipart(
    fields: &[(String, String)],
    files: &[UploadedFile],
    boundary: &str,
) -> std::io::Result<Bytes> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    for file in files {
        let data = tokio::fs::read(&file.path).await?;
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                file.field, file.filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(&data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    Ok(Bytes::from(body))
}

/// Upstream body wrapper that meters bytes as the caller consumes the
/// stream. Drop imports the count and releases the worker slot waiting in
/// `commit_stream`.
struct MeteredBody {
    inner: Incoming,
    perf: Arc<PoolPerf>,
    bytes: u64,
    done: Option<oneshot::Sender<()>>,
}

impl http_body::Body for MeteredBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_frame(cx);
        if let Poll::Ready(Some(Ok(frame))) = &poll {
            if let Some(data) = frame.data_ref() {
                this.bytes += data.len() as u64;
            }
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for MeteredBody {
    fn drop(&mut self) {
        self.perf.count("bytes_received", self.bytes);
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(config: PoolConfig) -> Arc<Pool> {
        Pool::new(config, &ProxyConfig::default()).unwrap()
    }

    fn base_config() -> PoolConfig {
        PoolConfig {
            name: "test".into(),
            target_hostname: "127.0.0.1".into(),
            target_port: 39999,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_admission_rejects_at_queue_bound() {
        let mut config = base_config();
        config.max_queue_length = 2;
        let pool = pool_with(config);

        // Workers never started: admitted tasks stay pending.
        let mut receivers = Vec::new();
        for _ in 0..2 {
            let (handle, rx) = ResponseHandle::channel();
            pool.admit(dummy_request(), handle);
            receivers.push(rx);
        }
        assert_eq!(pool.pending(), 2);

        let (handle, rx) = ResponseHandle::channel();
        pool.admit(dummy_request(), handle);
        let resp = rx.await.unwrap();
        assert_eq!(resp.status, StatusCode::TOO_MANY_REQUESTS);
        // the rejected request never joined the queue
        assert_eq!(pool.pending(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_admissions_never_overshoot_bound() {
        let mut config = base_config();
        config.max_queue_length = 1;
        let pool = pool_with(config);

        // Workers not started, so the one winner stays pending forever.
        let mut receivers = Vec::new();
        let mut joins = Vec::new();
        for _ in 0..8 {
            let (handle, rx) = ResponseHandle::channel();
            receivers.push(rx);
            let pool = Arc::clone(&pool);
            joins.push(tokio::spawn(async move {
                pool.admit(dummy_request(), handle);
            }));
        }
        for join in joins {
            join.await.unwrap();
        }

        assert_eq!(pool.pending(), 1);
        let rejected = receivers
            .iter_mut()
            .filter_map(|rx| rx.try_recv().ok())
            .filter(|resp| resp.status == StatusCode::TOO_MANY_REQUESTS)
            .count();
        assert_eq!(rejected, 7);
    }

    #[tokio::test]
    async fn test_blind_admission_acks_immediately() {
        let pool = pool_with(base_config());

        let mut request = dummy_request();
        request
            .headers
            .push(("X-Pool-Queue".to_string(), "1".to_string()));

        let (handle, rx) = ResponseHandle::channel();
        pool.admit(request, handle);

        let resp = rx.await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        let body = match resp.body {
            ResponseBody::Buffered(bytes) => bytes,
            _ => panic!("ack must be buffered"),
        };
        let ack: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(ack["code"], 0);
        assert!(ack["request_id"].as_str().unwrap().starts_with("test-"));
    }

    #[test]
    fn test_retry_delay_uses_previous_second_errors() {
        let mut config = base_config();
        config.retry_delay_base_ms = 100;
        config.retry_delay_mult_ms = 50;
        config.retry_delay_max_ms = 400;
        let pool = pool_with(config);

        // no errors last second: base only
        assert_eq!(pool.retry_delay(), Duration::from_millis(100));

        // 3 errors in the previous interval
        pool.perf.count("errors", 3);
        pool.perf.tick(0, 0, 0);
        assert_eq!(pool.retry_delay(), Duration::from_millis(250));

        // capped at max
        pool.perf.count("errors", 100);
        pool.perf.tick(0, 0, 0);
        assert_eq!(pool.retry_delay(), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_build_body_strips_content_type_parameters() {
        let pool = pool_with(base_config());
        let mut request = dummy_request();
        request.method = Method::POST;
        request.headers.push((
            "Content-Type".to_string(),
            "application/json; charset=utf-8".to_string(),
        ));
        request.body = RequestBody::Raw(Bytes::from_static(b"{}"));

        let mut hdrs = Vec::new();
        pool.build_body(&request, &mut hdrs).await.unwrap();
        assert_eq!(headers::get(&hdrs, "content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn test_multipart_encoding_round_shape() {
        let fields = vec![("kind".to_string(), "avatar".to_string())];
        let encoded = encode_multipart(&fields, &[], "bnd").await.unwrap();
        let text = String::from_utf8_lossy(&encoded);
        assert!(text.starts_with("--bnd\r\n"));
        assert!(text.contains("name=\"kind\""));
        assert!(text.ends_with("--bnd--\r\n"));
    }

    fn dummy_request() -> ProxyRequest {
        ProxyRequest {
            method: Method::GET,
            uri: "/".into(),
            headers: Vec::new(),
            remote_addr: "127.0.0.1".parse().unwrap(),
            encrypted: false,
            body: RequestBody::None,
        }
    }
}
