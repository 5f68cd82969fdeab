//! Single-endpoint JSON-RPC client.
//!
//! Calls arriving within a short coalescing window are flushed as one JSON
//! array request (see [`crate::batch`]). The batch size is probed adaptively:
//! it starts at 1 and grows after each successful full batch until the first
//! error or malformed response freezes it.
//!
//! Transport contract:
//! - GET for no-body requests, POST otherwise
//! - one `https:` redirect followed on 301/302 (GET only)
//! - HTTP 429 honors an integer `Retry-After`, otherwise backs off
//!   `slot_interval * rand(0, 2^attempt)` milliseconds
//! - connection-level failures and 5xx responses retry with the same backoff
//! - up to `throttle_limit` attempts, all raced against `call_timeout`; only
//!   then does the failure surface to the pool as `RpcError::Server`/`Http`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::batch::{flush_loop, PendingCall};
use crate::error::RpcError;
use crate::request::JsonRpcRequest;

/// Configuration for [`RpcClient`].
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Maximum attempts against a throttling endpoint.
    pub throttle_limit: u32,
    /// Base slot for the randomized throttle backoff.
    pub slot_interval: Duration,
    /// Wall-clock budget for one logical call, including all retries.
    pub call_timeout: Duration,
    /// Coalescing window for concurrent calls.
    pub batch_window: Duration,
    /// Ceiling for the adaptive batch-size probe.
    pub max_batch_size: usize,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            throttle_limit: 12,
            slot_interval: Duration::from_millis(100),
            call_timeout: Duration::from_secs(120),
            batch_window: Duration::from_millis(1),
            max_batch_size: 100,
        }
    }
}

/// What a response processor asks the transport to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorAction {
    /// Hand the response to the caller.
    Continue,
    /// Treat the response like an HTTP 429 and retry after a backoff slot.
    Throttle,
}

/// Callback that inspects the raw response before it is parsed.
pub type ResponseProcessor = Arc<dyn Fn(u16, &[u8]) -> ProcessorAction + Send + Sync>;

/// Per-request transport options.
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Return non-2xx bodies to the caller instead of raising.
    pub error_pass_through: bool,
    /// Optional raw-response inspector; may request a throttle.
    pub processor: Option<ResponseProcessor>,
}

// ─── Adaptive batch sizing ────────────────────────────────────────────────────

/// Whether the batch-size probe is still growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// Still probing upward after each successful full batch.
    Testing,
    /// Frozen after the first error or malformed batch response.
    Determined,
}

/// The adaptive batch-size state machine.
///
/// Starts at 1, increments after every successful batch at the current size,
/// and freezes one step down on the first failure. Capped at `max` so a
/// provider that never rejects batches cannot push the probe indefinitely.
#[derive(Debug)]
pub struct AdaptiveBatchSize {
    size: usize,
    state: ProbeState,
    max: usize,
}

impl AdaptiveBatchSize {
    pub fn new(max: usize) -> Self {
        Self {
            size: 1,
            state: ProbeState::Testing,
            max: max.max(1),
        }
    }

    /// Current batch size.
    pub fn current(&self) -> usize {
        self.size
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    /// A batch of `sent` requests came back well-formed.
    pub fn record_success(&mut self, sent: usize) {
        if self.state == ProbeState::Testing && sent >= self.size {
            self.size = (self.size + 1).min(self.max);
            if self.size == self.max {
                self.state = ProbeState::Determined;
            }
        }
    }

    /// A batch failed or came back malformed — freeze one step down.
    pub fn record_failure(&mut self) {
        self.size = self.size.saturating_sub(1).max(1);
        if self.state == ProbeState::Testing {
            tracing::info!(batch_size = self.size, "batch size determined");
        }
        self.state = ProbeState::Determined;
    }
}

// ─── Client ───────────────────────────────────────────────────────────────────

pub(crate) struct ClientInner {
    pub(crate) url: String,
    http: reqwest::Client,
    pub(crate) config: RpcClientConfig,
    next_id: AtomicU64,
    pub(crate) batch_size: Mutex<AdaptiveBatchSize>,
}

/// Single-endpoint JSON-RPC client with request coalescing.
pub struct RpcClient {
    inner: Arc<ClientInner>,
    queue: mpsc::UnboundedSender<PendingCall>,
}

impl RpcClient {
    /// Create a client for `url` and spawn its background flush task.
    pub fn new(url: impl Into<String>, config: RpcClientConfig) -> Self {
        let http = reqwest::Client::builder()
            // the transport implements the follow-once rule itself
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("failed to build reqwest client");

        let batch_size = Mutex::new(AdaptiveBatchSize::new(config.max_batch_size));
        let inner = Arc::new(ClientInner {
            url: url.into(),
            http,
            config,
            next_id: AtomicU64::new(1),
            batch_size,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let flush_inner = inner.clone();
        tokio::spawn(async move {
            flush_loop(flush_inner, rx).await;
        });

        Self { inner, queue: tx }
    }

    /// Create with default configuration.
    pub fn default_for(url: impl Into<String>) -> Self {
        Self::new(url, RpcClientConfig::default())
    }

    /// The endpoint URL.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Current adaptive batch size (exposed for observability).
    pub fn batch_size(&self) -> usize {
        self.inner.batch_size.lock().unwrap().current()
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Call one method. Concurrent calls within the coalescing window are
    /// flushed together as a single JSON array request.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let req = JsonRpcRequest::new(self.next_id(), method, params);
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.queue
            .send(PendingCall { req, tx })
            .map_err(|_| RpcError::Internal("batcher task gone".into()))?;
        rx.await
            .map_err(|_| RpcError::Internal("batcher dropped call".into()))?
    }

    /// Call one method outside the coalescer with explicit transport
    /// options — pass-through of non-2xx bodies, or a response processor
    /// that can request a throttle.
    pub async fn call_with_options(
        &self,
        method: &str,
        params: Vec<Value>,
        opts: &RequestOptions,
    ) -> Result<Value, RpcError> {
        let req = JsonRpcRequest::new(self.next_id(), method, params);
        let body = serde_json::to_string(&req).map_err(RpcError::Deserialization)?;
        let raw = self.inner.fetch_json(Some(body), opts).await?;
        if opts.error_pass_through && raw.get("jsonrpc").is_none() {
            return Ok(raw); // non-RPC error body handed to the caller
        }
        let resp: crate::request::JsonRpcResponse = serde_json::from_value(raw)?;
        resp.into_result().map_err(RpcError::Rpc)
    }

    /// Send `requests` as explicit batches, chunked by the current adaptive
    /// batch size, and return results in request order.
    pub async fn batch_call(
        &self,
        requests: Vec<(String, Vec<Value>)>,
    ) -> Vec<Result<Value, RpcError>> {
        let mut results = Vec::with_capacity(requests.len());
        let mut queued: Vec<JsonRpcRequest> = requests
            .into_iter()
            .map(|(method, params)| JsonRpcRequest::new(self.next_id(), method, params))
            .collect();

        while !queued.is_empty() {
            let size = self.inner.batch_size.lock().unwrap().current();
            let rest = queued.split_off(size.min(queued.len()));
            let chunk = std::mem::replace(&mut queued, rest);
            results.extend(crate::batch::send_chunk(&self.inner, chunk).await);
        }
        results
    }
}

impl ClientInner {
    /// One logical request: the full attempt sequence raced against the
    /// wall-clock timeout. `body = None` issues a GET.
    pub(crate) async fn fetch_json(
        &self,
        body: Option<String>,
        opts: &RequestOptions,
    ) -> Result<Value, RpcError> {
        let timeout = self.config.call_timeout;
        tokio::time::timeout(timeout, self.fetch_attempts(body, opts))
            .await
            .map_err(|_| RpcError::Timeout {
                ms: timeout.as_millis() as u64,
            })?
    }

    async fn fetch_attempts(
        &self,
        body: Option<String>,
        opts: &RequestOptions,
    ) -> Result<Value, RpcError> {
        let mut url = self.url.clone();
        let mut redirected = false;
        let mut last_error = None;

        for attempt in 0..self.config.throttle_limit {
            let response = match &body {
                Some(b) => {
                    self.http
                        .post(&url)
                        .header(reqwest::header::CONTENT_TYPE, "application/json")
                        .body(b.clone())
                        .send()
                        .await
                }
                None => self.http.get(&url).send().await,
            };

            // Transient network failures retry here; the pool only sees an
            // endpoint that kept failing for the whole attempt budget.
            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(RpcError::Server(e.to_string()));
                    if attempt + 1 >= self.config.throttle_limit {
                        break;
                    }
                    let delay = throttle_delay(attempt, None, self.config.slot_interval);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        url = %url,
                        error = %e,
                        "connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status().as_u16();

            // Follow a single https redirect, GET only.
            if (status == 301 || status == 302) && body.is_none() && !redirected {
                if let Some(location) = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                {
                    if location.starts_with("https:") {
                        tracing::debug!(from = %url, to = %location, "following redirect");
                        url = location.to_string();
                        redirected = true;
                        continue;
                    }
                }
            }

            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0);

            let bytes = response
                .bytes()
                .await
                .map_err(|e| RpcError::Server(e.to_string()))?;

            let throttled = status == 429
                || opts
                    .processor
                    .as_ref()
                    .map(|p| p(status, &bytes) == ProcessorAction::Throttle)
                    .unwrap_or(false);

            if throttled {
                if attempt + 1 >= self.config.throttle_limit {
                    break;
                }
                let delay = throttle_delay(attempt, retry_after, self.config.slot_interval);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    url = %url,
                    "throttled — backing off"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if !(200..300).contains(&status) {
                if opts.error_pass_through {
                    return serde_json::from_slice(&bytes)
                        .or(Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned())));
                }
                let error = RpcError::Http {
                    status,
                    body: String::from_utf8_lossy(&bytes).into_owned(),
                };
                // Server-side errors are transient; client errors are not.
                if !is_transient_status(status) {
                    return Err(error);
                }
                last_error = Some(error);
                if attempt + 1 >= self.config.throttle_limit {
                    break;
                }
                let delay = throttle_delay(attempt, retry_after, self.config.slot_interval);
                tracing::debug!(
                    attempt,
                    status,
                    delay_ms = delay.as_millis() as u64,
                    url = %url,
                    "server error, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            return serde_json::from_slice(&bytes).map_err(RpcError::Deserialization);
        }

        Err(last_error.unwrap_or(RpcError::RateLimited {
            endpoint: self.url.clone(),
            attempts: self.config.throttle_limit,
        }))
    }
}

/// Statuses worth retrying against the same endpoint: timeouts and
/// server-side failures.
fn is_transient_status(status: u16) -> bool {
    status == 408 || (500..600).contains(&status)
}

/// Backoff before the next throttled attempt: a positive integer `Retry-After`
/// wins, otherwise `slot_interval * rand(0, 2^attempt)`.
fn throttle_delay(attempt: u32, retry_after: Option<u64>, slot_interval: Duration) -> Duration {
    if let Some(secs) = retry_after {
        return Duration::from_secs(secs);
    }
    let slots = 1u64 << attempt.min(16);
    let picked = rand::thread_rng().gen_range(0..slots);
    slot_interval * picked as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_probes_upward() {
        let mut abs = AdaptiveBatchSize::new(100);
        assert_eq!(abs.current(), 1);
        abs.record_success(1);
        abs.record_success(2);
        abs.record_success(3);
        assert_eq!(abs.current(), 4);
        assert_eq!(abs.state(), ProbeState::Testing);
    }

    #[test]
    fn batch_size_freezes_on_failure() {
        let mut abs = AdaptiveBatchSize::new(100);
        abs.record_success(1);
        abs.record_success(2);
        abs.record_failure();
        assert_eq!(abs.current(), 2);
        assert_eq!(abs.state(), ProbeState::Determined);

        // Frozen — further successes do not grow it.
        abs.record_success(2);
        assert_eq!(abs.current(), 2);
    }

    #[test]
    fn batch_size_never_below_one() {
        let mut abs = AdaptiveBatchSize::new(100);
        abs.record_failure();
        abs.record_failure();
        assert_eq!(abs.current(), 1);
    }

    #[test]
    fn batch_size_capped_at_max() {
        let mut abs = AdaptiveBatchSize::new(3);
        abs.record_success(1);
        abs.record_success(2);
        abs.record_success(3);
        abs.record_success(3);
        assert_eq!(abs.current(), 3);
        assert_eq!(abs.state(), ProbeState::Determined);
    }

    #[test]
    fn transient_statuses() {
        assert!(is_transient_status(500));
        assert!(is_transient_status(503));
        assert!(is_transient_status(408));
        assert!(!is_transient_status(400));
        assert!(!is_transient_status(404));
        assert!(!is_transient_status(429)); // handled by the throttle path
    }

    #[test]
    fn retry_after_wins_over_slots() {
        let d = throttle_delay(5, Some(7), Duration::from_millis(100));
        assert_eq!(d, Duration::from_secs(7));
    }

    #[test]
    fn slot_backoff_bounded() {
        for attempt in 0..6 {
            let d = throttle_delay(attempt, None, Duration::from_millis(100));
            let max = Duration::from_millis(100) * (1u32 << attempt);
            assert!(d < max.max(Duration::from_millis(1)), "delay {d:?} out of range");
        }
    }
}
