//! Per-endpoint worker: bounded FIFO queue and serialized drain loop
//!
//! Each upstream endpoint gets exactly one worker. The worker owns its queue
//! and a single long-lived drain task, which guarantees at most one in-flight
//! upstream request per endpoint at any instant. Parallelism on a single
//! endpoint provokes the very rate limits this proxy mitigates.

use crate::config::WorkerConfig;
use crate::detector::{parse_retry_after, RateLimitDetector, UpstreamObservation};
use crate::error::DispatchError;
use crate::metrics::Metrics;
use crate::stats::StatsStore;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Maximum slice slept inside the cooldown gate before re-checking
const COOLDOWN_POLL: Duration = Duration::from_secs(1);

/// Poll interval while the worker sits in the errored state
const ERROR_POLL: Duration = Duration::from_secs(1);

/// JSON-RPC error codes classified as transient (retry on another endpoint)
const TRANSIENT_RPC_CODES: [i64; 5] = [19, -32000, -32603, 429, 503];

/// Error-message substrings classified as transient
const TRANSIENT_RPC_KEYWORDS: [&str; 12] = [
    "temporary",
    "retry",
    "timeout",
    "timed out",
    "unavailable",
    "connection",
    "network",
    "try again",
    "overloaded",
    "capacity",
    "grpc",
    "cancel",
];

/// One client request travelling through the proxy
#[derive(Debug, Clone)]
pub struct RpcCall {
    /// Raw JSON-RPC request body, forwarded to the upstream verbatim
    pub body: Bytes,
    /// Method name, used for logging and the request log
    pub method: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Healthy = 0,
    CoolingDown = 1,
    Error = 2,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::CoolingDown,
            2 => WorkerState::Error,
            _ => WorkerState::Healthy,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Healthy => "healthy",
            WorkerState::CoolingDown => "cooling_down",
            WorkerState::Error => "error",
        }
    }
}

/// Read-only view of a worker, reported by `/stats`
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub url: String,
    pub state: &'static str,
    pub queue_length: usize,
    pub recovery_time_ms: u64,
    pub consecutive_transport_failures: u32,
}

struct QueuedCall {
    call: RpcCall,
    reply: oneshot::Sender<Result<Bytes, DispatchError>>,
    enqueued_at: Instant,
}

/// State shared between the worker handle and its drain task.
///
/// The queue and cooldown are written only by the drain task (plus the
/// enqueue path for the queue); the router and pool read them through
/// short locks and atomics.
struct Shared {
    id: i64,
    url: String,
    queue: Mutex<VecDeque<QueuedCall>>,
    work_ready: Notify,
    state: AtomicU8,
    cooldown_until: Mutex<Option<Instant>>,
    transport_failures: AtomicU32,
    failure_threshold: u32,
}

impl Shared {
    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn enter_cooldown(&self, cooldown: Duration) {
        *self.cooldown_until.lock() = Some(Instant::now() + cooldown);
        self.set_state(WorkerState::CoolingDown);
    }
}

/// Serialized dispatcher for exactly one upstream endpoint
pub struct EndpointWorker {
    shared: Arc<Shared>,
    max_queue_size: usize,
    drain_task: tokio::task::JoinHandle<()>,
}

impl EndpointWorker {
    /// Create the worker and start its drain task
    pub fn spawn(
        id: i64,
        url: String,
        cfg: WorkerConfig,
        client: reqwest::Client,
        detector: Arc<RateLimitDetector>,
        store: Arc<StatsStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let shared = Arc::new(Shared {
            id,
            url,
            queue: Mutex::new(VecDeque::new()),
            work_ready: Notify::new(),
            state: AtomicU8::new(WorkerState::Healthy as u8),
            cooldown_until: Mutex::new(None),
            transport_failures: AtomicU32::new(0),
            failure_threshold: cfg.failure_threshold,
        });

        let drain_task = tokio::spawn(drain_loop(
            Arc::clone(&shared),
            cfg.clone(),
            client,
            detector,
            store,
            metrics,
        ));

        Self {
            shared,
            max_queue_size: cfg.max_queue_size,
            drain_task,
        }
    }

    pub fn id(&self) -> i64 {
        self.shared.id
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Queue the request; the returned receiver completes when this endpoint
    /// produced a terminal outcome. Fails fast when the queue is at capacity.
    pub fn enqueue(
        &self,
        call: RpcCall,
    ) -> Result<oneshot::Receiver<Result<Bytes, DispatchError>>, DispatchError> {
        let mut queue = self.shared.queue.lock();
        if queue.len() >= self.max_queue_size {
            return Err(DispatchError::QueueFull {
                endpoint: self.shared.url.clone(),
                capacity: self.max_queue_size,
            });
        }
        let (reply, rx) = oneshot::channel();
        queue.push_back(QueuedCall {
            call,
            reply,
            enqueued_at: Instant::now(),
        });
        drop(queue);
        self.shared.work_ready.notify_one();
        Ok(rx)
    }

    /// Enqueue and wait for this endpoint's terminal outcome
    pub async fn dispatch(&self, call: RpcCall) -> Result<Bytes, DispatchError> {
        let rx = self.enqueue(call)?;
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(DispatchError::WorkerGone {
                endpoint: self.shared.url.clone(),
            }),
        }
    }

    /// False while cooling down or errored
    pub fn is_available(&self) -> bool {
        match self.shared.state() {
            WorkerState::Healthy => true,
            WorkerState::Error => false,
            WorkerState::CoolingDown => match *self.shared.cooldown_until.lock() {
                // The drain loop transitions lazily; an expired cooldown no
                // longer blocks dispatch
                Some(until) => Instant::now() >= until,
                None => true,
            },
        }
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Milliseconds until the cooldown expires, or 0 when not cooling down.
    /// Rounded up so an almost-expired cooldown never reports zero.
    pub fn recovery_time_ms(&self) -> u64 {
        match *self.shared.cooldown_until.lock() {
            Some(until) => {
                let remaining = until.saturating_duration_since(Instant::now());
                remaining.as_millis() as u64 + u64::from(remaining.subsec_nanos() % 1_000_000 != 0)
            }
            None => 0,
        }
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            url: self.shared.url.clone(),
            state: self.shared.state().as_str(),
            queue_length: self.queue_len(),
            recovery_time_ms: self.recovery_time_ms(),
            consecutive_transport_failures: self.shared.transport_failures.load(Ordering::SeqCst),
        }
    }

    /// Restore an errored worker after a successful health probe
    pub fn mark_recovered(&self, detector: &RateLimitDetector) {
        *self.shared.cooldown_until.lock() = None;
        self.shared.transport_failures.store(0, Ordering::SeqCst);
        self.shared.set_state(WorkerState::Healthy);
        detector.reset_strikes(self.shared.id);
        self.shared.work_ready.notify_one();
        info!(url = %self.shared.url, "worker restored by health probe");
    }

    /// Stop the drain task. Pending queue items complete with `WorkerGone`.
    pub fn shutdown(&self) {
        self.drain_task.abort();
    }

    #[cfg(test)]
    pub fn force_cooldown(&self, cooldown: Duration) {
        self.shared.enter_cooldown(cooldown);
    }

    #[cfg(test)]
    pub fn force_error(&self) {
        self.shared.set_state(WorkerState::Error);
    }
}

impl Drop for EndpointWorker {
    fn drop(&mut self) {
        self.drain_task.abort();
    }
}

fn is_transient_rpc_error(code: Option<i64>, message: &str) -> bool {
    if let Some(code) = code {
        if TRANSIENT_RPC_CODES.contains(&code) {
            return true;
        }
    }
    let lower = message.to_lowercase();
    TRANSIENT_RPC_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

async fn drain_loop(
    shared: Arc<Shared>,
    cfg: WorkerConfig,
    client: reqwest::Client,
    detector: Arc<RateLimitDetector>,
    store: Arc<StatsStore>,
    metrics: Arc<Metrics>,
) {
    loop {
        // Park until there is queued work
        while shared.queue.lock().is_empty() {
            shared.work_ready.notified().await;
        }

        // An errored worker is not drained; only a health probe restores it
        if shared.state() == WorkerState::Error {
            sleep(ERROR_POLL).await;
            continue;
        }

        // Cooldown gate: no items are consumed while the cooldown runs
        let pending = *shared.cooldown_until.lock();
        if let Some(until) = pending {
            let now = Instant::now();
            if now < until {
                sleep((until - now).min(COOLDOWN_POLL)).await;
                continue;
            }
            *shared.cooldown_until.lock() = None;
            shared.set_state(WorkerState::Healthy);
            detector.reset_strikes(shared.id);
            info!(url = %shared.url, "cooldown expired, resuming dispatch");
        }

        let Some(item) = shared.queue.lock().pop_front() else {
            continue;
        };

        // Caller went away while the item sat in the queue
        if item.reply.is_closed() {
            debug!(url = %shared.url, method = %item.call.method, "skipping cancelled request");
            continue;
        }

        let queued_ms = item.enqueued_at.elapsed().as_millis() as u64;
        if queued_ms > 1_000 {
            debug!(url = %shared.url, queued_ms, "request waited in queue");
        }

        process_item(&shared, &cfg, &client, &detector, &store, &metrics, item).await;
    }
}

async fn process_item(
    shared: &Shared,
    cfg: &WorkerConfig,
    client: &reqwest::Client,
    detector: &RateLimitDetector,
    store: &StatsStore,
    metrics: &Metrics,
    item: QueuedCall,
) {
    let method = item.call.method.clone();
    let started = Instant::now();
    metrics.requests_total.inc();

    let outcome = client
        .post(&shared.url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(item.call.body.clone())
        .timeout(cfg.request_timeout())
        .send()
        .await;

    match outcome {
        Ok(response) => {
            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, chrono::Utc::now()));

            let body = match response.bytes().await {
                Ok(body) => body,
                Err(err) => {
                    transport_failure(shared, detector, store, metrics, item, &method, started, err)
                        .await;
                    return;
                }
            };

            let elapsed_ms = started.elapsed().as_millis() as u64;
            metrics.upstream_latency.observe(elapsed_ms as f64 / 1000.0);
            // A completed HTTP exchange breaks any transport-failure streak
            shared.transport_failures.store(0, Ordering::SeqCst);

            let parsed: Option<Value> = serde_json::from_slice(&body).ok();
            let verdict = detector.detect(
                shared.id,
                &UpstreamObservation {
                    status: Some(status),
                    body: parsed.as_ref(),
                    retry_after,
                    ..Default::default()
                },
            );

            if verdict.rate_limited {
                let message = parsed
                    .as_ref()
                    .and_then(|v| v.pointer("/error/message"))
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("HTTP {}", status));
                rate_limited(
                    shared,
                    store,
                    metrics,
                    item,
                    verdict.cooldown,
                    verdict.confidence,
                    Some(status),
                    &message,
                )
                .await;
                return;
            }

            let error_object = parsed
                .as_ref()
                .and_then(|v| v.get("error"))
                .filter(|e| !e.is_null());

            if let Some(error_object) = error_object {
                let code = error_object.get("code").and_then(Value::as_i64);
                let message = error_object
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();

                if is_transient_rpc_error(code, &message) {
                    debug!(url = %shared.url, %method, ?code, %message, "transient upstream error");
                    detector.record_outcome(shared.id, false);
                    metrics.requests_failed.inc();
                    record_request(
                        store,
                        shared,
                        &method,
                        false,
                        elapsed_ms,
                        Some(status),
                        Some(&message),
                    )
                    .await;
                    let _ = item.reply.send(Err(DispatchError::TransientUpstream {
                        endpoint: shared.url.clone(),
                        code,
                        message,
                    }));
                    return;
                }

                // A well-formed permanent JSON-RPC error is a correct
                // response from the upstream; forward it untouched
                debug!(url = %shared.url, %method, ?code, "permanent upstream error, forwarding");
                detector.record_outcome(shared.id, true);
                record_request(store, shared, &method, true, elapsed_ms, Some(status), None).await;
                let _ = item.reply.send(Ok(body));
                return;
            }

            detector.record_outcome(shared.id, true);
            record_request(store, shared, &method, true, elapsed_ms, Some(status), None).await;
            let _ = item.reply.send(Ok(body));
        }
        Err(err) => {
            transport_failure(shared, detector, store, metrics, item, &method, started, err).await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn transport_failure(
    shared: &Shared,
    detector: &RateLimitDetector,
    store: &StatsStore,
    metrics: &Metrics,
    item: QueuedCall,
    method: &str,
    started: Instant,
    err: reqwest::Error,
) {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let message = err.to_string();
    let timed_out = err.is_timeout();

    let verdict = detector.detect(
        shared.id,
        &UpstreamObservation {
            error_message: Some(&message),
            timed_out,
            ..Default::default()
        },
    );

    if verdict.rate_limited {
        rate_limited(
            shared,
            store,
            metrics,
            item,
            verdict.cooldown,
            verdict.confidence,
            None,
            &message,
        )
        .await;
        return;
    }

    warn!(url = %shared.url, %method, %message, "transport failure");
    detector.record_outcome(shared.id, false);
    metrics.requests_failed.inc();
    record_request(store, shared, method, false, elapsed_ms, None, Some(&message)).await;

    let failures = shared.transport_failures.fetch_add(1, Ordering::SeqCst) + 1;
    if failures >= shared.failure_threshold {
        shared.set_state(WorkerState::Error);
        error!(
            url = %shared.url,
            consecutive_failures = failures,
            "worker errored; waiting for health probe"
        );
    }

    let _ = item.reply.send(Err(DispatchError::Transport {
        endpoint: shared.url.clone(),
        message,
        timed_out,
    }));
}

#[allow(clippy::too_many_arguments)]
async fn rate_limited(
    shared: &Shared,
    store: &StatsStore,
    metrics: &Metrics,
    item: QueuedCall,
    cooldown: Duration,
    confidence: f64,
    http_status: Option<u16>,
    message: &str,
) {
    warn!(
        url = %shared.url,
        cooldown_ms = cooldown.as_millis() as u64,
        confidence,
        %message,
        "rate limit detected, cooling down"
    );
    metrics.rate_limit_events.inc();

    if let Err(err) = store
        .record_rate_limit_event(shared.id, cooldown.as_millis() as u64, http_status, Some(message))
        .await
    {
        error!(url = %shared.url, %err, "failed to persist rate-limit event");
    }

    shared.enter_cooldown(cooldown);
    // Head re-insertion: the limited request is retried first after cooldown
    shared.queue.lock().push_front(item);
}

async fn record_request(
    store: &StatsStore,
    shared: &Shared,
    method: &str,
    success: bool,
    elapsed_ms: u64,
    http_status: Option<u16>,
    error_message: Option<&str>,
) {
    if let Err(err) = store
        .record_request(shared.id, method, success, elapsed_ms, http_status, error_message)
        .await
    {
        error!(url = %shared.url, %err, "failed to persist request log entry");
    }
}
