//! Request router: failover across workers and connection holding
//!
//! A single `route` call owns one client request from ingress to terminal
//! outcome. Retries proceed sequentially across workers; while no worker is
//! available the call sleeps instead of failing, holding the client
//! connection until recovery or the attempt cap.

use crate::error::DispatchError;
use crate::metrics::Metrics;
use crate::pool::WorkerPool;
use crate::worker::RpcCall;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Upper bound on one hold-and-retry sleep while no worker is available
const MAX_HOLD_SLICE: Duration = Duration::from_secs(5);

pub struct RequestRouter {
    pool: Arc<WorkerPool>,
    metrics: Arc<Metrics>,
}

impl RequestRouter {
    pub fn new(pool: Arc<WorkerPool>, metrics: Arc<Metrics>) -> Self {
        Self { pool, metrics }
    }

    /// Dispatch a client request, failing over across endpoints until some
    /// upstream produces a completable response or the retry policy is
    /// exhausted
    pub async fn route(&self, call: RpcCall) -> Result<Bytes, DispatchError> {
        let max_attempts = (2 * self.pool.all().len()) as u32;
        let mut tried: HashSet<String> = HashSet::new();
        let mut attempts: u32 = 0;
        let mut last_error: Option<DispatchError> = None;

        loop {
            let available = self.pool.available();

            // Prefer workers not yet tried in this request; fall back to the
            // full available set once everything has failed once
            let untried: Vec<_> = available
                .iter()
                .filter(|w| !tried.contains(w.url()))
                .cloned()
                .collect();
            let candidates = if untried.is_empty() { available.clone() } else { untried };

            if candidates.is_empty() {
                // Connection hold: no error while recovery is pending
                let wait = self
                    .pool
                    .shortest_recovery()
                    .map(|d| d.min(MAX_HOLD_SLICE))
                    .unwrap_or(MAX_HOLD_SLICE);
                debug!(
                    method = %call.method,
                    wait_ms = wait.as_millis() as u64,
                    "no endpoint available, holding request"
                );
                sleep(wait).await;
                continue;
            }

            // Least-loaded selection; `min_by_key` keeps the first of equal
            // queue lengths, preserving roster order on ties
            let Some(worker) = candidates.iter().min_by_key(|w| w.queue_len()).cloned() else {
                continue;
            };

            attempts += 1;
            match worker.dispatch(call.clone()).await {
                Ok(body) => {
                    if attempts > 1 {
                        debug!(method = %call.method, attempts, url = %worker.url(), "request served after failover");
                    }
                    return Ok(body);
                }
                Err(err) => {
                    if !err.is_failover() {
                        return Err(err);
                    }
                    warn!(
                        method = %call.method,
                        url = %worker.url(),
                        attempts,
                        %err,
                        "endpoint rejected request, failing over"
                    );
                    self.metrics.failovers_total.inc();
                    if matches!(err, DispatchError::QueueFull { .. }) {
                        self.metrics.queue_rejections.inc();
                    }
                    tried.insert(worker.url().to_string());
                    last_error = Some(err);

                    if tried.len() >= available.len() {
                        if attempts >= max_attempts {
                            let last = last_error
                                .take()
                                .map(|e| e.to_string())
                                .unwrap_or_else(|| "unknown error".to_string());
                            return Err(DispatchError::AllEndpointsFailed {
                                attempts,
                                last_error: last,
                            });
                        }
                        // Give exhausted endpoints a second chance within
                        // this request
                        tried.clear();
                    }
                }
            }
        }
    }
}
