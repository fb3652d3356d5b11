//! Worker pool: roster, availability queries and health probing

use crate::config::Config;
use crate::detector::RateLimitDetector;
use crate::metrics::Metrics;
use crate::stats::StatsStore;
use crate::worker::{EndpointWorker, WorkerSnapshot, WorkerState};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

/// Days of rate-limit history consulted when seeding cooldown averages
const HISTORY_DAYS: u32 = 7;

/// Probe request sent to errored endpoints, bypassing their queues
const PROBE_REQUEST: &str = r#"{"jsonrpc":"2.0","id":1,"method":"eth_blockNumber","params":[]}"#;

/// Owns one worker per configured endpoint
pub struct WorkerPool {
    workers: Vec<Arc<EndpointWorker>>,
    detector: Arc<RateLimitDetector>,
    client: reqwest::Client,
    probe_interval: Duration,
    probe_timeout: Duration,
}

impl WorkerPool {
    /// Register every configured endpoint with the store, seed the detector
    /// with persisted history and spawn the workers
    pub async fn build(
        cfg: &Config,
        client: reqwest::Client,
        detector: Arc<RateLimitDetector>,
        store: Arc<StatsStore>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let mut workers = Vec::with_capacity(cfg.endpoints.len());
        for url in &cfg.endpoints {
            let id = store.ensure_endpoint(url).await?;

            let avg_cooldown = store.average_cooldown(id, HISTORY_DAYS).await?;
            let outcomes: Vec<bool> = store
                .recent_requests(id, cfg.rate_limit.history_window_size)
                .await?
                .iter()
                .map(|entry| entry.success)
                .collect();
            detector.seed_history(id, avg_cooldown, &outcomes);

            workers.push(Arc::new(EndpointWorker::spawn(
                id,
                url.clone(),
                cfg.worker.clone(),
                client.clone(),
                Arc::clone(&detector),
                Arc::clone(&store),
                Arc::clone(&metrics),
            )));
        }

        info!(endpoints = workers.len(), "worker pool ready");

        Ok(Self {
            workers,
            detector,
            client,
            probe_interval: cfg.worker.health_check_interval(),
            probe_timeout: cfg.worker.request_timeout(),
        })
    }

    pub fn all(&self) -> &[Arc<EndpointWorker>] {
        &self.workers
    }

    /// Workers currently accepting traffic, in roster order
    pub fn available(&self) -> Vec<Arc<EndpointWorker>> {
        self.workers
            .iter()
            .filter(|w| w.is_available())
            .cloned()
            .collect()
    }

    /// Smallest positive recovery time across unavailable workers
    pub fn shortest_recovery(&self) -> Option<Duration> {
        self.workers
            .iter()
            .filter(|w| !w.is_available())
            .map(|w| w.recovery_time_ms())
            .filter(|ms| *ms > 0)
            .min()
            .map(Duration::from_millis)
    }

    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        self.workers.iter().map(|w| w.snapshot()).collect()
    }

    /// Spawn the periodic probe task for errored workers.
    /// Cooling-down workers are skipped: their timers drive recovery.
    pub fn start_health_probes(self: Arc<Self>, metrics: Arc<Metrics>) -> tokio::task::JoinHandle<()> {
        let pool = self;
        tokio::spawn(async move {
            loop {
                sleep(pool.probe_interval).await;
                pool.probe_errored_workers().await;
                metrics.available_workers.set(pool.available().len() as i64);
            }
        })
    }

    /// Probe every worker in the errored state once
    pub async fn probe_errored_workers(&self) {
        let errored: Vec<_> = self
            .workers
            .iter()
            .filter(|w| w.state() == WorkerState::Error)
            .cloned()
            .collect();
        if errored.is_empty() {
            return;
        }

        futures::future::join_all(errored.iter().map(|worker| self.probe(worker))).await;
    }

    async fn probe(&self, worker: &Arc<EndpointWorker>) {
        let outcome = self
            .client
            .post(worker.url())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(PROBE_REQUEST)
            .timeout(self.probe_timeout)
            .send()
            .await;

        match outcome {
            Ok(response) => match response.json::<Value>().await {
                Ok(body) if has_nonempty_result(&body) => {
                    worker.mark_recovered(&self.detector);
                }
                Ok(_) => {
                    debug!(url = %worker.url(), "health probe answered without a result");
                }
                Err(err) => {
                    debug!(url = %worker.url(), %err, "health probe returned unparseable body");
                }
            },
            Err(err) => {
                debug!(url = %worker.url(), %err, "health probe failed");
            }
        }
    }

    /// Wait until every queue is empty, up to `timeout`; true when drained
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.workers.iter().all(|w| w.queue_len() == 0) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    /// Abort every drain task
    pub fn shutdown(&self) {
        for worker in &self.workers {
            worker.shutdown();
        }
    }
}

fn has_nonempty_result(body: &Value) -> bool {
    match body.get("result") {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    async fn build_pool(urls: &[String]) -> (Arc<WorkerPool>, Arc<StatsStore>) {
        let cfg = Config::from_urls(urls);
        let store = Arc::new(StatsStore::open_in_memory().await.unwrap());
        let detector = Arc::new(RateLimitDetector::new(cfg.rate_limit.clone()));
        let metrics = Arc::new(Metrics::new().unwrap());
        let pool = WorkerPool::build(&cfg, reqwest::Client::new(), detector, Arc::clone(&store), metrics)
            .await
            .unwrap();
        (Arc::new(pool), store)
    }

    #[test]
    fn test_probe_result_check() {
        assert!(has_nonempty_result(&serde_json::json!({"result": "0x10"})));
        assert!(has_nonempty_result(&serde_json::json!({"result": 7})));
        assert!(!has_nonempty_result(&serde_json::json!({"result": ""})));
        assert!(!has_nonempty_result(&serde_json::json!({"result": null})));
        assert!(!has_nonempty_result(
            &serde_json::json!({"error": {"code": -32601, "message": "no"}})
        ));
    }

    #[tokio::test]
    async fn test_availability_and_shortest_recovery() {
        let urls = vec![
            "http://127.0.0.1:9".to_string(),
            "http://127.0.0.2:9".to_string(),
        ];
        let (pool, _store) = build_pool(&urls).await;
        assert_eq!(pool.available().len(), 2);
        assert_eq!(pool.shortest_recovery(), None);

        pool.all()[0].force_cooldown(Duration::from_secs(60));
        pool.all()[1].force_cooldown(Duration::from_secs(10));

        assert!(pool.available().is_empty());
        let shortest = pool.shortest_recovery().unwrap();
        assert!(shortest <= Duration::from_secs(10));
        assert!(shortest > Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_probe_restores_errored_worker() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/")
            .with_status(200)
            .with_body(r#"{"jsonrpc":"2.0","result":"0x10","id":1}"#)
            .create_async()
            .await;

        let (pool, _store) = build_pool(&[server.url()]).await;
        pool.all()[0].force_error();
        assert!(pool.available().is_empty());

        pool.probe_errored_workers().await;
        assert_eq!(pool.available().len(), 1);
        assert_eq!(pool.all()[0].state(), WorkerState::Healthy);
    }

    #[tokio::test]
    async fn test_probe_leaves_unresponsive_worker_errored() {
        let (pool, _store) = build_pool(&["http://127.0.0.1:9".to_string()]).await;
        pool.all()[0].force_error();
        pool.probe_errored_workers().await;
        assert_eq!(pool.all()[0].state(), WorkerState::Error);
    }
}
