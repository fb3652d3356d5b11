//! Shared fixtures: scripted upstream servers and a fully wired proxy
#![allow(dead_code)]

use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use eth_rpc_proxy::config::Config;
use eth_rpc_proxy::detector::RateLimitDetector;
use eth_rpc_proxy::metrics::Metrics;
use eth_rpc_proxy::pool::WorkerPool;
use eth_rpc_proxy::router::RequestRouter;
use eth_rpc_proxy::server::{app, AppState};
use eth_rpc_proxy::stats::StatsStore;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One scripted upstream response
#[derive(Clone)]
pub struct Script {
    pub status: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
    pub delay: Duration,
}

impl Script {
    pub fn ok(body: &str) -> Self {
        Self {
            status: 200,
            body: body.to_string(),
            headers: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone)]
struct UpstreamState {
    hits: Arc<AtomicUsize>,
    queue: Arc<Mutex<VecDeque<Script>>>,
    fallback: Script,
}

/// A scripted upstream: queued responses are served in order, then the
/// fallback repeats forever
pub struct Upstream {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    queue: Arc<Mutex<VecDeque<Script>>>,
}

impl Upstream {
    pub async fn start(fallback: Script) -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let state = UpstreamState {
            hits: Arc::clone(&hits),
            queue: Arc::clone(&queue),
            fallback,
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new().route("/", post(respond)).with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { addr, hits, queue }
    }

    /// Queue a one-shot response ahead of the fallback
    pub fn push(&self, script: Script) {
        self.queue.lock().push_back(script);
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn respond(State(state): State<UpstreamState>, _body: axum::body::Bytes) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let script = state
        .queue
        .lock()
        .pop_front()
        .unwrap_or_else(|| state.fallback.clone());

    if script.delay > Duration::ZERO {
        tokio::time::sleep(script.delay).await;
    }

    let mut builder = Response::builder()
        .status(script.status)
        .header("content-type", "application/json");
    for (name, value) in &script.headers {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(script.body)).unwrap()
}

/// The proxy under test, with handles for assertions
pub struct TestProxy {
    pub base_url: String,
    pub state: AppState,
}

impl TestProxy {
    pub fn store(&self) -> &StatsStore {
        &self.state.store
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.state.pool
    }
}

/// Wire a complete proxy (in-memory statistics) and serve it on an
/// ephemeral port
pub async fn spawn_proxy(cfg: Config) -> TestProxy {
    let store = Arc::new(StatsStore::open_in_memory().await.unwrap());
    let detector = Arc::new(RateLimitDetector::new(cfg.rate_limit.clone()));
    let metrics = Arc::new(Metrics::new().unwrap());
    let pool = Arc::new(
        WorkerPool::build(
            &cfg,
            reqwest::Client::new(),
            detector,
            Arc::clone(&store),
            Arc::clone(&metrics),
        )
        .await
        .unwrap(),
    );
    let state = AppState {
        router: Arc::new(RequestRouter::new(Arc::clone(&pool), Arc::clone(&metrics))),
        pool,
        store,
        metrics,
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestProxy {
        base_url: format!("http://{}", addr),
        state,
    }
}
