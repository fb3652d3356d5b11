//! JSON-RPC ingress server
//!
//! Thin HTTP layer over the router: validates the JSON-RPC envelope, hands
//! the raw body to the dispatch core and returns whatever the chosen
//! upstream answered, byte for byte. Read-only health, statistics and
//! metrics endpoints ride on the same listener.

use crate::error::DispatchError;
use crate::metrics::Metrics;
use crate::pool::WorkerPool;
use crate::router::RequestRouter;
use crate::stats::StatsStore;
use crate::worker::RpcCall;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<RequestRouter>,
    pub pool: Arc<WorkerPool>,
    pub store: Arc<StatsStore>,
    pub metrics: Arc<Metrics>,
}

/// Build the ingress application
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", post(handle_rpc))
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

async fn handle_rpc(State(state): State<AppState>, body: Bytes) -> Response {
    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => return invalid_request(Value::Null),
    };

    let id = parsed.get("id").cloned().unwrap_or(Value::Null);
    if parsed.get("jsonrpc").and_then(Value::as_str).is_none() {
        return invalid_request(id);
    }
    let Some(method) = parsed.get("method").and_then(Value::as_str) else {
        return invalid_request(id);
    };

    let call = RpcCall {
        body,
        method: method.to_string(),
    };

    match state.router.route(call).await {
        Ok(upstream_body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            upstream_body,
        )
            .into_response(),
        Err(err) => internal_error(id, &err),
    }
}

/// HTTP 400 with the JSON-RPC invalid-request envelope
fn invalid_request(id: Value) -> Response {
    let envelope = json!({
        "jsonrpc": "2.0",
        "error": {"code": -32600, "message": "Invalid Request"},
        "id": id,
    });
    (StatusCode::BAD_REQUEST, Json(envelope)).into_response()
}

/// HTTP 200 with a JSON-RPC internal-error envelope; clients see a
/// well-formed RPC failure rather than a transport error
fn internal_error(id: Value, err: &DispatchError) -> Response {
    let envelope = json!({
        "jsonrpc": "2.0",
        "error": {"code": -32603, "message": format!("Internal error: {err}")},
        "id": id,
    });
    (StatusCode::OK, Json(envelope)).into_response()
}

async fn handle_health(State(state): State<AppState>) -> Response {
    let available = state.pool.available().len();
    let body = json!({
        "status": if available > 0 { "ok" } else { "unavailable" },
        "available_endpoints": available,
        "total_endpoints": state.pool.all().len(),
    });
    let code = if available > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}

async fn handle_stats(State(state): State<AppState>) -> Response {
    match state.store.endpoint_statistics().await {
        Ok(rows) => Json(json!({
            "endpoints": rows,
            "workers": state.pool.snapshots(),
        }))
        .into_response(),
        Err(err) => {
            error!(%err, "failed to read endpoint statistics");
            (StatusCode::INTERNAL_SERVER_ERROR, "statistics unavailable").into_response()
        }
    }
}

async fn handle_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(err) => {
            error!(%err, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::detector::RateLimitDetector;
    use std::net::SocketAddr;
    use std::time::Duration;

    async fn serve(urls: &[String]) -> (SocketAddr, AppState) {
        let cfg = Config::from_urls(urls);
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
        let app = app(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    #[tokio::test]
    async fn test_rejects_envelope_without_method() {
        let (addr, _state) = serve(&["http://127.0.0.1:9".to_string()]).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/"))
            .header("content-type", "application/json")
            .body(r#"{"jsonrpc":"2.0","id":7}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], -32600);
        assert_eq!(body["id"], 7);
    }

    #[tokio::test]
    async fn test_rejects_envelope_without_jsonrpc_version() {
        let (addr, _state) = serve(&["http://127.0.0.1:9".to_string()]).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/"))
            .body(r#"{"method":"eth_chainId","id":1}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn test_proxies_request_end_to_end() {
        let mut upstream = mockito::Server::new_async().await;
        let body = r#"{"jsonrpc":"2.0","result":"0x1","id":1}"#;
        let _m = upstream
            .mock("POST", "/")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let (addr, _state) = serve(&[upstream.url()]).await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://{addr}/"))
            .header("content-type", "application/json")
            .body(r#"{"jsonrpc":"2.0","method":"eth_chainId","params":[],"id":1}"#)
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 200);
        assert_eq!(resp.bytes().await.unwrap().as_ref(), body.as_bytes());
    }

    #[tokio::test]
    async fn test_health_reflects_worker_availability() {
        let (addr, state) = serve(&["http://127.0.0.1:9".to_string()]).await;
        let client = reqwest::Client::new();

        let resp = client.get(format!("http://{addr}/health")).send().await.unwrap();
        assert_eq!(resp.status(), 200);

        state.pool.all()[0].force_cooldown(Duration::from_secs(60));
        let resp = client.get(format!("http://{addr}/health")).send().await.unwrap();
        assert_eq!(resp.status(), 503);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders() {
        let (addr, _state) = serve(&["http://127.0.0.1:9".to_string()]).await;
        let client = reqwest::Client::new();
        let resp = client.get(format!("http://{addr}/metrics")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert!(resp.text().await.unwrap().contains("proxy_requests_total"));
    }
}
