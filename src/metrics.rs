//! Metrics collection and export module

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Global metrics registry
pub struct Metrics {
    registry: Registry,

    // Counters
    pub requests_total: IntCounter,
    pub requests_failed: IntCounter,
    pub rate_limit_events: IntCounter,
    pub failovers_total: IntCounter,
    pub queue_rejections: IntCounter,

    // Gauges
    pub available_workers: IntGauge,

    // Histograms
    pub upstream_latency: Histogram,
}

impl Metrics {
    /// Create new metrics instance
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounter::with_opts(Opts::new(
            "proxy_requests_total",
            "Total upstream requests dispatched",
        ))?;

        let requests_failed = IntCounter::with_opts(Opts::new(
            "proxy_requests_failed",
            "Upstream requests that ended in a transient or transport failure",
        ))?;

        let rate_limit_events = IntCounter::with_opts(Opts::new(
            "proxy_rate_limit_events",
            "Rate-limit detections across all endpoints",
        ))?;

        let failovers_total = IntCounter::with_opts(Opts::new(
            "proxy_failovers_total",
            "Requests re-routed to another endpoint after a failure",
        ))?;

        let queue_rejections = IntCounter::with_opts(Opts::new(
            "proxy_queue_rejections",
            "Enqueue attempts rejected because a worker queue was full",
        ))?;

        let available_workers = IntGauge::with_opts(Opts::new(
            "proxy_available_workers",
            "Workers currently accepting traffic",
        ))?;

        let upstream_latency = Histogram::with_opts(HistogramOpts::new(
            "proxy_upstream_latency_seconds",
            "Upstream HTTP round-trip latency",
        ))?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(requests_failed.clone()))?;
        registry.register(Box::new(rate_limit_events.clone()))?;
        registry.register(Box::new(failovers_total.clone()))?;
        registry.register(Box::new(queue_rejections.clone()))?;
        registry.register(Box::new(available_workers.clone()))?;
        registry.register(Box::new(upstream_latency.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            requests_failed,
            rate_limit_events,
            failovers_total,
            queue_rejections,
            available_workers,
            upstream_latency,
        })
    }

    /// Render the registry in the Prometheus text exposition format
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render() {
        let metrics = Metrics::new().unwrap();
        metrics.requests_total.inc();
        metrics.rate_limit_events.inc();
        metrics.available_workers.set(3);

        let text = metrics.render().unwrap();
        assert!(text.contains("proxy_requests_total 1"));
        assert!(text.contains("proxy_rate_limit_events 1"));
        assert!(text.contains("proxy_available_workers 3"));
    }
}
