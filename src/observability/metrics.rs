// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! Prometheus-backed metrics registry, generalizing the ambient metrics
//! concern to the counters/gauges/histograms both binaries expose on
//! `GET /metrics`.

use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,
    pub dispatch_errors_total: IntCounterVec,
    pub pool_size: IntGaugeVec,
    pub catalog_version: IntGaugeVec,
    pub reshard_jobs_active: IntGaugeVec,
    pub failover_events_total: IntCounterVec,
    pub replication_lag_seconds: HistogramVec,
}

impl Metrics {
    pub fn new(namespace: &str) -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            prometheus::Opts::new("requests_total", "Total dispatched requests").namespace(namespace),
            &["consistency", "outcome"],
        )
        .expect("metric registration");

        let request_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new("request_duration_seconds", "Dispatch latency").namespace(namespace),
            &["consistency"],
        )
        .expect("metric registration");

        let dispatch_errors_total = IntCounterVec::new(
            prometheus::Opts::new("dispatch_errors_total", "Dispatch errors by kind").namespace(namespace),
            &["code"],
        )
        .expect("metric registration");

        let pool_size = IntGaugeVec::new(
            prometheus::Opts::new("pool_size", "Connection pool size per endpoint").namespace(namespace),
            &["endpoint"],
        )
        .expect("metric registration");

        let catalog_version = IntGaugeVec::new(
            prometheus::Opts::new("catalog_version", "Currently installed catalog version").namespace(namespace),
            &["node"],
        )
        .expect("metric registration");

        let reshard_jobs_active = IntGaugeVec::new(
            prometheus::Opts::new("reshard_jobs_active", "Active reshard jobs by phase").namespace(namespace),
            &["phase"],
        )
        .expect("metric registration");

        let failover_events_total = IntCounterVec::new(
            prometheus::Opts::new("failover_events_total", "Failover events by outcome").namespace(namespace),
            &["status"],
        )
        .expect("metric registration");

        let replication_lag_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new("replication_lag_seconds", "Observed replica lag").namespace(namespace),
            &["shard"],
        )
        .expect("metric registration");

        for collector in [
            Box::new(requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(request_duration_seconds.clone()),
            Box::new(dispatch_errors_total.clone()),
            Box::new(pool_size.clone()),
            Box::new(catalog_version.clone()),
            Box::new(reshard_jobs_active.clone()),
            Box::new(failover_events_total.clone()),
            Box::new(replication_lag_seconds.clone()),
        ] {
            registry.register(collector).expect("metric registration");
        }

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            dispatch_errors_total,
            pool_size,
            catalog_version,
            reshard_jobs_active,
            failover_events_total,
            replication_lag_seconds,
        }
    }

    /// Render the Prometheus text exposition format for `GET /metrics`.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder.encode(&families, &mut buffer).expect("metric encode");
        String::from_utf8(buffer).expect("prometheus text encoding is valid utf8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_metric_names() {
        let metrics = Metrics::new("shardmesh");
        metrics.requests_total.with_label_values(&["strong", "ok"]).inc();
        let text = metrics.render();
        assert!(text.contains("shardmesh_requests_total"));
    }
}
