use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dashboard_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref VALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dashboard_valid_messages_total",
        "Total messages decoded into readings"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dashboard_invalid_messages_total",
        "Total malformed messages discarded"
    ))
    .unwrap();
    pub static ref READINGS_BROADCAST_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dashboard_readings_broadcast_total",
        "Total readings published to the live relay"
    ))
    .unwrap();
    pub static ref LIVE_VIEWERS: Gauge = Gauge::with_opts(Opts::new(
        "dashboard_live_viewers",
        "Currently connected push stream viewers"
    ))
    .unwrap();
    pub static ref VIEWER_LAGGED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dashboard_viewer_lagged_total",
        "Readings dropped for viewers that fell behind"
    ))
    .unwrap();
    pub static ref HEARTBEATS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dashboard_heartbeats_total",
        "Heartbeat events sent on idle streams"
    ))
    .unwrap();
    pub static ref STORE_QUERIES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dashboard_store_queries_total",
        "Total range queries issued to the store"
    ))
    .unwrap();
    pub static ref STORE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dashboard_store_failures_total",
        "Total failed store queries"
    ))
    .unwrap();
    pub static ref STORE_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "dashboard_store_latency_seconds",
            "Time taken by one store range query"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(VALID_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INVALID_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(READINGS_BROADCAST_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LIVE_VIEWERS.clone()))?;
    REGISTRY.register(Box::new(VIEWER_LAGGED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(HEARTBEATS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORE_QUERIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORE_LATENCY_SECONDS.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_registered_metrics() {
        // registration is process-wide; other tests may have done it already
        let _ = init_metrics();
        MESSAGES_TOTAL.inc();

        let text = gather_metrics();
        assert!(text.contains("dashboard_messages_total"));
        assert!(text.contains("dashboard_live_viewers"));
    }
}
