use std::net::SocketAddr;

use crate::model::Event;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total accepted mutations. Labels: entity.
pub const MUTATIONS_TOTAL: &str = "aeropad_mutations_total";

/// Histogram: subscriptions whose notification index a single write bumped.
pub const FANOUT_SUBSCRIPTIONS: &str = "aeropad_fanout_subscriptions";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "aeropad_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "aeropad_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map an event to a short entity label for metrics.
pub fn entity_label(event: &Event) -> &'static str {
    match event {
        Event::VertiportUpserted { .. } | Event::VertiportDeleted { .. } => "vertiport",
        Event::OperationalIntentUpserted { .. } | Event::OperationalIntentDeleted { .. } => {
            "operational_intent"
        }
        Event::ConstraintUpserted { .. } | Event::ConstraintDeleted { .. } => "constraint",
        Event::SubscriptionUpserted { .. } | Event::SubscriptionDeleted { .. } => "subscription",
    }
}
