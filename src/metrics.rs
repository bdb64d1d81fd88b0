//! Prometheus metrics, gated behind `RELAY_METRICS_BIND`. Ambient
//! observability, not a functional requirement of the relay itself.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

pub fn init(bind: Option<&str>) -> anyhow::Result<()> {
    let Some(bind) = bind else {
        info!("metrics exporter disabled (set RELAY_METRICS_BIND to enable)");
        return Ok(());
    };
    let addr: SocketAddr = bind.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!(%addr, "metrics exporter listening");

    metrics::describe_counter!("push_relay_notifications_sent_total", "Notifications delivered to the push gateway");
    metrics::describe_counter!("push_relay_notifications_dropped_total", "Notifications discarded without delivery");
    metrics::describe_counter!("push_relay_feedback_enqueued_total", "Invalid-token feedback records enqueued");
    metrics::describe_counter!("push_relay_gateway_errors_total", "Error responses received from the push gateway");

    Ok(())
}

pub fn record_notification_sent() {
    metrics::counter!("push_relay_notifications_sent_total", 1);
}

pub fn record_notification_dropped(reason: &'static str) {
    metrics::counter!("push_relay_notifications_dropped_total", 1, "reason" => reason);
}

pub fn record_feedback_enqueued() {
    metrics::counter!("push_relay_feedback_enqueued_total", 1);
}

pub fn record_gateway_error(status: u8) {
    metrics::counter!("push_relay_gateway_errors_total", 1, "status" => status.to_string());
}
