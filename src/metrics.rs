use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge, Encoder, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref CAMLINK_SESSIONS_STARTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "camlink_sessions_started_total",
        "Total number of signaling sessions started",
        &["role"] // "publisher" or "subscriber"
    )
    .unwrap();
    pub static ref CAMLINK_SIGNALS_SENT_TOTAL: IntCounterVec = register_int_counter_vec!(
        "camlink_signals_sent_total",
        "Total number of signaling messages sent to the bus",
        &["action"]
    )
    .unwrap();
    pub static ref CAMLINK_MESSAGES_DISCARDED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "camlink_messages_discarded_total",
        "Total number of inbound bus messages dropped",
        &["reason"] // "malformed", "no_session", "unknown_action"
    )
    .unwrap();
    pub static ref CAMLINK_ICE_QUEUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "camlink_ice_queued_total",
        "Total number of ICE candidates buffered before they could be applied",
        &["tier"] // "adapter" or "session"
    )
    .unwrap();
    pub static ref CAMLINK_ICE_FLUSHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "camlink_ice_flushed_total",
        "Total number of buffered ICE candidates handed on after their trigger",
        &["tier"]
    )
    .unwrap();
    pub static ref CAMLINK_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "camlink_failures_total",
        "Total number of capture and negotiation failures",
        &["kind"] // "capture" or "negotiation"
    )
    .unwrap();
    pub static ref CAMLINK_LIVE_PEER_CONNECTIONS: IntGauge = register_int_gauge!(
        "camlink_live_peer_connections",
        "Number of native peer connections currently open"
    )
    .unwrap();
}

pub fn register_metrics() {
    // Force initialization of lazy_statics
    let _ = CAMLINK_SESSIONS_STARTED_TOTAL
        .with_label_values(&["publisher"])
        .get();
    let _ = CAMLINK_SIGNALS_SENT_TOTAL
        .with_label_values(&["offer-request"])
        .get();
    let _ = CAMLINK_MESSAGES_DISCARDED_TOTAL
        .with_label_values(&["malformed"])
        .get();
    let _ = CAMLINK_ICE_QUEUED_TOTAL.with_label_values(&["adapter"]).get();
    let _ = CAMLINK_ICE_FLUSHED_TOTAL.with_label_values(&["adapter"]).get();
    let _ = CAMLINK_FAILURES_TOTAL.with_label_values(&["capture"]).get();
    let _ = CAMLINK_LIVE_PEER_CONNECTIONS.get();
}

/// Renders the default registry in the Prometheus text format.
pub fn gather_text() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Serves `/metrics` until the task is dropped.
pub async fn serve(port: u16) {
    use warp::Filter;

    let route = warp::path("metrics").map(|| {
        warp::reply::with_header(
            gather_text(),
            "content-type",
            "text/plain; version=0.0.4",
        )
    });
    tracing::info!(port, "Metrics endpoint listening");
    warp::serve(route).run(([0, 0, 0, 0], port)).await;
}
