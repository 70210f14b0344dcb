//! Prometheus collectors for the client and the reference service.

use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;
use tokio::sync::watch;
use tracing::warn;
use warp::Filter;
use warp::Rejection;
use warp::Reply;

lazy_static! {
    pub static ref REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("dcoord_requests_total", "Client requests by operation and outcome"),
        &["op", "outcome"]
    )
    .expect("metric can not be created");

    pub static ref SESSION_TRANSITIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("dcoord_session_transitions_total", "Client session state transitions"),
        &["state"]
    )
    .expect("metric can not be created");

    pub static ref WATCH_EVENTS_DELIVERED: IntCounter = IntCounter::new(
        "dcoord_watch_events_delivered_total",
        "Watch events handed to registrations"
    )
    .expect("metric can not be created");

    pub static ref MIRROR_EVENTS_APPLIED: IntCounterVec = IntCounterVec::new(
        Opts::new("dcoord_mirror_events_applied_total", "Events applied by mirror caches"),
        &["scope"]
    )
    .expect("metric can not be created");

    pub static ref SESSIONS_EXPIRED: IntCounter = IntCounter::new(
        "dcoord_sessions_expired_total",
        "Sessions expired by the service"
    )
    .expect("metric can not be created");

    pub static ref OPEN_CONNECTIONS: IntGauge = IntGauge::new(
        "dcoord_open_connections",
        "Connections accepted by the service and still open"
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

static REGISTER: Once = Once::new();

/// Registers every collector with [`REGISTRY`] on first use
fn register_custom_metrics() {
    REGISTER.call_once(register_collectors);
}

fn register_collectors() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(REQUESTS_TOTAL.clone()),
        Box::new(SESSION_TRANSITIONS.clone()),
        Box::new(WATCH_EVENTS_DELIVERED.clone()),
        Box::new(MIRROR_EVENTS_APPLIED.clone()),
        Box::new(SESSIONS_EXPIRED.clone()),
        Box::new(OPEN_CONNECTIONS.clone()),
    ];
    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            warn!("metric registration skipped: {}", e);
        }
    }
}

/// Text exposition of every registered collector
pub fn gather() -> String {
    use prometheus::Encoder;
    register_custom_metrics();
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("could not encode custom metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Serves `/metrics` until `shutdown_signal` fires
pub async fn start_server(
    port: u16,
    mut shutdown_signal: watch::Receiver<()>,
) {
    register_custom_metrics();

    let metrics_route = warp::path!("metrics").and_then(metrics_handler);

    let (_, server) =
        warp::serve(metrics_route).bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
            let _ = shutdown_signal.changed().await;
        });
    server.await;
}

async fn metrics_handler() -> Result<impl Reply, Rejection> {
    Ok(gather())
}
