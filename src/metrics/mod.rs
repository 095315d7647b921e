//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Request intake and queue depth per sender
//! - Broadcasts, retries and batch sizes
//! - Terminal outcomes and confirmation latency

use crate::cell::Address;
use crate::error::{TxmError, TxmResult};
use crate::txm::RequestState;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Intake
    pub static ref REQUESTS_ENQUEUED: CounterVec = register_counter_vec!(
        "ton_txm_requests_enqueued_total",
        "Total requests accepted",
        &["sender"]
    ).unwrap();

    pub static ref REQUESTS_QUEUED: GaugeVec = register_gauge_vec!(
        "ton_txm_requests_queued",
        "Accepted requests not yet broadcast",
        &["sender"]
    ).unwrap();

    pub static ref REQUESTS_UNCONFIRMED: GaugeVec = register_gauge_vec!(
        "ton_txm_requests_unconfirmed",
        "Broadcast requests not yet terminal",
        &["sender"]
    ).unwrap();

    // Broadcast
    pub static ref BATCHES_BROADCAST: CounterVec = register_counter_vec!(
        "ton_txm_batches_broadcast_total",
        "Total external messages broadcast",
        &["sender"]
    ).unwrap();

    pub static ref BROADCAST_RETRIES: CounterVec = register_counter_vec!(
        "ton_txm_broadcast_retries_total",
        "Total broadcast attempts retried after a transient error",
        &["sender"]
    ).unwrap();

    pub static ref BATCH_SIZE: HistogramVec = register_histogram_vec!(
        "ton_txm_batch_size",
        "Messages per external message",
        &["sender"],
        vec![1.0, 2.0, 4.0, 8.0, 16.0, 64.0, 254.0]
    ).unwrap();

    // Outcomes
    pub static ref OUTCOMES: CounterVec = register_counter_vec!(
        "ton_txm_outcomes_total",
        "Terminal request outcomes by state",
        &["sender", "state"]
    ).unwrap();

    pub static ref CONFIRM_LATENCY: HistogramVec = register_histogram_vec!(
        "ton_txm_confirmation_latency_seconds",
        "Time from broadcast to a terminal batch state",
        &["sender"],
        vec![1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "ton_txm_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "ton_txm_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> TxmResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| {
                TxmError::Config(format!("cannot bind metrics port {}: {}", self.port, e))
            })?;
        axum::serve(listener, app)
            .await
            .map_err(|e| TxmError::Internal(format!("metrics server stopped: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_enqueued(sender: &Address) {
    REQUESTS_ENQUEUED
        .with_label_values(&[&sender.to_raw()])
        .inc();
}

pub fn record_queue_depth(sender: &Address, queued: usize, unconfirmed: usize) {
    let label = sender.to_raw();
    REQUESTS_QUEUED
        .with_label_values(&[&label])
        .set(queued as f64);
    REQUESTS_UNCONFIRMED
        .with_label_values(&[&label])
        .set(unconfirmed as f64);
}

pub fn record_broadcast(sender: &Address, messages: usize) {
    let label = sender.to_raw();
    BATCHES_BROADCAST.with_label_values(&[&label]).inc();
    BATCH_SIZE
        .with_label_values(&[&label])
        .observe(messages as f64);
}

pub fn record_broadcast_retry(sender: &Address) {
    BROADCAST_RETRIES
        .with_label_values(&[&sender.to_raw()])
        .inc();
}

pub fn record_outcome(sender: &Address, state: RequestState) {
    OUTCOMES
        .with_label_values(&[&sender.to_raw(), state.as_str()])
        .inc();
}

pub fn record_confirm_latency(sender: &Address, latency_secs: f64) {
    CONFIRM_LATENCY
        .with_label_values(&[&sender.to_raw()])
        .observe(latency_secs);
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
