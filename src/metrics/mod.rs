//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Nonce reservations and the hybrid store's degraded mode
//! - Gas quote sources
//! - Submissions, retries, idempotent replays and outcomes
//! - Chain and health check status

use crate::error::{SubmitError, SubmitResult};
use crate::nonce::StoreKind;
use crate::tx::QuoteSource;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "txguard_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    // Nonce metrics
    pub static ref NONCE_RESERVED: CounterVec = register_counter_vec!(
        "txguard_nonce_reservations_total",
        "Total nonce reservations by issuing store",
        &["store"]
    ).unwrap();

    pub static ref STORE_FALLBACKS: CounterVec = register_counter_vec!(
        "txguard_nonce_store_fallbacks_total",
        "Times the hybrid store switched to in-process mode",
        &[]
    ).unwrap();

    pub static ref STORE_DEGRADED: Gauge = register_gauge!(
        "txguard_nonce_store_degraded",
        "Hybrid nonce store mode (1=degraded in-process, 0=distributed)"
    ).unwrap();

    // Gas metrics
    pub static ref GAS_QUOTES: CounterVec = register_counter_vec!(
        "txguard_gas_quotes_total",
        "Total gas quotes by source",
        &["source"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "txguard_transactions_submitted_total",
        "Total transactions accepted by the node",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_RETRIES: CounterVec = register_counter_vec!(
        "txguard_transaction_retries_total",
        "Total submission retries after transient failures",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_REPLAYED: CounterVec = register_counter_vec!(
        "txguard_transactions_replayed_total",
        "Requests answered from an existing record without resubmitting",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_REPLACED: CounterVec = register_counter_vec!(
        "txguard_transactions_replaced_total",
        "Fee-bumped replacement transactions",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "txguard_transactions_confirmed_total",
        "Total transactions confirmed with success status",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "txguard_transactions_failed_total",
        "Total transactions failed",
        &["chain_id", "reason"]
    ).unwrap();

    pub static ref TX_SEND_LATENCY: HistogramVec = register_histogram_vec!(
        "txguard_send_latency_seconds",
        "Time from first attempt to node acceptance",
        &["chain_id"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "txguard_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "txguard_health_check_failure_total",
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

    pub async fn run(&self) -> SubmitResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SubmitError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| SubmitError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

pub async fn metrics_handler() -> (StatusCode, String) {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    match String::from_utf8(buffer) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_nonce_reserved(store: StoreKind) {
    NONCE_RESERVED.with_label_values(&[store.as_str()]).inc();
}

pub fn record_store_fallback() {
    STORE_FALLBACKS.with_label_values(&[]).inc();
    set_store_degraded(true);
}

pub fn set_store_degraded(degraded: bool) {
    STORE_DEGRADED.set(if degraded { 1.0 } else { 0.0 });
}

pub fn record_gas_quote(source: QuoteSource) {
    GAS_QUOTES.with_label_values(&[source.as_str()]).inc();
}

pub fn record_tx_submitted(chain_id: u64) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_retry(chain_id: u64) {
    TX_RETRIES
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_replayed(chain_id: u64) {
    TX_REPLAYED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_replaced(chain_id: u64) {
    TX_REPLACED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_confirmed(chain_id: u64) {
    TX_CONFIRMED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_failed(chain_id: u64, reason: &str) {
    TX_FAILED
        .with_label_values(&[&chain_id.to_string(), reason])
        .inc();
}

pub fn record_send_latency(chain_id: u64, latency_secs: f64) {
    TX_SEND_LATENCY
        .with_label_values(&[&chain_id.to_string()])
        .observe(latency_secs);
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
