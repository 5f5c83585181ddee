//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and heads
//! - Transaction lifecycle (created, confirmed, errored, fatal)
//! - Gas escalation and rebroadcasts
//! - Re-orgs and nonce drift

use crate::error::{TxmError, TxmResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info};

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "txm_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_HEAD: GaugeVec = register_gauge_vec!(
        "txm_chain_head",
        "Last chain head processed by the confirmer",
        &["chain_id"]
    ).unwrap();

    pub static ref HEAD_PROCESSING: HistogramVec = register_histogram_vec!(
        "txm_head_processing_seconds",
        "Time to reconcile all accounts for one head",
        &["chain_id"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_CREATED: CounterVec = register_counter_vec!(
        "txm_transactions_created_total",
        "Total transactions queued",
        &["chain_id"]
    ).unwrap();

    pub static ref ATTEMPTS_SUBMITTED: CounterVec = register_counter_vec!(
        "txm_attempts_submitted_total",
        "Attempt submissions by outcome",
        &["chain_id", "outcome"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "txm_transactions_confirmed_total",
        "Total transactions confirmed",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_ERRORED: CounterVec = register_counter_vec!(
        "txm_transactions_errored_total",
        "Transactions whose nonce was consumed outside this node",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FATAL: CounterVec = register_counter_vec!(
        "txm_transactions_fatal_total",
        "Transactions that failed permanently",
        &["chain_id"]
    ).unwrap();

    pub static ref TIME_UNTIL_CONFIRMED: HistogramVec = register_histogram_vec!(
        "txm_time_until_confirmed_seconds",
        "Time from first broadcast to confirmation",
        &["chain_id"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]
    ).unwrap();

    pub static ref BLOCKS_UNTIL_CONFIRMED: HistogramVec = register_histogram_vec!(
        "txm_blocks_until_confirmed",
        "Blocks from first broadcast to confirmation",
        &["chain_id"],
        vec![1.0, 2.0, 3.0, 5.0, 10.0, 20.0, 50.0, 100.0, 250.0]
    ).unwrap();

    // Gas metrics
    pub static ref GAS_BUMPS: CounterVec = register_counter_vec!(
        "txm_gas_bumps_total",
        "Total gas bumps",
        &["chain_id"]
    ).unwrap();

    pub static ref GAS_BUMP_EXCEEDS_LIMIT: CounterVec = register_counter_vec!(
        "txm_gas_bump_exceeds_limit_total",
        "Bumps refused because the fee was already at the ceiling",
        &["chain_id"]
    ).unwrap();

    pub static ref REBROADCASTS: CounterVec = register_counter_vec!(
        "txm_rebroadcast_attempts_total",
        "Attempts created by operator rebroadcast",
        &["chain_id"]
    ).unwrap();

    pub static ref RESENDS: CounterVec = register_counter_vec!(
        "txm_resends_total",
        "Unconfirmed attempts sent again without a fee change",
        &["chain_id"]
    ).unwrap();

    pub static ref REAPED: CounterVec = register_counter_vec!(
        "txm_reaped_transactions_total",
        "Finished transactions deleted from the ledger",
        &["chain_id"]
    ).unwrap();

    // Chain consistency
    pub static ref REORGS: CounterVec = register_counter_vec!(
        "txm_reorgs_total",
        "Receipts that vanished or moved after being seen",
        &["chain_id"]
    ).unwrap();

    pub static ref NONCE_DRIFT: CounterVec = register_counter_vec!(
        "txm_nonce_drift_total",
        "Times the chain nonce was ahead of the local cursor",
        &["chain_id"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "txm_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "txm_health_check_failure_total",
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
            .map_err(|e| TxmError::Internal(format!("failed to bind metrics port: {}", e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| TxmError::Internal(format!("metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Text exposition of the default registry
pub fn render() -> TxmResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TxmError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TxmError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_head_processed(chain_id: u64, head: u64, elapsed: Duration) {
    let chain = chain_id.to_string();
    CHAIN_HEAD.with_label_values(&[&chain]).set(head as f64);
    HEAD_PROCESSING
        .with_label_values(&[&chain])
        .observe(elapsed.as_secs_f64());
}

pub fn record_tx_created(chain_id: u64) {
    TX_CREATED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_attempt_submitted(chain_id: u64, outcome: &str) {
    ATTEMPTS_SUBMITTED
        .with_label_values(&[&chain_id.to_string(), outcome])
        .inc();
}

pub fn record_tx_confirmed(chain_id: u64, elapsed: Duration, blocks: u64) {
    let chain = chain_id.to_string();
    TX_CONFIRMED.with_label_values(&[&chain]).inc();
    TIME_UNTIL_CONFIRMED
        .with_label_values(&[&chain])
        .observe(elapsed.as_secs_f64());
    BLOCKS_UNTIL_CONFIRMED
        .with_label_values(&[&chain])
        .observe(blocks as f64);
}

pub fn record_tx_errored(chain_id: u64) {
    TX_ERRORED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_fatal(chain_id: u64) {
    TX_FATAL
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_gas_bump(chain_id: u64) {
    GAS_BUMPS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_bump_exceeds_limit(chain_id: u64) {
    GAS_BUMP_EXCEEDS_LIMIT
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_rebroadcast(chain_id: u64) {
    REBROADCASTS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_resend(chain_id: u64) {
    RESENDS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_reaped(chain_id: u64, count: u64) {
    REAPED
        .with_label_values(&[&chain_id.to_string()])
        .inc_by(count as f64);
}

pub fn record_reorg(chain_id: u64) {
    REORGS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_nonce_drift(chain_id: u64) {
    NONCE_DRIFT
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
