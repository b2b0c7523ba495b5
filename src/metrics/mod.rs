//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain health
//! - Order creation and phase transitions
//! - Redemptions, refunds and adapter errors
//! - Monitor load and tick latency

use crate::error::{SwapError, SwapResult};
use crate::order::Phase;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    pub static ref CHAIN_HEALTHY: GaugeVec = register_gauge_vec!(
        "swap_chain_healthy",
        "Chain reachability (1=healthy, 0=unreachable)",
        &["chain"]
    ).unwrap();

    pub static ref ORDERS_CREATED: CounterVec = register_counter_vec!(
        "swap_orders_created_total",
        "Total orders created by route",
        &["from_chain", "to_chain"]
    ).unwrap();

    pub static ref PHASE_TRANSITIONS: CounterVec = register_counter_vec!(
        "swap_phase_transitions_total",
        "Total order phase transitions by target phase",
        &["phase"]
    ).unwrap();

    pub static ref REDEMPTIONS: CounterVec = register_counter_vec!(
        "swap_redemptions_total",
        "Total HTLC redemptions sent",
        &["chain"]
    ).unwrap();

    pub static ref REFUNDS: CounterVec = register_counter_vec!(
        "swap_refunds_total",
        "Total HTLC refunds sent",
        &["chain"]
    ).unwrap();

    pub static ref ADAPTER_ERRORS: CounterVec = register_counter_vec!(
        "swap_adapter_errors_total",
        "Adapter errors by chain and class",
        &["chain", "class"]
    ).unwrap();

    pub static ref ACTIVE_MONITORS: Gauge = register_gauge!(
        "swap_active_monitors",
        "Order monitors currently running"
    ).unwrap();

    pub static ref TICK_LATENCY: HistogramVec = register_histogram_vec!(
        "swap_monitor_tick_seconds",
        "Order monitor tick latency",
        &["outcome"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
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

    pub async fn run(&self) -> SwapResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SwapError::Config(format!("Cannot bind metrics on {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| SwapError::Internal(format!("Metrics server failed: {}", e)))?;

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

pub fn record_chain_health(chain: &str, healthy: bool) {
    CHAIN_HEALTHY
        .with_label_values(&[chain])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_order_created(from_chain: &str, to_chain: &str) {
    ORDERS_CREATED
        .with_label_values(&[from_chain, to_chain])
        .inc();
}

pub fn record_phase(phase: Phase) {
    PHASE_TRANSITIONS
        .with_label_values(&[phase.as_str()])
        .inc();
}

pub fn record_redemption(chain: &str) {
    REDEMPTIONS.with_label_values(&[chain]).inc();
}

pub fn record_refund(chain: &str) {
    REFUNDS.with_label_values(&[chain]).inc();
}

pub fn record_adapter_error(chain: &str, error: &SwapError) {
    ADAPTER_ERRORS
        .with_label_values(&[chain, error.class().as_str()])
        .inc();
}

pub fn monitor_started() {
    ACTIVE_MONITORS.inc();
}

pub fn monitor_stopped() {
    ACTIVE_MONITORS.dec();
}

pub fn record_tick(outcome: &str, latency_secs: f64) {
    TICK_LATENCY
        .with_label_values(&[outcome])
        .observe(latency_secs);
}
