//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Attempt results by class
//! - Raw transaction submissions
//! - Intent outcomes
//! - Endpoint failures
//! - Accumulated gas spend and completed cycles

use crate::error::DriverResult;

use axum::{routing::get, Router};
use ethers::types::U256;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_int_counter, CounterVec, Encoder, Gauge,
    IntCounter, TextEncoder,
};
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

lazy_static! {
    pub static ref ATTEMPT_RESULTS: CounterVec = register_counter_vec!(
        "evm_driver_attempt_results_total",
        "Attempt results by class",
        &["class"]
    ).unwrap();

    pub static ref RAW_SUBMISSIONS: CounterVec = register_counter_vec!(
        "evm_driver_raw_submissions_total",
        "eth_sendRawTransaction calls that reached a node",
        &["kind"]
    ).unwrap();

    pub static ref INTENTS: CounterVec = register_counter_vec!(
        "evm_driver_intents_total",
        "Intents by terminal status",
        &["status"]
    ).unwrap();

    pub static ref ENDPOINT_FAILURES: CounterVec = register_counter_vec!(
        "evm_driver_endpoint_failures_total",
        "Endpoint failures by pool index",
        &["endpoint"]
    ).unwrap();

    pub static ref GAS_SPENT_WEI: Gauge = register_gauge!(
        "evm_driver_gas_spent_wei",
        "Accumulated cost of confirmed transactions in wei"
    ).unwrap();

    pub static ref CYCLES: IntCounter = register_int_counter!(
        "evm_driver_cycles_total",
        "Completed wallet cycles"
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

    pub async fn run(&self) -> DriverResult<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .layer(TraceLayer::new_for_http());

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    render()
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Encode every registered metric in the text exposition format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

// Helper functions to record metrics

pub fn record_attempt_result(class: &str) {
    ATTEMPT_RESULTS.with_label_values(&[class]).inc();
}

pub fn record_submission(kind: &str) {
    RAW_SUBMISSIONS.with_label_values(&[kind]).inc();
}

pub fn record_intent(status: &str) {
    INTENTS.with_label_values(&[status]).inc();
}

pub fn record_endpoint_failure(index: usize) {
    ENDPOINT_FAILURES
        .with_label_values(&[&index.to_string()])
        .inc();
}

pub fn set_gas_spent(total: U256) {
    // Precision is lost past 2^53 wei
    GAS_SPENT_WEI.set(total.to_string().parse::<f64>().unwrap_or(f64::MAX));
}

pub fn record_cycle() {
    CYCLES.inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_metrics_are_rendered() {
        record_attempt_result("underpriced");
        record_endpoint_failure(2);
        set_gas_spent(U256::from(21_000_000_000_000u64));

        let text = render();
        assert!(text.contains("evm_driver_attempt_results_total{class=\"underpriced\"}"));
        assert!(text.contains("evm_driver_endpoint_failures_total{endpoint=\"2\"}"));
        assert!(text.contains("evm_driver_gas_spent_wei"));
    }

    #[tokio::test]
    async fn test_health_handler() {
        assert_eq!(health_handler().await, "ok");
    }
}
