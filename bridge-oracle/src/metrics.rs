// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use prometheus::{
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry, Encoder,
    IntCounterVec, IntGaugeVec, Registry, TextEncoder,
};
use tokio::task::JoinHandle;
use tracing::{error, info};

pub const METRICS_ROUTE: &str = "/metrics";

#[derive(Clone, Debug)]
pub struct OracleMetrics {
    pub(crate) runnable_cycles: IntCounterVec,
    pub(crate) runnable_failed_cycles: IntCounterVec,
    pub(crate) records_processed: IntCounterVec,
    pub(crate) record_errors: IntCounterVec,
    pub(crate) signatures_added: IntCounterVec,
    pub(crate) record_resets: IntCounterVec,
    pub(crate) transactions_broadcast: IntCounterVec,
    pub(crate) current_block_height: IntGaugeVec,
}

impl OracleMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            runnable_cycles: register_int_counter_vec_with_registry!(
                "oracle_runnable_cycles",
                "Total number of completed cycles, by runnable",
                &["runnable"],
                registry,
            )
            .unwrap(),
            runnable_failed_cycles: register_int_counter_vec_with_registry!(
                "oracle_runnable_failed_cycles",
                "Total number of cycles with at least one failure, by runnable",
                &["runnable"],
                registry,
            )
            .unwrap(),
            records_processed: register_int_counter_vec_with_registry!(
                "oracle_records_processed",
                "Total number of records handled, by runnable and outcome",
                &["runnable", "outcome"],
                registry,
            )
            .unwrap(),
            record_errors: register_int_counter_vec_with_registry!(
                "oracle_record_errors",
                "Total number of per-record errors, by runnable and error type",
                &["runnable", "error_type"],
                registry,
            )
            .unwrap(),
            signatures_added: register_int_counter_vec_with_registry!(
                "oracle_signatures_added",
                "Total number of signatures contributed by this oracle, by chain",
                &["chain"],
                registry,
            )
            .unwrap(),
            record_resets: register_int_counter_vec_with_registry!(
                "oracle_record_resets",
                "Total number of records reset to pending, by chain and reason",
                &["chain", "reason"],
                registry,
            )
            .unwrap(),
            transactions_broadcast: register_int_counter_vec_with_registry!(
                "oracle_transactions_broadcast",
                "Total number of transactions broadcast, by chain",
                &["chain"],
                registry,
            )
            .unwrap(),
            current_block_height: register_int_gauge_vec_with_registry!(
                "oracle_current_block_height",
                "Latest block height observed, by chain",
                &["chain"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }

    pub(crate) fn record_error(&self, runnable: &str, error: &crate::error::OracleError) {
        self.record_errors
            .with_label_values(&[runnable, error.error_type()])
            .inc();
    }
}

async fn metrics_handler(State(registry): State<Registry>) -> (StatusCode, String) {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    match encoder.encode(&registry.gather(), &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            String::from_utf8_lossy(&buffer).into_owned(),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to encode metrics: {e}"),
        ),
    }
}

pub fn metrics_router(registry: Registry) -> Router {
    Router::new()
        .route(METRICS_ROUTE, get(metrics_handler))
        .with_state(registry)
}

/// Serves the registry on `/metrics` until the process exits.
pub async fn start_metrics_server(
    address: SocketAddr,
    registry: Registry,
) -> anyhow::Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!("Metrics server listening on {}", address);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, metrics_router(registry)).await {
            error!("Metrics server error: {:?}", e);
        }
    }))
}
