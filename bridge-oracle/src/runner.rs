// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Timer-driven loop shared by every monitor, signer and relayer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::OracleMetrics;

#[async_trait]
pub trait Runnable: Send + Sync {
    fn name(&self) -> &str;

    /// Runs one cycle. Returns `false` if any record or step failed; failures
    /// are isolated and retried on the next cycle.
    async fn run(&self) -> bool;
}

pub fn spawn_runnable(
    runnable: Arc<dyn Runnable>,
    interval: Duration,
    metrics: Arc<OracleMetrics>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_service(runnable, interval, metrics, cancel))
}

pub async fn run_service(
    runnable: Arc<dyn Runnable>,
    interval: Duration,
    metrics: Arc<OracleMetrics>,
    cancel: CancellationToken,
) {
    let name = runnable.name().to_string();
    info!("[{}] Starting with interval {:?}", name, interval);

    let mut interval = time::interval(interval);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("[{}] Cancelled", name);
                break;
            }
            _ = interval.tick() => {
                let ok = runnable.run().await;
                metrics.runnable_cycles.with_label_values(&[&name]).inc();
                if ok {
                    debug!("[{}] Cycle complete", name);
                } else {
                    metrics.runnable_failed_cycles.with_label_values(&[&name]).inc();
                    warn!("[{}] Cycle completed with failures", name);
                }
            }
        }
    }
}
