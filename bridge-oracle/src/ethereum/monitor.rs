// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Watches the Mailbox for dispatches to the Cosmos domain.

use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::{TransactionReceipt, H256};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::client::{DispatchEvent, EvmClient};
use crate::config::{EthereumNetworkConfig, OracleConfig};
use crate::error::{OracleError, OracleResult};
use crate::metrics::OracleMetrics;
use crate::records::Outcome;
use crate::runner::Runnable;
use crate::store::{LockGuard, SharedStore};
use crate::types::{
    transaction_resource, Chain, NewMessage, NewTransaction, RecordId, Transaction,
    TransactionStatus, TransactionUpdate,
};

/// Upper bound on the block span of one `eth_getLogs` query.
const MAX_LOG_QUERY_RANGE: u64 = 1_000;

pub struct EthereumMonitor {
    name: String,
    progress_key: String,
    store: SharedStore,
    client: Arc<dyn EvmClient>,
    network: EthereumNetworkConfig,
    chain: Chain,
    cosmos_chain: Chain,
    start_block_height: Mutex<Option<u64>>,
    metrics: Arc<OracleMetrics>,
}

impl EthereumMonitor {
    pub fn new(
        config: &OracleConfig,
        network: &EthereumNetworkConfig,
        store: SharedStore,
        client: Arc<dyn EvmClient>,
        metrics: Arc<OracleMetrics>,
    ) -> OracleResult<Self> {
        Ok(Self {
            name: format!("EthereumMonitor {}", network.chain_id),
            progress_key: format!("ethereum_monitor:{}", network.chain_id),
            store,
            client,
            network: network.clone(),
            chain: network.chain()?,
            cosmos_chain: config.cosmos_chain.clone(),
            start_block_height: Mutex::new(None),
            metrics,
        })
    }

    fn mailbox(&self) -> String {
        format!("{:#x}", self.network.mailbox_address)
    }

    async fn start_height(&self, current: u64) -> OracleResult<u64> {
        let mut start = self.start_block_height.lock().await;
        if let Some(height) = *start {
            return Ok(height);
        }
        let height = match self.store.read_progress(&self.progress_key).await? {
            Some(h) if h <= current => h,
            _ => self
                .network
                .start_block_height
                .filter(|h| *h <= current)
                .unwrap_or(current),
        };
        info!("[{}] Starting from block {}", self.name, height);
        *start = Some(height);
        Ok(height)
    }

    fn track(&self, what: &str, result: OracleResult<Outcome>) -> bool {
        match result {
            Ok(outcome) => {
                self.metrics
                    .records_processed
                    .with_label_values(&[&self.name, outcome])
                    .inc();
                true
            }
            Err(e) => {
                warn!("[{}] Failed to process {}: {}", self.name, what, e);
                self.metrics.record_error(&self.name, &e);
                false
            }
        }
    }

    fn is_inbound(&self, event: &DispatchEvent) -> bool {
        event.destination == self.cosmos_chain.chain_domain
            && event.message.destination_domain == self.cosmos_chain.chain_domain
            && event.message.origin_domain == self.chain.chain_domain
    }

    async fn ingest(&self, start: u64, current: u64) -> bool {
        let mut ok = true;
        let mut from = start + 1;
        while from <= current {
            let to = current.min(from + MAX_LOG_QUERY_RANGE - 1);
            let events = match self.client.get_dispatch_events(from, to).await {
                Ok(events) => events,
                Err(e) => {
                    error!(
                        "[{}] Failed to fetch dispatches in [{}, {}]: {}",
                        self.name, from, to, e
                    );
                    self.metrics.record_error(&self.name, &e);
                    return false;
                }
            };
            debug!(
                "[{}] {} dispatch(es) in [{}, {}]",
                self.name,
                events.len(),
                from,
                to
            );
            for event in events.iter().filter(|e| self.is_inbound(e)) {
                let result = self.ingest_event(event, current).await;
                ok &= self.track(&format!("{:#x}", event.tx_hash), result);
            }
            from = to + 1;
        }
        ok
    }

    async fn ingest_event(&self, event: &DispatchEvent, current: u64) -> OracleResult<Outcome> {
        let confirmations = current.saturating_sub(event.block_number);
        let status = if confirmations < self.network.confirmations {
            TransactionStatus::Pending
        } else {
            TransactionStatus::Confirmed
        };
        let id = self
            .store
            .insert_transaction(NewTransaction {
                hash: format!("{:#x}", event.tx_hash),
                chain: self.chain.clone(),
                from_address: format!("{:#x}", event.sender),
                to_address: self.mailbox(),
                block_height: event.block_number,
                confirmations,
                status,
            })
            .await?;
        match status {
            TransactionStatus::Confirmed => self.create_messages(id).await,
            _ => Ok("pending"),
        }
    }

    async fn receipt(&self, hash: &str) -> OracleResult<Option<TransactionReceipt>> {
        let hash: H256 = hash
            .parse()
            .map_err(|_| OracleError::InvalidTransaction(format!("bad hash {hash}")))?;
        self.client.get_transaction_receipt(hash).await
    }

    async fn reconcile_tx(&self, tx: &Transaction, current: u64) -> OracleResult<Outcome> {
        let Some(receipt) = self.receipt(&tx.hash).await? else {
            return Ok("waiting");
        };
        let (status, confirmations) = match receipt.block_number {
            _ if receipt.status.map(|s| s.as_u64()) != Some(1) => (TransactionStatus::Failed, 0),
            None => return Ok("waiting"),
            Some(block) => {
                let confirmations = current.saturating_sub(block.as_u64());
                if confirmations < self.network.confirmations {
                    (TransactionStatus::Pending, confirmations)
                } else {
                    (TransactionStatus::Confirmed, confirmations)
                }
            }
        };
        self.store
            .update_transaction(
                tx.id,
                &tx.hash,
                TransactionUpdate {
                    status: Some(status),
                    confirmations: Some(confirmations),
                    ..Default::default()
                },
            )
            .await?;
        Ok("reconciled")
    }

    async fn create_messages(&self, id: RecordId) -> OracleResult<Outcome> {
        let guard = LockGuard::exclusive(self.store.as_ref(), &transaction_resource(id)).await?;
        let outcome = self.create_messages_locked(id).await;
        guard.release().await;
        outcome
    }

    async fn create_messages_locked(&self, id: RecordId) -> OracleResult<Outcome> {
        let Some(tx) = self.store.get_transaction(id).await? else {
            return Err(OracleError::Storage(format!("transaction {id} disappeared")));
        };
        if tx.has_outputs() {
            return Ok("exists");
        }
        let Some(receipt) = self.receipt(&tx.hash).await? else {
            return Err(OracleError::TxNotFound(tx.hash.clone()));
        };
        let events: Vec<DispatchEvent> = receipt
            .logs
            .iter()
            .filter_map(|log| self.client.parse_dispatch_event(log))
            .filter(|e| self.is_inbound(e))
            .collect();
        if events.is_empty() {
            warn!("[{}] No inbound dispatch left in {}", self.name, tx.hash);
            self.store
                .update_transaction(
                    id,
                    &tx.hash,
                    TransactionUpdate {
                        status: Some(TransactionStatus::Invalid),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok("invalid");
        }
        for event in events {
            let message_id = self
                .store
                .insert_message(NewMessage {
                    origin_transaction_id: id,
                    origin_transaction_hash: tx.hash.clone(),
                    chain: self.cosmos_chain.clone(),
                    content: event.message,
                })
                .await?;
            self.store
                .update_transaction(
                    id,
                    &tx.hash,
                    TransactionUpdate {
                        message_id: Some(message_id),
                        ..Default::default()
                    },
                )
                .await?;
            info!(
                "[{}] Created message {} for dispatch in {}",
                self.name, message_id, tx.hash
            );
        }
        Ok("message_created")
    }

    async fn for_each_tx<F, Fut>(&self, what: &str, txs: OracleResult<Vec<Transaction>>, f: F) -> bool
    where
        F: Fn(Transaction) -> Fut,
        Fut: std::future::Future<Output = OracleResult<Outcome>>,
    {
        let txs = match txs {
            Ok(txs) => txs,
            Err(e) => {
                error!("[{}] Failed to load {}: {}", self.name, what, e);
                self.metrics.record_error(&self.name, &e);
                return false;
            }
        };
        let mut ok = true;
        for tx in txs {
            let hash = tx.hash.clone();
            let result = f(tx).await;
            ok &= self.track(&hash, result);
        }
        ok
    }
}

#[async_trait]
impl Runnable for EthereumMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> bool {
        let current = match self.client.get_latest_block_height().await {
            Ok(height) => height,
            Err(e) => {
                error!("[{}] Failed to get latest block height: {}", self.name, e);
                self.metrics.record_error(&self.name, &e);
                return false;
            }
        };
        self.metrics
            .current_block_height
            .with_label_values(&[&self.chain.chain_id])
            .set(current as i64);
        let start = match self.start_height(current).await {
            Ok(start) => start,
            Err(e) => {
                error!("[{}] Failed to read progress: {}", self.name, e);
                self.metrics.record_error(&self.name, &e);
                return false;
            }
        };

        let mailbox = self.mailbox();
        let mut ok = self.ingest(start, current).await;
        let pending = self
            .store
            .find_pending_transactions_to(&self.chain.chain_id, &mailbox)
            .await;
        ok &= self
            .for_each_tx("pending transactions", pending, |tx| async move {
                self.reconcile_tx(&tx, current).await
            })
            .await;
        let confirmed = self
            .store
            .find_confirmed_transactions_to(&self.chain.chain_id, &mailbox)
            .await;
        ok &= self
            .for_each_tx("confirmed transactions", confirmed, |tx| async move {
                self.create_messages(tx.id).await
            })
            .await;

        if ok && current > start {
            if let Err(e) = self.store.write_progress(&self.progress_key, current).await {
                warn!("[{}] Failed to persist progress: {}", self.name, e);
                return false;
            }
            *self.start_block_height.lock().await = Some(current);
        }
        ok
    }
}
