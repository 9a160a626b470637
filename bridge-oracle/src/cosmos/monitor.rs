// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Watches deposits into the vault and turns confirmed ones into messages or
//! refunds.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::{H256, U256};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::client::CosmosClient;
use super::tx::TxResponse;
use super::validator::{validate_tx_to_vault, MintMemo, ValidateTxResult, ValidatorConfig};
use crate::config::{CosmosNetworkConfig, EthereumNetworkConfig, OracleConfig};
use crate::crypto::decode_bech32_address;
use crate::encoding::{nonce_from_tx_hash, MessageBody, MessageContent, MESSAGE_VERSION};
use crate::error::{OracleError, OracleResult};
use crate::metrics::OracleMetrics;
use crate::records::Outcome;
use crate::runner::Runnable;
use crate::store::{LockGuard, SharedStore};
use crate::types::{
    transaction_resource, Chain, NewMessage, NewRefund, NewTransaction, RecordId, Transaction,
    TransactionStatus, TransactionUpdate,
};

pub struct CosmosMonitor {
    name: String,
    progress_key: String,
    store: SharedStore,
    client: Arc<dyn CosmosClient>,
    network: CosmosNetworkConfig,
    chain: Chain,
    validator: ValidatorConfig,
    destinations: HashMap<String, EthereumNetworkConfig>,
    start_block_height: Mutex<Option<u64>>,
    metrics: Arc<OracleMetrics>,
}

impl CosmosMonitor {
    pub fn new(
        config: &OracleConfig,
        store: SharedStore,
        client: Arc<dyn CosmosClient>,
        metrics: Arc<OracleMetrics>,
    ) -> Self {
        Self {
            name: format!("CosmosMonitor {}", config.cosmos.chain_id),
            progress_key: format!("cosmos_monitor:{}", config.cosmos.chain_id),
            store,
            client,
            network: config.cosmos.clone(),
            chain: config.cosmos_chain.clone(),
            validator: config.validator_config(),
            destinations: config
                .ethereum
                .iter()
                .map(|n| (n.chain_id.to_string(), n.clone()))
                .collect(),
            start_block_height: Mutex::new(None),
            metrics,
        }
    }

    fn vault(&self) -> &str {
        &self.network.multisig_address
    }

    /// Resumes from the persisted height when it is not ahead of the chain,
    /// otherwise from the configured start or the current height.
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

    async fn ingest(&self, start: u64, current: u64) -> bool {
        let txs = match self
            .client
            .get_txs_sent_to_address_after_height(self.vault(), start)
            .await
        {
            Ok(txs) => txs,
            Err(e) => {
                error!("[{}] Failed to fetch deposits after {}: {}", self.name, start, e);
                self.metrics.record_error(&self.name, &e);
                return false;
            }
        };
        debug!(
            "[{}] {} transaction(s) after block {}",
            self.name,
            txs.len(),
            start
        );
        let mut ok = true;
        for tx in &txs {
            let result = self.ingest_tx(tx, current).await;
            ok &= self.track(&tx.txhash, result);
        }
        ok
    }

    async fn ingest_tx(&self, tx: &TxResponse, current: u64) -> OracleResult<Outcome> {
        let result = validate_tx_to_vault(tx, &self.validator, current);
        let id = self
            .store
            .insert_transaction(NewTransaction {
                hash: result.tx_hash.clone(),
                chain: self.chain.clone(),
                from_address: result.sender_address.clone(),
                to_address: self.vault().to_string(),
                block_height: tx.height,
                confirmations: result.confirmations,
                status: result.status,
            })
            .await?;
        match result.status {
            TransactionStatus::Confirmed => self.create_outputs(id, &result).await,
            TransactionStatus::Pending => Ok("pending"),
            TransactionStatus::Failed => Ok("failed"),
            TransactionStatus::Invalid => Ok("invalid"),
        }
    }

    async fn reconcile_pending(&self, current: u64) -> bool {
        let txs = match self
            .store
            .find_pending_transactions_to(&self.network.chain_id, self.vault())
            .await
        {
            Ok(txs) => txs,
            Err(e) => {
                error!("[{}] Failed to load pending transactions: {}", self.name, e);
                self.metrics.record_error(&self.name, &e);
                return false;
            }
        };
        let mut ok = true;
        for tx in &txs {
            let result = self.reconcile_tx(tx, current).await;
            ok &= self.track(&tx.hash, result);
        }
        ok
    }

    async fn reconcile_tx(&self, tx: &Transaction, current: u64) -> OracleResult<Outcome> {
        let response = self.client.get_tx(&tx.hash).await?;
        let result = validate_tx_to_vault(&response, &self.validator, current);
        self.store
            .update_transaction(
                tx.id,
                &tx.hash,
                TransactionUpdate {
                    status: Some(result.status),
                    confirmations: Some(result.confirmations),
                    ..Default::default()
                },
            )
            .await?;
        if result.status != TransactionStatus::Pending {
            info!(
                "[{}] Deposit {} is now {} ({} confirmations)",
                self.name, tx.hash, result.status, result.confirmations
            );
        }
        Ok("reconciled")
    }

    async fn promote_confirmed(&self, current: u64) -> bool {
        let txs = match self
            .store
            .find_confirmed_transactions_to(&self.network.chain_id, self.vault())
            .await
        {
            Ok(txs) => txs,
            Err(e) => {
                error!("[{}] Failed to load confirmed transactions: {}", self.name, e);
                self.metrics.record_error(&self.name, &e);
                return false;
            }
        };
        let mut ok = true;
        for tx in &txs {
            let result = async {
                let response = self.client.get_tx(&tx.hash).await?;
                let result = validate_tx_to_vault(&response, &self.validator, current);
                if result.status != TransactionStatus::Confirmed {
                    warn!(
                        "[{}] Confirmed deposit {} now validates as {}",
                        self.name, tx.hash, result.status
                    );
                    return Ok("skipped");
                }
                self.create_outputs(tx.id, &result).await
            }
            .await;
            ok &= self.track(&tx.hash, result);
        }
        ok
    }

    /// Creates the refund or message for a confirmed deposit. At most one
    /// instance does so, under the transaction's lock.
    async fn create_outputs(&self, id: RecordId, result: &ValidateTxResult) -> OracleResult<Outcome> {
        let guard = LockGuard::exclusive(self.store.as_ref(), &transaction_resource(id)).await?;
        let outcome = self.create_outputs_locked(id, result).await;
        guard.release().await;
        outcome
    }

    async fn create_outputs_locked(
        &self,
        id: RecordId,
        result: &ValidateTxResult,
    ) -> OracleResult<Outcome> {
        let Some(tx) = self.store.get_transaction(id).await? else {
            return Err(OracleError::Storage(format!("transaction {id} disappeared")));
        };
        if tx.has_outputs() {
            return Ok("exists");
        }

        let memo = match (&result.memo, result.needs_refund) {
            (Some(memo), false) => memo,
            _ => {
                let refund_id = self
                    .store
                    .insert_refund(NewRefund {
                        origin_transaction_id: id,
                        origin_transaction_hash: tx.hash.clone(),
                        recipient_address: result.sender_address.clone(),
                        amount: result.amount,
                        chain: self.chain.clone(),
                    })
                    .await?;
                self.store
                    .update_transaction(
                        id,
                        &tx.hash,
                        TransactionUpdate {
                            refund_id: Some(refund_id),
                            ..Default::default()
                        },
                    )
                    .await?;
                info!(
                    "[{}] Created refund {} for deposit {}",
                    self.name, refund_id, tx.hash
                );
                return Ok("refund_created");
            }
        };

        // unmintable deposits were routed to refunds by validation
        let (chain, content) = self.build_message(&tx.hash, result, memo)?;
        let message_id = self
            .store
            .insert_message(NewMessage {
                origin_transaction_id: id,
                origin_transaction_hash: tx.hash.clone(),
                chain,
                content,
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
            "[{}] Created message {} for deposit {}",
            self.name, message_id, tx.hash
        );
        Ok("message_created")
    }

    /// Message minting the deposit, net of the bridge fee, on the memo's chain.
    fn build_message(
        &self,
        tx_hash: &str,
        result: &ValidateTxResult,
        memo: &MintMemo,
    ) -> OracleResult<(Chain, MessageContent)> {
        let destination = self
            .destinations
            .get(&memo.chain_id)
            .ok_or_else(|| OracleError::UnsupportedChain(memo.chain_id.clone()))?;
        let prefix = &self.network.bech32_prefix;
        let vault = decode_bech32_address(prefix, self.vault())?;
        let sender = decode_bech32_address(prefix, &result.sender_address)?;
        let recipient = memo
            .address
            .parse()
            .map_err(|_| OracleError::InvalidMemo(memo.address.clone()))?;
        let chain = destination.chain()?;
        let content = MessageContent {
            version: MESSAGE_VERSION,
            nonce: nonce_from_tx_hash(tx_hash)?,
            origin_domain: self.chain.chain_domain,
            sender: H256::from(ethers::types::Address::from(vault)),
            destination_domain: chain.chain_domain,
            recipient: H256::from(destination.mint_controller_address),
            body: MessageBody {
                recipient_address: recipient,
                amount: U256::from(result.amount - self.validator.tx_fee),
                sender_address: sender.into(),
            },
        };
        Ok((chain, content))
    }
}

#[async_trait]
impl Runnable for CosmosMonitor {
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
            .with_label_values(&[&self.network.chain_id])
            .set(current as i64);

        let start = match self.start_height(current).await {
            Ok(start) => start,
            Err(e) => {
                error!("[{}] Failed to read progress: {}", self.name, e);
                self.metrics.record_error(&self.name, &e);
                return false;
            }
        };

        let mut ok = self.ingest(start, current).await;
        ok &= self.reconcile_pending(current).await;
        ok &= self.promote_confirmed(current).await;

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
