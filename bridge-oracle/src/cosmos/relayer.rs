// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Broadcasts fully signed vault transactions and follows them to finality.
//!
//! A broadcast that never shows up on chain is sent again once the broadcast
//! timeout passes, as long as the vault has not spent its sequence. A spent
//! sequence is traced back through the account-sequence index before the
//! record is given up, since the node may hash the transaction differently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::client::CosmosClient;
use super::multisig::MultisigAssembler;
use super::tx::{tx_hash, StdTx, UnsignedTx};
use super::validator::outbound_status;
use crate::config::{CosmosNetworkConfig, OracleConfig};
use crate::error::{OracleError, OracleResult};
use crate::metrics::OracleMetrics;
use crate::records::{reset_record, with_record_lock, Outcome};
use crate::runner::Runnable;
use crate::store::{LockGuard, SharedStore};
use crate::types::{
    transaction_resource, Chain, MessageStatus, NewTransaction, Signable, SigningRecord,
    SigningUpdate, Transaction, TransactionStatus, TransactionUpdate,
};

pub struct CosmosRelayer {
    name: String,
    store: SharedStore,
    client: Arc<dyn CosmosClient>,
    assembler: MultisigAssembler,
    network: CosmosNetworkConfig,
    chain: Chain,
    broadcast_timeout: Duration,
    // first time each record's transaction was found missing, by lock resource
    missing_since: Mutex<HashMap<String, Instant>>,
    metrics: Arc<OracleMetrics>,
}

/// What spent a vault sequence below the account's current one.
enum SpentSequence {
    /// This record's transaction, under the hash the chain gave it.
    Ours(String),
    Other(String),
    /// Not indexed by the node.
    Unknown,
}

impl CosmosRelayer {
    pub fn new(
        config: &OracleConfig,
        store: SharedStore,
        client: Arc<dyn CosmosClient>,
        metrics: Arc<OracleMetrics>,
    ) -> Self {
        Self {
            name: format!("CosmosRelayer {}", config.cosmos.chain_id),
            store,
            client,
            assembler: MultisigAssembler::new(
                config.multisig.clone(),
                config.cosmos.multisig_address.clone(),
                config.cosmos.chain_id.clone(),
            ),
            network: config.cosmos.clone(),
            chain: config.cosmos_chain.clone(),
            broadcast_timeout: config.cosmos.broadcast_timeout(),
            missing_since: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Starts the record's missing clock on the first call and reports
    /// whether the broadcast timeout has passed since.
    fn overdue(&self, record: &SigningRecord) -> bool {
        let mut missing = self.missing_since.lock().unwrap_or_else(|e| e.into_inner());
        let since = *missing
            .entry(record.lock_resource())
            .or_insert_with(Instant::now);
        since.elapsed() >= self.broadcast_timeout
    }

    fn found(&self, record: &SigningRecord) {
        self.missing_since
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&record.lock_resource());
    }

    fn vault(&self) -> &str {
        &self.network.multisig_address
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

    async fn relay_signed(&self, record: &SigningRecord) -> OracleResult<Outcome> {
        with_record_lock(self.store.as_ref(), record.kind(), record.id(), || async {
            let Some(current) = self.store.get_record(record.kind(), record.id()).await? else {
                return Ok("skipped");
            };
            if current.status() != MessageStatus::Signed {
                return Ok("skipped");
            }
            if let Some(hash) = current.transaction_hash() {
                info!(
                    "[{}] {} already broadcast as {}",
                    self.name,
                    current.lock_resource(),
                    hash
                );
                self.store
                    .update_record(
                        current.kind(),
                        current.id(),
                        SigningUpdate::status(MessageStatus::Broadcasted),
                    )
                    .await?;
                return Ok("already_broadcast");
            }

            let account = self.client.get_account(self.vault()).await?;
            if let Some(sequence) = current.sequence().assigned() {
                if sequence > account.sequence {
                    debug!(
                        "[{}] {} waits for vault sequence {} to reach {}",
                        self.name,
                        current.lock_resource(),
                        account.sequence,
                        sequence
                    );
                    return Ok("waiting");
                }
            }
            let tx = match self.assembler.assemble(&current, account.account_number) {
                Ok(tx) => tx,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    warn!(
                        "[{}] Rejecting signatures of {}: {}",
                        self.name,
                        current.lock_resource(),
                        e
                    );
                    self.reset(&current, "signature_rejected").await?;
                    return Ok("reset");
                }
            };
            let bytes = tx.to_bytes()?;
            let expected_hash = tx_hash(&bytes);
            // checked by the assembler
            let sequence = current.sequence().assigned().unwrap_or_default();

            if sequence < account.sequence {
                // either this transaction landed without its hash being recorded
                // or the sequence went to another transaction
                return match self.client.get_tx(&expected_hash).await {
                    Ok(_) => {
                        self.found(&current);
                        self.mark_broadcasted(&current, expected_hash).await?;
                        Ok("broadcasted")
                    }
                    Err(OracleError::TxNotFound(_)) => {
                        self.recover_spent(&current, sequence, &tx, None, "stale_sequence")
                            .await
                    }
                    Err(e) => Err(e),
                };
            }

            let hash = self.client.broadcast_tx(&bytes).await?;
            if hash != expected_hash {
                debug!(
                    "[{}] Node reported hash {} for local hash {}",
                    self.name, hash, expected_hash
                );
            }
            self.mark_broadcasted(&current, hash).await?;
            self.metrics
                .transactions_broadcast
                .with_label_values(&[&self.network.chain_id])
                .inc();
            Ok("broadcasted")
        })
        .await
    }

    /// The transaction the vault signed at `sequence`, told apart by memo.
    async fn spent_by(&self, sequence: u64, memo: &str) -> OracleResult<SpentSequence> {
        let found = self
            .client
            .find_tx_by_sequence(self.vault(), sequence)
            .await?;
        Ok(match found {
            Some(tx) if !memo.is_empty() && tx.memo() == memo => SpentSequence::Ours(tx.txhash),
            Some(tx) => SpentSequence::Other(tx.txhash),
            None => SpentSequence::Unknown,
        })
    }

    /// Settles a record whose sequence the vault already spent. The record
    /// adopts its own landed transaction; otherwise it is reset, immediately
    /// when another transaction took the sequence and after the broadcast
    /// timeout when the spender cannot be found.
    async fn recover_spent(
        &self,
        record: &SigningRecord,
        sequence: u64,
        tx: &StdTx,
        recorded_hash: Option<&str>,
        reason: &str,
    ) -> OracleResult<Outcome> {
        match self.spent_by(sequence, &tx.memo).await? {
            SpentSequence::Ours(hash) if recorded_hash == Some(hash.as_str()) => {
                debug!("[{}] Outbound {} indexed by sequence only", self.name, hash);
                Ok("waiting")
            }
            SpentSequence::Ours(hash) => {
                self.found(record);
                info!(
                    "[{}] Found {} on chain by sequence {}",
                    self.name,
                    record.lock_resource(),
                    sequence
                );
                self.mark_broadcasted(record, hash).await?;
                Ok("recovered")
            }
            SpentSequence::Other(hash) => {
                warn!(
                    "[{}] Sequence {} of {} was spent by {}",
                    self.name,
                    sequence,
                    record.lock_resource(),
                    hash
                );
                self.found(record);
                self.reset(record, reason).await?;
                Ok("reset")
            }
            SpentSequence::Unknown if self.overdue(record) => {
                warn!(
                    "[{}] No transaction found at sequence {} for {}, giving it up",
                    self.name,
                    sequence,
                    record.lock_resource()
                );
                self.found(record);
                self.reset(record, reason).await?;
                Ok("reset")
            }
            SpentSequence::Unknown => Ok("waiting"),
        }
    }

    /// A broadcast record whose transaction the chain does not know.
    async fn recover_missing(&self, record: &SigningRecord, hash: &str) -> OracleResult<Outcome> {
        let account = self.client.get_account(self.vault()).await?;
        let tx = match self.assembler.assemble(record, account.account_number) {
            Ok(tx) => tx,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                warn!(
                    "[{}] Cannot rebuild {}: {}",
                    self.name,
                    record.lock_resource(),
                    e
                );
                self.found(record);
                self.reset(record, "broadcast_lost").await?;
                return Ok("reset");
            }
        };
        // checked by the assembler
        let sequence = record.sequence().assigned().unwrap_or_default();

        if sequence < account.sequence {
            return self
                .recover_spent(record, sequence, &tx, Some(hash), "broadcast_lost")
                .await;
        }
        if sequence > account.sequence || !self.overdue(record) {
            debug!("[{}] Outbound {} not on chain yet", self.name, hash);
            return Ok("waiting");
        }

        // the sequence is still free, so the transaction was dropped
        let rebroadcast = self.client.broadcast_tx(&tx.to_bytes()?).await?;
        warn!(
            "[{}] {} was not included within {:?}, sent again",
            self.name,
            record.lock_resource(),
            self.broadcast_timeout
        );
        self.found(record);
        self.mark_broadcasted(record, rebroadcast).await?;
        self.metrics
            .transactions_broadcast
            .with_label_values(&[&self.network.chain_id])
            .inc();
        Ok("rebroadcast")
    }

    async fn mark_broadcasted(&self, record: &SigningRecord, hash: String) -> OracleResult<()> {
        info!(
            "[{}] Broadcast {} as {}",
            self.name,
            record.lock_resource(),
            hash
        );
        self.store
            .update_record(
                record.kind(),
                record.id(),
                SigningUpdate {
                    status: Some(MessageStatus::Broadcasted),
                    transaction_hash: Some(Some(hash)),
                    ..Default::default()
                },
            )
            .await
    }

    async fn reset(&self, record: &SigningRecord, reason: &str) -> OracleResult<()> {
        reset_record(
            self.store.as_ref(),
            &self.metrics,
            record.kind(),
            record.id(),
            &self.network.chain_id,
            reason,
        )
        .await
    }

    /// Records the outbound transaction of a broadcast record once the chain
    /// knows it, and links it back.
    async fn link_outbound(&self, record: &SigningRecord) -> OracleResult<Outcome> {
        with_record_lock(self.store.as_ref(), record.kind(), record.id(), || async {
            let Some(current) = self.store.get_record(record.kind(), record.id()).await? else {
                return Ok("skipped");
            };
            let (MessageStatus::Broadcasted, None, Some(hash)) = (
                current.status(),
                current.transaction_id(),
                current.transaction_hash(),
            ) else {
                return Ok("skipped");
            };

            let tx = match self.client.get_tx(hash).await {
                Ok(tx) => tx,
                Err(OracleError::TxNotFound(_)) => return self.recover_missing(&current, hash).await,
                Err(e) => return Err(e),
            };
            self.found(&current);
            let to_address = UnsignedTx::from_json(current.transaction_body())
                .ok()
                .and_then(|body| body.msgs.first().map(|m| m.value.to_address.clone()))
                .unwrap_or_default();
            let id = self
                .store
                .insert_transaction(NewTransaction {
                    hash: tx.txhash.clone(),
                    chain: self.chain.clone(),
                    from_address: self.vault().to_string(),
                    to_address,
                    block_height: tx.height,
                    confirmations: 0,
                    status: TransactionStatus::Pending,
                })
                .await?;
            self.store
                .update_record(
                    current.kind(),
                    current.id(),
                    SigningUpdate {
                        transaction_id: Some(Some(id)),
                        ..Default::default()
                    },
                )
                .await?;
            info!(
                "[{}] Linked {} to outbound transaction {} ({})",
                self.name,
                current.lock_resource(),
                id,
                tx.txhash
            );
            Ok("linked")
        })
        .await
    }

    async fn reconcile_outbound(&self, tx: &Transaction) -> OracleResult<Outcome> {
        let guard = LockGuard::exclusive(self.store.as_ref(), &transaction_resource(tx.id)).await?;
        let result = self.reconcile_outbound_locked(tx).await;
        guard.release().await;
        result
    }

    async fn reconcile_outbound_locked(&self, tx: &Transaction) -> OracleResult<Outcome> {
        let response = match self.client.get_tx(&tx.hash).await {
            Ok(response) => response,
            Err(OracleError::TxNotFound(_)) => return Ok("waiting"),
            Err(e) => return Err(e),
        };
        let height = self.client.get_latest_block_height().await?;
        let (status, confirmations) =
            outbound_status(&response, self.network.confirmations, height);

        let mut records: Vec<SigningRecord> = self
            .store
            .find_messages_by_transaction_hash(&tx.hash)
            .await?
            .into_iter()
            .map(SigningRecord::from)
            .collect();
        records.extend(
            self.store
                .find_refunds_by_transaction_hash(&tx.hash)
                .await?
                .into_iter()
                .map(SigningRecord::from),
        );

        let outcome = match status {
            TransactionStatus::Pending => {
                self.store
                    .update_transaction(
                        tx.id,
                        &tx.hash,
                        TransactionUpdate {
                            confirmations: Some(confirmations),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Ok("pending");
            }
            TransactionStatus::Failed => {
                warn!(
                    "[{}] Outbound transaction {} failed with code {}: {}",
                    self.name, tx.hash, response.code, response.raw_log
                );
                for record in &records {
                    self.settle(record, &tx.hash, None).await?;
                }
                "failed"
            }
            TransactionStatus::Confirmed => {
                for record in &records {
                    self.settle(record, &tx.hash, Some(MessageStatus::Success))
                        .await?;
                }
                "confirmed"
            }
            TransactionStatus::Invalid => return Ok("skipped"),
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
        info!(
            "[{}] Outbound transaction {} is {} ({} record(s))",
            self.name,
            tx.hash,
            status,
            records.len()
        );
        Ok(outcome)
    }

    /// `Success` on confirmation; on failure (`None`) the record is reset.
    async fn settle(
        &self,
        record: &SigningRecord,
        hash: &str,
        status: Option<MessageStatus>,
    ) -> OracleResult<()> {
        with_record_lock(self.store.as_ref(), record.kind(), record.id(), || async {
            let Some(current) = self.store.get_record(record.kind(), record.id()).await? else {
                return Ok(());
            };
            if current.status() != MessageStatus::Broadcasted
                || current.transaction_hash() != Some(hash)
            {
                return Ok(());
            }
            match status {
                Some(status) => {
                    self.store
                        .update_record(current.kind(), current.id(), SigningUpdate::status(status))
                        .await?;
                    info!("[{}] {} is {}", self.name, current.lock_resource(), status);
                    Ok(())
                }
                None => self.reset(&current, "tx_failed").await,
            }
        })
        .await
    }

    async fn load<T, F>(&self, what: &str, f: F) -> Option<Vec<T>>
    where
        F: std::future::Future<Output = OracleResult<Vec<T>>>,
    {
        match f.await {
            Ok(items) => Some(items),
            Err(e) => {
                error!("[{}] Failed to load {}: {}", self.name, what, e);
                self.metrics.record_error(&self.name, &e);
                None
            }
        }
    }
}

#[async_trait]
impl Runnable for CosmosRelayer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> bool {
        let chain_id = self.network.chain_id.as_str();
        let mut ok = true;

        let mut signed: Vec<SigningRecord> = Vec::new();
        match self.load("signed messages", self.store.find_signed_messages(chain_id)).await {
            Some(items) => signed.extend(items.into_iter().map(SigningRecord::from)),
            None => ok = false,
        }
        match self.load("signed refunds", self.store.find_signed_refunds(chain_id)).await {
            Some(items) => signed.extend(items.into_iter().map(SigningRecord::from)),
            None => ok = false,
        }
        // oldest first so sequences go out in order
        signed.sort_by_key(|r| r.sequence().assigned());
        for record in &signed {
            let result = self.relay_signed(record).await;
            ok &= self.track(&record.lock_resource(), result);
        }

        let mut broadcasted: Vec<SigningRecord> = Vec::new();
        match self
            .load(
                "broadcasted messages",
                self.store.find_broadcasted_messages_without_tx(chain_id),
            )
            .await
        {
            Some(items) => broadcasted.extend(items.into_iter().map(SigningRecord::from)),
            None => ok = false,
        }
        match self
            .load(
                "broadcasted refunds",
                self.store.find_broadcasted_refunds_without_tx(chain_id),
            )
            .await
        {
            Some(items) => broadcasted.extend(items.into_iter().map(SigningRecord::from)),
            None => ok = false,
        }
        for record in &broadcasted {
            let result = self.link_outbound(record).await;
            ok &= self.track(&record.lock_resource(), result);
        }

        match self
            .load(
                "pending outbound transactions",
                self.store
                    .find_pending_transactions_from(chain_id, self.vault()),
            )
            .await
        {
            Some(txs) => {
                for tx in &txs {
                    let result = self.reconcile_outbound(tx).await;
                    ok &= self.track(&tx.hash, result);
                }
            }
            None => ok = false,
        }
        ok
    }
}
