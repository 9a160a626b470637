// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared document store used by every oracle instance.
//!
//! All cross-process coordination goes through the lock operations here:
//! `xlock` / `slock` never block, they either hand out a lock id or fail with
//! [`OracleError::LockNotAcquired`], and every lock expires after its TTL.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::OracleResult;
use crate::types::{
    Message, NewMessage, NewRefund, NewTransaction, RecordId, RecordKind, Refund, SigningRecord,
    SigningUpdate, Transaction, TransactionUpdate,
};

pub mod memory;
pub mod pg;

pub use memory::InMemoryStore;
pub use pg::PgOracleStore;

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

pub type SharedStore = Arc<dyn OracleStore>;

#[async_trait]
pub trait OracleStore: Debug + Send + Sync {
    /// Inserts a transaction, or returns the id of the row already stored
    /// for the same `(hash, chain)`.
    async fn insert_transaction(&self, tx: NewTransaction) -> OracleResult<RecordId>;

    async fn get_transaction(&self, id: RecordId) -> OracleResult<Option<Transaction>>;

    /// Applies `update` to the row matching both `id` and `hash`.
    async fn update_transaction(
        &self,
        id: RecordId,
        hash: &str,
        update: TransactionUpdate,
    ) -> OracleResult<()>;

    async fn find_pending_transactions_to(
        &self,
        chain_id: &str,
        to_address: &str,
    ) -> OracleResult<Vec<Transaction>>;

    async fn find_pending_transactions_from(
        &self,
        chain_id: &str,
        from_address: &str,
    ) -> OracleResult<Vec<Transaction>>;

    /// Confirmed transactions into `to_address` with neither a refund nor
    /// any message attached.
    async fn find_confirmed_transactions_to(
        &self,
        chain_id: &str,
        to_address: &str,
    ) -> OracleResult<Vec<Transaction>>;

    /// Inserts a message, or returns the id of the one with the same message id.
    async fn insert_message(&self, message: NewMessage) -> OracleResult<RecordId>;

    async fn get_message(&self, id: RecordId) -> OracleResult<Option<Message>>;

    async fn update_message(&self, id: RecordId, update: SigningUpdate) -> OracleResult<()>;

    /// Pending messages destined to `chain_id` that `signer` has not signed.
    async fn find_pending_messages(&self, signer: &str, chain_id: &str)
        -> OracleResult<Vec<Message>>;

    async fn find_signed_messages(&self, chain_id: &str) -> OracleResult<Vec<Message>>;

    async fn find_broadcasted_messages_without_tx(
        &self,
        chain_id: &str,
    ) -> OracleResult<Vec<Message>>;

    /// Messages whose outbound transaction has the given hash.
    async fn find_messages_by_transaction_hash(&self, hash: &str) -> OracleResult<Vec<Message>>;

    /// Inserts a refund, or returns the id of the one for the same origin transaction.
    async fn insert_refund(&self, refund: NewRefund) -> OracleResult<RecordId>;

    async fn get_refund(&self, id: RecordId) -> OracleResult<Option<Refund>>;

    async fn update_refund(&self, id: RecordId, update: SigningUpdate) -> OracleResult<()>;

    async fn find_pending_refunds(&self, signer: &str, chain_id: &str)
        -> OracleResult<Vec<Refund>>;

    async fn find_signed_refunds(&self, chain_id: &str) -> OracleResult<Vec<Refund>>;

    async fn find_broadcasted_refunds_without_tx(
        &self,
        chain_id: &str,
    ) -> OracleResult<Vec<Refund>>;

    async fn find_refunds_by_transaction_hash(&self, hash: &str) -> OracleResult<Vec<Refund>>;

    /// Highest assigned sequence over messages destined to `chain_id` and all refunds.
    async fn max_sequence(&self, chain_id: &str) -> OracleResult<Option<u64>>;

    /// Assigned sequences at or above `from`, over the same records as
    /// [`OracleStore::max_sequence`], ascending and without duplicates.
    async fn assigned_sequences(&self, chain_id: &str, from: u64) -> OracleResult<Vec<u64>>;

    async fn xlock(&self, resource_id: &str) -> OracleResult<String>;

    async fn slock(&self, resource_id: &str) -> OracleResult<String>;

    async fn unlock(&self, lock_id: &str) -> OracleResult<()>;

    async fn read_progress(&self, task_name: &str) -> OracleResult<Option<u64>>;

    async fn write_progress(&self, task_name: &str, block_height: u64) -> OracleResult<()>;

    async fn get_record(&self, kind: RecordKind, id: RecordId) -> OracleResult<Option<SigningRecord>> {
        Ok(match kind {
            RecordKind::Message => self.get_message(id).await?.map(SigningRecord::Message),
            RecordKind::Refund => self.get_refund(id).await?.map(SigningRecord::Refund),
        })
    }

    async fn update_record(
        &self,
        kind: RecordKind,
        id: RecordId,
        update: SigningUpdate,
    ) -> OracleResult<()> {
        match kind {
            RecordKind::Message => self.update_message(id, update).await,
            RecordKind::Refund => self.update_refund(id, update).await,
        }
    }
}

/// Releases a lock, logging instead of failing. Expiry covers a failed unlock.
pub async fn release_lock(store: &dyn OracleStore, lock_id: &str) {
    if let Err(e) = store.unlock(lock_id).await {
        warn!("Failed to release lock {}: {}", lock_id, e);
    }
}

/// A held lock. Must be released with [`LockGuard::release`]; if it is not,
/// the lock lapses after its TTL.
#[must_use]
pub struct LockGuard<'a> {
    store: &'a dyn OracleStore,
    resource_id: String,
    lock_id: String,
}

impl<'a> LockGuard<'a> {
    pub async fn exclusive(store: &'a dyn OracleStore, resource_id: &str) -> OracleResult<Self> {
        let lock_id = store.xlock(resource_id).await?;
        Ok(Self {
            store,
            resource_id: resource_id.to_string(),
            lock_id,
        })
    }

    pub async fn shared(store: &'a dyn OracleStore, resource_id: &str) -> OracleResult<Self> {
        let lock_id = store.slock(resource_id).await?;
        Ok(Self {
            store,
            resource_id: resource_id.to_string(),
            lock_id,
        })
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub async fn release(self) {
        release_lock(self.store, &self.lock_id).await;
    }
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub(crate) fn new_lock_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}
