// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Process-local [`OracleStore`]. Used by tests and single-instance runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{new_lock_id, OracleStore, DEFAULT_LOCK_TTL};
use crate::error::{OracleError, OracleResult};
use crate::types::{
    Message, MessageStatus, NewMessage, NewRefund, NewTransaction, RecordId, Refund, Sequence,
    SigningUpdate, Transaction, TransactionStatus, TransactionUpdate,
};

#[derive(Debug)]
struct LockEntry {
    resource_id: String,
    exclusive: bool,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: RecordId,
    transactions: BTreeMap<RecordId, Transaction>,
    messages: BTreeMap<RecordId, Message>,
    refunds: BTreeMap<RecordId, Refund>,
    locks: HashMap<String, LockEntry>,
    progress: HashMap<String, u64>,
}

impl Inner {
    fn next_id(&mut self) -> RecordId {
        self.next_id += 1;
        self.next_id
    }

    fn acquire(&mut self, resource_id: &str, exclusive: bool, ttl: Duration) -> OracleResult<String> {
        let now = Instant::now();
        self.locks.retain(|_, l| l.expires_at > now);
        let conflict = self
            .locks
            .values()
            .any(|l| l.resource_id == resource_id && (exclusive || l.exclusive));
        if conflict {
            return Err(OracleError::LockNotAcquired(resource_id.to_string()));
        }
        let lock_id = new_lock_id();
        self.locks.insert(
            lock_id.clone(),
            LockEntry {
                resource_id: resource_id.to_string(),
                exclusive,
                expires_at: now + ttl,
            },
        );
        Ok(lock_id)
    }
}

#[derive(Debug)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    lock_ttl: Duration,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TTL)
    }
}

impl InMemoryStore {
    pub fn new(lock_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            lock_ttl,
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.inner().transactions.values().cloned().collect()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner().messages.values().cloned().collect()
    }

    pub fn refunds(&self) -> Vec<Refund> {
        self.inner().refunds.values().cloned().collect()
    }

    /// Rewrites a stored message in place, bypassing the record's invariants.
    #[cfg(test)]
    pub fn modify_message(&self, id: RecordId, f: impl FnOnce(&mut Message)) {
        if let Some(message) = self.inner().messages.get_mut(&id) {
            f(message);
        }
    }

    pub fn active_locks(&self) -> usize {
        let now = Instant::now();
        self.inner()
            .locks
            .values()
            .filter(|l| l.expires_at > now)
            .count()
    }
}

fn apply_signing_update(
    status: &mut MessageStatus,
    signatures: &mut Vec<crate::types::Signature>,
    transaction_body: &mut String,
    sequence: &mut Sequence,
    transaction_id: &mut Option<RecordId>,
    transaction_hash: &mut Option<String>,
    update: SigningUpdate,
) {
    if let Some(s) = update.status {
        *status = s;
    }
    if let Some(s) = update.signatures {
        *signatures = s;
    }
    if let Some(b) = update.transaction_body {
        *transaction_body = b;
    }
    if let Some(s) = update.sequence {
        *sequence = s;
    }
    if let Some(id) = update.transaction_id {
        *transaction_id = id;
    }
    if let Some(h) = update.transaction_hash {
        *transaction_hash = h;
    }
}

fn not_found(what: &str, id: RecordId) -> OracleError {
    OracleError::Storage(format!("{what} {id} not found"))
}

#[async_trait]
impl OracleStore for InMemoryStore {
    async fn insert_transaction(&self, tx: NewTransaction) -> OracleResult<RecordId> {
        let mut inner = self.inner();
        if let Some(existing) = inner
            .transactions
            .values()
            .find(|t| t.hash == tx.hash && t.chain.chain_id == tx.chain.chain_id)
        {
            return Ok(existing.id);
        }
        let id = inner.next_id();
        inner.transactions.insert(
            id,
            Transaction {
                id,
                hash: tx.hash,
                chain: tx.chain,
                from_address: tx.from_address,
                to_address: tx.to_address,
                block_height: tx.block_height,
                confirmations: tx.confirmations,
                status: tx.status,
                refund_id: None,
                message_ids: vec![],
            },
        );
        Ok(id)
    }

    async fn get_transaction(&self, id: RecordId) -> OracleResult<Option<Transaction>> {
        Ok(self.inner().transactions.get(&id).cloned())
    }

    async fn update_transaction(
        &self,
        id: RecordId,
        hash: &str,
        update: TransactionUpdate,
    ) -> OracleResult<()> {
        let mut inner = self.inner();
        let tx = inner
            .transactions
            .get_mut(&id)
            .filter(|t| t.hash == hash)
            .ok_or_else(|| not_found("transaction", id))?;
        if let Some(status) = update.status {
            tx.status = status;
        }
        if let Some(confirmations) = update.confirmations {
            tx.confirmations = confirmations;
        }
        if let Some(refund_id) = update.refund_id {
            tx.refund_id = Some(refund_id);
        }
        if let Some(message_id) = update.message_id {
            if !tx.message_ids.contains(&message_id) {
                tx.message_ids.push(message_id);
            }
        }
        Ok(())
    }

    async fn find_pending_transactions_to(
        &self,
        chain_id: &str,
        to_address: &str,
    ) -> OracleResult<Vec<Transaction>> {
        Ok(self
            .inner()
            .transactions
            .values()
            .filter(|t| {
                t.chain.chain_id == chain_id
                    && t.to_address == to_address
                    && t.status == TransactionStatus::Pending
            })
            .cloned()
            .collect())
    }

    async fn find_pending_transactions_from(
        &self,
        chain_id: &str,
        from_address: &str,
    ) -> OracleResult<Vec<Transaction>> {
        Ok(self
            .inner()
            .transactions
            .values()
            .filter(|t| {
                t.chain.chain_id == chain_id
                    && t.from_address == from_address
                    && t.status == TransactionStatus::Pending
            })
            .cloned()
            .collect())
    }

    async fn find_confirmed_transactions_to(
        &self,
        chain_id: &str,
        to_address: &str,
    ) -> OracleResult<Vec<Transaction>> {
        Ok(self
            .inner()
            .transactions
            .values()
            .filter(|t| {
                t.chain.chain_id == chain_id
                    && t.to_address == to_address
                    && t.status == TransactionStatus::Confirmed
                    && !t.has_outputs()
            })
            .cloned()
            .collect())
    }

    async fn insert_message(&self, message: NewMessage) -> OracleResult<RecordId> {
        let mut inner = self.inner();
        let message_id = message.content.message_id_hex();
        if let Some(existing) = inner.messages.values().find(|m| m.message_id == message_id) {
            return Ok(existing.id);
        }
        let id = inner.next_id();
        inner.messages.insert(
            id,
            Message {
                id,
                origin_transaction_id: message.origin_transaction_id,
                origin_transaction_hash: message.origin_transaction_hash,
                message_id,
                chain: message.chain,
                content: message.content,
                transaction_body: String::new(),
                signatures: vec![],
                sequence: Sequence::Unassigned,
                status: MessageStatus::Pending,
                transaction_id: None,
                transaction_hash: None,
            },
        );
        Ok(id)
    }

    async fn get_message(&self, id: RecordId) -> OracleResult<Option<Message>> {
        Ok(self.inner().messages.get(&id).cloned())
    }

    async fn update_message(&self, id: RecordId, update: SigningUpdate) -> OracleResult<()> {
        let mut inner = self.inner();
        let m = inner
            .messages
            .get_mut(&id)
            .ok_or_else(|| not_found("message", id))?;
        apply_signing_update(
            &mut m.status,
            &mut m.signatures,
            &mut m.transaction_body,
            &mut m.sequence,
            &mut m.transaction_id,
            &mut m.transaction_hash,
            update,
        );
        Ok(())
    }

    async fn find_pending_messages(
        &self,
        signer: &str,
        chain_id: &str,
    ) -> OracleResult<Vec<Message>> {
        Ok(self
            .inner()
            .messages
            .values()
            .filter(|m| {
                m.chain.chain_id == chain_id
                    && m.status == MessageStatus::Pending
                    && !m.signatures.iter().any(|s| s.signer == signer)
            })
            .cloned()
            .collect())
    }

    async fn find_signed_messages(&self, chain_id: &str) -> OracleResult<Vec<Message>> {
        Ok(self
            .inner()
            .messages
            .values()
            .filter(|m| m.chain.chain_id == chain_id && m.status == MessageStatus::Signed)
            .cloned()
            .collect())
    }

    async fn find_broadcasted_messages_without_tx(
        &self,
        chain_id: &str,
    ) -> OracleResult<Vec<Message>> {
        Ok(self
            .inner()
            .messages
            .values()
            .filter(|m| {
                m.chain.chain_id == chain_id
                    && m.status == MessageStatus::Broadcasted
                    && m.transaction_id.is_none()
            })
            .cloned()
            .collect())
    }

    async fn find_messages_by_transaction_hash(&self, hash: &str) -> OracleResult<Vec<Message>> {
        Ok(self
            .inner()
            .messages
            .values()
            .filter(|m| m.transaction_hash.as_deref() == Some(hash))
            .cloned()
            .collect())
    }

    async fn insert_refund(&self, refund: NewRefund) -> OracleResult<RecordId> {
        let mut inner = self.inner();
        if let Some(existing) = inner
            .refunds
            .values()
            .find(|r| r.origin_transaction_hash == refund.origin_transaction_hash)
        {
            return Ok(existing.id);
        }
        let id = inner.next_id();
        inner.refunds.insert(
            id,
            Refund {
                id,
                origin_transaction_id: refund.origin_transaction_id,
                origin_transaction_hash: refund.origin_transaction_hash,
                recipient_address: refund.recipient_address,
                amount: refund.amount,
                chain: refund.chain,
                transaction_body: String::new(),
                signatures: vec![],
                sequence: Sequence::Unassigned,
                status: MessageStatus::Pending,
                transaction_id: None,
                transaction_hash: None,
            },
        );
        Ok(id)
    }

    async fn get_refund(&self, id: RecordId) -> OracleResult<Option<Refund>> {
        Ok(self.inner().refunds.get(&id).cloned())
    }

    async fn update_refund(&self, id: RecordId, update: SigningUpdate) -> OracleResult<()> {
        let mut inner = self.inner();
        let r = inner
            .refunds
            .get_mut(&id)
            .ok_or_else(|| not_found("refund", id))?;
        apply_signing_update(
            &mut r.status,
            &mut r.signatures,
            &mut r.transaction_body,
            &mut r.sequence,
            &mut r.transaction_id,
            &mut r.transaction_hash,
            update,
        );
        Ok(())
    }

    async fn find_pending_refunds(
        &self,
        signer: &str,
        chain_id: &str,
    ) -> OracleResult<Vec<Refund>> {
        Ok(self
            .inner()
            .refunds
            .values()
            .filter(|r| {
                r.chain.chain_id == chain_id
                    && r.status == MessageStatus::Pending
                    && !r.signatures.iter().any(|s| s.signer == signer)
            })
            .cloned()
            .collect())
    }

    async fn find_signed_refunds(&self, chain_id: &str) -> OracleResult<Vec<Refund>> {
        Ok(self
            .inner()
            .refunds
            .values()
            .filter(|r| r.chain.chain_id == chain_id && r.status == MessageStatus::Signed)
            .cloned()
            .collect())
    }

    async fn find_broadcasted_refunds_without_tx(
        &self,
        chain_id: &str,
    ) -> OracleResult<Vec<Refund>> {
        Ok(self
            .inner()
            .refunds
            .values()
            .filter(|r| {
                r.chain.chain_id == chain_id
                    && r.status == MessageStatus::Broadcasted
                    && r.transaction_id.is_none()
            })
            .cloned()
            .collect())
    }

    async fn find_refunds_by_transaction_hash(&self, hash: &str) -> OracleResult<Vec<Refund>> {
        Ok(self
            .inner()
            .refunds
            .values()
            .filter(|r| r.transaction_hash.as_deref() == Some(hash))
            .cloned()
            .collect())
    }

    async fn max_sequence(&self, chain_id: &str) -> OracleResult<Option<u64>> {
        let inner = self.inner();
        let messages = inner
            .messages
            .values()
            .filter(|m| m.chain.chain_id == chain_id)
            .filter_map(|m| m.sequence.assigned());
        let refunds = inner.refunds.values().filter_map(|r| r.sequence.assigned());
        Ok(messages.chain(refunds).max())
    }

    async fn assigned_sequences(&self, chain_id: &str, from: u64) -> OracleResult<Vec<u64>> {
        let inner = self.inner();
        let messages = inner
            .messages
            .values()
            .filter(|m| m.chain.chain_id == chain_id)
            .filter_map(|m| m.sequence.assigned());
        let refunds = inner.refunds.values().filter_map(|r| r.sequence.assigned());
        let held: BTreeSet<u64> = messages.chain(refunds).filter(|s| *s >= from).collect();
        Ok(held.into_iter().collect())
    }

    async fn xlock(&self, resource_id: &str) -> OracleResult<String> {
        self.inner().acquire(resource_id, true, self.lock_ttl)
    }

    async fn slock(&self, resource_id: &str) -> OracleResult<String> {
        self.inner().acquire(resource_id, false, self.lock_ttl)
    }

    async fn unlock(&self, lock_id: &str) -> OracleResult<()> {
        self.inner().locks.remove(lock_id);
        Ok(())
    }

    async fn read_progress(&self, task_name: &str) -> OracleResult<Option<u64>> {
        Ok(self.inner().progress.get(task_name).copied())
    }

    async fn write_progress(&self, task_name: &str, block_height: u64) -> OracleResult<()> {
        self.inner()
            .progress
            .insert(task_name.to_string(), block_height);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{new_message_for_test, new_transaction_for_test};
    use crate::types::{Chain, Signature};

    #[tokio::test]
    async fn test_insert_transaction_is_idempotent() {
        let store = InMemoryStore::default();
        let tx = new_transaction_for_test("AA11", "pokt1vault");
        let first = store.insert_transaction(tx.clone()).await.unwrap();
        let second = store.insert_transaction(tx.clone()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.transactions().len(), 1);

        // same hash on another chain is a different row
        let mut other = tx;
        other.chain = Chain::ethereum(1).unwrap();
        assert_ne!(store.insert_transaction(other).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_update_transaction_requires_matching_hash() {
        let store = InMemoryStore::default();
        let id = store
            .insert_transaction(new_transaction_for_test("AA11", "pokt1vault"))
            .await
            .unwrap();
        let update = TransactionUpdate {
            message_id: Some(7),
            ..Default::default()
        };
        assert!(store
            .update_transaction(id, "BB22", update.clone())
            .await
            .is_err());
        store.update_transaction(id, "AA11", update.clone()).await.unwrap();
        store.update_transaction(id, "AA11", update).await.unwrap();
        let tx = store.get_transaction(id).await.unwrap().unwrap();
        assert_eq!(tx.message_ids, vec![7]);
    }

    #[tokio::test]
    async fn test_confirmed_finder_skips_transactions_with_outputs() {
        let store = InMemoryStore::default();
        let mut ids = vec![];
        for hash in ["A1", "A2"] {
            let mut tx = new_transaction_for_test(hash, "pokt1vault");
            tx.status = TransactionStatus::Confirmed;
            ids.push(store.insert_transaction(tx).await.unwrap());
        }
        store
            .update_transaction(
                ids[0],
                "A1",
                TransactionUpdate {
                    refund_id: Some(99),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let found = store
            .find_confirmed_transactions_to("poktroll", "pokt1vault")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, ids[1]);
    }

    #[tokio::test]
    async fn test_pending_messages_exclude_signer() {
        let store = InMemoryStore::default();
        let id = store.insert_message(new_message_for_test(1, 5)).await.unwrap();
        // duplicate content maps to the same row
        assert_eq!(
            store.insert_message(new_message_for_test(1, 5)).await.unwrap(),
            id
        );
        store
            .update_message(
                id,
                SigningUpdate {
                    signatures: Some(vec![Signature {
                        signer: "02aa".into(),
                        signature: "00".into(),
                    }]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(store
            .find_pending_messages("02aa", "poktroll")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .find_pending_messages("02bb", "poktroll")
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_max_sequence_spans_messages_and_refunds() {
        let store = InMemoryStore::default();
        assert_eq!(store.max_sequence("poktroll").await.unwrap(), None);

        let m = store.insert_message(new_message_for_test(1, 5)).await.unwrap();
        store
            .update_message(
                m,
                SigningUpdate {
                    sequence: Some(Sequence::Assigned(0)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(store.max_sequence("poktroll").await.unwrap(), Some(0));

        let r = store
            .insert_refund(NewRefund {
                origin_transaction_id: 1,
                origin_transaction_hash: "CC".into(),
                recipient_address: "pokt1sender".into(),
                amount: 10,
                chain: Chain::cosmos("poktroll", 1000),
            })
            .await
            .unwrap();
        store
            .update_refund(
                r,
                SigningUpdate {
                    sequence: Some(Sequence::Assigned(4)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(store.max_sequence("poktroll").await.unwrap(), Some(4));

        assert_eq!(
            store.assigned_sequences("poktroll", 0).await.unwrap(),
            vec![0, 4]
        );
        assert_eq!(store.assigned_sequences("poktroll", 1).await.unwrap(), vec![4]);
        assert_eq!(store.assigned_sequences("other", 0).await.unwrap(), vec![4]);

        store.update_refund(r, SigningUpdate::reset()).await.unwrap();
        assert_eq!(store.max_sequence("poktroll").await.unwrap(), Some(0));
        assert!(store.assigned_sequences("poktroll", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_modes() {
        let store = InMemoryStore::default();
        let s1 = store.slock("sequence/poktroll").await.unwrap();
        let s2 = store.slock("sequence/poktroll").await.unwrap();
        assert!(store.xlock("sequence/poktroll").await.is_err());
        store.unlock(&s1).await.unwrap();
        store.unlock(&s2).await.unwrap();

        let x = store.xlock("sequence/poktroll").await.unwrap();
        let err = store.slock("sequence/poktroll").await.unwrap_err();
        assert!(err.is_transient());
        // other resources are independent
        store.xlock("messages/1").await.unwrap();
        store.unlock(&x).await.unwrap();
        store.xlock("sequence/poktroll").await.unwrap();
    }

    #[tokio::test]
    async fn test_locks_expire() {
        let store = InMemoryStore::new(Duration::from_millis(20));
        store.xlock("messages/1").await.unwrap();
        assert!(store.xlock("messages/1").await.is_err());
        tokio::time::sleep(Duration::from_millis(40)).await;
        store.xlock("messages/1").await.unwrap();
        assert_eq!(store.active_locks(), 1);
    }

    #[tokio::test]
    async fn test_progress() {
        let store = InMemoryStore::default();
        assert_eq!(store.read_progress("monitor:poktroll").await.unwrap(), None);
        store.write_progress("monitor:poktroll", 42).await.unwrap();
        assert_eq!(
            store.read_progress("monitor:poktroll").await.unwrap(),
            Some(42)
        );
    }
}
