// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! [`OracleStore`] over Postgres, shared by every oracle instance of a vault.
//!
//! Locks are rows in the `locks` table. Acquisition is serialized per resource
//! with a transaction scoped advisory lock, so the conflict check and the
//! insert cannot interleave across processes.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bridge_oracle_pg_db::{Connection, Db};
use bridge_oracle_schema::models::{
    LockRow, MessageChangeset, MessageRow, NewMessageRow, NewRefundRow, NewTransactionRow,
    RefundChangeset, RefundRow, TransactionChangeset, TransactionRow,
};
use bridge_oracle_schema::schema::{locks, messages, progress_store, refunds, transactions};
use diesel::dsl::{max, not};
use diesel::sql_types::{BigInt, Text};
use diesel::{
    ExpressionMethods, OptionalExtension, PgJsonbExpressionMethods, QueryDsl, SelectableHelper,
};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use tracing::debug;

use super::{new_lock_id, now_ms, OracleStore};
use crate::error::{OracleError, OracleResult};
use crate::types::{
    Chain, Message, MessageContent, MessageStatus, NewMessage, NewRefund,
    NewTransaction, RecordId, Refund, Sequence, Signature, SigningUpdate, Transaction,
    TransactionStatus, TransactionUpdate,
};

const LIVE_TASK_TARGET_BLOCK: i64 = i64::MAX;

#[derive(Clone)]
pub struct PgOracleStore {
    db: Db,
    lock_ttl: Duration,
}

impl std::fmt::Debug for PgOracleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgOracleStore")
            .field("lock_ttl", &self.lock_ttl)
            .finish()
    }
}

fn storage(e: impl std::fmt::Display) -> OracleError {
    OracleError::Storage(e.to_string())
}

fn parse_enum<T: FromStr>(what: &str, value: &str) -> OracleResult<T> {
    T::from_str(value).map_err(|_| OracleError::Storage(format!("unknown {what} '{value}'")))
}

fn to_sequence(value: Option<i64>) -> Sequence {
    value.map(|s| s as u64).into()
}

fn from_sequence(sequence: Sequence) -> Option<i64> {
    sequence.assigned().map(|s| s as i64)
}

fn signatures_json(signatures: &[Signature]) -> OracleResult<serde_json::Value> {
    serde_json::to_value(signatures).map_err(storage)
}

fn parse_signatures(value: serde_json::Value) -> OracleResult<Vec<Signature>> {
    serde_json::from_value(value).map_err(storage)
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = OracleError;

    fn try_from(row: TransactionRow) -> OracleResult<Self> {
        Ok(Transaction {
            id: row.id,
            hash: row.hash,
            chain: Chain {
                chain_id: row.chain_id,
                chain_domain: row.chain_domain as u32,
                chain_type: parse_enum("chain type", &row.chain_type)?,
            },
            from_address: row.from_address,
            to_address: row.to_address,
            block_height: row.block_height as u64,
            confirmations: row.confirmations as u64,
            status: parse_enum("transaction status", &row.status)?,
            refund_id: row.refund_id,
            message_ids: row.message_ids,
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = OracleError;

    fn try_from(row: MessageRow) -> OracleResult<Self> {
        let content: MessageContent = serde_json::from_value(row.content).map_err(storage)?;
        Ok(Message {
            id: row.id,
            origin_transaction_id: row.origin_transaction_id,
            origin_transaction_hash: row.origin_transaction_hash,
            message_id: row.message_id,
            chain: Chain {
                chain_id: row.chain_id,
                chain_domain: row.chain_domain as u32,
                chain_type: parse_enum("chain type", &row.chain_type)?,
            },
            content,
            transaction_body: row.transaction_body,
            signatures: parse_signatures(row.signatures)?,
            sequence: to_sequence(row.sequence),
            status: parse_enum("message status", &row.status)?,
            transaction_id: row.transaction_id,
            transaction_hash: row.transaction_hash,
        })
    }
}

impl TryFrom<RefundRow> for Refund {
    type Error = OracleError;

    fn try_from(row: RefundRow) -> OracleResult<Self> {
        Ok(Refund {
            id: row.id,
            origin_transaction_id: row.origin_transaction_id,
            origin_transaction_hash: row.origin_transaction_hash,
            recipient_address: row.recipient_address,
            amount: row
                .amount
                .parse()
                .map_err(|_| OracleError::Storage(format!("bad refund amount '{}'", row.amount)))?,
            chain: Chain::cosmos(row.chain_id, row.chain_domain as u32),
            transaction_body: row.transaction_body,
            signatures: parse_signatures(row.signatures)?,
            sequence: to_sequence(row.sequence),
            status: parse_enum("refund status", &row.status)?,
            transaction_id: row.transaction_id,
            transaction_hash: row.transaction_hash,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> OracleResult<Vec<T>>
where
    T: TryFrom<R, Error = OracleError>,
{
    rows.into_iter().map(T::try_from).collect()
}

struct SigningColumns {
    status: Option<String>,
    signatures: Option<serde_json::Value>,
    transaction_body: Option<String>,
    sequence: Option<Option<i64>>,
    transaction_id: Option<Option<i64>>,
    transaction_hash: Option<Option<String>>,
}

impl SigningColumns {
    fn new(update: SigningUpdate) -> OracleResult<Self> {
        Ok(Self {
            status: update.status.map(|s| s.to_string()),
            signatures: update
                .signatures
                .map(|s| signatures_json(&s))
                .transpose()?,
            transaction_body: update.transaction_body,
            sequence: update.sequence.map(from_sequence),
            transaction_id: update.transaction_id,
            transaction_hash: update.transaction_hash,
        })
    }
}

impl PgOracleStore {
    pub fn new(db: Db, lock_ttl: Duration) -> Self {
        Self { db, lock_ttl }
    }

    async fn conn(&self) -> OracleResult<Connection<'_>> {
        self.db.connect().await.map_err(storage)
    }

    async fn acquire(&self, resource_id: &str, exclusive: bool) -> OracleResult<String> {
        let mut conn = self.conn().await?;
        let resource = resource_id.to_string();
        let ttl_ms = self.lock_ttl.as_millis() as i64;
        let acquired = conn
            .transaction::<_, diesel::result::Error, _>(|conn| {
                async move {
                    diesel::sql_query("SELECT pg_advisory_xact_lock(hashtext($1))")
                        .bind::<Text, _>(&resource)
                        .execute(conn)
                        .await?;
                    let now = now_ms();
                    diesel::delete(locks::table.filter(locks::expires_at_ms.le(now)))
                        .execute(conn)
                        .await?;
                    let mut held = locks::table
                        .filter(locks::resource_id.eq(&resource))
                        .into_boxed();
                    if !exclusive {
                        held = held.filter(locks::exclusive.eq(true));
                    }
                    let conflicts: i64 = held.count().get_result(conn).await?;
                    if conflicts > 0 {
                        return Ok(None);
                    }
                    let row = LockRow {
                        lock_id: new_lock_id(),
                        resource_id: resource.clone(),
                        exclusive,
                        expires_at_ms: now + ttl_ms,
                    };
                    diesel::insert_into(locks::table)
                        .values(&row)
                        .execute(conn)
                        .await?;
                    Ok(Some(row.lock_id))
                }
                .scope_boxed()
            })
            .await
            .map_err(storage)?;
        match acquired {
            Some(lock_id) => {
                debug!("Acquired lock {} on {} (exclusive: {})", lock_id, resource_id, exclusive);
                Ok(lock_id)
            }
            None => Err(OracleError::LockNotAcquired(resource_id.to_string())),
        }
    }
}

#[async_trait]
impl OracleStore for PgOracleStore {
    async fn insert_transaction(&self, tx: NewTransaction) -> OracleResult<RecordId> {
        let mut conn = self.conn().await?;
        let now = now_ms();
        let row = NewTransactionRow {
            hash: tx.hash.clone(),
            chain_id: tx.chain.chain_id.clone(),
            chain_domain: tx.chain.chain_domain as i64,
            chain_type: tx.chain.chain_type.to_string(),
            from_address: tx.from_address,
            to_address: tx.to_address,
            block_height: tx.block_height as i64,
            confirmations: tx.confirmations as i64,
            status: tx.status.to_string(),
            refund_id: None,
            message_ids: vec![],
            created_at_ms: now,
            updated_at_ms: now,
        };
        let inserted: Option<i64> = diesel::insert_into(transactions::table)
            .values(&row)
            .on_conflict((transactions::hash, transactions::chain_id))
            .do_nothing()
            .returning(transactions::id)
            .get_result(&mut conn)
            .await
            .optional()
            .map_err(storage)?;
        if let Some(id) = inserted {
            return Ok(id);
        }
        transactions::table
            .filter(transactions::hash.eq(&tx.hash))
            .filter(transactions::chain_id.eq(&tx.chain.chain_id))
            .select(transactions::id)
            .first(&mut conn)
            .await
            .map_err(storage)
    }

    async fn get_transaction(&self, id: RecordId) -> OracleResult<Option<Transaction>> {
        let mut conn = self.conn().await?;
        transactions::table
            .find(id)
            .select(TransactionRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(storage)?
            .map(Transaction::try_from)
            .transpose()
    }

    async fn update_transaction(
        &self,
        id: RecordId,
        hash: &str,
        update: TransactionUpdate,
    ) -> OracleResult<()> {
        let mut conn = self.conn().await?;
        let changeset = TransactionChangeset {
            status: update.status.map(|s| s.to_string()),
            confirmations: update.confirmations.map(|c| c as i64),
            refund_id: update.refund_id,
            updated_at_ms: now_ms(),
        };
        let updated = diesel::update(
            transactions::table
                .filter(transactions::id.eq(id))
                .filter(transactions::hash.eq(hash)),
        )
        .set(&changeset)
        .execute(&mut conn)
        .await
        .map_err(storage)?;
        if updated == 0 {
            return Err(OracleError::Storage(format!("transaction {id} not found")));
        }
        if let Some(message_id) = update.message_id {
            diesel::sql_query(
                "UPDATE transactions SET message_ids = array_append(message_ids, $1) \
                 WHERE id = $2 AND NOT ($1 = ANY(message_ids))",
            )
            .bind::<BigInt, _>(message_id)
            .bind::<BigInt, _>(id)
            .execute(&mut conn)
            .await
            .map_err(storage)?;
        }
        Ok(())
    }

    async fn find_pending_transactions_to(
        &self,
        chain_id: &str,
        to_address: &str,
    ) -> OracleResult<Vec<Transaction>> {
        let mut conn = self.conn().await?;
        let rows = transactions::table
            .filter(transactions::chain_id.eq(chain_id))
            .filter(transactions::to_address.eq(to_address))
            .filter(transactions::status.eq(TransactionStatus::Pending.to_string()))
            .order(transactions::id.asc())
            .select(TransactionRow::as_select())
            .load(&mut conn)
            .await
            .map_err(storage)?;
        convert_all(rows)
    }

    async fn find_pending_transactions_from(
        &self,
        chain_id: &str,
        from_address: &str,
    ) -> OracleResult<Vec<Transaction>> {
        let mut conn = self.conn().await?;
        let rows = transactions::table
            .filter(transactions::chain_id.eq(chain_id))
            .filter(transactions::from_address.eq(from_address))
            .filter(transactions::status.eq(TransactionStatus::Pending.to_string()))
            .order(transactions::id.asc())
            .select(TransactionRow::as_select())
            .load(&mut conn)
            .await
            .map_err(storage)?;
        convert_all(rows)
    }

    async fn find_confirmed_transactions_to(
        &self,
        chain_id: &str,
        to_address: &str,
    ) -> OracleResult<Vec<Transaction>> {
        let mut conn = self.conn().await?;
        let rows = transactions::table
            .filter(transactions::chain_id.eq(chain_id))
            .filter(transactions::to_address.eq(to_address))
            .filter(transactions::status.eq(TransactionStatus::Confirmed.to_string()))
            .filter(transactions::refund_id.is_null())
            .filter(transactions::message_ids.eq(Vec::<i64>::new()))
            .order(transactions::id.asc())
            .select(TransactionRow::as_select())
            .load(&mut conn)
            .await
            .map_err(storage)?;
        convert_all(rows)
    }

    async fn insert_message(&self, message: NewMessage) -> OracleResult<RecordId> {
        let mut conn = self.conn().await?;
        let now = now_ms();
        let message_id = message.content.message_id_hex();
        let row = NewMessageRow {
            origin_transaction_id: message.origin_transaction_id,
            origin_transaction_hash: message.origin_transaction_hash,
            message_id: message_id.clone(),
            chain_id: message.chain.chain_id,
            chain_domain: message.chain.chain_domain as i64,
            chain_type: message.chain.chain_type.to_string(),
            content: serde_json::to_value(&message.content).map_err(storage)?,
            transaction_body: String::new(),
            signatures: serde_json::json!([]),
            sequence: None,
            status: MessageStatus::Pending.to_string(),
            created_at_ms: now,
            updated_at_ms: now,
        };
        let inserted: Option<i64> = diesel::insert_into(messages::table)
            .values(&row)
            .on_conflict(messages::message_id)
            .do_nothing()
            .returning(messages::id)
            .get_result(&mut conn)
            .await
            .optional()
            .map_err(storage)?;
        if let Some(id) = inserted {
            return Ok(id);
        }
        messages::table
            .filter(messages::message_id.eq(&message_id))
            .select(messages::id)
            .first(&mut conn)
            .await
            .map_err(storage)
    }

    async fn get_message(&self, id: RecordId) -> OracleResult<Option<Message>> {
        let mut conn = self.conn().await?;
        messages::table
            .find(id)
            .select(MessageRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(storage)?
            .map(Message::try_from)
            .transpose()
    }

    async fn update_message(&self, id: RecordId, update: SigningUpdate) -> OracleResult<()> {
        let mut conn = self.conn().await?;
        let columns = SigningColumns::new(update)?;
        let changeset = MessageChangeset {
            status: columns.status,
            signatures: columns.signatures,
            transaction_body: columns.transaction_body,
            sequence: columns.sequence,
            transaction_id: columns.transaction_id,
            transaction_hash: columns.transaction_hash,
            updated_at_ms: now_ms(),
        };
        let updated = diesel::update(messages::table.find(id))
            .set(&changeset)
            .execute(&mut conn)
            .await
            .map_err(storage)?;
        if updated == 0 {
            return Err(OracleError::Storage(format!("message {id} not found")));
        }
        Ok(())
    }

    async fn find_pending_messages(
        &self,
        signer: &str,
        chain_id: &str,
    ) -> OracleResult<Vec<Message>> {
        let mut conn = self.conn().await?;
        let rows = messages::table
            .filter(messages::chain_id.eq(chain_id))
            .filter(messages::status.eq(MessageStatus::Pending.to_string()))
            .filter(not(messages::signatures.contains(serde_json::json!([{ "signer": signer }]))))
            .order(messages::id.asc())
            .select(MessageRow::as_select())
            .load(&mut conn)
            .await
            .map_err(storage)?;
        convert_all(rows)
    }

    async fn find_signed_messages(&self, chain_id: &str) -> OracleResult<Vec<Message>> {
        let mut conn = self.conn().await?;
        let rows = messages::table
            .filter(messages::chain_id.eq(chain_id))
            .filter(messages::status.eq(MessageStatus::Signed.to_string()))
            .order(messages::id.asc())
            .select(MessageRow::as_select())
            .load(&mut conn)
            .await
            .map_err(storage)?;
        convert_all(rows)
    }

    async fn find_broadcasted_messages_without_tx(
        &self,
        chain_id: &str,
    ) -> OracleResult<Vec<Message>> {
        let mut conn = self.conn().await?;
        let rows = messages::table
            .filter(messages::chain_id.eq(chain_id))
            .filter(messages::status.eq(MessageStatus::Broadcasted.to_string()))
            .filter(messages::transaction_id.is_null())
            .order(messages::id.asc())
            .select(MessageRow::as_select())
            .load(&mut conn)
            .await
            .map_err(storage)?;
        convert_all(rows)
    }

    async fn find_messages_by_transaction_hash(&self, hash: &str) -> OracleResult<Vec<Message>> {
        let mut conn = self.conn().await?;
        let rows = messages::table
            .filter(messages::transaction_hash.eq(hash))
            .order(messages::id.asc())
            .select(MessageRow::as_select())
            .load(&mut conn)
            .await
            .map_err(storage)?;
        convert_all(rows)
    }

    async fn insert_refund(&self, refund: NewRefund) -> OracleResult<RecordId> {
        let mut conn = self.conn().await?;
        let now = now_ms();
        let row = NewRefundRow {
            origin_transaction_id: refund.origin_transaction_id,
            origin_transaction_hash: refund.origin_transaction_hash.clone(),
            recipient_address: refund.recipient_address,
            amount: refund.amount.to_string(),
            chain_id: refund.chain.chain_id,
            chain_domain: refund.chain.chain_domain as i64,
            transaction_body: String::new(),
            signatures: serde_json::json!([]),
            sequence: None,
            status: MessageStatus::Pending.to_string(),
            created_at_ms: now,
            updated_at_ms: now,
        };
        let inserted: Option<i64> = diesel::insert_into(refunds::table)
            .values(&row)
            .on_conflict(refunds::origin_transaction_hash)
            .do_nothing()
            .returning(refunds::id)
            .get_result(&mut conn)
            .await
            .optional()
            .map_err(storage)?;
        if let Some(id) = inserted {
            return Ok(id);
        }
        refunds::table
            .filter(refunds::origin_transaction_hash.eq(&refund.origin_transaction_hash))
            .select(refunds::id)
            .first(&mut conn)
            .await
            .map_err(storage)
    }

    async fn get_refund(&self, id: RecordId) -> OracleResult<Option<Refund>> {
        let mut conn = self.conn().await?;
        refunds::table
            .find(id)
            .select(RefundRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(storage)?
            .map(Refund::try_from)
            .transpose()
    }

    async fn update_refund(&self, id: RecordId, update: SigningUpdate) -> OracleResult<()> {
        let mut conn = self.conn().await?;
        let columns = SigningColumns::new(update)?;
        let changeset = RefundChangeset {
            status: columns.status,
            signatures: columns.signatures,
            transaction_body: columns.transaction_body,
            sequence: columns.sequence,
            transaction_id: columns.transaction_id,
            transaction_hash: columns.transaction_hash,
            updated_at_ms: now_ms(),
        };
        let updated = diesel::update(refunds::table.find(id))
            .set(&changeset)
            .execute(&mut conn)
            .await
            .map_err(storage)?;
        if updated == 0 {
            return Err(OracleError::Storage(format!("refund {id} not found")));
        }
        Ok(())
    }

    async fn find_pending_refunds(
        &self,
        signer: &str,
        chain_id: &str,
    ) -> OracleResult<Vec<Refund>> {
        let mut conn = self.conn().await?;
        let rows = refunds::table
            .filter(refunds::chain_id.eq(chain_id))
            .filter(refunds::status.eq(MessageStatus::Pending.to_string()))
            .filter(not(refunds::signatures.contains(serde_json::json!([{ "signer": signer }]))))
            .order(refunds::id.asc())
            .select(RefundRow::as_select())
            .load(&mut conn)
            .await
            .map_err(storage)?;
        convert_all(rows)
    }

    async fn find_signed_refunds(&self, chain_id: &str) -> OracleResult<Vec<Refund>> {
        let mut conn = self.conn().await?;
        let rows = refunds::table
            .filter(refunds::chain_id.eq(chain_id))
            .filter(refunds::status.eq(MessageStatus::Signed.to_string()))
            .order(refunds::id.asc())
            .select(RefundRow::as_select())
            .load(&mut conn)
            .await
            .map_err(storage)?;
        convert_all(rows)
    }

    async fn find_broadcasted_refunds_without_tx(
        &self,
        chain_id: &str,
    ) -> OracleResult<Vec<Refund>> {
        let mut conn = self.conn().await?;
        let rows = refunds::table
            .filter(refunds::chain_id.eq(chain_id))
            .filter(refunds::status.eq(MessageStatus::Broadcasted.to_string()))
            .filter(refunds::transaction_id.is_null())
            .order(refunds::id.asc())
            .select(RefundRow::as_select())
            .load(&mut conn)
            .await
            .map_err(storage)?;
        convert_all(rows)
    }

    async fn find_refunds_by_transaction_hash(&self, hash: &str) -> OracleResult<Vec<Refund>> {
        let mut conn = self.conn().await?;
        let rows = refunds::table
            .filter(refunds::transaction_hash.eq(hash))
            .order(refunds::id.asc())
            .select(RefundRow::as_select())
            .load(&mut conn)
            .await
            .map_err(storage)?;
        convert_all(rows)
    }

    async fn max_sequence(&self, chain_id: &str) -> OracleResult<Option<u64>> {
        let mut conn = self.conn().await?;
        let messages_max: Option<i64> = messages::table
            .filter(messages::chain_id.eq(chain_id))
            .select(max(messages::sequence))
            .first(&mut conn)
            .await
            .map_err(storage)?;
        let refunds_max: Option<i64> = refunds::table
            .select(max(refunds::sequence))
            .first(&mut conn)
            .await
            .map_err(storage)?;
        Ok(messages_max.max(refunds_max).map(|s| s as u64))
    }

    async fn assigned_sequences(&self, chain_id: &str, from: u64) -> OracleResult<Vec<u64>> {
        let from = from as i64;
        let mut conn = self.conn().await?;
        let mut held: Vec<Option<i64>> = messages::table
            .filter(messages::chain_id.eq(chain_id))
            .filter(messages::sequence.ge(from))
            .select(messages::sequence)
            .load(&mut conn)
            .await
            .map_err(storage)?;
        held.extend(
            refunds::table
                .filter(refunds::sequence.ge(from))
                .select(refunds::sequence)
                .load::<Option<i64>>(&mut conn)
                .await
                .map_err(storage)?,
        );
        let mut held: Vec<u64> = held.into_iter().flatten().map(|s| s as u64).collect();
        held.sort_unstable();
        held.dedup();
        Ok(held)
    }

    async fn xlock(&self, resource_id: &str) -> OracleResult<String> {
        self.acquire(resource_id, true).await
    }

    async fn slock(&self, resource_id: &str) -> OracleResult<String> {
        self.acquire(resource_id, false).await
    }

    async fn unlock(&self, lock_id: &str) -> OracleResult<()> {
        let mut conn = self.conn().await?;
        diesel::delete(locks::table.filter(locks::lock_id.eq(lock_id)))
            .execute(&mut conn)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn read_progress(&self, task_name: &str) -> OracleResult<Option<u64>> {
        let mut conn = self.conn().await?;
        let block: Option<i64> = progress_store::table
            .filter(progress_store::task_name.eq(task_name))
            .select(progress_store::block_number)
            .first(&mut conn)
            .await
            .optional()
            .map_err(storage)?;
        Ok(block.map(|b| b as u64))
    }

    async fn write_progress(&self, task_name: &str, block_height: u64) -> OracleResult<()> {
        use diesel::dsl::now;

        let mut conn = self.conn().await?;
        diesel::insert_into(progress_store::table)
            .values((
                progress_store::task_name.eq(task_name),
                progress_store::block_number.eq(block_height as i64),
                progress_store::target_block.eq(LIVE_TASK_TARGET_BLOCK),
                progress_store::timestamp.eq(now),
            ))
            .on_conflict(progress_store::task_name)
            .do_update()
            .set((
                progress_store::block_number.eq(block_height as i64),
                progress_store::timestamp.eq(now),
            ))
            .execute(&mut conn)
            .await
            .map_err(storage)?;
        debug!("Progress of '{}' is now {}", task_name, block_height);
        Ok(())
    }
}
