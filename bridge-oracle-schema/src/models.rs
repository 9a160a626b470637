// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Row types for the oracle tables. Domain types live in the oracle crate;
//! these are the flat shapes diesel reads and writes.

use diesel::{AsChangeset, Insertable, Queryable, Selectable};
use serde::{Deserialize, Serialize};

use crate::schema::{locks, messages, refunds, transactions};

#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = transactions, check_for_backend(diesel::pg::Pg))]
pub struct TransactionRow {
    pub id: i64,
    pub hash: String,
    pub chain_id: String,
    pub chain_domain: i64,
    pub chain_type: String,
    pub from_address: String,
    pub to_address: String,
    pub block_height: i64,
    pub confirmations: i64,
    pub status: String,
    pub refund_id: Option<i64>,
    pub message_ids: Vec<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = transactions)]
pub struct NewTransactionRow {
    pub hash: String,
    pub chain_id: String,
    pub chain_domain: i64,
    pub chain_type: String,
    pub from_address: String,
    pub to_address: String,
    pub block_height: i64,
    pub confirmations: i64,
    pub status: String,
    pub refund_id: Option<i64>,
    pub message_ids: Vec<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Partial update of a transaction; `None` fields are left untouched.
#[derive(AsChangeset, Debug, Clone, Default)]
#[diesel(table_name = transactions)]
pub struct TransactionChangeset {
    pub status: Option<String>,
    pub confirmations: Option<i64>,
    pub refund_id: Option<i64>,
    pub updated_at_ms: i64,
}

#[derive(Queryable, Selectable, Debug, Clone, PartialEq)]
#[diesel(table_name = messages, check_for_backend(diesel::pg::Pg))]
pub struct MessageRow {
    pub id: i64,
    pub origin_transaction_id: i64,
    pub origin_transaction_hash: String,
    pub message_id: String,
    pub chain_id: String,
    pub chain_domain: i64,
    pub chain_type: String,
    pub content: serde_json::Value,
    pub transaction_body: String,
    pub signatures: serde_json::Value,
    pub sequence: Option<i64>,
    pub status: String,
    pub transaction_id: Option<i64>,
    pub transaction_hash: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = messages)]
pub struct NewMessageRow {
    pub origin_transaction_id: i64,
    pub origin_transaction_hash: String,
    pub message_id: String,
    pub chain_id: String,
    pub chain_domain: i64,
    pub chain_type: String,
    pub content: serde_json::Value,
    pub transaction_body: String,
    pub signatures: serde_json::Value,
    pub sequence: Option<i64>,
    pub status: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Queryable, Selectable, Debug, Clone, PartialEq)]
#[diesel(table_name = refunds, check_for_backend(diesel::pg::Pg))]
pub struct RefundRow {
    pub id: i64,
    pub origin_transaction_id: i64,
    pub origin_transaction_hash: String,
    pub recipient_address: String,
    pub amount: String,
    pub chain_id: String,
    pub chain_domain: i64,
    pub transaction_body: String,
    pub signatures: serde_json::Value,
    pub sequence: Option<i64>,
    pub status: String,
    pub transaction_id: Option<i64>,
    pub transaction_hash: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = refunds)]
pub struct NewRefundRow {
    pub origin_transaction_id: i64,
    pub origin_transaction_hash: String,
    pub recipient_address: String,
    pub amount: String,
    pub chain_id: String,
    pub chain_domain: i64,
    pub transaction_body: String,
    pub signatures: serde_json::Value,
    pub sequence: Option<i64>,
    pub status: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Partial update of a message or refund. `Some(None)` clears a nullable column.
#[derive(AsChangeset, Debug, Clone, Default)]
#[diesel(table_name = messages)]
pub struct MessageChangeset {
    pub status: Option<String>,
    pub signatures: Option<serde_json::Value>,
    pub transaction_body: Option<String>,
    pub sequence: Option<Option<i64>>,
    pub transaction_id: Option<Option<i64>>,
    pub transaction_hash: Option<Option<String>>,
    pub updated_at_ms: i64,
}

#[derive(AsChangeset, Debug, Clone, Default)]
#[diesel(table_name = refunds)]
pub struct RefundChangeset {
    pub status: Option<String>,
    pub signatures: Option<serde_json::Value>,
    pub transaction_body: Option<String>,
    pub sequence: Option<Option<i64>>,
    pub transaction_id: Option<Option<i64>>,
    pub transaction_hash: Option<Option<String>>,
    pub updated_at_ms: i64,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = locks, check_for_backend(diesel::pg::Pg))]
pub struct LockRow {
    pub lock_id: String,
    pub resource_id: String,
    pub exclusive: bool,
    pub expires_at_ms: i64,
}
