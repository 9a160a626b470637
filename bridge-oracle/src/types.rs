// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Records shared by every stage of the pipeline.
//!
//! ```text
//!  Transaction (inbound) ──► Message | Refund ──► Transaction (outbound)
//!        Pending                 Pending               Pending
//!        Confirmed ─────────►    Signed                Confirmed / Failed
//!        Failed / Invalid        Broadcasted
//!                                Success / Invalid
//! ```

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use strum_macros::Display;

pub use crate::encoding::{MessageBody, MessageContent};
use crate::error::{OracleError, OracleResult};

pub type RecordId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChainType {
    Cosmos,
    Ethereum,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chain {
    pub chain_id: String,
    pub chain_domain: u32,
    pub chain_type: ChainType,
}

impl Chain {
    pub fn cosmos(chain_id: impl Into<String>, chain_domain: u32) -> Self {
        Self {
            chain_id: chain_id.into(),
            chain_domain,
            chain_type: ChainType::Cosmos,
        }
    }

    /// EVM chains use the numeric chain id as their messaging domain, so the
    /// id has to fit one.
    pub fn ethereum(chain_id: u64) -> OracleResult<Self> {
        let chain_domain = u32::try_from(chain_id).map_err(|_| {
            OracleError::UnsupportedChain(format!(
                "ethereum chain id {chain_id} does not fit a messaging domain"
            ))
        })?;
        Ok(Self {
            chain_id: chain_id.to_string(),
            chain_domain,
            chain_type: ChainType::Ethereum,
        })
    }

    pub fn name(&self) -> String {
        format!("{}:{}", self.chain_type, self.chain_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
    Invalid,
}

/// Lifecycle shared by messages and refunds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Signed,
    Broadcasted,
    Success,
    Invalid,
}

/// Parses the snake_case names written by `Display`, as stored in status columns.
macro_rules! impl_from_display {
    ($ty:ident, [$($variant:ident),+ $(,)?]) => {
        impl FromStr for $ty {
            type Err = OracleError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                [$($ty::$variant),+]
                    .into_iter()
                    .find(|v| v.to_string() == s)
                    .ok_or_else(|| {
                        OracleError::Storage(format!("unknown {} {s:?}", stringify!($ty)))
                    })
            }
        }
    };
}

impl_from_display!(ChainType, [Cosmos, Ethereum]);
impl_from_display!(TransactionStatus, [Pending, Confirmed, Failed, Invalid]);
impl_from_display!(MessageStatus, [Pending, Signed, Broadcasted, Success, Invalid]);

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Success | MessageStatus::Invalid)
    }
}

/// Account sequence attached to an outbound transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Sequence {
    #[default]
    Unassigned,
    Assigned(u64),
}

impl Sequence {
    pub fn assigned(&self) -> Option<u64> {
        match self {
            Sequence::Unassigned => None,
            Sequence::Assigned(s) => Some(*s),
        }
    }

    pub fn is_assigned(&self) -> bool {
        matches!(self, Sequence::Assigned(_))
    }
}

impl From<Option<u64>> for Sequence {
    fn from(value: Option<u64>) -> Self {
        value.map_or(Sequence::Unassigned, Sequence::Assigned)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    /// Hex compressed public key (Cosmos) or lower-case 0x address (EVM).
    pub signer: String,
    /// Hex signature bytes.
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: RecordId,
    pub hash: String,
    pub chain: Chain,
    pub from_address: String,
    pub to_address: String,
    pub block_height: u64,
    pub confirmations: u64,
    pub status: TransactionStatus,
    pub refund_id: Option<RecordId>,
    pub message_ids: Vec<RecordId>,
}

impl Transaction {
    pub fn has_outputs(&self) -> bool {
        self.refund_id.is_some() || !self.message_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub hash: String,
    pub chain: Chain,
    pub from_address: String,
    pub to_address: String,
    pub block_height: u64,
    pub confirmations: u64,
    pub status: TransactionStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionUpdate {
    pub status: Option<TransactionStatus>,
    pub confirmations: Option<u64>,
    pub refund_id: Option<RecordId>,
    /// Appended to `message_ids` if not already present.
    pub message_id: Option<RecordId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RecordKind {
    Message,
    Refund,
}

impl RecordKind {
    pub fn collection(&self) -> &'static str {
        match self {
            RecordKind::Message => "messages",
            RecordKind::Refund => "refunds",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: RecordId,
    pub origin_transaction_id: RecordId,
    pub origin_transaction_hash: String,
    /// 0x-prefixed keccak256 of the encoded content.
    pub message_id: String,
    /// Destination chain.
    pub chain: Chain,
    pub content: MessageContent,
    pub transaction_body: String,
    pub signatures: Vec<Signature>,
    pub sequence: Sequence,
    pub status: MessageStatus,
    pub transaction_id: Option<RecordId>,
    pub transaction_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub origin_transaction_id: RecordId,
    pub origin_transaction_hash: String,
    pub chain: Chain,
    pub content: MessageContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub id: RecordId,
    pub origin_transaction_id: RecordId,
    pub origin_transaction_hash: String,
    /// Bech32 address the funds go back to.
    pub recipient_address: String,
    /// Amount debited from the vault, outbound fee included.
    pub amount: u128,
    pub chain: Chain,
    pub transaction_body: String,
    pub signatures: Vec<Signature>,
    pub sequence: Sequence,
    pub status: MessageStatus,
    pub transaction_id: Option<RecordId>,
    pub transaction_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRefund {
    pub origin_transaction_id: RecordId,
    pub origin_transaction_hash: String,
    pub recipient_address: String,
    pub amount: u128,
    pub chain: Chain,
}

/// Update applied to a message or refund. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SigningUpdate {
    pub status: Option<MessageStatus>,
    pub signatures: Option<Vec<Signature>>,
    pub transaction_body: Option<String>,
    pub sequence: Option<Sequence>,
    pub transaction_id: Option<Option<RecordId>>,
    pub transaction_hash: Option<Option<String>>,
}

impl SigningUpdate {
    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Back to `Pending` with every piece of signing state discarded.
    pub fn reset() -> Self {
        Self {
            status: Some(MessageStatus::Pending),
            signatures: Some(vec![]),
            transaction_body: Some(String::new()),
            sequence: Some(Sequence::Unassigned),
            transaction_id: Some(None),
            transaction_hash: Some(None),
        }
    }
}

/// Common view over the two record kinds that collect signatures.
pub trait Signable {
    fn kind(&self) -> RecordKind;
    fn id(&self) -> RecordId;
    fn origin_transaction_hash(&self) -> &str;
    fn chain(&self) -> &Chain;
    fn signatures(&self) -> &[Signature];
    fn sequence(&self) -> Sequence;
    fn status(&self) -> MessageStatus;
    fn transaction_body(&self) -> &str;
    fn transaction_id(&self) -> Option<RecordId>;
    fn transaction_hash(&self) -> Option<&str>;

    fn has_signed(&self, signer: &str) -> bool {
        self.signatures().iter().any(|s| s.signer == signer)
    }

    fn lock_resource(&self) -> String {
        format!("{}/{}", self.kind().collection(), self.id())
    }
}

macro_rules! impl_signable {
    ($ty:ty, $kind:expr) => {
        impl Signable for $ty {
            fn kind(&self) -> RecordKind {
                $kind
            }
            fn id(&self) -> RecordId {
                self.id
            }
            fn origin_transaction_hash(&self) -> &str {
                &self.origin_transaction_hash
            }
            fn chain(&self) -> &Chain {
                &self.chain
            }
            fn signatures(&self) -> &[Signature] {
                &self.signatures
            }
            fn sequence(&self) -> Sequence {
                self.sequence
            }
            fn status(&self) -> MessageStatus {
                self.status
            }
            fn transaction_body(&self) -> &str {
                &self.transaction_body
            }
            fn transaction_id(&self) -> Option<RecordId> {
                self.transaction_id
            }
            fn transaction_hash(&self) -> Option<&str> {
                self.transaction_hash.as_deref()
            }
        }
    };
}

impl_signable!(Message, RecordKind::Message);
impl_signable!(Refund, RecordKind::Refund);

/// A message or refund, for code paths that treat both alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningRecord {
    Message(Message),
    Refund(Refund),
}

impl SigningRecord {
    fn inner(&self) -> &dyn Signable {
        match self {
            SigningRecord::Message(m) => m,
            SigningRecord::Refund(r) => r,
        }
    }
}

impl Signable for SigningRecord {
    fn kind(&self) -> RecordKind {
        self.inner().kind()
    }
    fn id(&self) -> RecordId {
        self.inner().id()
    }
    fn origin_transaction_hash(&self) -> &str {
        self.inner().origin_transaction_hash()
    }
    fn chain(&self) -> &Chain {
        self.inner().chain()
    }
    fn signatures(&self) -> &[Signature] {
        self.inner().signatures()
    }
    fn sequence(&self) -> Sequence {
        self.inner().sequence()
    }
    fn status(&self) -> MessageStatus {
        self.inner().status()
    }
    fn transaction_body(&self) -> &str {
        self.inner().transaction_body()
    }
    fn transaction_id(&self) -> Option<RecordId> {
        self.inner().transaction_id()
    }
    fn transaction_hash(&self) -> Option<&str> {
        self.inner().transaction_hash()
    }
}

impl From<Message> for SigningRecord {
    fn from(m: Message) -> Self {
        SigningRecord::Message(m)
    }
}

impl From<Refund> for SigningRecord {
    fn from(r: Refund) -> Self {
        SigningRecord::Refund(r)
    }
}

/// Resource name serializing sequence allocation for a chain.
pub fn sequence_resource(chain_id: &str) -> String {
    format!("sequence/{chain_id}")
}

pub fn transaction_resource(id: RecordId) -> String {
    format!("transactions/{id}")
}
