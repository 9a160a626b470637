// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    // Deposit does not qualify for bridging (missing events, zero amounts, fee not covered)
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
    // Evidence amount differs from the amount in the record
    #[error("amount mismatch: expected {expected}, got {actual}")]
    AmountMismatch { expected: String, actual: String },
    // Evidence sender differs from the sender in the record
    #[error("sender mismatch: expected {expected}, got {actual}")]
    SenderMismatch { expected: String, actual: String },
    // Memo cannot be used as a destination
    #[error("invalid memo: {0}")]
    InvalidMemo(String),
    // Destination chain is not configured
    #[error("unsupported chain: {0}")]
    UnsupportedChain(String),
    // The referenced transaction does not exist
    #[error("transaction not found: {0}")]
    TxNotFound(String),
    // The referenced transaction exists but lacks confirmations
    #[error("transaction {hash} has {confirmations} of {required} confirmations")]
    TxNotConfirmed {
        hash: String,
        confirmations: u64,
        required: u64,
    },
    // The referenced transaction failed on chain
    #[error("origin transaction failed: {0}")]
    OriginTxFailed(String),
    // No dispatch event for the message in the origin transaction
    #[error("dispatch event not found: {0}")]
    DispatchEventNotFound(String),
    // Chain RPC failure
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("timed out: {0}")]
    Timeout(String),
    // Store failure
    #[error("storage error: {0}")]
    Storage(String),
    // Someone else holds the lock
    #[error("lock not acquired: {0}")]
    LockNotAcquired(String),
    #[error("invalid signature from {signer}: {reason}")]
    InvalidSignature { signer: String, reason: String },
    // Another record already holds the allocated sequence
    #[error("sequence conflict on {chain_id}: {sequence}")]
    SequenceConflict { chain_id: String, sequence: u64 },
    #[error("insufficient signatures: {have} of {threshold}")]
    InsufficientSignatures { have: usize, threshold: usize },
    // This oracle already contributed a signature
    #[error("already signed by {0}")]
    AlreadySigned(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("{0}")]
    Generic(String),
}

pub type OracleResult<T> = Result<T, OracleError>;

impl OracleError {
    /// Stable label for metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            OracleError::InvalidTransaction(_) => "invalid_transaction",
            OracleError::AmountMismatch { .. } => "amount_mismatch",
            OracleError::SenderMismatch { .. } => "sender_mismatch",
            OracleError::InvalidMemo(_) => "invalid_memo",
            OracleError::UnsupportedChain(_) => "unsupported_chain",
            OracleError::TxNotFound(_) => "tx_not_found",
            OracleError::TxNotConfirmed { .. } => "tx_not_confirmed",
            OracleError::OriginTxFailed(_) => "origin_tx_failed",
            OracleError::DispatchEventNotFound(_) => "dispatch_event_not_found",
            OracleError::Rpc(_) => "rpc_error",
            OracleError::Timeout(_) => "timeout",
            OracleError::Storage(_) => "storage_error",
            OracleError::LockNotAcquired(_) => "lock_not_acquired",
            OracleError::InvalidSignature { .. } => "invalid_signature",
            OracleError::SequenceConflict { .. } => "sequence_conflict",
            OracleError::InsufficientSignatures { .. } => "insufficient_signatures",
            OracleError::AlreadySigned(_) => "already_signed",
            OracleError::InvalidConfig(_) => "invalid_config",
            OracleError::InvalidKey(_) => "invalid_key",
            OracleError::Generic(_) => "generic",
        }
    }

    /// Errors that leave the record untouched and are retried on the next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OracleError::Rpc(_)
                | OracleError::Timeout(_)
                | OracleError::Storage(_)
                | OracleError::LockNotAcquired(_)
                | OracleError::TxNotConfirmed { .. }
                | OracleError::SequenceConflict { .. }
        )
    }

    /// Errors that make the record permanently `Invalid`.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            OracleError::InvalidTransaction(_)
                | OracleError::AmountMismatch { .. }
                | OracleError::SenderMismatch { .. }
                | OracleError::InvalidMemo(_)
                | OracleError::UnsupportedChain(_)
                | OracleError::TxNotFound(_)
                | OracleError::OriginTxFailed(_)
                | OracleError::DispatchEventNotFound(_)
        )
    }
}

impl From<tokio::time::error::Elapsed> for OracleError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        OracleError::Timeout(e.to_string())
    }
}

impl From<serde_json::Error> for OracleError {
    fn from(e: serde_json::Error) -> Self {
        OracleError::Generic(format!("serde_json: {e}"))
    }
}

impl From<anyhow::Error> for OracleError {
    fn from(e: anyhow::Error) -> Self {
        OracleError::Storage(format!("{e:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_labels() {
        let cases = vec![
            (OracleError::TxNotFound("0x1".into()), "tx_not_found"),
            (OracleError::Rpc("down".into()), "rpc_error"),
            (OracleError::LockNotAcquired("messages/1".into()), "lock_not_acquired"),
            (
                OracleError::SequenceConflict {
                    chain_id: "poktroll".into(),
                    sequence: 7,
                },
                "sequence_conflict",
            ),
            (OracleError::AlreadySigned("02ab".into()), "already_signed"),
            (OracleError::InvalidConfig("x".into()), "invalid_config"),
        ];
        for (err, label) in cases {
            assert_eq!(err.error_type(), label);
            assert!(label.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }

    #[test]
    fn test_error_classification() {
        assert!(OracleError::Timeout("rpc".into()).is_transient());
        assert!(OracleError::LockNotAcquired("r".into()).is_transient());
        assert!(!OracleError::InvalidMemo("bad".into()).is_transient());
        assert!(OracleError::InvalidMemo("bad".into()).is_validation());
        assert!(OracleError::SenderMismatch {
            expected: "a".into(),
            actual: "b".into()
        }
        .is_validation());
        assert!(!OracleError::InvalidSignature {
            signer: "s".into(),
            reason: "r".into()
        }
        .is_validation());
    }

    #[test]
    fn test_display_includes_context() {
        let err = OracleError::TxNotConfirmed {
            hash: "ABCD".into(),
            confirmations: 2,
            required: 5,
        };
        assert_eq!(err.to_string(), "transaction ABCD has 2 of 5 confirmations");
    }
}
