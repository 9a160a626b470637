// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Classifies Cosmos transactions sent to the vault.
//!
//! Only message-execution events are counted when the chain tags them with
//! `msg_index`, so fee deduction events from the ante handler never inflate
//! the spent total. On chains that do not tag events every event counts.
//!
//! A deposit is only mintable when its memo, sender and hash can all be
//! carried in a message. Anything else is refunded.

use ethers::types::Address;
use serde::{Deserialize, Serialize};

use super::tx::{parse_coins, TxResponse};
use crate::crypto::decode_bech32_address;
use crate::encoding::nonce_from_tx_hash;
use crate::types::TransactionStatus;

const MSG_INDEX: &str = "msg_index";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorConfig {
    pub vault_address: String,
    pub bech32_prefix: String,
    pub coin_denom: String,
    pub tx_fee: u128,
    pub confirmations: u64,
    /// EVM chain ids a memo may target.
    pub supported_chain_ids: Vec<String>,
}

/// Destination requested in the deposit memo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintMemo {
    pub address: String,
    pub chain_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateTxResult {
    pub tx_hash: String,
    pub status: TransactionStatus,
    pub confirmations: u64,
    /// Total received by the vault in the configured denom.
    pub amount: u128,
    pub sender_address: String,
    pub memo: Option<MintMemo>,
    pub needs_refund: bool,
    pub tx: TxResponse,
}

impl ValidateTxResult {
    fn new(tx: &TxResponse, status: TransactionStatus) -> Self {
        Self {
            tx_hash: tx.txhash.clone(),
            status,
            confirmations: 0,
            amount: 0,
            sender_address: String::new(),
            memo: None,
            needs_refund: false,
            tx: tx.clone(),
        }
    }
}

pub fn validate_tx_to_vault(
    tx: &TxResponse,
    config: &ValidatorConfig,
    current_height: u64,
) -> ValidateTxResult {
    let mut result = ValidateTxResult::new(tx, TransactionStatus::Invalid);

    let Some(sender) = tx
        .events_of("message")
        .find_map(|e| e.attribute("sender"))
        .filter(|s| !s.is_empty())
    else {
        return result;
    };
    result.sender_address = sender.to_string();

    if tx.code != 0 {
        result.status = TransactionStatus::Failed;
        return result;
    }

    let tagged = tx
        .events
        .iter()
        .any(|e| e.attribute(MSG_INDEX).is_some());
    let counted = move |kind: &'static str| {
        tx.events_of(kind)
            .filter(move |e| !tagged || e.attribute(MSG_INDEX).is_some())
    };

    let mut received: u128 = 0;
    for event in counted("coin_received") {
        if event.attribute("receiver") != Some(config.vault_address.as_str()) {
            continue;
        }
        match sum_denom(event.attribute("amount"), &config.coin_denom) {
            Some(amount) => received = received.saturating_add(amount),
            None => return result,
        }
    }

    let mut spent: u128 = 0;
    let mut spenders = Vec::new();
    for event in counted("coin_spent") {
        match sum_denom(event.attribute("amount"), &config.coin_denom) {
            Some(0) => continue,
            Some(amount) => spent = spent.saturating_add(amount),
            None => return result,
        }
        spenders.push(event.attribute("spender").unwrap_or_default());
    }

    if received == 0 || spent == 0 || received <= config.tx_fee {
        return result;
    }
    if spenders.iter().any(|s| *s != sender) {
        return result;
    }

    result.amount = received;
    result.confirmations = current_height.saturating_sub(tx.height);
    result.status = if result.confirmations < config.confirmations {
        TransactionStatus::Pending
    } else {
        TransactionStatus::Confirmed
    };

    if spent != received {
        result.needs_refund = true;
        return result;
    }

    match parse_memo(tx.memo(), &config.supported_chain_ids) {
        Some(memo) if is_mintable_origin(tx, sender, config) => result.memo = Some(memo),
        _ => result.needs_refund = true,
    }
    result
}

// The message carries the sender as a 20-byte address and derives its nonce
// from the deposit hash.
fn is_mintable_origin(tx: &TxResponse, sender: &str, config: &ValidatorConfig) -> bool {
    decode_bech32_address(&config.bech32_prefix, sender).is_ok()
        && nonce_from_tx_hash(&tx.txhash).is_ok()
}

fn sum_denom(amount: Option<&str>, denom: &str) -> Option<u128> {
    let coins = parse_coins(amount?).ok()?;
    Some(
        coins
            .into_iter()
            .filter(|(_, d)| d == denom)
            .map(|(a, _)| a)
            .sum(),
    )
}

/// Parses `{"address": "0x..", "chain_id": ".."}`, normalizing the address to
/// lower case. Returns `None` for anything that cannot be minted.
pub fn parse_memo(memo: &str, supported_chain_ids: &[String]) -> Option<MintMemo> {
    let memo: MintMemo = serde_json::from_str(memo.trim()).ok()?;
    let address = memo.address.trim();
    if !address.starts_with("0x") {
        return None;
    }
    let parsed: Address = address.parse().ok()?;
    if parsed.is_zero() {
        return None;
    }
    let chain_id = memo.chain_id.trim();
    chain_id.parse::<u64>().ok()?;
    if !supported_chain_ids.iter().any(|c| c == chain_id) {
        return None;
    }
    Some(MintMemo {
        address: format!("{parsed:#x}"),
        chain_id: chain_id.to_string(),
    })
}

/// Outcome of an outbound transaction sent from the vault.
pub fn outbound_status(
    tx: &TxResponse,
    required_confirmations: u64,
    current_height: u64,
) -> (TransactionStatus, u64) {
    if tx.code != 0 {
        return (TransactionStatus::Failed, 0);
    }
    let confirmations = current_height.saturating_sub(tx.height);
    if confirmations < required_confirmations {
        (TransactionStatus::Pending, confirmations)
    } else {
        (TransactionStatus::Confirmed, confirmations)
    }
}
