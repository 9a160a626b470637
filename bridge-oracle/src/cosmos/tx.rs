// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cosmos transaction model: REST responses we read, and the legacy amino
//! JSON documents we sign and broadcast from the vault multisig.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use sha2::{Digest, Sha256};

use crate::crypto::MultisigPublicKey;
use crate::error::{OracleError, OracleResult};

pub const MSG_SEND_TYPE: &str = "cosmos-sdk/MsgSend";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EventAttribute {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attributes: Vec<EventAttribute>,
}

impl Event {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct TxBodyJson {
    #[serde(default)]
    pub memo: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct TxJson {
    #[serde(default)]
    pub body: TxBodyJson,
}

/// `tx_response` as returned by the REST gateway.
#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TxResponse {
    #[serde_as(as = "DisplayFromStr")]
    pub height: u64,
    pub txhash: String,
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub raw_log: String,
    #[serde(default)]
    pub tx: Option<TxJson>,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl TxResponse {
    pub fn memo(&self) -> &str {
        self.tx.as_ref().map(|t| t.body.memo.as_str()).unwrap_or("")
    }

    pub fn events_of<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Event> + 'a {
        self.events.iter().filter(move |e| e.kind == kind)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccountInfo {
    pub account_number: u64,
    pub sequence: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Coin {
    pub denom: String,
    pub amount: String,
}

impl Coin {
    pub fn new(amount: u128, denom: &str) -> Self {
        Self {
            denom: denom.to_string(),
            amount: amount.to_string(),
        }
    }
}

/// Parses a coin list such as `"1000upokt,5stake"`.
pub fn parse_coins(value: &str) -> OracleResult<Vec<(u128, String)>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|coin| {
            let split = coin
                .find(|c: char| !c.is_ascii_digit())
                .ok_or_else(|| OracleError::InvalidTransaction(format!("coin without denom: {coin}")))?;
            let (amount, denom) = coin.split_at(split);
            let amount = amount
                .parse::<u128>()
                .map_err(|e| OracleError::InvalidTransaction(format!("coin {coin}: {e}")))?;
            Ok((amount, denom.to_string()))
        })
        .collect()
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StdFee {
    pub amount: Vec<Coin>,
    pub gas: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MsgSend {
    pub from_address: String,
    pub to_address: String,
    pub amount: Vec<Coin>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AminoMsg {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: MsgSend,
}

/// Unsigned transaction body persisted with the record. Account number and
/// sequence are supplied separately at signing and verification time.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UnsignedTx {
    pub fee: StdFee,
    pub msgs: Vec<AminoMsg>,
    pub memo: String,
}

#[derive(Serialize)]
struct StdSignDoc<'a> {
    account_number: String,
    chain_id: &'a str,
    fee: &'a StdFee,
    memo: &'a str,
    msgs: &'a [AminoMsg],
    sequence: String,
}

impl UnsignedTx {
    /// Single bank send out of the vault. `fee` is paid on top of `amount`.
    pub fn send(
        from: &str,
        to: &str,
        amount: u128,
        denom: &str,
        fee: u128,
        gas_limit: u64,
        memo: impl Into<String>,
    ) -> Self {
        Self {
            fee: StdFee {
                amount: vec![Coin::new(fee, denom)],
                gas: gas_limit.to_string(),
            },
            msgs: vec![AminoMsg {
                kind: MSG_SEND_TYPE.to_string(),
                value: MsgSend {
                    from_address: from.to_string(),
                    to_address: to.to_string(),
                    amount: vec![Coin::new(amount, denom)],
                },
            }],
            memo: memo.into(),
        }
    }

    pub fn from_json(body: &str) -> OracleResult<Self> {
        serde_json::from_str(body)
            .map_err(|e| OracleError::Generic(format!("unparsable transaction body: {e}")))
    }

    pub fn to_json(&self) -> OracleResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Addresses whose signatures the transaction requires.
    pub fn signers(&self) -> Vec<&str> {
        let mut signers: Vec<&str> = Vec::new();
        for msg in &self.msgs {
            if !signers.contains(&msg.value.from_address.as_str()) {
                signers.push(&msg.value.from_address);
            }
        }
        signers
    }

    /// Canonical amino JSON sign bytes: keys sorted, no whitespace.
    pub fn sign_bytes(
        &self,
        chain_id: &str,
        account_number: u64,
        sequence: u64,
    ) -> OracleResult<Vec<u8>> {
        let doc = StdSignDoc {
            account_number: account_number.to_string(),
            chain_id,
            fee: &self.fee,
            memo: &self.memo,
            msgs: &self.msgs,
            sequence: sequence.to_string(),
        };
        // round trip through Value, whose maps are ordered, to sort nested keys
        let value = serde_json::to_value(doc)?;
        Ok(serde_json::to_vec(&value)?)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CompactBitArray {
    pub extra_bits_stored: u32,
    /// base64
    pub elems: String,
}

impl CompactBitArray {
    pub fn from_indices(size: usize, indices: &[usize]) -> Self {
        let mut elems = vec![0u8; size.div_ceil(8)];
        for &i in indices {
            elems[i / 8] |= 0x80 >> (i % 8);
        }
        Self {
            extra_bits_stored: (size % 8) as u32,
            elems: BASE64.encode(elems),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PubKeyJson {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: serde_json::Value,
}

impl PubKeyJson {
    pub fn multisig(key: &MultisigPublicKey) -> Self {
        let keys: Vec<serde_json::Value> = key
            .public_keys
            .iter()
            .map(|k| {
                serde_json::json!({
                    "type": "tendermint/PubKeySecp256k1",
                    "value": BASE64.encode(k),
                })
            })
            .collect();
        Self {
            kind: "tendermint/PubKeyMultisigThreshold".to_string(),
            value: serde_json::json!({
                "threshold": key.threshold.to_string(),
                "pubkeys": keys,
            }),
        }
    }
}

/// Threshold signature: one signature per set bit, in key order.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MultisignatureJson {
    pub bitarray: CompactBitArray,
    /// base64 per signer
    pub signatures: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StdSignature {
    pub pub_key: PubKeyJson,
    pub signature: MultisignatureJson,
    pub account_number: String,
    pub sequence: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StdTx {
    pub msg: Vec<AminoMsg>,
    pub fee: StdFee,
    pub memo: String,
    pub signatures: Vec<StdSignature>,
}

impl StdTx {
    /// Attaches combined signatures, given as `(key index, raw signature)` pairs.
    pub fn assemble(
        body: &UnsignedTx,
        multisig: &MultisigPublicKey,
        mut signatures: Vec<(usize, Vec<u8>)>,
        account_number: u64,
        sequence: u64,
    ) -> Self {
        signatures.sort_by_key(|(i, _)| *i);
        let indices: Vec<usize> = signatures.iter().map(|(i, _)| *i).collect();
        Self {
            msg: body.msgs.clone(),
            fee: body.fee.clone(),
            memo: body.memo.clone(),
            signatures: vec![StdSignature {
                pub_key: PubKeyJson::multisig(multisig),
                signature: MultisignatureJson {
                    bitarray: CompactBitArray::from_indices(multisig.public_keys.len(), &indices),
                    signatures: signatures.iter().map(|(_, s)| BASE64.encode(s)).collect(),
                },
                account_number: account_number.to_string(),
                sequence: sequence.to_string(),
            }],
        }
    }

    pub fn to_bytes(&self) -> OracleResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Upper-case hex SHA-256, the Cosmos transaction hash format.
pub fn tx_hash(tx_bytes: &[u8]) -> String {
    hex::encode_upper(Sha256::digest(tx_bytes))
}
