// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Hyperlane-style message layout.
//!
//! ```text
//! version(1) | nonce(4) | origin(4) | sender(32) | destination(4) | recipient(32) | body
//! body = recipient_address(32) | amount(32) | sender_address(32)
//! ```
//!
//! All integers are big-endian; 20-byte addresses are left padded to 32 bytes.

use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

use crate::error::{OracleError, OracleResult};

pub const MESSAGE_VERSION: u8 = 3;
const HEADER_LEN: usize = 1 + 4 + 4 + 32 + 4 + 32;
const BODY_LEN: usize = 32 * 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub recipient_address: Address,
    pub amount: U256,
    pub sender_address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    pub version: u8,
    pub nonce: u32,
    pub origin_domain: u32,
    pub sender: H256,
    pub destination_domain: u32,
    pub recipient: H256,
    pub body: MessageBody,
}

impl MessageBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BODY_LEN);
        out.extend_from_slice(H256::from(self.recipient_address).as_bytes());
        let mut amount = [0u8; 32];
        self.amount.to_big_endian(&mut amount);
        out.extend_from_slice(&amount);
        out.extend_from_slice(H256::from(self.sender_address).as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> OracleResult<Self> {
        if bytes.len() != BODY_LEN {
            return Err(OracleError::InvalidTransaction(format!(
                "message body must be {} bytes, got {}",
                BODY_LEN,
                bytes.len()
            )));
        }
        Ok(Self {
            recipient_address: Address::from(H256::from_slice(&bytes[0..32])),
            amount: U256::from_big_endian(&bytes[32..64]),
            sender_address: Address::from(H256::from_slice(&bytes[64..96])),
        })
    }
}

impl MessageContent {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + BODY_LEN);
        out.push(self.version);
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.origin_domain.to_be_bytes());
        out.extend_from_slice(self.sender.as_bytes());
        out.extend_from_slice(&self.destination_domain.to_be_bytes());
        out.extend_from_slice(self.recipient.as_bytes());
        out.extend_from_slice(&self.body.encode());
        out
    }

    pub fn decode(bytes: &[u8]) -> OracleResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(OracleError::InvalidTransaction(format!(
                "message too short: {} bytes",
                bytes.len()
            )));
        }
        let u32_at = |offset: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[offset..offset + 4]);
            u32::from_be_bytes(buf)
        };
        Ok(Self {
            version: bytes[0],
            nonce: u32_at(1),
            origin_domain: u32_at(5),
            sender: H256::from_slice(&bytes[9..41]),
            destination_domain: u32_at(41),
            recipient: H256::from_slice(&bytes[45..77]),
            body: MessageBody::decode(&bytes[HEADER_LEN..])?,
        })
    }

    pub fn message_id(&self) -> H256 {
        H256::from(keccak256(self.encode()))
    }

    /// 0x-prefixed lower-case hex of [`Self::message_id`].
    pub fn message_id_hex(&self) -> String {
        format!("{:#x}", self.message_id())
    }
}

/// Nonce for messages created from a Cosmos deposit: the leading four bytes of
/// the deposit's transaction hash.
pub fn nonce_from_tx_hash(tx_hash: &str) -> OracleResult<u32> {
    let bytes = hex::decode(tx_hash.trim_start_matches("0x"))
        .map_err(|e| OracleError::InvalidTransaction(format!("bad tx hash {tx_hash}: {e}")))?;
    if bytes.len() < 4 {
        return Err(OracleError::InvalidTransaction(format!(
            "tx hash too short: {tx_hash}"
        )));
    }
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MessageContent {
        MessageContent {
            version: MESSAGE_VERSION,
            nonce: 0xdeadbeef,
            origin_domain: 1000,
            sender: H256::from(Address::repeat_byte(0x11)),
            destination_domain: 1,
            recipient: H256::from(Address::repeat_byte(0x22)),
            body: MessageBody {
                recipient_address: Address::repeat_byte(0xab),
                amount: U256::from(900u64),
                sender_address: Address::repeat_byte(0xcd),
            },
        }
    }

    #[test]
    fn test_layout_offsets() {
        let encoded = sample().encode();
        assert_eq!(encoded.len(), 77 + 96);
        assert_eq!(encoded[0], MESSAGE_VERSION);
        assert_eq!(&encoded[1..5], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&encoded[5..9], &1000u32.to_be_bytes());
        assert_eq!(&encoded[41..45], &1u32.to_be_bytes());
        // amount is the second body word
        assert_eq!(encoded[77 + 63], 0x84);
        assert_eq!(encoded[77 + 62], 0x03);
        assert_eq!(MessageContent::decode(&encoded).unwrap(), sample());
    }

    #[test]
    fn test_message_id_changes_with_content() {
        let a = sample();
        let mut b = sample();
        b.body.amount = U256::from(901u64);
        assert_ne!(a.message_id(), b.message_id());
        assert_eq!(a.message_id_hex().len(), 66);
        assert!(a.message_id_hex().starts_with("0x"));
    }

    #[test]
    fn test_decode_rejects_truncated_body() {
        let mut encoded = sample().encode();
        encoded.truncate(100);
        assert!(MessageContent::decode(&encoded).is_err());
    }

    #[test]
    fn test_nonce_from_tx_hash() {
        assert_eq!(
            nonce_from_tx_hash("0A0B0C0D0E0F").unwrap(),
            0x0a0b0c0d
        );
        assert!(nonce_from_tx_hash("0A0B").is_err());
        assert!(nonce_from_tx_hash("zz").is_err());
    }
}
