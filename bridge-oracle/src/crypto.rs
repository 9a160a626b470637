// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Key material for both sides of the bridge.
//!
//! Cosmos: secp256k1 keys at `m/44'/118'/0'/0/0`, ECDSA over SHA-256 of the
//! sign bytes, bech32 addresses derived as `ripemd160(sha256(pubkey))`, and a
//! legacy amino threshold multisig account for the vault.
//!
//! Ethereum: secp256k1 keys at `m/44'/60'/0'/0/0`, EIP-191 signatures over
//! the 32-byte message id.

use bech32::{FromBase32, ToBase32, Variant};
use ethers::core::k256::ecdsa::signature::{Signer as _, Verifier as _};
use ethers::core::k256::ecdsa::{Signature as K256Signature, SigningKey, VerifyingKey};
use ethers::core::k256::elliptic_curve::sec1::ToEncodedPoint;
use ethers::core::k256::AffinePoint;
use ethers::signers::{coins_bip39::English, LocalWallet, MnemonicBuilder, Signer as _};
use ethers::types::{Address, RecoveryMessage, Signature as EthSignature, H256};
use ethers::utils::hash_message;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use tap::TapFallible;
use tracing::warn;

use crate::error::{OracleError, OracleResult};

pub const COSMOS_DERIVATION_PATH: &str = "m/44'/118'/0'/0/0";
pub const ETH_DERIVATION_PATH: &str = "m/44'/60'/0'/0/0";

pub type CosmosPublicKeyBytes = [u8; 33];

// amino registered prefixes
const AMINO_MULTISIG_PREFIX: [u8; 4] = [0x22, 0xc1, 0xf7, 0xe2];
const AMINO_SECP256K1_PREFIX: [u8; 4] = [0xeb, 0x5a, 0xe9, 0x87];

fn wallet_from_mnemonic(mnemonic: &str, path: &str) -> OracleResult<LocalWallet> {
    MnemonicBuilder::<English>::default()
        .phrase(mnemonic)
        .derivation_path(path)
        .map_err(|e| OracleError::InvalidKey(format!("derivation path {path}: {e}")))?
        .build()
        .map_err(|e| OracleError::InvalidKey(format!("mnemonic: {e}")))
}

/// Signing key for the Cosmos vault multisig.
#[derive(Clone)]
pub struct CosmosKey {
    signing_key: SigningKey,
}

impl std::fmt::Debug for CosmosKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CosmosKey")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

impl CosmosKey {
    pub fn from_mnemonic(mnemonic: &str) -> OracleResult<Self> {
        let wallet = wallet_from_mnemonic(mnemonic, COSMOS_DERIVATION_PATH)?;
        Ok(Self {
            signing_key: wallet.signer().clone(),
        })
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    pub fn random() -> Self {
        Self::from_signing_key(SigningKey::random(&mut rand::thread_rng()))
    }

    pub fn public_key(&self) -> CosmosPublicKeyBytes {
        compress(self.signing_key.verifying_key())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    pub fn address(&self, prefix: &str) -> OracleResult<String> {
        bech32_address(prefix, &address_bytes(&self.public_key()))
    }

    /// 64-byte `r || s` signature over SHA-256 of `msg`.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        let signature: K256Signature = self.signing_key.sign(msg);
        signature.to_bytes().to_vec()
    }
}

fn compress(key: &VerifyingKey) -> CosmosPublicKeyBytes {
    let affine: &AffinePoint = key.as_ref();
    let encoded = affine.to_encoded_point(true);
    let mut out = [0u8; 33];
    out.copy_from_slice(encoded.as_bytes());
    out
}

pub fn parse_public_key_hex(value: &str) -> OracleResult<CosmosPublicKeyBytes> {
    let bytes = hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| OracleError::InvalidKey(format!("public key {value}: {e}")))?;
    let key: CosmosPublicKeyBytes = bytes
        .try_into()
        .map_err(|_| OracleError::InvalidKey(format!("public key {value} is not 33 bytes")))?;
    VerifyingKey::from_sec1_bytes(&key)
        .map_err(|e| OracleError::InvalidKey(format!("public key {value}: {e}")))?;
    Ok(key)
}

pub fn verify_cosmos_signature(
    public_key: &CosmosPublicKeyBytes,
    msg: &[u8],
    signature: &[u8],
) -> OracleResult<()> {
    let signer = hex::encode(public_key);
    let key = VerifyingKey::from_sec1_bytes(public_key).map_err(|e| {
        OracleError::InvalidSignature {
            signer: signer.clone(),
            reason: format!("bad public key: {e}"),
        }
    })?;
    let signature =
        K256Signature::from_slice(signature).map_err(|e| OracleError::InvalidSignature {
            signer: signer.clone(),
            reason: format!("malformed signature: {e}"),
        })?;
    key.verify(msg, &signature)
        .map_err(|_| OracleError::InvalidSignature {
            signer,
            reason: "signature does not match sign bytes".to_string(),
        })
}

/// `ripemd160(sha256(pubkey))`
pub fn address_bytes(public_key: &CosmosPublicKeyBytes) -> [u8; 20] {
    let sha = Sha256::digest(public_key);
    let rip = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&rip);
    out
}

pub fn bech32_address(prefix: &str, bytes: &[u8]) -> OracleResult<String> {
    bech32::encode(prefix, bytes.to_base32(), Variant::Bech32)
        .map_err(|e| OracleError::Generic(format!("bech32 encode: {e}")))
}

/// Decodes a bech32 address, requiring the given prefix and a 20-byte payload.
pub fn decode_bech32_address(prefix: &str, address: &str) -> OracleResult<[u8; 20]> {
    let (hrp, data, _) = bech32::decode(address)
        .map_err(|e| OracleError::InvalidTransaction(format!("address {address}: {e}")))?;
    if hrp != prefix {
        return Err(OracleError::InvalidTransaction(format!(
            "address {address} does not use prefix {prefix}"
        )));
    }
    let bytes = Vec::<u8>::from_base32(&data)
        .map_err(|e| OracleError::InvalidTransaction(format!("address {address}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| OracleError::InvalidTransaction(format!("address {address} is not 20 bytes")))
}

/// Threshold multisig account controlling the Cosmos vault. Key order is
/// significant: it fixes both the address and the signature bitarray.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigPublicKey {
    pub threshold: u32,
    pub public_keys: Vec<CosmosPublicKeyBytes>,
}

impl MultisigPublicKey {
    pub fn new(threshold: u32, public_keys: Vec<CosmosPublicKeyBytes>) -> OracleResult<Self> {
        if threshold == 0 || threshold as usize > public_keys.len() {
            return Err(OracleError::InvalidConfig(format!(
                "multisig threshold {} out of range for {} keys",
                threshold,
                public_keys.len()
            )));
        }
        Ok(Self {
            threshold,
            public_keys,
        })
    }

    pub fn index_of(&self, public_key: &CosmosPublicKeyBytes) -> Option<usize> {
        self.public_keys.iter().position(|k| k == public_key)
    }

    pub fn index_of_hex(&self, public_key_hex: &str) -> Option<usize> {
        let key = parse_public_key_hex(public_key_hex)
            .tap_err(|e| warn!("Unparsable signer public key {}: {}", public_key_hex, e))
            .ok()?;
        self.index_of(&key)
    }

    /// Legacy amino encoding of the threshold public key.
    pub fn amino_bytes(&self) -> Vec<u8> {
        let mut out = AMINO_MULTISIG_PREFIX.to_vec();
        out.push(0x08);
        put_uvarint(&mut out, self.threshold as u64);
        for key in &self.public_keys {
            let mut inner = AMINO_SECP256K1_PREFIX.to_vec();
            inner.push(key.len() as u8);
            inner.extend_from_slice(key);
            out.push(0x12);
            put_uvarint(&mut out, inner.len() as u64);
            out.extend_from_slice(&inner);
        }
        out
    }

    pub fn address_bytes(&self) -> [u8; 20] {
        let digest = Sha256::digest(self.amino_bytes());
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest[..20]);
        out
    }

    pub fn address(&self, prefix: &str) -> OracleResult<String> {
        bech32_address(prefix, &self.address_bytes())
    }
}

fn put_uvarint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Signing key for EVM message approvals.
#[derive(Clone, Debug)]
pub struct EthKey {
    wallet: LocalWallet,
}

impl EthKey {
    pub fn from_mnemonic(mnemonic: &str) -> OracleResult<Self> {
        Ok(Self {
            wallet: wallet_from_mnemonic(mnemonic, ETH_DERIVATION_PATH)?,
        })
    }

    pub fn random() -> Self {
        Self {
            wallet: LocalWallet::from(SigningKey::random(&mut rand::thread_rng())),
        }
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Lower-case 0x address, the signer identity stored with signatures.
    pub fn identity(&self) -> String {
        format!("{:#x}", self.address())
    }

    /// EIP-191 signature over the message id, hex encoded.
    pub fn sign_message_id(&self, message_id: H256) -> OracleResult<String> {
        let signature = self
            .wallet
            .sign_hash(hash_message(message_id.as_bytes()))
            .map_err(|e| OracleError::InvalidKey(format!("eth signing failed: {e}")))?;
        Ok(hex::encode(signature.to_vec()))
    }
}

pub fn recover_eth_signer(message_id: H256, signature_hex: &str) -> OracleResult<Address> {
    let invalid = |reason: String| OracleError::InvalidSignature {
        signer: signature_hex.to_string(),
        reason,
    };
    let bytes = hex::decode(signature_hex.trim_start_matches("0x"))
        .map_err(|e| invalid(e.to_string()))?;
    let signature = EthSignature::try_from(bytes.as_slice()).map_err(|e| invalid(e.to_string()))?;
    signature
        .recover(RecoveryMessage::Hash(hash_message(message_id.as_bytes())))
        .map_err(|e| invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MNEMONIC: &str =
        "test test test test test test test test test test test junk";

    #[test]
    fn test_mnemonic_derivation_is_deterministic() {
        let a = CosmosKey::from_mnemonic(MNEMONIC).unwrap();
        let b = CosmosKey::from_mnemonic(MNEMONIC).unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert!(a.public_key()[0] == 0x02 || a.public_key()[0] == 0x03);

        // well-known first account of the test mnemonic
        let eth = EthKey::from_mnemonic(MNEMONIC).unwrap();
        assert_eq!(
            eth.identity(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
        assert!(CosmosKey::from_mnemonic("not a mnemonic").is_err());
    }

    #[test]
    fn test_cosmos_sign_and_verify() {
        let key = CosmosKey::random();
        let msg = b"sign bytes";
        let sig = key.sign(msg);
        assert_eq!(sig.len(), 64);
        verify_cosmos_signature(&key.public_key(), msg, &sig).unwrap();

        let err = verify_cosmos_signature(&key.public_key(), b"other bytes", &sig).unwrap_err();
        assert_eq!(err.error_type(), "invalid_signature");

        let other = CosmosKey::random();
        assert!(verify_cosmos_signature(&other.public_key(), msg, &sig).is_err());
        assert!(verify_cosmos_signature(&key.public_key(), msg, &sig[..10]).is_err());
    }

    #[test]
    fn test_bech32_round_trip_and_prefix_check() {
        let key = CosmosKey::random();
        let address = key.address("pokt").unwrap();
        assert!(address.starts_with("pokt1"));
        let bytes = decode_bech32_address("pokt", &address).unwrap();
        assert_eq!(bytes, address_bytes(&key.public_key()));
        assert!(decode_bech32_address("cosmos", &address).is_err());
    }

    #[test]
    fn test_multisig_address_depends_on_order_and_threshold() {
        let keys: Vec<_> = (0..3).map(|_| CosmosKey::random().public_key()).collect();
        let a = MultisigPublicKey::new(2, keys.clone()).unwrap();
        let mut reversed = keys.clone();
        reversed.reverse();
        let b = MultisigPublicKey::new(2, reversed).unwrap();
        let c = MultisigPublicKey::new(3, keys.clone()).unwrap();
        assert_ne!(a.address_bytes(), b.address_bytes());
        assert_ne!(a.address_bytes(), c.address_bytes());
        assert_eq!(a.address_bytes(), a.clone().address_bytes());

        let amino = a.amino_bytes();
        assert_eq!(&amino[..4], &AMINO_MULTISIG_PREFIX);
        assert_eq!(&amino[4..6], &[0x08, 0x02]);
        assert_eq!(amino.len(), 6 + 3 * (2 + 38));
        assert_eq!(a.index_of(&keys[1]), Some(1));
        assert_eq!(a.index_of_hex(&hex::encode(keys[2])), Some(2));

        assert!(MultisigPublicKey::new(0, keys.clone()).is_err());
        assert!(MultisigPublicKey::new(4, keys).is_err());
    }

    #[test]
    fn test_eth_sign_and_recover() {
        let key = EthKey::random();
        let id = H256::repeat_byte(7);
        let sig = key.sign_message_id(id).unwrap();
        assert_eq!(recover_eth_signer(id, &sig).unwrap(), key.address());
        assert_ne!(
            recover_eth_signer(H256::repeat_byte(8), &sig).unwrap(),
            key.address()
        );
        assert!(recover_eth_signer(id, "zz").is_err());
    }
}
