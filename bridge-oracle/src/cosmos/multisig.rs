// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Combines collected signatures into the vault's threshold signature.
//!
//! Every stored signature is verified again against sign bytes rebuilt from
//! the persisted body, the current account number and the record's sequence.
//! A single failure rejects the whole batch.

use std::collections::HashSet;

use crate::crypto::{verify_cosmos_signature, MultisigPublicKey};
use crate::error::{OracleError, OracleResult};
use crate::types::Signable;

use super::tx::{StdTx, UnsignedTx};

#[derive(Clone, Debug)]
pub struct MultisigAssembler {
    multisig: MultisigPublicKey,
    vault_address: String,
    chain_id: String,
}

impl MultisigAssembler {
    pub fn new(multisig: MultisigPublicKey, vault_address: String, chain_id: String) -> Self {
        Self {
            multisig,
            vault_address,
            chain_id,
        }
    }

    pub fn threshold(&self) -> usize {
        self.multisig.threshold as usize
    }

    pub fn assemble(&self, record: &impl Signable, account_number: u64) -> OracleResult<StdTx> {
        let sequence = record.sequence().assigned().ok_or_else(|| {
            OracleError::Generic(format!("{} has no sequence", record.lock_resource()))
        })?;

        let signatures = record.signatures();
        if signatures.len() < self.threshold() {
            return Err(OracleError::InsufficientSignatures {
                have: signatures.len(),
                threshold: self.threshold(),
            });
        }

        let body = UnsignedTx::from_json(record.transaction_body())?;
        if body.signers() != [self.vault_address.as_str()] {
            return Err(OracleError::InvalidTransaction(format!(
                "body of {} is not signed by the vault {}",
                record.lock_resource(),
                self.vault_address
            )));
        }
        let sign_bytes = body.sign_bytes(&self.chain_id, account_number, sequence)?;

        let mut seen = HashSet::new();
        let mut combined = Vec::with_capacity(signatures.len());
        for signature in signatures {
            let index = self.multisig.index_of_hex(&signature.signer).ok_or_else(|| {
                OracleError::InvalidSignature {
                    signer: signature.signer.clone(),
                    reason: "not a member of the vault multisig".to_string(),
                }
            })?;
            if !seen.insert(index) {
                return Err(OracleError::InvalidSignature {
                    signer: signature.signer.clone(),
                    reason: "duplicate signer".to_string(),
                });
            }
            let bytes = hex::decode(&signature.signature).map_err(|e| {
                OracleError::InvalidSignature {
                    signer: signature.signer.clone(),
                    reason: format!("malformed hex: {e}"),
                }
            })?;
            verify_cosmos_signature(&self.multisig.public_keys[index], &sign_bytes, &bytes)?;
            combined.push((index, bytes));
        }

        Ok(StdTx::assemble(
            &body,
            &self.multisig,
            combined,
            account_number,
            sequence,
        ))
    }
}
