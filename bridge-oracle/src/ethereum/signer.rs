// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Approves messages bound for an EVM chain. Each oracle signs the message id;
//! the collected approvals are what the mint controller verifies.

use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::U256;
use tracing::{debug, error, info, warn};

use crate::config::{EthereumNetworkConfig, OracleConfig};
use crate::cosmos::client::CosmosClient;
use crate::cosmos::validator::{validate_tx_to_vault, ValidatorConfig};
use crate::crypto::{decode_bech32_address, EthKey};
use crate::error::{OracleError, OracleResult};
use crate::metrics::OracleMetrics;
use crate::records::{mark_invalid, with_record_lock, Outcome};
use crate::runner::Runnable;
use crate::store::SharedStore;
use crate::types::{
    Chain, Message, MessageStatus, RecordKind, Signable, Signature, SigningUpdate,
    TransactionStatus,
};

pub struct EthereumSigner {
    name: String,
    store: SharedStore,
    cosmos: Arc<dyn CosmosClient>,
    key: EthKey,
    chain: Chain,
    cosmos_chain: Chain,
    bech32_prefix: String,
    threshold: usize,
    validator: ValidatorConfig,
    metrics: Arc<OracleMetrics>,
}

impl EthereumSigner {
    pub fn new(
        config: &OracleConfig,
        network: &EthereumNetworkConfig,
        store: SharedStore,
        cosmos: Arc<dyn CosmosClient>,
        metrics: Arc<OracleMetrics>,
    ) -> OracleResult<Self> {
        Ok(Self {
            name: format!("EthereumSigner {}", network.chain_id),
            store,
            cosmos,
            key: config.eth_key.clone(),
            chain: network.chain()?,
            cosmos_chain: config.cosmos_chain.clone(),
            bech32_prefix: config.cosmos.bech32_prefix.clone(),
            threshold: network.signature_threshold as usize,
            validator: config.validator_config(),
            metrics,
        })
    }

    /// The deposit behind the message must still validate as a confirmed
    /// mint request whose memo, sender and net amount match the message body.
    async fn validate_evidence(&self, message: &Message) -> OracleResult<()> {
        let content = &message.content;
        if content.message_id_hex() != message.message_id {
            return Err(OracleError::InvalidTransaction(format!(
                "message id {} does not match its content",
                message.message_id
            )));
        }
        if content.origin_domain != self.cosmos_chain.chain_domain
            || content.destination_domain != self.chain.chain_domain
        {
            return Err(OracleError::UnsupportedChain(format!(
                "route {} -> {}",
                content.origin_domain, content.destination_domain
            )));
        }

        let tx = self.cosmos.get_tx(&message.origin_transaction_hash).await?;
        let height = self.cosmos.get_latest_block_height().await?;
        let result = validate_tx_to_vault(&tx, &self.validator, height);
        match result.status {
            TransactionStatus::Confirmed => {}
            TransactionStatus::Pending => {
                return Err(OracleError::TxNotConfirmed {
                    hash: result.tx_hash,
                    confirmations: result.confirmations,
                    required: self.validator.confirmations,
                })
            }
            TransactionStatus::Failed => return Err(OracleError::OriginTxFailed(result.tx_hash)),
            TransactionStatus::Invalid => {
                return Err(OracleError::InvalidTransaction(format!(
                    "deposit {} no longer validates",
                    result.tx_hash
                )))
            }
        }
        let memo = match (&result.memo, result.needs_refund) {
            (Some(memo), false) => memo,
            _ => {
                return Err(OracleError::InvalidMemo(format!(
                    "deposit {} is not a mint request",
                    result.tx_hash
                )))
            }
        };
        if memo.chain_id != self.chain.chain_id {
            return Err(OracleError::InvalidMemo(format!(
                "deposit {} targets chain {}",
                result.tx_hash, memo.chain_id
            )));
        }
        let recipient = format!("{:#x}", content.body.recipient_address);
        if memo.address != recipient {
            return Err(OracleError::InvalidMemo(format!(
                "memo recipient {} differs from {}",
                memo.address, recipient
            )));
        }
        let sender = decode_bech32_address(&self.bech32_prefix, &result.sender_address)?;
        if content.body.sender_address.as_bytes() != sender.as_slice() {
            return Err(OracleError::SenderMismatch {
                expected: format!("{:#x}", content.body.sender_address),
                actual: result.sender_address,
            });
        }
        let net = U256::from(result.amount.saturating_sub(self.validator.tx_fee));
        if net != content.body.amount {
            return Err(OracleError::AmountMismatch {
                expected: content.body.amount.to_string(),
                actual: net.to_string(),
            });
        }
        Ok(())
    }

    async fn sign_locked(&self, message: &Message) -> OracleResult<Outcome> {
        let Some(current) = self.store.get_message(message.id).await? else {
            return Err(OracleError::Storage(format!("{} disappeared", message.lock_resource())));
        };
        if current.status != MessageStatus::Pending {
            debug!("[{}] {} is {}, skipping", self.name, current.lock_resource(), current.status);
            return Ok("skipped");
        }
        let signer = self.key.identity();
        if current.has_signed(&signer) {
            return Err(OracleError::AlreadySigned(signer));
        }

        let signature = self.key.sign_message_id(current.content.message_id())?;
        let mut signatures = current.signatures.clone();
        signatures.push(Signature { signer, signature });
        let signed = signatures.len() >= self.threshold;
        let count = signatures.len();
        self.store
            .update_message(
                current.id,
                SigningUpdate {
                    status: Some(if signed {
                        MessageStatus::Signed
                    } else {
                        MessageStatus::Pending
                    }),
                    signatures: Some(signatures),
                    ..Default::default()
                },
            )
            .await?;
        self.metrics
            .signatures_added
            .with_label_values(&[&self.chain.chain_id])
            .inc();
        info!(
            "[{}] Signed message {} ({}/{} signatures)",
            self.name, current.message_id, count, self.threshold
        );
        Ok(if signed { "signed" } else { "signature_added" })
    }

    async fn handle(&self, message: Message) -> bool {
        let result = match self.validate_evidence(&message).await {
            Ok(()) => {
                with_record_lock(self.store.as_ref(), RecordKind::Message, message.id, || {
                    self.sign_locked(&message)
                })
                .await
            }
            Err(e) => Err(e),
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(OracleError::TxNotConfirmed { .. }) => "evidence_pending",
            Err(OracleError::AlreadySigned(_)) => "already_signed",
            Err(e) if e.is_validation() => match mark_invalid(self.store.as_ref(), &message, &e).await {
                Ok(_) => "invalid",
                Err(e) => {
                    warn!("[{}] Failed to mark {} invalid: {}", self.name, message.lock_resource(), e);
                    self.metrics.record_error(&self.name, &e);
                    return false;
                }
            },
            Err(e) => {
                warn!("[{}] Failed to sign {}: {}", self.name, message.lock_resource(), e);
                self.metrics.record_error(&self.name, &e);
                return false;
            }
        };
        self.metrics
            .records_processed
            .with_label_values(&[&self.name, outcome])
            .inc();
        true
    }
}

#[async_trait]
impl Runnable for EthereumSigner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> bool {
        let messages = match self
            .store
            .find_pending_messages(&self.key.identity(), &self.chain.chain_id)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                error!("[{}] Failed to load pending messages: {}", self.name, e);
                self.metrics.record_error(&self.name, &e);
                return false;
            }
        };
        let mut ok = true;
        for message in messages {
            ok &= self.handle(message).await;
        }
        ok
    }
}
