// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Contributes this oracle's signature to vault transactions: messages that
//! arrive from EVM chains and refunds of rejected deposits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::{H256, U256};
use tracing::{debug, error, info, warn};

use super::client::CosmosClient;
use super::tx::UnsignedTx;
use super::validator::{validate_tx_to_vault, ValidatorConfig};
use crate::config::{CosmosNetworkConfig, OracleConfig};
use crate::crypto::{bech32_address, CosmosKey};
use crate::error::{OracleError, OracleResult};
use crate::ethereum::client::EvmClient;
use crate::metrics::OracleMetrics;
use crate::records::{mark_invalid, reset_record, with_record_lock, Outcome};
use crate::runner::Runnable;
use crate::sequence::SequenceAllocator;
use crate::store::SharedStore;
use crate::types::{
    Message, MessageStatus, Refund, Sequence, Signable, Signature, SigningRecord, SigningUpdate,
    TransactionStatus,
};

/// Where the dispatch event of an inbound message is checked.
#[derive(Clone)]
pub struct EvmOrigin {
    pub client: Arc<dyn EvmClient>,
    pub confirmations: u64,
}

pub struct CosmosSigner {
    name: String,
    store: SharedStore,
    client: Arc<dyn CosmosClient>,
    evm_origins: HashMap<u32, EvmOrigin>,
    key: CosmosKey,
    network: CosmosNetworkConfig,
    chain_domain: u32,
    threshold: usize,
    validator: ValidatorConfig,
    allocator: SequenceAllocator,
    metrics: Arc<OracleMetrics>,
}

impl CosmosSigner {
    pub fn new(
        config: &OracleConfig,
        store: SharedStore,
        client: Arc<dyn CosmosClient>,
        evm_origins: HashMap<u32, EvmOrigin>,
        metrics: Arc<OracleMetrics>,
    ) -> Self {
        Self {
            name: format!("CosmosSigner {}", config.cosmos.chain_id),
            allocator: SequenceAllocator::new(store.clone()),
            store,
            client,
            evm_origins,
            key: config.cosmos_key.clone(),
            network: config.cosmos.clone(),
            chain_domain: config.cosmos_chain.chain_domain,
            threshold: config.multisig.threshold as usize,
            validator: config.validator_config(),
            metrics,
        }
    }

    fn signer(&self) -> String {
        self.key.public_key_hex()
    }

    fn vault(&self) -> &str {
        &self.network.multisig_address
    }

    async fn handle(&self, record: SigningRecord) -> bool {
        let result = match self.validate_evidence(&record).await {
            Ok(()) => {
                with_record_lock(self.store.as_ref(), record.kind(), record.id(), || {
                    self.sign_locked(&record)
                })
                .await
            }
            Err(e) => Err(e),
        };
        self.finish(&record, result).await
    }

    async fn finish(&self, record: &SigningRecord, result: OracleResult<Outcome>) -> bool {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(OracleError::TxNotConfirmed {
                hash,
                confirmations,
                required,
            }) => {
                debug!(
                    "[{}] Evidence {} at {}/{} confirmations, waiting",
                    self.name, hash, confirmations, required
                );
                "evidence_pending"
            }
            Err(OracleError::AlreadySigned(_)) => "already_signed",
            Err(e) if e.is_validation() => {
                match mark_invalid(self.store.as_ref(), record, &e).await {
                    Ok(_) => "invalid",
                    Err(e) => {
                        warn!("[{}] Failed to mark {} invalid: {}", self.name, record.lock_resource(), e);
                        self.metrics.record_error(&self.name, &e);
                        return false;
                    }
                }
            }
            Err(e) => {
                warn!("[{}] Failed to sign {}: {}", self.name, record.lock_resource(), e);
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

    async fn validate_evidence(&self, record: &SigningRecord) -> OracleResult<()> {
        match record {
            SigningRecord::Message(message) => self.validate_message_evidence(message).await,
            SigningRecord::Refund(refund) => self.validate_refund_evidence(refund).await,
        }
    }

    /// The message must have been dispatched by the origin chain's mailbox in
    /// a successful, sufficiently confirmed transaction.
    async fn validate_message_evidence(&self, message: &Message) -> OracleResult<()> {
        let content = &message.content;
        // the memo and the dispatch lookup both use the stored id
        if content.message_id_hex() != message.message_id {
            return Err(OracleError::InvalidTransaction(format!(
                "message id {} does not match its content",
                message.message_id
            )));
        }
        if content.destination_domain != self.chain_domain {
            return Err(OracleError::UnsupportedChain(format!(
                "message {} targets domain {}",
                message.message_id, content.destination_domain
            )));
        }
        let origin = self.evm_origins.get(&content.origin_domain).ok_or_else(|| {
            OracleError::UnsupportedChain(format!("origin domain {}", content.origin_domain))
        })?;

        let hash: H256 = message.origin_transaction_hash.parse().map_err(|_| {
            OracleError::InvalidTransaction(format!(
                "bad origin hash {}",
                message.origin_transaction_hash
            ))
        })?;
        let receipt = origin
            .client
            .get_transaction_receipt(hash)
            .await?
            .ok_or_else(|| OracleError::TxNotFound(message.origin_transaction_hash.clone()))?;
        if receipt.status.map(|s| s.as_u64()) != Some(1) {
            return Err(OracleError::OriginTxFailed(
                message.origin_transaction_hash.clone(),
            ));
        }
        let block = receipt
            .block_number
            .ok_or_else(|| OracleError::TxNotFound(message.origin_transaction_hash.clone()))?
            .as_u64();
        let latest = origin.client.get_latest_block_height().await?;
        let confirmations = latest.saturating_sub(block);
        if confirmations < origin.confirmations {
            return Err(OracleError::TxNotConfirmed {
                hash: message.origin_transaction_hash.clone(),
                confirmations,
                required: origin.confirmations,
            });
        }

        receipt
            .logs
            .iter()
            .filter_map(|log| origin.client.parse_dispatch_event(log))
            .find(|event| event.message_id() == message.message_id)
            .map(|_| ())
            .ok_or_else(|| OracleError::DispatchEventNotFound(message.message_id.clone()))
    }

    /// The origin deposit must still validate as confirmed and refundable, with
    /// the refunded sender and amount matching.
    async fn validate_refund_evidence(&self, refund: &Refund) -> OracleResult<()> {
        let tx = self.client.get_tx(&refund.origin_transaction_hash).await?;
        let height = self.client.get_latest_block_height().await?;
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
        if !result.needs_refund {
            return Err(OracleError::InvalidTransaction(format!(
                "deposit {} does not need a refund",
                result.tx_hash
            )));
        }
        if result.sender_address != refund.recipient_address {
            return Err(OracleError::SenderMismatch {
                expected: refund.recipient_address.clone(),
                actual: result.sender_address,
            });
        }
        if result.amount != refund.amount {
            return Err(OracleError::AmountMismatch {
                expected: refund.amount.to_string(),
                actual: result.amount.to_string(),
            });
        }
        Ok(())
    }

    /// Vault send for the record. The fee is paid out of the recorded amount.
    fn build_body(&self, record: &SigningRecord) -> OracleResult<UnsignedTx> {
        let (recipient, amount, memo) = match record {
            SigningRecord::Message(message) => {
                let body = &message.content.body;
                (
                    bech32_address(&self.network.bech32_prefix, body.recipient_address.as_bytes())?,
                    u256_to_u128(body.amount)?,
                    message.message_id.clone(),
                )
            }
            SigningRecord::Refund(refund) => (
                refund.recipient_address.clone(),
                refund.amount,
                format!("refund {}", refund.origin_transaction_hash),
            ),
        };
        let fee = self.network.tx_fee as u128;
        if amount <= fee {
            return Err(OracleError::InvalidTransaction(format!(
                "{} amount {} does not cover fee {}",
                record.lock_resource(),
                amount,
                fee
            )));
        }
        Ok(UnsignedTx::send(
            self.vault(),
            &recipient,
            amount - fee,
            &self.network.coin_denom,
            fee,
            self.network.gas_limit,
            memo,
        ))
    }

    async fn sign_locked(&self, record: &SigningRecord) -> OracleResult<Outcome> {
        let (kind, id) = (record.kind(), record.id());
        let Some(current) = self.store.get_record(kind, id).await? else {
            return Err(OracleError::Storage(format!("{} disappeared", record.lock_resource())));
        };
        if current.status() != MessageStatus::Pending {
            debug!("[{}] {} is {}, skipping", self.name, current.lock_resource(), current.status());
            return Ok("skipped");
        }
        let signer = self.signer();
        if current.has_signed(&signer) {
            return Err(OracleError::AlreadySigned(signer));
        }

        let body = self.build_body(&current)?;
        if !current.transaction_body().is_empty()
            && UnsignedTx::from_json(current.transaction_body()).ok().as_ref() != Some(&body)
        {
            reset_record(
                self.store.as_ref(),
                &self.metrics,
                kind,
                id,
                &self.network.chain_id,
                "body_mismatch",
            )
            .await?;
            return Ok("reset");
        }
        if !body.signers().contains(&self.vault()) {
            return Err(OracleError::Generic(format!(
                "vault {} is not a signer of {}",
                self.vault(),
                current.lock_resource()
            )));
        }

        let account = self.client.get_account(self.vault()).await?;
        let (sequence, allocated) = match current.sequence() {
            Sequence::Assigned(s) if s < account.sequence => {
                // the vault moved past this sequence, the collected signatures can never land
                reset_record(
                    self.store.as_ref(),
                    &self.metrics,
                    kind,
                    id,
                    &self.network.chain_id,
                    "stale_sequence",
                )
                .await?;
                return Ok("reset");
            }
            Sequence::Assigned(s) => (s, false),
            Sequence::Unassigned => (
                self.allocator
                    .next_sequence(&self.network.chain_id, account.sequence)
                    .await?,
                true,
            ),
        };

        let sign_bytes = body.sign_bytes(&self.network.chain_id, account.account_number, sequence)?;
        let mut signatures = current.signatures().to_vec();
        signatures.push(Signature {
            signer: signer.clone(),
            signature: hex::encode(self.key.sign(&sign_bytes)),
        });
        let signed = signatures.len() >= self.threshold;
        let count = signatures.len();
        let update = SigningUpdate {
            status: Some(if signed {
                MessageStatus::Signed
            } else {
                MessageStatus::Pending
            }),
            signatures: Some(signatures),
            transaction_body: Some(body.to_json()?),
            ..Default::default()
        };
        if allocated {
            self.allocator
                .persist_with_sequence(&self.network.chain_id, kind, id, sequence, update)
                .await?;
        } else {
            self.store.update_record(kind, id, update).await?;
        }

        self.metrics
            .signatures_added
            .with_label_values(&[&self.network.chain_id])
            .inc();
        info!(
            "[{}] Signed {} at sequence {} ({}/{} signatures)",
            self.name,
            current.lock_resource(),
            sequence,
            count,
            self.threshold
        );
        Ok(if signed { "signed" } else { "signature_added" })
    }
}

fn u256_to_u128(value: U256) -> OracleResult<u128> {
    if value > U256::from(u128::MAX) {
        return Err(OracleError::InvalidTransaction(format!(
            "amount {value} overflows"
        )));
    }
    Ok(value.as_u128())
}

#[async_trait]
impl Runnable for CosmosSigner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> bool {
        let signer = self.signer();
        let chain_id = &self.network.chain_id;
        let mut ok = true;

        match self.store.find_pending_messages(&signer, chain_id).await {
            Ok(messages) => {
                for message in messages {
                    ok &= self.handle(message.into()).await;
                }
            }
            Err(e) => {
                error!("[{}] Failed to load pending messages: {}", self.name, e);
                self.metrics.record_error(&self.name, &e);
                ok = false;
            }
        }

        match self.store.find_pending_refunds(&signer, chain_id).await {
            Ok(refunds) => {
                for refund in refunds {
                    ok &= self.handle(refund.into()).await;
                }
            }
            Err(e) => {
                error!("[{}] Failed to load pending refunds: {}", self.name, e);
                self.metrics.record_error(&self.name, &e);
                ok = false;
            }
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, OracleStore};
    use crate::test_utils::{
        cosmos_deposit_tx_to, dispatch_log, evm_receipt, evm_to_cosmos_content, MockCosmosClient,
        MockEvmClient, OracleTestEnv, YieldingStore,
    };
    use crate::types::{Chain, NewMessage, NewRefund};

    const DEPOSIT: &str = "AA11";

    async fn insert_refund(store: &InMemoryStore, env: &OracleTestEnv) -> i64 {
        store
            .insert_refund(NewRefund {
                origin_transaction_id: 1,
                origin_transaction_hash: DEPOSIT.into(),
                recipient_address: "pokt1sender".into(),
                amount: 1000,
                chain: env.config.cosmos_chain.clone(),
            })
            .await
            .unwrap()
    }

    fn refundable_deposit(cosmos: &MockCosmosClient) {
        // spent differs from received
        cosmos.add_tx(cosmos_deposit_tx_to(
            &cosmos.vault(),
            DEPOSIT,
            100,
            "pokt1sender",
            1000,
            900,
            "",
        ));
        cosmos.set_height(110);
    }

    #[tokio::test]
    async fn test_refund_reaches_signed_at_threshold() {
        let env = OracleTestEnv::new(2, 3);
        let store = Arc::new(InMemoryStore::default());
        let cosmos = env.cosmos_client();
        refundable_deposit(&cosmos);
        let id = insert_refund(&store, &env).await;

        let first = env.cosmos_signer(0, store.clone(), cosmos.clone(), HashMap::new());
        assert!(first.run().await);
        let refund = store.get_refund(id).await.unwrap().unwrap();
        assert_eq!(refund.status, MessageStatus::Pending);
        assert_eq!(refund.signatures.len(), 1);
        assert_eq!(refund.sequence, Sequence::Assigned(cosmos.account().sequence));
        let body = UnsignedTx::from_json(&refund.transaction_body).unwrap();
        assert_eq!(body.msgs[0].value.amount[0].amount, "900");
        assert_eq!(body.fee.amount[0].amount, "100");

        // running again is a no-op for the same signer
        assert!(first.run().await);
        assert_eq!(store.get_refund(id).await.unwrap().unwrap().signatures.len(), 1);

        let second = env.cosmos_signer(1, store.clone(), cosmos.clone(), HashMap::new());
        assert!(second.run().await);
        let refund = store.get_refund(id).await.unwrap().unwrap();
        assert_eq!(refund.status, MessageStatus::Signed);
        assert_eq!(refund.signatures.len(), 2);
        assert_ne!(refund.signatures[0].signer, refund.signatures[1].signer);
        assert_eq!(store.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_one_oracle_signs_once_from_two_instances() {
        let env = OracleTestEnv::new(3, 3);
        let store = Arc::new(InMemoryStore::default());
        let cosmos = env.cosmos_client();
        refundable_deposit(&cosmos);
        let id = insert_refund(&store, &env).await;

        let shared = YieldingStore::new(store.clone());
        let a = env.cosmos_signer(0, shared.clone(), cosmos.clone(), HashMap::new());
        let b = env.cosmos_signer(0, shared.clone(), cosmos.clone(), HashMap::new());
        let (_, _) = tokio::join!(a.run(), b.run());
        let refund = store.get_refund(id).await.unwrap().unwrap();
        assert_eq!(refund.status, MessageStatus::Pending);
        assert_eq!(refund.signatures.len(), 1);
        assert_eq!(refund.sequence, Sequence::Assigned(3));

        assert!(a.run().await);
        assert!(b.run().await);
        let refund = store.get_refund(id).await.unwrap().unwrap();
        assert_eq!(refund.signatures.len(), 1);
        assert_eq!(store.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_refund_with_mismatched_amount_is_invalid() {
        let env = OracleTestEnv::new(2, 3);
        let store = Arc::new(InMemoryStore::default());
        let cosmos = env.cosmos_client();
        refundable_deposit(&cosmos);
        let id = store
            .insert_refund(NewRefund {
                origin_transaction_id: 1,
                origin_transaction_hash: DEPOSIT.into(),
                recipient_address: "pokt1sender".into(),
                amount: 5000,
                chain: env.config.cosmos_chain.clone(),
            })
            .await
            .unwrap();

        let signer = env.cosmos_signer(0, store.clone(), cosmos, HashMap::new());
        assert!(signer.run().await);
        let refund = store.get_refund(id).await.unwrap().unwrap();
        assert_eq!(refund.status, MessageStatus::Invalid);
        assert!(refund.signatures.is_empty());
    }

    #[tokio::test]
    async fn test_unconfirmed_refund_evidence_waits() {
        let env = OracleTestEnv::new(2, 3);
        let store = Arc::new(InMemoryStore::default());
        let cosmos = env.cosmos_client();
        refundable_deposit(&cosmos);
        cosmos.set_height(101);
        let id = insert_refund(&store, &env).await;

        let signer = env.cosmos_signer(0, store.clone(), cosmos, HashMap::new());
        assert!(signer.run().await);
        let refund = store.get_refund(id).await.unwrap().unwrap();
        assert_eq!(refund.status, MessageStatus::Pending);
        assert!(refund.signatures.is_empty());
    }

    #[tokio::test]
    async fn test_locked_record_is_retried_next_cycle() {
        let env = OracleTestEnv::new(2, 3);
        let store = Arc::new(InMemoryStore::default());
        let cosmos = env.cosmos_client();
        refundable_deposit(&cosmos);
        let id = insert_refund(&store, &env).await;
        let lock = store.xlock(&format!("refunds/{id}")).await.unwrap();

        let signer = env.cosmos_signer(0, store.clone(), cosmos, HashMap::new());
        assert!(!signer.run().await);
        assert!(store.get_refund(id).await.unwrap().unwrap().signatures.is_empty());

        store.unlock(&lock).await.unwrap();
        assert!(signer.run().await);
        assert_eq!(store.get_refund(id).await.unwrap().unwrap().signatures.len(), 1);
    }

    async fn insert_evm_message(store: &InMemoryStore, env: &OracleTestEnv, evm: &MockEvmClient) -> i64 {
        let content = evm_to_cosmos_content(env.config.cosmos_chain.chain_domain, 5_000);
        let tx_hash = H256::repeat_byte(0xaa);
        let log = dispatch_log(evm.mailbox_address(), tx_hash, 50, &content);
        evm.add_receipt(evm_receipt(tx_hash, 50, true, vec![log]));
        store
            .insert_message(NewMessage {
                origin_transaction_id: 1,
                origin_transaction_hash: format!("{tx_hash:#x}"),
                chain: env.config.cosmos_chain.clone(),
                content,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_inbound_message_waits_for_dispatch_confirmations() {
        let env = OracleTestEnv::new(1, 1);
        let store = Arc::new(InMemoryStore::default());
        let cosmos = env.cosmos_client();
        let evm = MockEvmClient::new(env.config.ethereum[0].mailbox_address);
        let id = insert_evm_message(&store, &env, &evm).await;
        let origins = env.evm_origins(&evm);

        evm.set_height(52);
        let signer = env.cosmos_signer(0, store.clone(), cosmos.clone(), origins.clone());
        assert!(signer.run().await);
        assert!(store.get_message(id).await.unwrap().unwrap().signatures.is_empty());

        evm.set_height(80);
        assert!(signer.run().await);
        let message = store.get_message(id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Signed);
        let body = UnsignedTx::from_json(&message.transaction_body).unwrap();
        assert_eq!(body.msgs[0].value.amount[0].amount, "4900");
        assert_eq!(body.memo, message.message_id);
    }

    #[tokio::test]
    async fn test_inbound_message_without_dispatch_is_invalid() {
        let env = OracleTestEnv::new(1, 1);
        let store = Arc::new(InMemoryStore::default());
        let evm = MockEvmClient::new(env.config.ethereum[0].mailbox_address);
        let id = insert_evm_message(&store, &env, &evm).await;
        // replace the receipt with one that carries no dispatch
        evm.add_receipt(evm_receipt(H256::repeat_byte(0xaa), 50, true, vec![]));
        evm.set_height(80);

        let signer = env.cosmos_signer(0, store.clone(), env.cosmos_client(), env.evm_origins(&evm));
        assert!(signer.run().await);
        assert_eq!(
            store.get_message(id).await.unwrap().unwrap().status,
            MessageStatus::Invalid
        );
    }

    #[tokio::test]
    async fn test_message_content_must_hash_to_its_id() {
        let env = OracleTestEnv::new(1, 1);
        let store = Arc::new(InMemoryStore::default());
        let evm = MockEvmClient::new(env.config.ethereum[0].mailbox_address);
        let id = insert_evm_message(&store, &env, &evm).await;
        evm.set_height(80);
        // the stored id still matches the dispatched event
        store.modify_message(id, |m| m.content.body.amount = U256::from(9_000));

        let signer = env.cosmos_signer(0, store.clone(), env.cosmos_client(), env.evm_origins(&evm));
        assert!(signer.run().await);
        let message = store.get_message(id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Invalid);
        assert!(message.signatures.is_empty());
        assert!(message.transaction_body.is_empty());
    }

    #[tokio::test]
    async fn test_message_from_unknown_origin_is_invalid() {
        let env = OracleTestEnv::new(1, 1);
        let store = Arc::new(InMemoryStore::default());
        let mut content = evm_to_cosmos_content(env.config.cosmos_chain.chain_domain, 5_000);
        content.origin_domain = 77;
        let id = store
            .insert_message(NewMessage {
                origin_transaction_id: 1,
                origin_transaction_hash: format!("{:#x}", H256::repeat_byte(1)),
                chain: Chain::cosmos("poktroll", 1000),
                content,
            })
            .await
            .unwrap();
        let signer = env.cosmos_signer(0, store.clone(), env.cosmos_client(), HashMap::new());
        assert!(signer.run().await);
        assert_eq!(
            store.get_message(id).await.unwrap().unwrap().status,
            MessageStatus::Invalid
        );
    }

    #[tokio::test]
    async fn test_stale_sequence_resets_record() {
        let env = OracleTestEnv::new(2, 3);
        let store = Arc::new(InMemoryStore::default());
        let cosmos = env.cosmos_client();
        refundable_deposit(&cosmos);
        let id = insert_refund(&store, &env).await;

        let first = env.cosmos_signer(0, store.clone(), cosmos.clone(), HashMap::new());
        assert!(first.run().await);
        // the vault spent that sequence elsewhere
        cosmos.set_account_sequence(cosmos.account().sequence + 1);

        let second = env.cosmos_signer(1, store.clone(), cosmos.clone(), HashMap::new());
        assert!(second.run().await);
        let refund = store.get_refund(id).await.unwrap().unwrap();
        assert_eq!(refund.status, MessageStatus::Pending);
        assert!(refund.signatures.is_empty());
        assert_eq!(refund.sequence, Sequence::Unassigned);
    }
}
