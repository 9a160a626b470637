// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::contract::EthEvent;
use ethers::types::{Address as EthAddress, Log, TransactionReceipt, H256, U256, U64};

use crate::config::{CosmosNetworkConfig, EthereumNetworkConfig, OracleConfig, OracleNodeConfig, ServiceConfig};
use crate::cosmos::client::CosmosClient;
use crate::cosmos::monitor::CosmosMonitor;
use crate::cosmos::relayer::CosmosRelayer;
use crate::cosmos::signer::{CosmosSigner, EvmOrigin};
use crate::cosmos::tx::{tx_hash, AccountInfo, Event, EventAttribute, StdTx, TxBodyJson, TxJson, TxResponse};
use crate::cosmos::validator::ValidatorConfig;
use crate::crypto::{bech32_address, CosmosKey, EthKey, MultisigPublicKey};
use crate::encoding::{MessageBody, MessageContent, MESSAGE_VERSION};
use crate::error::{OracleError, OracleResult};
use crate::ethereum::client::{DispatchEvent, DispatchFilter, EvmClient};
use crate::ethereum::monitor::EthereumMonitor;
use crate::ethereum::signer::EthereumSigner;
use crate::metrics::OracleMetrics;
use crate::runner::Runnable;
use crate::store::{InMemoryStore, OracleStore, SharedStore};
use crate::types::{
    Chain, Message, MessageStatus, NewMessage, NewRefund, NewTransaction, RecordId, Refund, SigningUpdate,
    Transaction, TransactionStatus, TransactionUpdate,
};

pub const TEST_MNEMONIC: &str = "test test test test test test test test test test test junk";

const COSMOS_CHAIN_ID: &str = "poktroll";
const COSMOS_DOMAIN: u32 = 1000;
const ETH_CHAIN_ID: u64 = 1;

pub fn validator_config_for_test() -> ValidatorConfig {
    ValidatorConfig {
        vault_address: "pokt1vault".to_string(),
        bech32_prefix: "pokt".to_string(),
        coin_denom: "upokt".to_string(),
        tx_fee: 100,
        confirmations: 5,
        supported_chain_ids: vec![ETH_CHAIN_ID.to_string()],
    }
}

/// Config for oracle 0 of an `n` member vault. Oracle 0 derives from
/// [`TEST_MNEMONIC`], the rest are random.
pub fn node_config_for_test(threshold: u32, n: usize) -> OracleNodeConfig {
    let (cosmos_keys, eth_keys) = keys_for_test(n);
    node_config_with_keys(threshold, &cosmos_keys, &eth_keys)
}

fn keys_for_test(n: usize) -> (Vec<CosmosKey>, Vec<EthKey>) {
    let mut cosmos_keys = vec![CosmosKey::from_mnemonic(TEST_MNEMONIC).unwrap()];
    let mut eth_keys = vec![EthKey::from_mnemonic(TEST_MNEMONIC).unwrap()];
    for _ in 1..n {
        cosmos_keys.push(CosmosKey::random());
        eth_keys.push(EthKey::random());
    }
    (cosmos_keys, eth_keys)
}

fn node_config_with_keys(
    threshold: u32,
    cosmos_keys: &[CosmosKey],
    eth_keys: &[EthKey],
) -> OracleNodeConfig {
    let multisig =
        MultisigPublicKey::new(threshold, cosmos_keys.iter().map(|k| k.public_key()).collect())
            .unwrap();
    OracleNodeConfig {
        mnemonic: TEST_MNEMONIC.to_string(),
        metrics_port: 9184,
        lock_ttl_ms: 60_000,
        cosmos_network: CosmosNetworkConfig {
            chain_id: COSMOS_CHAIN_ID.to_string(),
            chain_domain: COSMOS_DOMAIN,
            rest_url: "http://localhost:1317".to_string(),
            bech32_prefix: "pokt".to_string(),
            coin_denom: "upokt".to_string(),
            tx_fee: 100,
            gas_limit: 200_000,
            confirmations: 5,
            multisig_address: multisig.address("pokt").unwrap(),
            multisig_public_keys: cosmos_keys.iter().map(|k| k.public_key_hex()).collect(),
            multisig_threshold: threshold,
            timeout_ms: 1_000,
            broadcast_timeout_ms: 60_000,
            start_block_height: None,
            message_monitor: ServiceConfig::default(),
            message_signer: ServiceConfig::default(),
            message_relayer: ServiceConfig::default(),
        },
        ethereum_networks: vec![EthereumNetworkConfig {
            chain_id: ETH_CHAIN_ID,
            rpc_url: "http://localhost:8545".to_string(),
            confirmations: 12,
            mailbox_address: EthAddress::repeat_byte(0x11),
            mint_controller_address: EthAddress::repeat_byte(0x22),
            oracle_addresses: eth_keys.iter().map(|k| k.address()).collect(),
            signature_threshold: threshold as u64,
            timeout_ms: 1_000,
            start_block_height: None,
            message_monitor: ServiceConfig::default(),
            message_signer: ServiceConfig::default(),
        }],
    }
}

fn attribute(key: &str, value: &str) -> EventAttribute {
    EventAttribute {
        key: key.to_string(),
        value: value.to_string(),
    }
}

/// Bank send into `pokt1vault`.
pub fn cosmos_deposit_tx(
    hash: &str,
    height: u64,
    sender: &str,
    received: u128,
    spent: u128,
    memo: &str,
) -> TxResponse {
    cosmos_deposit_tx_to("pokt1vault", hash, height, sender, received, spent, memo)
}

pub fn cosmos_deposit_tx_to(
    vault: &str,
    hash: &str,
    height: u64,
    sender: &str,
    received: u128,
    spent: u128,
    memo: &str,
) -> TxResponse {
    let event = |kind: &str, mut attributes: Vec<EventAttribute>| {
        attributes.push(attribute("msg_index", "0"));
        Event {
            kind: kind.to_string(),
            attributes,
        }
    };
    TxResponse {
        height,
        txhash: hash.to_string(),
        code: 0,
        raw_log: String::new(),
        tx: Some(TxJson {
            body: TxBodyJson {
                memo: memo.to_string(),
            },
        }),
        events: vec![
            event(
                "message",
                vec![attribute("action", "/cosmos.bank.v1beta1.MsgSend"), attribute("sender", sender)],
            ),
            event(
                "coin_spent",
                vec![attribute("spender", sender), attribute("amount", &format!("{spent}upokt"))],
            ),
            event(
                "coin_received",
                vec![attribute("receiver", vault), attribute("amount", &format!("{received}upokt"))],
            ),
        ],
    }
}

pub fn new_transaction_for_test(hash: &str, to_address: &str) -> NewTransaction {
    NewTransaction {
        hash: hash.to_string(),
        chain: Chain::cosmos(COSMOS_CHAIN_ID, COSMOS_DOMAIN),
        from_address: "pokt1sender".to_string(),
        to_address: to_address.to_string(),
        block_height: 100,
        confirmations: 0,
        status: TransactionStatus::Pending,
    }
}

/// Inbound message to the Cosmos chain; distinct arguments give distinct ids.
pub fn new_message_for_test(origin_transaction_id: RecordId, amount: u128) -> NewMessage {
    let mut content = evm_to_cosmos_content(COSMOS_DOMAIN, amount);
    content.nonce = origin_transaction_id as u32;
    NewMessage {
        origin_transaction_id,
        origin_transaction_hash: format!("{:#x}", H256::from_low_u64_be(origin_transaction_id as u64)),
        chain: Chain::cosmos(COSMOS_CHAIN_ID, COSMOS_DOMAIN),
        content,
    }
}

/// Message dispatched on the test EVM chain.
pub fn evm_to_cosmos_content(destination_domain: u32, amount: u128) -> MessageContent {
    MessageContent {
        version: MESSAGE_VERSION,
        nonce: 7,
        origin_domain: ETH_CHAIN_ID as u32,
        sender: H256::from(EthAddress::repeat_byte(0x42)),
        destination_domain,
        recipient: H256::repeat_byte(0x33),
        body: MessageBody {
            recipient_address: EthAddress::repeat_byte(0x55),
            amount: U256::from(amount),
            sender_address: EthAddress::repeat_byte(0x66),
        },
    }
}

pub fn dispatch_log(mailbox: EthAddress, tx_hash: H256, block: u64, content: &MessageContent) -> Log {
    Log {
        address: mailbox,
        topics: vec![
            DispatchFilter::signature(),
            content.sender,
            H256::from_low_u64_be(content.destination_domain as u64),
            content.recipient,
        ],
        data: ethers::abi::encode(&[Token::Bytes(content.encode())]).into(),
        block_number: Some(U64::from(block)),
        transaction_hash: Some(tx_hash),
        ..Default::default()
    }
}

pub fn evm_receipt(hash: H256, block: u64, success: bool, logs: Vec<Log>) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: hash,
        block_number: Some(U64::from(block)),
        status: Some(U64::from(success as u64)),
        logs,
        ..Default::default()
    }
}

#[derive(Debug)]
struct MockCosmosState {
    height: u64,
    txs: Vec<TxResponse>,
    account: AccountInfo,
    broadcasts: Vec<Vec<u8>>,
    // included transaction hash by the vault sequence it spent
    by_sequence: HashMap<u64, String>,
    fail_next_broadcast: Option<u32>,
    drop_next_broadcast: bool,
    lose_next_broadcast_response: bool,
    reencode: bool,
    fail_searches: bool,
}

/// In-process Cosmos chain. Clones share state.
#[derive(Clone, Debug)]
pub struct MockCosmosClient {
    vault: String,
    state: Arc<Mutex<MockCosmosState>>,
}

impl MockCosmosClient {
    pub fn new(vault: &str) -> Self {
        Self {
            vault: vault.to_string(),
            state: Arc::new(Mutex::new(MockCosmosState {
                height: 100,
                txs: vec![],
                account: AccountInfo {
                    account_number: 7,
                    sequence: 3,
                },
                broadcasts: vec![],
                by_sequence: HashMap::new(),
                fail_next_broadcast: None,
                drop_next_broadcast: false,
                lose_next_broadcast_response: false,
                reencode: false,
                fail_searches: false,
            })),
        }
    }

    pub fn vault(&self) -> String {
        self.vault.clone()
    }

    pub fn add_tx(&self, tx: TxResponse) {
        let mut state = self.state.lock().unwrap();
        state.txs.retain(|t| t.txhash != tx.txhash);
        state.txs.push(tx);
    }

    pub fn set_height(&self, height: u64) {
        self.state.lock().unwrap().height = height;
    }

    pub fn height(&self) -> u64 {
        self.state.lock().unwrap().height
    }

    pub fn advance(&self, blocks: u64) {
        self.state.lock().unwrap().height += blocks;
    }

    pub fn account(&self) -> AccountInfo {
        self.state.lock().unwrap().account
    }

    pub fn set_account_sequence(&self, sequence: u64) {
        self.state.lock().unwrap().account.sequence = sequence;
    }

    pub fn broadcasts(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().broadcasts.clone()
    }

    /// The next broadcast is accepted but executes with `code`.
    pub fn fail_next_broadcast_on_chain(&self, code: u32) {
        self.state.lock().unwrap().fail_next_broadcast = Some(code);
    }

    /// The next broadcast is accepted but never included, as when a
    /// transaction is evicted from the mempool.
    pub fn drop_next_broadcast(&self) {
        self.state.lock().unwrap().drop_next_broadcast = true;
    }

    /// The next broadcast is included but the caller sees a timeout.
    pub fn lose_next_broadcast_response(&self) {
        self.state.lock().unwrap().lose_next_broadcast_response = true;
    }

    /// The node hashes broadcast transactions differently from the local
    /// encoding, as when it re-encodes them.
    pub fn reencode_broadcasts(&self, reencode: bool) {
        self.state.lock().unwrap().reencode = reencode;
    }

    /// Spends the current vault sequence on a transaction nobody recorded.
    pub fn spend_sequence_elsewhere(&self, memo: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let sequence = state.account.sequence;
        let hash = tx_hash(format!("{memo}/{sequence}").as_bytes());
        let response = included_tx(&hash, state.height, 0, memo);
        state.txs.push(response);
        state.by_sequence.insert(sequence, hash.clone());
        state.account.sequence += 1;
        hash
    }

    pub fn fail_searches(&self, fail: bool) {
        self.state.lock().unwrap().fail_searches = fail;
    }
}

fn included_tx(hash: &str, height: u64, code: u32, memo: &str) -> TxResponse {
    TxResponse {
        height,
        txhash: hash.to_string(),
        code,
        raw_log: String::new(),
        tx: Some(TxJson {
            body: TxBodyJson {
                memo: memo.to_string(),
            },
        }),
        events: vec![],
    }
}

#[async_trait]
impl CosmosClient for MockCosmosClient {
    async fn get_latest_block_height(&self) -> OracleResult<u64> {
        Ok(self.state.lock().unwrap().height)
    }

    async fn get_txs_sent_to_address_after_height(
        &self,
        address: &str,
        height: u64,
    ) -> OracleResult<Vec<TxResponse>> {
        let state = self.state.lock().unwrap();
        if state.fail_searches {
            return Err(OracleError::Rpc("search unavailable".to_string()));
        }
        let mut txs: Vec<TxResponse> = state
            .txs
            .iter()
            .filter(|t| t.height > height && t.height <= state.height)
            .filter(|t| {
                t.events_of("coin_received")
                    .any(|e| e.attribute("receiver") == Some(address))
            })
            .cloned()
            .collect();
        txs.sort_by_key(|t| t.height);
        Ok(txs)
    }

    async fn get_tx(&self, hash: &str) -> OracleResult<TxResponse> {
        self.state
            .lock()
            .unwrap()
            .txs
            .iter()
            .find(|t| t.txhash == hash)
            .cloned()
            .ok_or_else(|| OracleError::TxNotFound(hash.to_string()))
    }

    async fn get_account(&self, _address: &str) -> OracleResult<AccountInfo> {
        Ok(self.account())
    }

    async fn find_tx_by_sequence(
        &self,
        _address: &str,
        sequence: u64,
    ) -> OracleResult<Option<TxResponse>> {
        let state = self.state.lock().unwrap();
        if state.fail_searches {
            return Err(OracleError::Rpc("search unavailable".to_string()));
        }
        Ok(state
            .by_sequence
            .get(&sequence)
            .and_then(|hash| state.txs.iter().find(|t| &t.txhash == hash))
            .cloned())
    }

    async fn broadcast_tx(&self, tx_bytes: &[u8]) -> OracleResult<String> {
        let mut state = self.state.lock().unwrap();
        let tx: StdTx = serde_json::from_slice(tx_bytes)?;
        let sequence = tx.signatures.first().map(|s| s.sequence.as_str()).unwrap_or_default();
        if sequence != state.account.sequence.to_string() {
            return Err(OracleError::Rpc(format!(
                "account sequence mismatch, expected {}, got {}",
                state.account.sequence, sequence
            )));
        }
        let hash = if state.reencode {
            tx_hash(&[tx_bytes, b"\n".as_slice()].concat())
        } else {
            tx_hash(tx_bytes)
        };
        state.broadcasts.push(tx_bytes.to_vec());
        if std::mem::take(&mut state.drop_next_broadcast) {
            return Ok(hash);
        }

        let code = state.fail_next_broadcast.take().unwrap_or(0);
        let response = included_tx(&hash, state.height, code, &tx.memo);
        state.txs.push(response);
        let sequence = state.account.sequence;
        state.by_sequence.insert(sequence, hash.clone());
        state.account.sequence += 1;
        if std::mem::take(&mut state.lose_next_broadcast_response) {
            return Err(OracleError::Timeout("broadcast response lost".to_string()));
        }
        Ok(hash)
    }
}

#[derive(Debug)]
struct MockEvmState {
    height: u64,
    receipts: Vec<TransactionReceipt>,
}

/// In-process EVM chain with a single Mailbox. Clones share state.
#[derive(Clone, Debug)]
pub struct MockEvmClient {
    mailbox: EthAddress,
    state: Arc<Mutex<MockEvmState>>,
}

impl MockEvmClient {
    pub fn new(mailbox: EthAddress) -> Self {
        Self {
            mailbox,
            state: Arc::new(Mutex::new(MockEvmState {
                height: 0,
                receipts: vec![],
            })),
        }
    }

    /// Adds a receipt, replacing any earlier one for the same hash.
    pub fn add_receipt(&self, receipt: TransactionReceipt) {
        let mut state = self.state.lock().unwrap();
        state
            .receipts
            .retain(|r| r.transaction_hash != receipt.transaction_hash);
        state.receipts.push(receipt);
    }

    pub fn set_height(&self, height: u64) {
        self.state.lock().unwrap().height = height;
    }
}

#[async_trait]
impl EvmClient for MockEvmClient {
    fn mailbox_address(&self) -> EthAddress {
        self.mailbox
    }

    async fn get_latest_block_height(&self) -> OracleResult<u64> {
        Ok(self.state.lock().unwrap().height)
    }

    async fn get_transaction_receipt(&self, hash: H256) -> OracleResult<Option<TransactionReceipt>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .receipts
            .iter()
            .find(|r| r.transaction_hash == hash)
            .cloned())
    }

    async fn get_dispatch_events(&self, from_block: u64, to_block: u64) -> OracleResult<Vec<DispatchEvent>> {
        let receipts = self.state.lock().unwrap().receipts.clone();
        // reverted transactions emit no logs
        Ok(receipts
            .iter()
            .filter(|r| r.status == Some(U64::from(1)))
            .flat_map(|r| r.logs.iter())
            .filter_map(|log| self.parse_dispatch_event(log))
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .collect())
    }
}

/// A vault of `n` oracles with every key at hand, and factories for the
/// runnables of each oracle.
pub struct OracleTestEnv {
    pub config: OracleConfig,
    pub cosmos_keys: Vec<CosmosKey>,
    pub eth_keys: Vec<EthKey>,
}

impl OracleTestEnv {
    pub fn new(threshold: u32, n: usize) -> Self {
        let (cosmos_keys, eth_keys) = keys_for_test(n);
        let config = node_config_with_keys(threshold, &cosmos_keys, &eth_keys)
            .validate()
            .unwrap();
        Self {
            config,
            cosmos_keys,
            eth_keys,
        }
    }

    /// Config as seen by oracle `index`.
    pub fn config_for(&self, index: usize) -> OracleConfig {
        let mut config = self.config.clone();
        config.cosmos_key = self.cosmos_keys[index].clone();
        config.eth_key = self.eth_keys[index].clone();
        config
    }

    pub fn cosmos_client(&self) -> Arc<MockCosmosClient> {
        Arc::new(MockCosmosClient::new(&self.config.cosmos.multisig_address))
    }

    pub fn depositor_address(&self) -> String {
        bech32_address(&self.config.cosmos.bech32_prefix, &[0x42; 20]).unwrap()
    }

    pub fn evm_origins(&self, evm: &MockEvmClient) -> HashMap<u32, EvmOrigin> {
        let network = &self.config.ethereum[0];
        HashMap::from([(
            network.chain().unwrap().chain_domain,
            EvmOrigin {
                client: Arc::new(evm.clone()),
                confirmations: network.confirmations,
            },
        )])
    }

    pub fn cosmos_signer(
        &self,
        index: usize,
        store: SharedStore,
        cosmos: Arc<MockCosmosClient>,
        evm_origins: HashMap<u32, EvmOrigin>,
    ) -> CosmosSigner {
        CosmosSigner::new(
            &self.config_for(index),
            store,
            cosmos,
            evm_origins,
            Arc::new(OracleMetrics::new_for_testing()),
        )
    }

    pub fn cosmos_relayer(&self, store: SharedStore, cosmos: Arc<MockCosmosClient>) -> CosmosRelayer {
        CosmosRelayer::new(
            &self.config,
            store,
            cosmos,
            Arc::new(OracleMetrics::new_for_testing()),
        )
    }

    pub fn cosmos_monitor(&self, store: SharedStore, cosmos: Arc<MockCosmosClient>) -> CosmosMonitor {
        CosmosMonitor::new(
            &self.config,
            store,
            cosmos,
            Arc::new(OracleMetrics::new_for_testing()),
        )
    }

    pub fn ethereum_monitor(&self, store: SharedStore, evm: &MockEvmClient) -> EthereumMonitor {
        EthereumMonitor::new(
            &self.config,
            &self.config.ethereum[0],
            store,
            Arc::new(evm.clone()),
            Arc::new(OracleMetrics::new_for_testing()),
        )
        .unwrap()
    }

    pub fn ethereum_signer(
        &self,
        index: usize,
        store: SharedStore,
        cosmos: Arc<MockCosmosClient>,
    ) -> EthereumSigner {
        let config = self.config_for(index);
        EthereumSigner::new(
            &config,
            &config.ethereum[0],
            store,
            cosmos,
            Arc::new(OracleMetrics::new_for_testing()),
        )
        .unwrap()
    }
}

/// Puts a confirmed refundable deposit on chain, records its refund and has
/// the oracles at `signers` sign it. Returns the refund id.
pub async fn signed_refund_for_test(
    env: &OracleTestEnv,
    store: &Arc<InMemoryStore>,
    cosmos: &Arc<MockCosmosClient>,
    signers: &[usize],
) -> RecordId {
    signed_refund_for_deposit(env, store, cosmos, signers, 1, "5EED0001").await
}

/// [`signed_refund_for_test`] for the deposit `hash`, recorded as transaction
/// `origin_transaction_id`.
pub async fn signed_refund_for_deposit(
    env: &OracleTestEnv,
    store: &Arc<InMemoryStore>,
    cosmos: &Arc<MockCosmosClient>,
    signers: &[usize],
    origin_transaction_id: RecordId,
    hash: &str,
) -> RecordId {
    let depositor = env.depositor_address();
    cosmos.add_tx(cosmos_deposit_tx_to(&cosmos.vault(), hash, 100, &depositor, 1000, 900, ""));
    cosmos.set_height(cosmos.height().max(110));
    let id = store
        .insert_refund(NewRefund {
            origin_transaction_id,
            origin_transaction_hash: hash.to_string(),
            recipient_address: depositor,
            amount: 1000,
            chain: env.config.cosmos_chain.clone(),
        })
        .await
        .unwrap();
    for index in signers {
        let signer = env.cosmos_signer(*index, store.clone(), cosmos.clone(), HashMap::new());
        assert!(signer.run().await);
    }
    let refund = store.get_refund(id).await.unwrap().unwrap();
    assert_eq!(refund.status, MessageStatus::Signed);
    id
}

/// Delegates to an [`InMemoryStore`], yielding to the scheduler before every
/// call so that concurrently polled services interleave between store calls.
#[derive(Debug)]
pub struct YieldingStore {
    inner: Arc<InMemoryStore>,
}

impl YieldingStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Arc<Self> {
        Arc::new(Self { inner })
    }
}

#[async_trait]
impl OracleStore for YieldingStore {
    async fn insert_transaction(&self, tx: NewTransaction) -> OracleResult<RecordId> {
        tokio::task::yield_now().await;
        self.inner.insert_transaction(tx).await
    }

    async fn get_transaction(&self, id: RecordId) -> OracleResult<Option<Transaction>> {
        tokio::task::yield_now().await;
        self.inner.get_transaction(id).await
    }

    async fn update_transaction(&self, id: RecordId, hash: &str, update: TransactionUpdate) -> OracleResult<()> {
        tokio::task::yield_now().await;
        self.inner.update_transaction(id, hash, update).await
    }

    async fn find_pending_transactions_to(&self, chain_id: &str, to_address: &str) -> OracleResult<Vec<Transaction>> {
        tokio::task::yield_now().await;
        self.inner.find_pending_transactions_to(chain_id, to_address).await
    }

    async fn find_pending_transactions_from(
        &self,
        chain_id: &str,
        from_address: &str,
    ) -> OracleResult<Vec<Transaction>> {
        tokio::task::yield_now().await;
        self.inner.find_pending_transactions_from(chain_id, from_address).await
    }

    async fn find_confirmed_transactions_to(
        &self,
        chain_id: &str,
        to_address: &str,
    ) -> OracleResult<Vec<Transaction>> {
        tokio::task::yield_now().await;
        self.inner.find_confirmed_transactions_to(chain_id, to_address).await
    }

    async fn insert_message(&self, message: NewMessage) -> OracleResult<RecordId> {
        tokio::task::yield_now().await;
        self.inner.insert_message(message).await
    }

    async fn get_message(&self, id: RecordId) -> OracleResult<Option<Message>> {
        tokio::task::yield_now().await;
        self.inner.get_message(id).await
    }

    async fn update_message(&self, id: RecordId, update: SigningUpdate) -> OracleResult<()> {
        tokio::task::yield_now().await;
        self.inner.update_message(id, update).await
    }

    async fn find_pending_messages(&self, signer: &str, chain_id: &str) -> OracleResult<Vec<Message>> {
        tokio::task::yield_now().await;
        self.inner.find_pending_messages(signer, chain_id).await
    }

    async fn find_signed_messages(&self, chain_id: &str) -> OracleResult<Vec<Message>> {
        tokio::task::yield_now().await;
        self.inner.find_signed_messages(chain_id).await
    }

    async fn find_broadcasted_messages_without_tx(&self, chain_id: &str) -> OracleResult<Vec<Message>> {
        tokio::task::yield_now().await;
        self.inner.find_broadcasted_messages_without_tx(chain_id).await
    }

    async fn find_messages_by_transaction_hash(&self, hash: &str) -> OracleResult<Vec<Message>> {
        tokio::task::yield_now().await;
        self.inner.find_messages_by_transaction_hash(hash).await
    }

    async fn insert_refund(&self, refund: NewRefund) -> OracleResult<RecordId> {
        tokio::task::yield_now().await;
        self.inner.insert_refund(refund).await
    }

    async fn get_refund(&self, id: RecordId) -> OracleResult<Option<Refund>> {
        tokio::task::yield_now().await;
        self.inner.get_refund(id).await
    }

    async fn update_refund(&self, id: RecordId, update: SigningUpdate) -> OracleResult<()> {
        tokio::task::yield_now().await;
        self.inner.update_refund(id, update).await
    }

    async fn find_pending_refunds(&self, signer: &str, chain_id: &str) -> OracleResult<Vec<Refund>> {
        tokio::task::yield_now().await;
        self.inner.find_pending_refunds(signer, chain_id).await
    }

    async fn find_signed_refunds(&self, chain_id: &str) -> OracleResult<Vec<Refund>> {
        tokio::task::yield_now().await;
        self.inner.find_signed_refunds(chain_id).await
    }

    async fn find_broadcasted_refunds_without_tx(&self, chain_id: &str) -> OracleResult<Vec<Refund>> {
        tokio::task::yield_now().await;
        self.inner.find_broadcasted_refunds_without_tx(chain_id).await
    }

    async fn find_refunds_by_transaction_hash(&self, hash: &str) -> OracleResult<Vec<Refund>> {
        tokio::task::yield_now().await;
        self.inner.find_refunds_by_transaction_hash(hash).await
    }

    async fn max_sequence(&self, chain_id: &str) -> OracleResult<Option<u64>> {
        tokio::task::yield_now().await;
        self.inner.max_sequence(chain_id).await
    }

    async fn assigned_sequences(&self, chain_id: &str, from: u64) -> OracleResult<Vec<u64>> {
        tokio::task::yield_now().await;
        self.inner.assigned_sequences(chain_id, from).await
    }

    async fn xlock(&self, resource_id: &str) -> OracleResult<String> {
        tokio::task::yield_now().await;
        self.inner.xlock(resource_id).await
    }

    async fn slock(&self, resource_id: &str) -> OracleResult<String> {
        tokio::task::yield_now().await;
        self.inner.slock(resource_id).await
    }

    async fn unlock(&self, lock_id: &str) -> OracleResult<()> {
        tokio::task::yield_now().await;
        self.inner.unlock(lock_id).await
    }

    async fn read_progress(&self, task_name: &str) -> OracleResult<Option<u64>> {
        tokio::task::yield_now().await;
        self.inner.read_progress(task_name).await
    }

    async fn write_progress(&self, task_name: &str, block_height: u64) -> OracleResult<()> {
        tokio::task::yield_now().await;
        self.inner.write_progress(task_name, block_height).await
    }
}
