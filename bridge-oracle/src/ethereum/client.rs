// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! EVM chain access: block height, receipts and Mailbox `Dispatch` events.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use ethers::abi::RawLog;
use ethers::contract::EthEvent;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address as EthAddress, Bytes, Filter, Log, TransactionReceipt, H256};
use tap::TapFallible;
use tracing::{debug, warn};

use crate::encoding::MessageContent;
use crate::error::{OracleError, OracleResult};

/// `Dispatch(address indexed sender, uint32 indexed destination, bytes32 indexed recipient, bytes message)`
#[derive(Clone, Debug, PartialEq, Eq, EthEvent)]
#[ethevent(name = "Dispatch", abi = "Dispatch(address,uint32,bytes32,bytes)")]
pub struct DispatchFilter {
    #[ethevent(indexed)]
    pub sender: EthAddress,
    #[ethevent(indexed)]
    pub destination: u32,
    #[ethevent(indexed)]
    pub recipient: [u8; 32],
    pub message: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchEvent {
    pub tx_hash: H256,
    pub block_number: u64,
    pub sender: EthAddress,
    pub destination: u32,
    pub recipient: H256,
    pub message: MessageContent,
}

impl DispatchEvent {
    pub fn message_id(&self) -> String {
        self.message.message_id_hex()
    }
}

/// Decodes a Mailbox `Dispatch` log. Returns `None` for any other log.
pub fn parse_dispatch_event(mailbox: EthAddress, log: &Log) -> Option<DispatchEvent> {
    if log.address != mailbox || log.topics.first() != Some(&DispatchFilter::signature()) {
        return None;
    }
    let decoded = DispatchFilter::decode_log(&RawLog::from(log.clone()))
        .tap_err(|e| warn!("[EthereumClient] Undecodable Dispatch log: {:?}", e))
        .ok()?;
    let message = MessageContent::decode(&decoded.message)
        .tap_err(|e| warn!("[EthereumClient] Undecodable dispatched message: {}", e))
        .ok()?;
    Some(DispatchEvent {
        tx_hash: log.transaction_hash.unwrap_or_default(),
        block_number: log.block_number.map(|b| b.as_u64()).unwrap_or_default(),
        sender: decoded.sender,
        destination: decoded.destination,
        recipient: H256::from(decoded.recipient),
        message,
    })
}

#[async_trait]
pub trait EvmClient: Send + Sync {
    fn mailbox_address(&self) -> EthAddress;

    async fn get_latest_block_height(&self) -> OracleResult<u64>;

    /// `None` while the transaction is unknown or not yet mined.
    async fn get_transaction_receipt(&self, hash: H256) -> OracleResult<Option<TransactionReceipt>>;

    /// Mailbox dispatches in `[from_block, to_block]`.
    async fn get_dispatch_events(&self, from_block: u64, to_block: u64)
        -> OracleResult<Vec<DispatchEvent>>;

    fn parse_dispatch_event(&self, log: &Log) -> Option<DispatchEvent> {
        parse_dispatch_event(self.mailbox_address(), log)
    }
}

#[derive(Clone, Debug)]
pub struct EthereumClient {
    provider: Provider<Http>,
    mailbox_address: EthAddress,
    timeout: Duration,
}

impl EthereumClient {
    pub fn new(rpc_url: &str, mailbox_address: EthAddress, timeout: Duration) -> OracleResult<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| OracleError::InvalidConfig(format!("rpc url {rpc_url}: {e}")))?;
        Ok(Self {
            provider,
            mailbox_address,
            timeout,
        })
    }

    async fn call<T, E, F>(&self, what: &str, f: F) -> OracleResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        tokio::time::timeout(self.timeout, f)
            .await
            .map_err(|_| OracleError::Timeout(what.to_string()))?
            .map_err(|e| OracleError::Rpc(format!("{what}: {e}")))
    }
}

#[async_trait]
impl EvmClient for EthereumClient {
    fn mailbox_address(&self) -> EthAddress {
        self.mailbox_address
    }

    async fn get_latest_block_height(&self) -> OracleResult<u64> {
        let number = self
            .call("eth_blockNumber", self.provider.get_block_number())
            .await?;
        Ok(number.as_u64())
    }

    async fn get_transaction_receipt(&self, hash: H256) -> OracleResult<Option<TransactionReceipt>> {
        self.call(
            "eth_getTransactionReceipt",
            self.provider.get_transaction_receipt(hash),
        )
        .await
    }

    async fn get_dispatch_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> OracleResult<Vec<DispatchEvent>> {
        let filter = Filter::new()
            .from_block(from_block)
            .to_block(to_block)
            .address(self.mailbox_address)
            .topic0(DispatchFilter::signature());
        let logs = self
            .call("eth_getLogs", self.provider.get_logs(&filter))
            .await
            .tap_err(|e| warn!("[EthereumClient] get_logs failed. Filter: {:?}. Error {}", filter, e))?;
        debug!(
            "[EthereumClient] {} Dispatch log(s) in [{}, {}]",
            logs.len(),
            from_block,
            to_block
        );
        Ok(logs
            .iter()
            .filter_map(|log| self.parse_dispatch_event(log))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{dispatch_log, evm_to_cosmos_content};

    #[test]
    fn test_parse_dispatch_log() {
        let mailbox = EthAddress::repeat_byte(0x11);
        let content = evm_to_cosmos_content(1000, 5_000);
        let log = dispatch_log(mailbox, H256::repeat_byte(0xaa), 50, &content);

        let event = parse_dispatch_event(mailbox, &log).unwrap();
        assert_eq!(event.block_number, 50);
        assert_eq!(event.tx_hash, H256::repeat_byte(0xaa));
        assert_eq!(event.destination, 1000);
        assert_eq!(event.message, content);
        assert_eq!(event.message_id(), content.message_id_hex());
    }

    #[test]
    fn test_ignores_foreign_logs() {
        let mailbox = EthAddress::repeat_byte(0x11);
        let content = evm_to_cosmos_content(1000, 5_000);
        let log = dispatch_log(mailbox, H256::repeat_byte(0xaa), 50, &content);
        assert!(parse_dispatch_event(EthAddress::repeat_byte(0x22), &log).is_none());

        let mut other_topic = log.clone();
        other_topic.topics[0] = H256::repeat_byte(9);
        assert!(parse_dispatch_event(mailbox, &other_topic).is_none());

        let mut garbage = log;
        garbage.data = Bytes::from(vec![1, 2, 3]);
        assert!(parse_dispatch_event(mailbox, &garbage).is_none());
    }
}
