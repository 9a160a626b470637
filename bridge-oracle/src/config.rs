// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::time::Duration;

use anyhow::anyhow;
use bridge_oracle_config::Config;
use ethers::types::Address as EthAddress;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use tracing::info;

use crate::cosmos::validator::ValidatorConfig;
use crate::crypto::{parse_public_key_hex, CosmosKey, EthKey, MultisigPublicKey};
use crate::error::OracleResult;
use crate::types::Chain;

fn default_true() -> bool {
    true
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_metrics_port() -> u16 {
    9184
}

fn default_lock_ttl_ms() -> u64 {
    60_000
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_broadcast_timeout_ms() -> u64 {
    60_000
}

fn default_gas_limit() -> u64 {
    200_000
}

fn default_bech32_prefix() -> String {
    "pokt".to_string()
}

/// Polling knobs shared by every runnable.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_interval_ms(),
        }
    }
}

impl ServiceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CosmosNetworkConfig {
    pub chain_id: String,
    // Messaging domain of the Cosmos chain.
    pub chain_domain: u32,
    // REST gateway of a full node.
    pub rest_url: String,
    #[serde(default = "default_bech32_prefix")]
    pub bech32_prefix: String,
    pub coin_denom: String,
    // Fee paid by the vault for every outbound transaction, in `coin_denom`.
    pub tx_fee: u64,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    pub confirmations: u64,
    pub multisig_address: String,
    // Hex compressed secp256k1 keys, in multisig order.
    pub multisig_public_keys: Vec<String>,
    pub multisig_threshold: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    // How long a broadcast transaction may stay off chain before the relayer
    // sends it again or gives its sequence up.
    #[serde(default = "default_broadcast_timeout_ms")]
    pub broadcast_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_block_height: Option<u64>,
    #[serde(default)]
    pub message_monitor: ServiceConfig,
    #[serde(default)]
    pub message_signer: ServiceConfig,
    #[serde(default)]
    pub message_relayer: ServiceConfig,
}

impl CosmosNetworkConfig {
    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_timeout_ms)
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EthereumNetworkConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub confirmations: u64,
    // Mailbox emitting Dispatch events.
    pub mailbox_address: EthAddress,
    // Contract that executes signed mint orders.
    pub mint_controller_address: EthAddress,
    pub oracle_addresses: Vec<EthAddress>,
    pub signature_threshold: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_block_height: Option<u64>,
    #[serde(default)]
    pub message_monitor: ServiceConfig,
    #[serde(default)]
    pub message_signer: ServiceConfig,
}

impl EthereumNetworkConfig {
    pub fn chain(&self) -> OracleResult<Chain> {
        Chain::ethereum(self.chain_id)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct OracleNodeConfig {
    // BIP-39 phrase both signing keys derive from.
    pub mnemonic: String,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    pub cosmos_network: CosmosNetworkConfig,
    #[serde(default)]
    pub ethereum_networks: Vec<EthereumNetworkConfig>,
}

impl Config for OracleNodeConfig {}

/// Everything the pipeline needs, checked and with keys derived.
#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub cosmos: CosmosNetworkConfig,
    pub cosmos_chain: Chain,
    pub multisig: MultisigPublicKey,
    pub cosmos_key: CosmosKey,
    pub eth_key: EthKey,
    pub ethereum: Vec<EthereumNetworkConfig>,
    pub metrics_port: u16,
    pub lock_ttl: Duration,
}

impl OracleNodeConfig {
    pub fn validate(&self) -> anyhow::Result<OracleConfig> {
        info!("Starting config validation");
        let cosmos = &self.cosmos_network;

        let cosmos_key = CosmosKey::from_mnemonic(&self.mnemonic)?;
        let eth_key = EthKey::from_mnemonic(&self.mnemonic)?;

        let keys = cosmos
            .multisig_public_keys
            .iter()
            .map(|k| parse_public_key_hex(k))
            .collect::<Result<Vec<_>, _>>()?;
        let unique: HashSet<_> = keys.iter().collect();
        if unique.len() != keys.len() {
            return Err(anyhow!("multisig-public-keys contains duplicates"));
        }
        let multisig = MultisigPublicKey::new(cosmos.multisig_threshold, keys)?;

        let computed = multisig.address(&cosmos.bech32_prefix)?;
        if computed != cosmos.multisig_address {
            return Err(anyhow!(
                "Multisig address {} does not match public keys and threshold (computed {})",
                cosmos.multisig_address,
                computed
            ));
        }
        if multisig.index_of(&cosmos_key.public_key()).is_none() {
            return Err(anyhow!(
                "Oracle public key {} is not one of the multisig public keys",
                cosmos_key.public_key_hex()
            ));
        }

        let mut chain_ids = HashSet::new();
        for network in &self.ethereum_networks {
            if !chain_ids.insert(network.chain_id) {
                return Err(anyhow!("Duplicate ethereum network {}", network.chain_id));
            }
            network.chain()?;
            if !network.oracle_addresses.contains(&eth_key.address()) {
                return Err(anyhow!(
                    "Oracle address {:#x} is not in oracle-addresses of chain {}",
                    eth_key.address(),
                    network.chain_id
                ));
            }
            if network.signature_threshold == 0
                || network.signature_threshold as usize > network.oracle_addresses.len()
            {
                return Err(anyhow!(
                    "signature-threshold {} out of range for chain {}",
                    network.signature_threshold,
                    network.chain_id
                ));
            }
        }

        info!(
            "Config validated: vault {} ({} of {}), {} ethereum network(s)",
            cosmos.multisig_address,
            multisig.threshold,
            multisig.public_keys.len(),
            self.ethereum_networks.len()
        );

        Ok(OracleConfig {
            cosmos: cosmos.clone(),
            cosmos_chain: Chain::cosmos(cosmos.chain_id.clone(), cosmos.chain_domain),
            multisig,
            cosmos_key,
            eth_key,
            ethereum: self.ethereum_networks.clone(),
            metrics_port: self.metrics_port,
            lock_ttl: Duration::from_millis(self.lock_ttl_ms),
        })
    }
}

impl OracleConfig {
    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            vault_address: self.cosmos.multisig_address.clone(),
            bech32_prefix: self.cosmos.bech32_prefix.clone(),
            coin_denom: self.cosmos.coin_denom.clone(),
            tx_fee: self.cosmos.tx_fee as u128,
            confirmations: self.cosmos.confirmations,
            supported_chain_ids: self
                .ethereum
                .iter()
                .map(|n| n.chain_id.to_string())
                .collect(),
        }
    }

    pub fn cosmos_timeout(&self) -> Duration {
        Duration::from_millis(self.cosmos.timeout_ms)
    }

    /// Identity recorded with this oracle's Cosmos signatures.
    pub fn cosmos_signer(&self) -> String {
        self.cosmos_key.public_key_hex()
    }

    pub fn ethereum_network(&self, chain_domain: u32) -> Option<&EthereumNetworkConfig> {
        self.ethereum
            .iter()
            .find(|n| n.chain_id == chain_domain as u64)
    }
}
