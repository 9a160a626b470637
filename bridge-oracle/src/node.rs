// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::OracleConfig;
use crate::cosmos::client::{CosmosClient, CosmosRestClient};
use crate::cosmos::monitor::CosmosMonitor;
use crate::cosmos::relayer::CosmosRelayer;
use crate::cosmos::signer::{CosmosSigner, EvmOrigin};
use crate::ethereum::client::{EthereumClient, EvmClient};
use crate::ethereum::monitor::EthereumMonitor;
use crate::ethereum::signer::EthereumSigner;
use crate::metrics::OracleMetrics;
use crate::runner::{spawn_runnable, Runnable};
use crate::store::SharedStore;

/// Chain access for one oracle, keyed by EVM chain id.
#[derive(Clone)]
pub struct OracleClients {
    pub cosmos: Arc<dyn CosmosClient>,
    pub ethereum: HashMap<u64, Arc<dyn EvmClient>>,
}

impl OracleClients {
    pub fn from_config(config: &OracleConfig) -> anyhow::Result<Self> {
        let cosmos: Arc<dyn CosmosClient> = Arc::new(CosmosRestClient::new(
            config.cosmos.rest_url.clone(),
            config.cosmos_timeout(),
        )?);
        let mut ethereum: HashMap<u64, Arc<dyn EvmClient>> = HashMap::new();
        for network in &config.ethereum {
            let client = EthereumClient::new(
                &network.rpc_url,
                network.mailbox_address,
                network.timeout(),
            )?;
            ethereum.insert(network.chain_id, Arc::new(client));
        }
        Ok(Self { cosmos, ethereum })
    }
}

/// Instantiates every enabled runnable together with its polling interval.
pub fn build_runnables(
    config: &OracleConfig,
    store: SharedStore,
    clients: &OracleClients,
    metrics: Arc<OracleMetrics>,
) -> anyhow::Result<Vec<(Arc<dyn Runnable>, Duration)>> {
    let mut runnables: Vec<(Arc<dyn Runnable>, Duration)> = vec![];
    let mut evm_origins = HashMap::new();

    for network in &config.ethereum {
        let client = clients
            .ethereum
            .get(&network.chain_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No client for ethereum chain {}", network.chain_id))?;
        evm_origins.insert(
            network.chain()?.chain_domain,
            EvmOrigin {
                client: client.clone(),
                confirmations: network.confirmations,
            },
        );

        if network.message_monitor.enabled {
            runnables.push((
                Arc::new(EthereumMonitor::new(
                    config,
                    network,
                    store.clone(),
                    client,
                    metrics.clone(),
                )?),
                network.message_monitor.interval(),
            ));
        }
        if network.message_signer.enabled {
            runnables.push((
                Arc::new(EthereumSigner::new(
                    config,
                    network,
                    store.clone(),
                    clients.cosmos.clone(),
                    metrics.clone(),
                )?),
                network.message_signer.interval(),
            ));
        }
    }

    let cosmos = &config.cosmos;
    if cosmos.message_monitor.enabled {
        runnables.push((
            Arc::new(CosmosMonitor::new(
                config,
                store.clone(),
                clients.cosmos.clone(),
                metrics.clone(),
            )),
            cosmos.message_monitor.interval(),
        ));
    }
    if cosmos.message_signer.enabled {
        runnables.push((
            Arc::new(CosmosSigner::new(
                config,
                store.clone(),
                clients.cosmos.clone(),
                evm_origins,
                metrics.clone(),
            )),
            cosmos.message_signer.interval(),
        ));
    }
    if cosmos.message_relayer.enabled {
        runnables.push((
            Arc::new(CosmosRelayer::new(
                config,
                store,
                clients.cosmos.clone(),
                metrics,
            )),
            cosmos.message_relayer.interval(),
        ));
    }
    Ok(runnables)
}

pub fn spawn_oracle_node(
    config: &OracleConfig,
    store: SharedStore,
    clients: &OracleClients,
    metrics: Arc<OracleMetrics>,
    cancel: CancellationToken,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let runnables = build_runnables(config, store, clients, metrics.clone())?;
    info!("Starting {} runnable(s)", runnables.len());
    Ok(runnables
        .into_iter()
        .map(|(runnable, interval)| {
            spawn_runnable(runnable, interval, metrics.clone(), cancel.clone())
        })
        .collect())
}

pub async fn run_oracle_node(
    config: OracleConfig,
    store: SharedStore,
    registry: &Registry,
    cancel: CancellationToken,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let metrics = Arc::new(OracleMetrics::new(registry));
    let clients = OracleClients::from_config(&config)?;
    info!(
        "Oracle {} watching vault {} on {}",
        config.cosmos_signer(),
        config.cosmos.multisig_address,
        config.cosmos.chain_id
    );
    spawn_oracle_node(&config, store, &clients, metrics, cancel)
}
