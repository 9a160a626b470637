// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cosmos chain access over the REST gateway.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use tracing::debug;

use super::tx::{AccountInfo, TxResponse};
use crate::error::{OracleError, OracleResult};

const TX_SEARCH_PAGE_LIMIT: u64 = 100;

#[async_trait]
pub trait CosmosClient: Send + Sync {
    async fn get_latest_block_height(&self) -> OracleResult<u64>;

    /// Transactions that transferred into `address` above `height`, oldest first.
    async fn get_txs_sent_to_address_after_height(
        &self,
        address: &str,
        height: u64,
    ) -> OracleResult<Vec<TxResponse>>;

    /// Fails with [`OracleError::TxNotFound`] when the chain does not know `hash`.
    async fn get_tx(&self, hash: &str) -> OracleResult<TxResponse>;

    /// The indexed transaction that `address` signed with account `sequence`.
    /// Finds a transaction whose hash the node computed differently.
    async fn find_tx_by_sequence(
        &self,
        address: &str,
        sequence: u64,
    ) -> OracleResult<Option<TxResponse>>;

    async fn get_account(&self, address: &str) -> OracleResult<AccountInfo>;

    /// Submits signed transaction bytes, returning the transaction hash.
    async fn broadcast_tx(&self, tx_bytes: &[u8]) -> OracleResult<String>;
}

#[derive(Clone, Debug)]
pub struct CosmosRestClient {
    http_client: reqwest::Client,
    rest_url: String,
}

#[derive(Deserialize)]
struct LatestBlockResponse {
    block: BlockJson,
}

#[derive(Deserialize)]
struct BlockJson {
    header: HeaderJson,
}

#[serde_as]
#[derive(Deserialize)]
struct HeaderJson {
    #[serde_as(as = "DisplayFromStr")]
    height: u64,
}

#[derive(Deserialize)]
struct GetTxResponse {
    tx_response: TxResponse,
}

#[serde_as]
#[derive(Deserialize)]
struct SearchTxsResponse {
    #[serde(default)]
    tx_responses: Vec<TxResponse>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Deserialize)]
struct AccountResponse {
    account: AccountJson,
}

#[serde_as]
#[derive(Deserialize)]
struct AccountJson {
    #[serde_as(as = "DisplayFromStr")]
    account_number: u64,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default)]
    sequence: u64,
}

#[derive(Deserialize)]
struct BroadcastResponse {
    txhash: Option<String>,
    #[serde(default)]
    code: u32,
    #[serde(default)]
    raw_log: String,
}

impl CosmosRestClient {
    pub fn new(rest_url: impl Into<String>, timeout: Duration) -> OracleResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .build()
            .map_err(|e| OracleError::InvalidConfig(format!("http client: {e}")))?;
        Ok(Self {
            http_client,
            rest_url: rest_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> OracleResult<T> {
        let url = format!("{}{}", self.rest_url, path);
        debug!("[CosmosRest] GET {}", url);
        let response = self
            .http_client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(OracleError::TxNotFound(path.to_string()));
        }
        let response = response
            .error_for_status()
            .map_err(map_reqwest_error)?;
        response.json::<T>().await.map_err(map_reqwest_error)
    }

    /// All pages of a transaction search, oldest first.
    async fn search_txs(&self, query: &str) -> OracleResult<Vec<TxResponse>> {
        let mut txs = Vec::new();
        let mut page = 1;
        loop {
            let response: SearchTxsResponse = self
                .get_json(
                    "/cosmos/tx/v1beta1/txs",
                    &[
                        ("query", query.to_string()),
                        ("order_by", "ORDER_BY_ASC".to_string()),
                        ("page", page.to_string()),
                        ("limit", TX_SEARCH_PAGE_LIMIT.to_string()),
                    ],
                )
                .await?;
            let fetched = response.tx_responses.len() as u64;
            txs.extend(response.tx_responses);
            let total = response.total.unwrap_or(0);
            if fetched < TX_SEARCH_PAGE_LIMIT || txs.len() as u64 >= total {
                break;
            }
            page += 1;
        }
        Ok(txs)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> OracleError {
    if e.is_timeout() {
        OracleError::Timeout(e.to_string())
    } else {
        OracleError::Rpc(e.to_string())
    }
}

#[async_trait]
impl CosmosClient for CosmosRestClient {
    async fn get_latest_block_height(&self) -> OracleResult<u64> {
        let response: LatestBlockResponse = self
            .get_json("/cosmos/base/tendermint/v1beta1/blocks/latest", &[])
            .await?;
        Ok(response.block.header.height)
    }

    async fn get_txs_sent_to_address_after_height(
        &self,
        address: &str,
        height: u64,
    ) -> OracleResult<Vec<TxResponse>> {
        self.search_txs(&format!(
            "transfer.recipient='{address}' AND tx.height>{height}"
        ))
        .await
    }

    async fn get_tx(&self, hash: &str) -> OracleResult<TxResponse> {
        let response: GetTxResponse = self
            .get_json(&format!("/cosmos/tx/v1beta1/txs/{hash}"), &[])
            .await
            .map_err(|e| match e {
                OracleError::TxNotFound(_) => OracleError::TxNotFound(hash.to_string()),
                other => other,
            })?;
        Ok(response.tx_response)
    }

    async fn find_tx_by_sequence(
        &self,
        address: &str,
        sequence: u64,
    ) -> OracleResult<Option<TxResponse>> {
        let txs = match self
            .search_txs(&format!("tx.acc_seq='{address}/{sequence}'"))
            .await
        {
            Ok(txs) => txs,
            // some gateways answer an empty search with 404
            Err(OracleError::TxNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(txs.into_iter().next())
    }

    async fn get_account(&self, address: &str) -> OracleResult<AccountInfo> {
        let response: AccountResponse = self
            .get_json(&format!("/cosmos/auth/v1beta1/accounts/{address}"), &[])
            .await
            .map_err(|e| match e {
                OracleError::TxNotFound(_) => {
                    OracleError::Rpc(format!("account {address} not found"))
                }
                other => other,
            })?;
        Ok(AccountInfo {
            account_number: response.account.account_number,
            sequence: response.account.sequence,
        })
    }

    async fn broadcast_tx(&self, tx_bytes: &[u8]) -> OracleResult<String> {
        let tx: serde_json::Value = serde_json::from_slice(tx_bytes)?;
        let url = format!("{}/txs", self.rest_url);
        let response = self
            .http_client
            .post(&url)
            .json(&serde_json::json!({ "tx": tx, "mode": "sync" }))
            .send()
            .await
            .map_err(map_reqwest_error)?
            .error_for_status()
            .map_err(map_reqwest_error)?;
        let response: BroadcastResponse = response.json().await.map_err(map_reqwest_error)?;
        if response.code != 0 {
            return Err(OracleError::Rpc(format!(
                "broadcast rejected with code {}: {}",
                response.code, response.raw_log
            )));
        }
        response
            .txhash
            .ok_or_else(|| OracleError::Rpc("broadcast response without txhash".to_string()))
    }
}
