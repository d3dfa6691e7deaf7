// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{spawn_log_poller, CallMsg, ChainBackend, LogQuery, LogSubscription};
use crate::abi::decode_revert_reason;
use crate::error::{BridgeError, BridgeResult, RevertInfo};
use crate::metrics::BridgeMetrics;
use crate::transaction::{Receipt, RECEIPT_STATUS_SUCCESSFUL};
use crate::types::{Block, BlockHeader, BlockTransaction};
use async_trait::async_trait;
use ethers::providers::{Http, JsonRpcClient, Provider, ProviderError, RpcError};
use ethers::types::{Address, Bytes, Log, H256, U256, U64};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tap::TapFallible;
use url::Url;

const DEFAULT_LOG_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcBlockTransaction {
    hash: H256,
    #[serde(default)]
    type_int: u64,
    #[serde(default)]
    input: Option<Bytes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcBlock {
    number: U64,
    hash: H256,
    parent_hash: H256,
    transactions_root: H256,
    receipts_root: H256,
    state_root: H256,
    #[serde(default)]
    transactions: Vec<RpcBlockTransaction>,
}

impl From<RpcBlock> for Block {
    fn from(block: RpcBlock) -> Self {
        Block {
            header: BlockHeader {
                number: block.number.as_u64(),
                hash: block.hash,
                parent_hash: block.parent_hash,
                transactions_root: block.transactions_root,
                receipts_root: block.receipts_root,
                state_root: block.state_root,
            },
            transactions: block
                .transactions
                .into_iter()
                .map(|tx| BlockTransaction {
                    hash: tx.hash,
                    tx_type: tx.type_int as u8,
                    input: tx.input.unwrap_or_default(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: H256,
    status: U64,
    #[serde(default)]
    gas_used: U64,
    #[serde(default)]
    block_number: U64,
    #[serde(default)]
    contract_address: Option<Address>,
    #[serde(default)]
    logs: Vec<Log>,
    #[serde(default)]
    revert_reason: Option<String>,
}

impl From<RpcReceipt> for Receipt {
    fn from(receipt: RpcReceipt) -> Self {
        Receipt {
            tx_hash: receipt.transaction_hash,
            status: receipt.status.as_u64(),
            gas_used: receipt.gas_used.as_u64(),
            block_number: receipt.block_number.as_u64(),
            contract_address: receipt.contract_address,
            logs: receipt.logs,
            revert_reason: receipt
                .revert_reason
                .filter(|_| receipt.status.as_u64() != RECEIPT_STATUS_SUCCESSFUL),
        }
    }
}

fn call_object(msg: &CallMsg) -> Value {
    let mut object = json!({
        "data": msg.data,
        "value": msg.value,
    });
    if let Some(from) = msg.from {
        object["from"] = json!(from);
    }
    if let Some(to) = msg.to {
        object["to"] = json!(to);
    }
    if let Some(gas) = msg.gas {
        object["gas"] = json!(U64::from(gas));
    }
    object
}

fn filter_object(query: &LogQuery) -> Value {
    let to_block = match query.to_block {
        Some(to) => json!(U64::from(to)),
        None => json!("latest"),
    };
    json!({
        "address": query.addresses,
        "topics": [query.topics0],
        "fromBlock": U64::from(query.from_block),
        "toBlock": to_block,
    })
}

/// Maps a node error, recognising contract reverts by message or data.
fn classify_provider_error(method: &str, to: Option<Address>, err: ProviderError) -> BridgeError {
    if let Some(response) = err.as_error_response() {
        let revert_data = response
            .data
            .as_ref()
            .and_then(|data| data.as_str())
            .and_then(|data| hex::decode(data.trim_start_matches("0x")).ok())
            .and_then(|data| decode_revert_reason(&data));
        if let Some(reason) = revert_data {
            return BridgeError::OnChainRevert(RevertInfo::new(to, reason));
        }
        let message = response.message.to_lowercase();
        if message.contains("revert") {
            let reason = response
                .message
                .split_once(':')
                .map(|(_, reason)| reason.trim().to_string())
                .unwrap_or_else(|| response.message.clone());
            return BridgeError::OnChainRevert(RevertInfo::new(to, reason));
        }
    }
    BridgeError::Transport(format!("{}: {}", method, err))
}

/// `ChainBackend` over a node's `klay_*` JSON-RPC namespace.
pub struct RpcBackend<P> {
    name: String,
    provider: Arc<Provider<P>>,
    rpc_url: Option<Url>,
    http: reqwest::Client,
    timeout: Duration,
    log_poll_interval: Duration,
    metrics: Arc<BridgeMetrics>,
}

impl<P> Clone for RpcBackend<P> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            provider: self.provider.clone(),
            rpc_url: self.rpc_url.clone(),
            http: self.http.clone(),
            timeout: self.timeout,
            log_poll_interval: self.log_poll_interval,
            metrics: self.metrics.clone(),
        }
    }
}

impl RpcBackend<Http> {
    pub fn new_http(
        name: &str,
        url: &str,
        timeout: Duration,
        metrics: Arc<BridgeMetrics>,
    ) -> anyhow::Result<Self> {
        let url = Url::parse(url)?;
        let provider = Provider::new(Http::new(url.clone()));
        Ok(Self::new(name, provider, Some(url), timeout, metrics))
    }
}

impl<P> RpcBackend<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn new(
        name: &str,
        provider: Provider<P>,
        rpc_url: Option<Url>,
        timeout: Duration,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            name: name.to_string(),
            provider: Arc::new(provider),
            rpc_url,
            http: reqwest::Client::new(),
            timeout,
            log_poll_interval: DEFAULT_LOG_POLL_INTERVAL,
            metrics,
        }
    }

    pub fn with_log_poll_interval(mut self, interval: Duration) -> Self {
        self.log_poll_interval = interval;
        self
    }

    async fn request<T, R>(&self, method: &str, params: T, to: Option<Address>) -> BridgeResult<R>
    where
        T: Debug + Serialize + Send + Sync,
        R: Serialize + DeserializeOwned + Debug + Send,
    {
        self.metrics
            .rpc_queries
            .with_label_values(&[&self.name, method])
            .inc();
        let _guard = self
            .metrics
            .rpc_queries_latency
            .with_label_values(&[&self.name, method])
            .start_timer();

        match tokio::time::timeout(self.timeout, self.provider.request(method, params)).await {
            Err(_) => Err(BridgeError::Timeout(format!(
                "[{}] {} exceeded {:?}",
                self.name, method, self.timeout
            ))),
            Ok(result) => result.map_err(|e| classify_provider_error(method, to, e)),
        }
    }
}

#[async_trait]
impl<P> ChainBackend for RpcBackend<P>
where
    P: JsonRpcClient + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn chain_id(&self) -> BridgeResult<u64> {
        let id: U64 = self.request("klay_chainID", (), None).await?;
        Ok(id.as_u64())
    }

    async fn current_block_number(&self) -> BridgeResult<u64> {
        let number: U64 = self.request("klay_blockNumber", (), None).await?;
        Ok(number.as_u64())
    }

    async fn block_by_number(&self, number: u64) -> BridgeResult<Option<Block>> {
        let block: Option<RpcBlock> = self
            .request("klay_getBlockByNumber", (U64::from(number), true), None)
            .await?;
        Ok(block.map(Block::from))
    }

    async fn code_at(&self, address: Address) -> BridgeResult<Bytes> {
        self.request("klay_getCode", (address, "latest"), None).await
    }

    async fn balance_at(&self, address: Address) -> BridgeResult<U256> {
        self.request("klay_getBalance", (address, "latest"), None)
            .await
    }

    async fn pending_nonce_at(&self, address: Address) -> BridgeResult<u64> {
        let nonce: U64 = self
            .request("klay_getTransactionCount", (address, "pending"), None)
            .await?;
        Ok(nonce.as_u64())
    }

    async fn suggest_gas_price(&self) -> BridgeResult<U256> {
        self.request("klay_gasPrice", (), None).await
    }

    async fn call_contract(&self, msg: &CallMsg) -> BridgeResult<Bytes> {
        self.request("klay_call", (call_object(msg), "latest"), msg.to)
            .await
    }

    async fn estimate_gas(&self, msg: &CallMsg) -> BridgeResult<u64> {
        let gas: U64 = self
            .request("klay_estimateGas", [call_object(msg)], msg.to)
            .await?;
        Ok(gas.as_u64())
    }

    async fn send_transaction(&self, tx: &crate::transaction::Transaction) -> BridgeResult<H256> {
        self.request("klay_sendRawTransaction", [tx.raw_bytes()], tx.to)
            .await
            .map_err(|e| match e {
                BridgeError::Transport(msg) if msg.contains("known transaction") => {
                    BridgeError::KnownTx(tx.hash())
                }
                other => other,
            })
            .tap_err(|e| {
                tracing::warn!("[{}] Failed to send tx {:?}: {}", self.name, tx.hash(), e)
            })
    }

    async fn transaction_receipt(&self, hash: H256) -> BridgeResult<Option<Receipt>> {
        let receipt: Option<RpcReceipt> = self
            .request("klay_getTransactionReceipt", [hash], None)
            .await?;
        Ok(receipt.map(Receipt::from))
    }

    async fn filter_logs(&self, query: &LogQuery) -> BridgeResult<Vec<Log>> {
        self.request("klay_getLogs", [filter_object(query)], None)
            .await
    }

    async fn subscribe_logs(&self, query: LogQuery) -> BridgeResult<LogSubscription> {
        let backend: Arc<dyn ChainBackend> = Arc::new(self.clone());
        Ok(spawn_log_poller(backend, query, self.log_poll_interval))
    }

    async fn raw_rpc(&self, payload: &[u8]) -> BridgeResult<Vec<u8>> {
        let url = self
            .rpc_url
            .clone()
            .ok_or_else(|| BridgeError::Transport(format!("[{}] no rpc url", self.name)))?;
        let response = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload.to_vec())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| BridgeError::Transport(format!("raw rpc: {}", e)))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| BridgeError::Transport(format!("raw rpc body: {}", e)))?;
        Ok(body.to_vec())
    }
}
