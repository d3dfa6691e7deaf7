// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Access to one chain: reads, calls, transaction submission and log streams.

use crate::error::BridgeResult;
use crate::transaction::{Receipt, Transaction};
use crate::types::Block;
use async_trait::async_trait;
use ethers::types::{Address, Bytes, Log, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod rpc;
#[cfg(test)]
pub mod simulated;

pub use rpc::RpcBackend;

const LOG_SUBSCRIPTION_BUFFER: usize = 1024;

/// A message call that is executed without creating a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallMsg {
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub data: Bytes,
    pub value: U256,
    pub gas: Option<u64>,
}

impl CallMsg {
    pub fn new(from: Option<Address>, to: Address, data: Bytes) -> Self {
        Self {
            from,
            to: Some(to),
            data,
            ..Default::default()
        }
    }
}

/// Log filter over contract addresses and topic0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogQuery {
    pub addresses: Vec<Address>,
    pub topics0: Vec<H256>,
    pub from_block: u64,
    /// `None` means up to the chain head.
    pub to_block: Option<u64>,
}

impl LogQuery {
    pub fn new(addresses: Vec<Address>, topics0: Vec<H256>) -> Self {
        Self {
            addresses,
            topics0,
            ..Default::default()
        }
    }

    pub fn with_range(mut self, from_block: u64, to_block: Option<u64>) -> Self {
        self.from_block = from_block;
        self.to_block = to_block;
        self
    }

    pub fn matches(&self, log: &Log) -> bool {
        if !self.addresses.is_empty() && !self.addresses.contains(&log.address) {
            return false;
        }
        if !self.topics0.is_empty() {
            match log.topics.first() {
                Some(topic) if self.topics0.contains(topic) => {}
                _ => return false,
            }
        }
        let number = log.block_number.map(|n| n.as_u64()).unwrap_or_default();
        number >= self.from_block && self.to_block.map_or(true, |to| number <= to)
    }
}

/// Live log stream. Dropping it unsubscribes.
#[derive(Debug)]
pub struct LogSubscription {
    receiver: mpsc::Receiver<Log>,
    cancel: CancellationToken,
}

impl LogSubscription {
    /// A subscription and the producer side feeding it. The producer stops
    /// when `cancel` fires or the subscription is dropped.
    pub fn channel() -> (mpsc::Sender<Log>, CancellationToken, LogSubscription) {
        let (tx, receiver) = mpsc::channel(LOG_SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        let subscription = LogSubscription {
            receiver,
            cancel: cancel.clone(),
        };
        (tx, cancel, subscription)
    }

    /// Next log, or `None` once the producer is gone or the subscription
    /// was cancelled.
    pub async fn recv(&mut self) -> Option<Log> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            log = self.receiver.recv() => log,
        }
    }

    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
pub trait ChainBackend: Send + Sync + 'static {
    /// Short label used in logs and metrics, e.g. `parent` or `child`.
    fn name(&self) -> &str;

    async fn chain_id(&self) -> BridgeResult<u64>;

    async fn current_block_number(&self) -> BridgeResult<u64>;

    async fn block_by_number(&self, number: u64) -> BridgeResult<Option<Block>>;

    async fn code_at(&self, address: Address) -> BridgeResult<Bytes>;

    async fn balance_at(&self, address: Address) -> BridgeResult<U256>;

    async fn pending_nonce_at(&self, address: Address) -> BridgeResult<u64>;

    async fn suggest_gas_price(&self) -> BridgeResult<U256>;

    async fn call_contract(&self, msg: &CallMsg) -> BridgeResult<Bytes>;

    async fn estimate_gas(&self, msg: &CallMsg) -> BridgeResult<u64>;

    async fn send_transaction(&self, tx: &Transaction) -> BridgeResult<H256>;

    async fn transaction_receipt(&self, hash: H256) -> BridgeResult<Option<Receipt>>;

    async fn filter_logs(&self, query: &LogQuery) -> BridgeResult<Vec<Log>>;

    async fn subscribe_logs(&self, query: LogQuery) -> BridgeResult<LogSubscription>;

    /// Forwards an opaque JSON-RPC request body and returns the response body.
    async fn raw_rpc(&self, payload: &[u8]) -> BridgeResult<Vec<u8>>;
}

/// Emits every new block of `backend` on `sender`, starting from the head
/// seen on the first tick.
pub fn spawn_head_poller(
    backend: Arc<dyn ChainBackend>,
    interval: Duration,
    sender: mpsc::Sender<Block>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = backend.name().to_string();
        info!("[{}] Starting chain head poller", name);
        let mut last_block: Option<u64> = None;
        let mut interval = time::interval(interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[{}] Chain head poller cancelled", name);
                    break;
                }
                _ = interval.tick() => {
                    let head = match backend.current_block_number().await {
                        Ok(head) => head,
                        Err(e) => {
                            warn!("[{}] Failed to get current block number: {}", name, e);
                            continue;
                        }
                    };
                    let start = match last_block {
                        Some(last) if head <= last => continue,
                        Some(last) => last + 1,
                        None => head,
                    };
                    for number in start..=head {
                        match backend.block_by_number(number).await {
                            Ok(Some(block)) => {
                                if sender.send(block).await.is_err() {
                                    debug!("[{}] Head receiver closed", name);
                                    return;
                                }
                                last_block = Some(number);
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("[{}] Failed to get block {}: {}", name, number, e);
                                break;
                            }
                        }
                    }
                }
            }
        }
    })
}

/// Feeds `query` matches into a subscription by polling `filter_logs`,
/// for nodes that only expose log filtering.
pub fn spawn_log_poller(
    backend: Arc<dyn ChainBackend>,
    query: LogQuery,
    interval: Duration,
) -> LogSubscription {
    let (sender, cancel, subscription) = LogSubscription::channel();
    tokio::spawn(async move {
        let name = backend.name().to_string();
        let mut from_block = query.from_block;
        let mut interval = time::interval(interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("[{}] Log poller cancelled", name);
                    break;
                }
                _ = interval.tick() => {
                    let head = match backend.current_block_number().await {
                        Ok(head) => head,
                        Err(e) => {
                            warn!("[{}] Log poller failed to read head: {}", name, e);
                            continue;
                        }
                    };
                    if from_block == 0 {
                        from_block = head;
                    }
                    if head < from_block {
                        continue;
                    }
                    let window = query.clone().with_range(from_block, Some(head));
                    match backend.filter_logs(&window).await {
                        Ok(logs) => {
                            for log in logs {
                                if sender.send(log).await.is_err() {
                                    return;
                                }
                            }
                            from_block = head + 1;
                        }
                        Err(e) => warn!(
                            "[{}] Log poller failed on blocks {}..={}: {}",
                            name, from_block, head, e
                        ),
                    }
                }
            }
        }
    });
    subscription
}
