// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Signed transactions waiting to be confirmed on the parent chain.

use crate::config::BridgeTxPoolConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::journal::{run_blocking, RlpJournal};
use crate::metrics::BridgeMetrics;
use crate::transaction::Transaction;
use ethers::types::{Address, H256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

#[derive(Default)]
struct PoolInner {
    // per sender, sorted by nonce
    queue: HashMap<Address, BTreeMap<u64, Transaction>>,
    all: HashMap<H256, Transaction>,
    journal: Option<RlpJournal<Transaction>>,
}

impl PoolInner {
    fn add(&mut self, tx: Transaction, global_queue: u64) -> BridgeResult<()> {
        let hash = tx.hash();
        if self.all.contains_key(&hash) {
            trace!("Discarding already known transaction {:?}", hash);
            return Err(BridgeError::KnownTx(hash));
        }
        if self.all.len() as u64 >= global_queue {
            debug!("Rejecting {:?}, bridge tx pool is full", hash);
            return Err(BridgeError::PoolFull(self.all.len()));
        }
        let list = self.queue.entry(tx.from).or_default();
        if list.contains_key(&tx.nonce) {
            return Err(BridgeError::DuplicatedNonceTx(tx.from, tx.nonce));
        }
        list.insert(tx.nonce, tx.clone());
        self.all.insert(hash, tx);
        trace!("Pooled bridge transaction {:?}", hash);
        Ok(())
    }

    fn remove(&mut self, hash: &H256) -> BridgeResult<Transaction> {
        let tx = self.all.remove(hash).ok_or(BridgeError::UnknownTx(*hash))?;
        if let Some(list) = self.queue.get_mut(&tx.from) {
            list.remove(&tx.nonce);
            if list.is_empty() {
                self.queue.remove(&tx.from);
            }
        }
        Ok(tx)
    }

    fn pending(&self) -> HashMap<Address, Vec<Transaction>> {
        self.queue
            .iter()
            .map(|(sender, list)| (*sender, list.values().cloned().collect()))
            .collect()
    }

    async fn journal_tx(&mut self, tx: Transaction) {
        let hash = tx.hash();
        if let Some(Err(e)) = run_blocking(&mut self.journal, move |j| j.insert(&tx)).await {
            error!("Failed to journal bridge transaction {:?}: {}", hash, e);
        }
    }

    async fn rotate(&mut self) -> BridgeResult<()> {
        let txs: Vec<Transaction> = self
            .queue
            .values()
            .flat_map(|list| list.values().cloned())
            .collect();
        if let Some(result) = run_blocking(&mut self.journal, move |j| j.rotate(txs.iter())).await {
            debug!("Rotated bridge tx journal with {} transactions", result?);
        }
        Ok(())
    }
}

pub struct BridgeTxPool {
    config: BridgeTxPoolConfig,
    inner: Mutex<PoolInner>,
    metrics: Arc<BridgeMetrics>,
}

impl BridgeTxPool {
    /// Opens the pool, replaying and compacting the journal when one is
    /// configured.
    pub async fn new(config: BridgeTxPoolConfig, metrics: Arc<BridgeMetrics>) -> BridgeResult<Self> {
        let config = config.sanitize();
        let pool = Self {
            inner: Mutex::new(PoolInner::default()),
            config,
            metrics,
        };
        if let Some(path) = pool.config.journal.clone() {
            let mut inner = pool.inner.lock().await;
            inner.journal = Some(RlpJournal::new(path));
            let replayed = run_blocking(&mut inner.journal, |j| {
                let mut replayed = vec![];
                j.load(|tx: Transaction| replayed.push(tx)).map(|_| replayed)
            })
            .await
            .transpose()?
            .unwrap_or_default();
            for tx in replayed {
                if let Err(e) = inner.add(tx, pool.config.global_queue) {
                    debug!("Dropping journaled bridge transaction: {}", e);
                }
            }
            if let Err(e) = inner.rotate().await {
                error!("Failed to rotate bridge tx journal: {}", e);
            }
            pool.metrics.bridge_tx_pool_size.set(inner.all.len() as i64);
            info!("Bridge tx pool restored {} transactions", inner.all.len());
        }
        Ok(pool)
    }

    /// Rewrites the journal every `rejournal` until cancelled, then once more.
    pub fn spawn_rejournal_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(pool.config.rejournal);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        pool.stop().await;
                        info!("Bridge tx pool loop is closing");
                        return;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = pool.inner.lock().await.rotate().await {
                            error!("Failed to rotate bridge tx journal: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Final journal rotation, then closes the journal.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Err(e) = inner.rotate().await {
            error!("Failed to rotate bridge tx journal: {}", e);
        }
        if let Some(Err(e)) = run_blocking(&mut inner.journal, |j| j.close()).await {
            error!("Failed to close bridge tx journal: {}", e);
        }
        inner.journal = None;
    }

    pub fn config(&self) -> &BridgeTxPoolConfig {
        &self.config
    }

    /// Number of pooled transactions.
    pub async fn stats(&self) -> usize {
        self.inner.lock().await.all.len()
    }

    pub async fn content(&self) -> HashMap<Address, Vec<Transaction>> {
        self.inner.lock().await.pending()
    }

    /// Every pooled transaction, per sender in nonce order.
    pub async fn pending(&self) -> HashMap<Address, Vec<Transaction>> {
        self.inner.lock().await.pending()
    }

    pub async fn get(&self, hash: &H256) -> Option<Transaction> {
        self.inner.lock().await.all.get(hash).cloned()
    }

    pub async fn get_tx(&self, hash: &H256) -> BridgeResult<Transaction> {
        self.get(hash).await.ok_or(BridgeError::UnknownTx(*hash))
    }

    /// Up to `limit` transactions of `from`, lowest nonce first.
    pub async fn pending_txs_by_address(&self, from: &Address, limit: usize) -> Vec<Transaction> {
        self.inner
            .lock()
            .await
            .queue
            .get(from)
            .map(|list| list.values().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub async fn pending_tx_hashes_by_address(&self, from: &Address, limit: usize) -> Vec<H256> {
        self.pending_txs_by_address(from, limit)
            .await
            .iter()
            .map(Transaction::hash)
            .collect()
    }

    /// Highest pooled nonce of `from`, `None` when it has nothing pooled.
    pub async fn get_max_tx_nonce(&self, from: &Address) -> Option<u64> {
        self.inner
            .lock()
            .await
            .queue
            .get(from)
            .and_then(|list| list.keys().next_back().copied())
    }

    pub async fn add_local(&self, tx: Transaction) -> BridgeResult<()> {
        let mut inner = self.inner.lock().await;
        let result = inner.add(tx.clone(), self.config.global_queue);
        if result.is_ok() {
            inner.journal_tx(tx).await;
        }
        self.metrics.bridge_tx_pool_size.set(inner.all.len() as i64);
        result
    }

    pub async fn add_locals(&self, txs: Vec<Transaction>) -> Vec<BridgeResult<()>> {
        let mut inner = self.inner.lock().await;
        let mut results = Vec::with_capacity(txs.len());
        for tx in txs {
            let result = inner.add(tx.clone(), self.config.global_queue);
            if result.is_ok() {
                inner.journal_tx(tx).await;
            }
            results.push(result);
        }
        self.metrics.bridge_tx_pool_size.set(inner.all.len() as i64);
        results
    }

    /// Removes the given transactions and rewrites the journal.
    pub async fn remove(&self, hashes: &[H256]) -> Vec<BridgeResult<Transaction>> {
        let mut inner = self.inner.lock().await;
        let results: Vec<_> = hashes.iter().map(|hash| inner.remove(hash)).collect();
        if results.iter().any(Result::is_ok) {
            if let Err(e) = inner.rotate().await {
                error!("Failed to rotate bridge tx journal: {}", e);
            }
        }
        self.metrics.bridge_tx_pool_size.set(inner.all.len() as i64);
        results
    }

    pub async fn remove_tx(&self, tx: &Transaction) -> BridgeResult<()> {
        self.remove(&[tx.hash()])
            .await
            .pop()
            .unwrap_or(Err(BridgeError::UnknownTx(tx.hash())))
            .map(|_| ())
    }
}
