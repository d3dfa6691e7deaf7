// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Child side driver: reacts to child chain heads (anchoring, tx and receipt
//! broadcasts, nonce sync) and to messages from parent bridge nodes.

use crate::accounts::BridgeAccounts;
use crate::anchoring::{
    AnchorStore, AnchoringData, AnchoringDataType0, AnchoringPipeline, ANCHORING_TX_GAS_LIMIT,
};
use crate::bridge_pool::BridgeTxPool;
use crate::chain_backend::ChainBackend;
use crate::error::{BridgeError, BridgeResult};
use crate::metrics::BridgeMetrics;
use crate::peer::{BridgePeer, BridgePeerSet, PeerMessageHandler};
use crate::protocol::{BridgeMessage, ParentChainInfo};
use crate::transaction::{Receipt, Transaction, TxType};
use crate::types::Block;
use async_trait::async_trait;
use bytes::Bytes;
use ethers::types::U256;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, trace, warn};

/// Heads between two sync requests while the parent operator nonce is not
/// synced.
pub const SYNC_REQUEST_INTERVAL: u64 = 10;
const RPC_RESPONSE_CHANNEL_SIZE: usize = 64;

pub struct SubBridgeHandler {
    parent_chain_id: u64,
    anchoring: AtomicBool,
    sent_chain_txs_limit: usize,
    accounts: Arc<BridgeAccounts>,
    tx_pool: Arc<BridgeTxPool>,
    peers: Arc<BridgePeerSet>,
    child_backend: Arc<dyn ChainBackend>,
    pipeline: Mutex<AnchoringPipeline>,
    anchors: AnchorStore,
    skip_sync_block_count: AtomicU64,
    rpc_responses: broadcast::Sender<Bytes>,
    rpc_call_lock: Mutex<()>,
    metrics: Arc<BridgeMetrics>,
}

impl SubBridgeHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parent_chain_id: u64,
        anchoring: bool,
        anchoring_period: u64,
        sent_chain_txs_limit: usize,
        accounts: Arc<BridgeAccounts>,
        tx_pool: Arc<BridgeTxPool>,
        peers: Arc<BridgePeerSet>,
        child_backend: Arc<dyn ChainBackend>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        let (rpc_responses, _) = broadcast::channel(RPC_RESPONSE_CHANNEL_SIZE);
        Self {
            parent_chain_id,
            anchoring: AtomicBool::new(anchoring),
            sent_chain_txs_limit,
            accounts,
            tx_pool,
            peers,
            child_backend,
            pipeline: Mutex::new(AnchoringPipeline::new(anchoring_period)),
            anchors: AnchorStore::new(),
            skip_sync_block_count: AtomicU64::new(0),
            rpc_responses,
            rpc_call_lock: Mutex::new(()),
            metrics,
        }
    }

    pub fn parent_chain_id(&self) -> u64 {
        self.parent_chain_id
    }

    pub fn accounts(&self) -> &Arc<BridgeAccounts> {
        &self.accounts
    }

    pub fn anchoring_enabled(&self) -> bool {
        self.anchoring.load(Ordering::SeqCst)
    }

    /// Turns anchoring on or off. Turning it on starts a new counting epoch.
    pub async fn set_anchoring(&self, enabled: bool) {
        if self.anchoring.swap(enabled, Ordering::SeqCst) != enabled {
            self.pipeline.lock().await.reset();
            info!("[sub-bridge] Anchoring enabled: {}", enabled);
        }
    }

    pub fn anchor_store(&self) -> &AnchorStore {
        &self.anchors
    }

    pub async fn tx_count(&self) -> u64 {
        self.pipeline.lock().await.tx_count()
    }

    /// Drives the child side on every new child chain head.
    pub async fn on_child_head(&self, block: &Block) {
        let parent = &self.accounts.parent;
        if parent.is_nonce_synced().await && self.peers.is_empty().await {
            warn!("[sub-bridge] No parent peer left, parent operator nonce is unsynced");
            parent.set_nonce_synced(false).await;
        }

        if parent.is_nonce_synced().await {
            if self.anchoring_enabled() {
                if let Err(e) = self.block_anchoring_manager(block).await {
                    warn!(
                        "[sub-bridge] Anchoring of block {} failed: {}",
                        block.number(),
                        e
                    );
                }
            }
            self.broadcast_service_chain_txs().await;
            self.broadcast_receipt_request().await;
            self.skip_sync_block_count.store(0, Ordering::SeqCst);
        } else {
            self.pipeline.lock().await.reset();
            let skipped = self.skip_sync_block_count.fetch_add(1, Ordering::SeqCst);
            if skipped % SYNC_REQUEST_INTERVAL == 0 {
                self.sync_nonce_and_gas_price().await;
                self.broadcast_receipt_request().await;
            }
        }
    }

    /// Counts transactions up to `block` and queues an anchoring transaction
    /// when `block` closes a period. Returns the queued transaction.
    pub async fn block_anchoring_manager(&self, block: &Block) -> BridgeResult<Option<Transaction>> {
        let mut pipeline = self.pipeline.lock().await;
        if let Some(range) = pipeline.blocks_to_count(block.number()) {
            for number in range {
                let tx_count = if number == block.number() {
                    block.tx_count()
                } else {
                    match self.child_backend.block_by_number(number).await? {
                        Some(b) => b.tx_count(),
                        None => {
                            error!("[sub-bridge] Missed block {} while counting txs", number);
                            break;
                        }
                    }
                };
                pipeline.add_block_tx_count(number, tx_count);
            }
        }
        let Some(data) = pipeline.anchoring_data(block) else {
            return Ok(None);
        };
        let tx = self.submit_anchoring_tx(&data).await?;
        pipeline.commit(block.number());
        self.metrics.anchoring_tx_submitted.inc();
        info!(
            "[sub-bridge] Generated an anchoring tx {:?} for block {} ({:?}), tx count {}",
            tx.hash(),
            block.number(),
            block.hash(),
            data.tx_count
        );
        Ok(Some(tx))
    }

    async fn submit_anchoring_tx(&self, data: &AnchoringDataType0) -> BridgeResult<Transaction> {
        let input = ethers::types::Bytes::from(AnchoringData::encode_type0(data));
        let pool = self.tx_pool.clone();
        self.accounts
            .parent
            .with_signing(|opts| async move {
                let nonce = opts.nonce.ok_or_else(|| {
                    BridgeError::Generic("parent operator nonce is not synced".to_string())
                })?;
                let mut tx = Transaction::new(
                    opts.tx_type(TxType::ChainDataAnchoring),
                    opts.from,
                    nonce,
                    None,
                    U256::zero(),
                    ANCHORING_TX_GAS_LIMIT,
                    opts.gas_price,
                    input,
                );
                opts.sign_tx(&mut tx)?;
                pool.add_local(tx.clone()).await?;
                Ok((tx, true))
            })
            .await
    }

    /// Asks every parent peer for the parent operator's nonce and gas price.
    pub async fn sync_nonce_and_gas_price(&self) {
        let operator = self.accounts.parent.address();
        let sent = self
            .peers
            .broadcast(BridgeMessage::ParentChainInfoRequest(operator))
            .await;
        debug!("[sub-bridge] Requested parent chain info from {} peers", sent);
    }

    /// Sends pending parent operator transactions to the parent peers.
    pub async fn broadcast_service_chain_txs(&self) {
        let operator = self.accounts.parent.address();
        let txs = self
            .tx_pool
            .pending_txs_by_address(&operator, self.sent_chain_txs_limit)
            .await;
        if txs.is_empty() {
            return;
        }
        for peer in self.peers.peers().await {
            if peer.chain_id() != self.parent_chain_id {
                error!(
                    "[sub-bridge] Peer {} is on chain {}, expected {}",
                    peer.id(),
                    peer.chain_id(),
                    self.parent_chain_id
                );
                continue;
            }
            match peer.send_service_chain_txs(txs.clone()).await {
                Ok(n) => trace!("[sub-bridge] Sent {} txs to {}", n, peer.id()),
                Err(e) => warn!("[sub-bridge] Failed to send txs to {}: {}", peer.id(), e),
            }
        }
    }

    /// Asks the parent peers for the receipts of pending transactions.
    pub async fn broadcast_receipt_request(&self) {
        let operator = self.accounts.parent.address();
        let hashes = self
            .tx_pool
            .pending_tx_hashes_by_address(&operator, self.sent_chain_txs_limit)
            .await;
        if hashes.is_empty() {
            return;
        }
        let count = hashes.len();
        let sent = self.peers.broadcast(BridgeMessage::ReceiptRequest(hashes)).await;
        debug!("[sub-bridge] Requested {} receipts from {} peers", count, sent);
    }

    /// Reconciles the parent operator nonce with what the parent node
    /// reports and the transactions still in the pool.
    pub async fn handle_parent_chain_info_response(&self, info: ParentChainInfo) {
        let parent = &self.accounts.parent;
        let local = parent.nonce().await;
        let nonce = match self.tx_pool.get_max_tx_nonce(&parent.address()).await {
            Some(max) => {
                let pool_nonce = max + 1;
                if local > pool_nonce {
                    error!(
                        "[sub-bridge] Parent operator nonce {} is above the pool nonce {}",
                        local, pool_nonce
                    );
                }
                pool_nonce.max(info.nonce)
            }
            None => {
                if local > info.nonce {
                    warn!(
                        "[sub-bridge] Parent operator nonce {} is above the received nonce {}",
                        local, info.nonce
                    );
                }
                info.nonce
            }
        };
        parent.set_nonce(nonce).await;
        parent.set_gas_price(info.gas_price).await;
        parent.set_nonce_synced(true).await;
        info!(
            "[sub-bridge] Parent chain info: received nonce {}, gas price {}, operator nonce {}",
            info.nonce, info.gas_price, nonce
        );
    }

    /// Drops confirmed transactions from the pool and records anchoring
    /// receipts.
    pub async fn handle_receipt_response(&self, receipts: Vec<Receipt>) {
        for receipt in receipts {
            let Some(tx) = self.tx_pool.get(&receipt.tx_hash).await else {
                trace!("[sub-bridge] Receipt of unknown tx {:?}", receipt.tx_hash);
                continue;
            };
            if tx.tx_type.is_anchoring() {
                match AnchoringData::decode(&tx.input) {
                    Ok(data) => {
                        let number = data.block_number();
                        self.anchors
                            .write_receipt_from_parent_chain(data.block_hash(), receipt.clone())
                            .await;
                        if self.anchors.write_anchored_block_number(number) {
                            self.metrics.last_anchored_block_num.set(number as i64);
                        }
                    }
                    Err(e) => {
                        error!(
                            "[sub-bridge] Failed to decode anchoring tx {:?}: {}",
                            receipt.tx_hash, e
                        );
                    }
                }
            }
            if let Err(e) = self.tx_pool.remove_tx(&tx).await {
                debug!("[sub-bridge] {:?} left the pool already: {}", receipt.tx_hash, e);
            }
        }
    }

    /// Forwards a JSON-RPC request to the parent node through a peer and
    /// waits for its response.
    pub async fn call_parent_rpc(&self, payload: Bytes, timeout: Duration) -> BridgeResult<Bytes> {
        let _guard = self.rpc_call_lock.lock().await;
        let peer = self
            .peers
            .peers()
            .await
            .into_iter()
            .next()
            .ok_or(BridgeError::NoPeer)?;
        let mut responses = self.rpc_responses.subscribe();
        peer.send_request_rpc(payload).await?;
        tokio::time::timeout(timeout, responses.recv())
            .await
            .map_err(|_| BridgeError::Timeout("parent rpc response".to_string()))?
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }
}

#[async_trait]
impl PeerMessageHandler for SubBridgeHandler {
    async fn on_peer_registered(&self, peer: &Arc<BridgePeer>) -> BridgeResult<()> {
        if peer.chain_id() != self.parent_chain_id {
            return Err(BridgeError::Protocol(format!(
                "peer chain id {} differs from parent chain id {}",
                peer.chain_id(),
                self.parent_chain_id
            )));
        }
        peer.send_parent_chain_info_request(self.accounts.parent.address())
            .await
    }

    async fn handle_message(&self, peer: &Arc<BridgePeer>, msg: BridgeMessage) -> BridgeResult<()> {
        match msg {
            BridgeMessage::Response(payload) => {
                trace!("[sub-bridge] RPC response from {}", peer.id());
                let _ = self.rpc_responses.send(payload);
            }
            BridgeMessage::ParentChainInfoResponse(info) => {
                self.handle_parent_chain_info_response(info).await
            }
            BridgeMessage::ReceiptResponse(receipts) => {
                debug!("[sub-bridge] {} receipts from {}", receipts.len(), peer.id());
                self.handle_receipt_response(receipts).await
            }
            other => {
                return Err(BridgeError::Protocol(format!(
                    "unexpected message {} from parent peer",
                    other.code()
                )))
            }
        }
        Ok(())
    }
}
