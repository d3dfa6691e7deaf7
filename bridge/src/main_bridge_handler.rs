// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Parent side: answers child bridge nodes and indexes anchoring
//! transactions found in parent chain blocks.

use crate::anchoring::AnchoringData;
use crate::chain_backend::ChainBackend;
use crate::error::{BridgeError, BridgeResult};
use crate::peer::{BridgePeer, PeerMessageHandler};
use crate::protocol::{BridgeMessage, ParentChainInfo};
use crate::transaction::{Transaction, TxType};
use crate::types::Block;
use async_trait::async_trait;
use bytes::Bytes;
use ethers::types::{Address, H256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, trace, warn};

/// Serves the requests of connected child bridge nodes against the parent
/// chain node.
pub struct MainBridgeHandler {
    chain_id: u64,
    parent_backend: Arc<dyn ChainBackend>,
}

impl MainBridgeHandler {
    pub fn new(chain_id: u64, parent_backend: Arc<dyn ChainBackend>) -> Self {
        Self {
            chain_id,
            parent_backend,
        }
    }

    pub async fn handle_parent_chain_info_request(
        &self,
        peer: &BridgePeer,
        operator: Address,
    ) -> BridgeResult<()> {
        let nonce = self.parent_backend.pending_nonce_at(operator).await?;
        let gas_price = self.parent_backend.suggest_gas_price().await?;
        debug!(
            "[main-bridge] Parent chain info for {:?}: nonce {}, gas price {}",
            operator, nonce, gas_price
        );
        peer.send_parent_chain_info_response(ParentChainInfo { nonce, gas_price })
            .await
    }

    /// Submits transactions relayed by a child node. Returns how many the
    /// parent node accepted or already knew.
    pub async fn handle_service_chain_txs(&self, peer: &BridgePeer, txs: Vec<Transaction>) -> usize {
        let mut accepted = 0;
        for tx in txs {
            let hash = tx.hash();
            peer.add_to_known_txs(hash).await;
            if let Err(e) = tx.verify_signatures(self.chain_id) {
                warn!("[main-bridge] Dropping tx {:?} from {}: {}", hash, peer.id(), e);
                continue;
            }
            match self.parent_backend.send_transaction(&tx).await {
                Ok(_) | Err(BridgeError::KnownTx(_)) => accepted += 1,
                Err(e) => warn!("[main-bridge] Failed to submit tx {:?}: {}", hash, e),
            }
        }
        accepted
    }

    pub async fn handle_receipt_request(
        &self,
        peer: &BridgePeer,
        hashes: Vec<H256>,
    ) -> BridgeResult<()> {
        let mut receipts = Vec::with_capacity(hashes.len());
        for hash in hashes {
            match self.parent_backend.transaction_receipt(hash).await {
                Ok(Some(receipt)) => receipts.push(receipt),
                Ok(None) => trace!("[main-bridge] No receipt yet for {:?}", hash),
                Err(e) => warn!("[main-bridge] Failed to read receipt of {:?}: {}", hash, e),
            }
        }
        if receipts.is_empty() {
            return Ok(());
        }
        peer.send_receipt_response(receipts).await
    }

    pub async fn handle_rpc_call(&self, peer: &BridgePeer, payload: Bytes) -> BridgeResult<()> {
        let response = self.parent_backend.raw_rpc(&payload).await?;
        peer.send_response_rpc(Bytes::from(response)).await
    }
}

#[async_trait]
impl PeerMessageHandler for MainBridgeHandler {
    async fn handle_message(&self, peer: &Arc<BridgePeer>, msg: BridgeMessage) -> BridgeResult<()> {
        match msg {
            BridgeMessage::ParentChainInfoRequest(operator) => {
                self.handle_parent_chain_info_request(peer, operator).await
            }
            BridgeMessage::ServiceChainTxs(txs) => {
                let count = txs.len();
                let accepted = self.handle_service_chain_txs(peer, txs).await;
                debug!(
                    "[main-bridge] {} of {} txs from {} submitted",
                    accepted,
                    count,
                    peer.id()
                );
                Ok(())
            }
            BridgeMessage::ReceiptRequest(hashes) => self.handle_receipt_request(peer, hashes).await,
            BridgeMessage::Call(payload) => self.handle_rpc_call(peer, payload).await,
            other => Err(BridgeError::Protocol(format!(
                "unexpected message {} from child peer",
                other.code()
            ))),
        }
    }
}

/// Indexes anchoring transactions of parent chain blocks: child block hash
/// to the parent tx hash that anchored it.
pub struct MainChainEventHandler {
    parent_backend: Arc<dyn ChainBackend>,
    last_indexed_block_number: AtomicU64,
    child_block_to_tx: RwLock<HashMap<H256, H256>>,
}

impl MainChainEventHandler {
    pub fn new(parent_backend: Arc<dyn ChainBackend>) -> Self {
        Self {
            parent_backend,
            last_indexed_block_number: AtomicU64::new(0),
            child_block_to_tx: RwLock::new(HashMap::new()),
        }
    }

    pub fn last_indexed_block_number(&self) -> u64 {
        self.last_indexed_block_number.load(Ordering::SeqCst)
    }

    pub async fn child_block_to_parent_tx(&self, child_block_hash: &H256) -> Option<H256> {
        self.child_block_to_tx
            .read()
            .await
            .get(child_block_hash)
            .copied()
    }

    /// Indexes every block between the last indexed one and `head`.
    pub async fn on_parent_head(&self, head: &Block) -> BridgeResult<()> {
        let from = self.last_indexed_block_number() + 1;
        let to = head.number();
        for number in from..=to {
            let block = if number == to {
                head.clone()
            } else {
                match self.parent_backend.block_by_number(number).await? {
                    Some(block) => block,
                    None => {
                        return Err(BridgeError::InvalidBlock(format!(
                            "parent block {} is missing",
                            number
                        )))
                    }
                }
            };
            self.index_block(&block).await;
            self.last_indexed_block_number.store(number, Ordering::SeqCst);
        }
        if from <= to {
            trace!("[main-bridge] Indexed parent blocks {}..={}", from, to);
        }
        Ok(())
    }

    async fn index_block(&self, block: &Block) {
        for tx in &block.transactions {
            let is_anchoring = TxType::try_from(tx.tx_type).map_or(false, |t| t.is_anchoring());
            if !is_anchoring {
                continue;
            }
            match AnchoringData::decode(&tx.input) {
                Ok(data) => {
                    self.child_block_to_tx
                        .write()
                        .await
                        .insert(data.block_hash(), tx.hash);
                    info!(
                        "[main-bridge] Child block {} ({:?}) anchored by {:?}",
                        data.block_number(),
                        data.block_hash(),
                        tx.hash
                    );
                }
                Err(e) => error!(
                    "[main-bridge] Failed to decode anchoring tx {:?}: {}",
                    tx.hash, e
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchoring::AnchoringDataType0;
    use crate::chain_backend::simulated::SimulatedChain;
    use crate::protocol::{StatusData, PROTOCOL_VERSION};
    use crate::test_utils::{random_wallet, signed_value_transfer, CHILD_CHAIN_ID, PARENT_CHAIN_ID};
    use crate::types::BlockHeader;
    use ethers::signers::Signer;
    use ethers::types::U256;
    use tokio::sync::mpsc;

    fn child_peer() -> (Arc<BridgePeer>, mpsc::Receiver<BridgeMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let status = StatusData {
            protocol_version: PROTOCOL_VERSION,
            network_id: 1,
            td: U256::one(),
            current_block: H256::zero(),
            chain_id: CHILD_CHAIN_ID,
        };
        (Arc::new(BridgePeer::new("child".into(), status, tx)), rx)
    }

    #[tokio::test]
    async fn test_relayed_txs_are_submitted_and_receipts_answered() {
        let parent = Arc::new(SimulatedChain::new("parent", PARENT_CHAIN_ID));
        let wallet = random_wallet();
        parent.fund(wallet.address(), 10u64);
        let handler = MainBridgeHandler::new(PARENT_CHAIN_ID, parent.clone());
        let (peer, mut rx) = child_peer();

        handler
            .handle_message(&peer, BridgeMessage::ParentChainInfoRequest(wallet.address()))
            .await
            .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(BridgeMessage::ParentChainInfoResponse(ParentChainInfo { nonce: 0, .. }))
        ));

        let txs: Vec<_> = (0..2)
            .map(|n| signed_value_transfer(&wallet, n, PARENT_CHAIN_ID))
            .collect();
        let wrong_chain = signed_value_transfer(&wallet, 2, CHILD_CHAIN_ID);
        let mut relayed = txs.clone();
        relayed.push(wrong_chain);
        assert_eq!(handler.handle_service_chain_txs(&peer, relayed).await, 2);
        // resending is harmless
        assert_eq!(handler.handle_service_chain_txs(&peer, txs.clone()).await, 2);
        assert!(peer.knows_tx(&txs[0].hash()).await);

        let unknown = H256::repeat_byte(9);
        handler
            .handle_message(
                &peer,
                BridgeMessage::ReceiptRequest(vec![txs[0].hash(), unknown, txs[1].hash()]),
            )
            .await
            .unwrap();
        match rx.recv().await {
            Some(BridgeMessage::ReceiptResponse(receipts)) => {
                assert_eq!(receipts.len(), 2);
                assert!(receipts.iter().all(|r| r.is_successful()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rpc_call_is_proxied() {
        let parent = Arc::new(SimulatedChain::new("parent", PARENT_CHAIN_ID));
        let handler = MainBridgeHandler::new(PARENT_CHAIN_ID, parent.clone());
        let (peer, mut rx) = child_peer();
        let request = br#"{"jsonrpc":"2.0","id":7,"method":"klay_chainID","params":[]}"#;
        handler
            .handle_message(&peer, BridgeMessage::Call(Bytes::from_static(request)))
            .await
            .unwrap();
        let Some(BridgeMessage::Response(payload)) = rx.recv().await else {
            panic!("no rpc response");
        };
        let response: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(response["id"], 7);
        assert_eq!(response["result"], format!("{:#x}", PARENT_CHAIN_ID));
    }

    #[tokio::test]
    async fn test_anchoring_txs_are_indexed() {
        let parent = Arc::new(SimulatedChain::new("parent", PARENT_CHAIN_ID));
        let wallet = random_wallet();
        let child_header = BlockHeader {
            number: 8,
            hash: H256::repeat_byte(8),
            ..Default::default()
        };
        let data = AnchoringDataType0::new(&child_header, 4, 3);
        let mut tx = Transaction::new(
            TxType::ChainDataAnchoring,
            wallet.address(),
            0,
            None,
            U256::zero(),
            crate::anchoring::ANCHORING_TX_GAS_LIMIT,
            U256::one(),
            AnchoringData::encode_type0(&data).into(),
        );
        tx.sign_as_sender(&wallet, PARENT_CHAIN_ID).unwrap();
        parent.advance_blocks(2);
        parent.send_transaction(&tx).await.unwrap();
        parent.advance_blocks(1);

        let indexer = MainChainEventHandler::new(parent.clone());
        let head = parent.block_by_number(parent.head()).await.unwrap().unwrap();
        indexer.on_parent_head(&head).await.unwrap();
        assert_eq!(indexer.last_indexed_block_number(), parent.head());
        assert_eq!(
            indexer.child_block_to_parent_tx(&child_header.hash).await,
            Some(tx.hash())
        );
        assert_eq!(indexer.child_block_to_parent_tx(&H256::zero()).await, None);
    }
}
