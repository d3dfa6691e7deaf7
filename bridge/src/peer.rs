// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Connected bridge nodes on the other chain and the per-connection message
//! loop.

use crate::chain_backend::ChainBackend;
use crate::error::{BridgeError, BridgeResult};
use crate::metrics::BridgeMetrics;
use crate::protocol::{
    validate_status, BridgeCodec, BridgeMessage, ParentChainInfo, ProtocolError, StatusData,
    HANDSHAKE_TIMEOUT, PROTOCOL_VERSION,
};
use crate::transaction::{Receipt, Transaction};
use async_trait::async_trait;
use bytes::Bytes;
use ethers::types::{Address, H256, U256};
use futures::{SinkExt, StreamExt};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Transaction hashes remembered per peer so a tx is not sent twice.
pub const MAX_KNOWN_TXS: usize = 32_768;
const PEER_OUTBOUND_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerSetError {
    #[error("peer set is closed")]
    Closed,
    #[error("peer {0} is already registered")]
    AlreadyRegistered(String),
    #[error("peer {0} is not registered")]
    NotRegistered(String),
}

impl From<PeerSetError> for BridgeError {
    fn from(err: PeerSetError) -> Self {
        BridgeError::Protocol(err.to_string())
    }
}

/// Reacts to messages received from a peer.
#[async_trait]
pub trait PeerMessageHandler: Send + Sync {
    /// Called once the peer passed the handshake and joined the set. An
    /// error disconnects the peer.
    async fn on_peer_registered(&self, _peer: &Arc<BridgePeer>) -> BridgeResult<()> {
        Ok(())
    }

    async fn handle_message(&self, peer: &Arc<BridgePeer>, msg: BridgeMessage) -> BridgeResult<()>;
}

pub struct BridgePeer {
    id: String,
    status: StatusData,
    outbound: mpsc::Sender<BridgeMessage>,
    known_txs: Mutex<LruCache<H256, ()>>,
    closed: CancellationToken,
}

impl std::fmt::Debug for BridgePeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgePeer")
            .field("id", &self.id)
            .field("chain_id", &self.status.chain_id)
            .finish()
    }
}

impl BridgePeer {
    pub fn new(id: String, status: StatusData, outbound: mpsc::Sender<BridgeMessage>) -> Self {
        Self {
            id,
            status,
            outbound,
            known_txs: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_KNOWN_TXS).unwrap_or(NonZeroUsize::MIN),
            )),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn chain_id(&self) -> u64 {
        self.status.chain_id
    }

    pub fn head(&self) -> H256 {
        self.status.current_block
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn knows_tx(&self, hash: &H256) -> bool {
        self.known_txs.lock().await.contains(hash)
    }

    pub async fn add_to_known_txs(&self, hash: H256) {
        self.known_txs.lock().await.put(hash, ());
    }

    /// Queues `msg` for the connection writer.
    pub async fn send(&self, msg: BridgeMessage) -> BridgeResult<()> {
        if self.is_closed() {
            return Err(BridgeError::Transport(format!("peer {} is closed", self.id)));
        }
        self.outbound
            .send(msg)
            .await
            .map_err(|_| BridgeError::Transport(format!("peer {} is gone", self.id)))
    }

    /// Sends the transactions the peer does not know yet. Returns how many
    /// were sent.
    pub async fn send_service_chain_txs(&self, txs: Vec<Transaction>) -> BridgeResult<usize> {
        let mut unknown = Vec::with_capacity(txs.len());
        {
            let known = self.known_txs.lock().await;
            for tx in txs {
                if !known.contains(&tx.hash()) {
                    unknown.push(tx);
                }
            }
        }
        if unknown.is_empty() {
            return Ok(0);
        }
        let hashes: Vec<H256> = unknown.iter().map(Transaction::hash).collect();
        let count = unknown.len();
        self.send(BridgeMessage::ServiceChainTxs(unknown)).await?;
        let mut known = self.known_txs.lock().await;
        for hash in hashes {
            known.put(hash, ());
        }
        Ok(count)
    }

    pub async fn send_parent_chain_info_request(&self, operator: Address) -> BridgeResult<()> {
        self.send(BridgeMessage::ParentChainInfoRequest(operator)).await
    }

    pub async fn send_parent_chain_info_response(&self, info: ParentChainInfo) -> BridgeResult<()> {
        self.send(BridgeMessage::ParentChainInfoResponse(info)).await
    }

    pub async fn send_receipt_request(&self, hashes: Vec<H256>) -> BridgeResult<()> {
        self.send(BridgeMessage::ReceiptRequest(hashes)).await
    }

    pub async fn send_receipt_response(&self, receipts: Vec<Receipt>) -> BridgeResult<()> {
        self.send(BridgeMessage::ReceiptResponse(receipts)).await
    }

    pub async fn send_request_rpc(&self, payload: Bytes) -> BridgeResult<()> {
        self.send(BridgeMessage::Call(payload)).await
    }

    pub async fn send_response_rpc(&self, payload: Bytes) -> BridgeResult<()> {
        self.send(BridgeMessage::Response(payload)).await
    }
}

/// Peers keyed by id. The number of peers is published on a watch channel.
pub struct BridgePeerSet {
    peers: RwLock<HashMap<String, Arc<BridgePeer>>>,
    closed: AtomicBool,
    count: watch::Sender<usize>,
    metrics: Arc<BridgeMetrics>,
}

impl BridgePeerSet {
    pub fn new(metrics: Arc<BridgeMetrics>) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            peers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            count,
            metrics,
        }
    }

    fn publish_len(&self, len: usize) {
        self.metrics.peer_count.set(len as i64);
        self.count.send_replace(len);
    }

    pub async fn register(&self, peer: Arc<BridgePeer>) -> Result<(), PeerSetError> {
        let mut peers = self.peers.write().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(PeerSetError::Closed);
        }
        if peers.contains_key(peer.id()) {
            return Err(PeerSetError::AlreadyRegistered(peer.id().to_string()));
        }
        peers.insert(peer.id().to_string(), peer);
        self.publish_len(peers.len());
        Ok(())
    }

    pub async fn unregister(&self, id: &str) -> Result<Arc<BridgePeer>, PeerSetError> {
        let mut peers = self.peers.write().await;
        let peer = peers
            .remove(id)
            .ok_or_else(|| PeerSetError::NotRegistered(id.to_string()))?;
        self.publish_len(peers.len());
        Ok(peer)
    }

    pub async fn peer(&self, id: &str) -> Option<Arc<BridgePeer>> {
        self.peers.read().await.get(id).cloned()
    }

    pub async fn peers(&self) -> Vec<Arc<BridgePeer>> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Receives every change of the number of registered peers.
    pub fn subscribe_len(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }

    /// Disconnects every peer and refuses new ones.
    pub async fn close(&self) {
        let mut peers = self.peers.write().await;
        self.closed.store(true, Ordering::SeqCst);
        for peer in peers.values() {
            peer.close();
        }
        peers.clear();
        self.publish_len(0);
    }

    /// Sends `msg` to every peer. Returns how many peers accepted it.
    pub async fn broadcast(&self, msg: BridgeMessage) -> usize {
        let mut sent = 0;
        for peer in self.peers().await {
            match peer.send(msg.clone()).await {
                Ok(()) => sent += 1,
                Err(e) => warn!("[peer {}] Failed to send {}: {}", peer.id(), msg.code(), e),
            }
        }
        sent
    }
}

/// Status advertised to peers: the head of the chain behind `backend`.
pub async fn local_status(backend: &dyn ChainBackend, network_id: u64) -> BridgeResult<StatusData> {
    let chain_id = backend.chain_id().await?;
    let number = backend.current_block_number().await?;
    let head = backend
        .block_by_number(number)
        .await?
        .ok_or_else(|| BridgeError::InvalidBlock(format!("head block {} is missing", number)))?;
    Ok(StatusData {
        protocol_version: PROTOCOL_VERSION,
        network_id,
        td: U256::from(number + 1),
        current_block: head.hash(),
        chain_id,
    })
}

/// Exchanges status messages and validates the remote one.
pub async fn handshake<S>(
    framed: &mut Framed<S, BridgeCodec>,
    local: StatusData,
) -> Result<StatusData, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let network_id = local.network_id;
    let exchange = async {
        framed.send(BridgeMessage::Status(local)).await?;
        match framed.next().await {
            Some(Ok(BridgeMessage::Status(remote))) => {
                validate_status(network_id, &remote)?;
                Ok(remote)
            }
            Some(Ok(other)) => Err(ProtocolError::NoStatusMsg(other.code())),
            Some(Err(e)) => Err(e),
            None => Err(ProtocolError::ConnectionClosed),
        }
    };
    tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange)
        .await
        .map_err(|_| ProtocolError::HandshakeTimeout)?
}

/// Runs one connection until it closes: handshake, registration in `peers`,
/// then the read and write loop dispatching into `handler`.
pub async fn run_peer<S>(
    id: String,
    stream: S,
    local: StatusData,
    peers: Arc<BridgePeerSet>,
    handler: Arc<dyn PeerMessageHandler>,
    metrics: Arc<BridgeMetrics>,
    cancel: CancellationToken,
) -> BridgeResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut framed = Framed::new(stream, BridgeCodec::default());
    let remote = handshake(&mut framed, local).await.map_err(|e| {
        debug!("[peer {}] Handshake failed: {}", id, e);
        BridgeError::from(e)
    })?;
    let (outbound_tx, outbound_rx) = mpsc::channel(PEER_OUTBOUND_BUFFER);
    let peer = Arc::new(BridgePeer::new(id.clone(), remote, outbound_tx));
    peers.register(peer.clone()).await?;
    info!(
        "[peer {}] Connected, chain id {}, head {:?}",
        id,
        peer.chain_id(),
        peer.head()
    );

    let result = match handler.on_peer_registered(&peer).await {
        Ok(()) => {
            message_loop(&peer, framed, outbound_rx, handler.as_ref(), &metrics, &cancel).await
        }
        Err(e) => {
            warn!("[peer {}] Rejected: {}", id, e);
            Err(e)
        }
    };

    peer.close();
    // the set may already be closed and cleared
    let _ = peers.unregister(&id).await;
    info!("[peer {}] Disconnected", id);
    result
}

async fn message_loop<S>(
    peer: &Arc<BridgePeer>,
    framed: Framed<S, BridgeCodec>,
    mut outbound: mpsc::Receiver<BridgeMessage>,
    handler: &dyn PeerMessageHandler,
    metrics: &BridgeMetrics,
    cancel: &CancellationToken,
) -> BridgeResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut sink, mut source) = framed.split();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = peer.closed.cancelled() => return Ok(()),
            Some(msg) = outbound.recv() => {
                sink.send(msg).await?;
            }
            incoming = source.next() => match incoming {
                Some(Ok(BridgeMessage::Status(_))) => {
                    warn!("[peer {}] Ignoring extra status message", peer.id());
                }
                Some(Ok(msg)) => {
                    let code = msg.code();
                    metrics
                        .peer_messages_received
                        .with_label_values(&[&code.to_string()])
                        .inc();
                    if let Err(e) = handler.handle_message(peer, msg).await {
                        warn!("[peer {}] Failed to handle {}: {}", peer.id(), code, e);
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_VERSION;
    use crate::test_utils::{CHILD_CHAIN_ID, PARENT_CHAIN_ID};
    use ethers::types::U256;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingHandler {
        received: Mutex<Vec<BridgeMessage>>,
    }

    #[async_trait]
    impl PeerMessageHandler for RecordingHandler {
        async fn handle_message(
            &self,
            peer: &Arc<BridgePeer>,
            msg: BridgeMessage,
        ) -> BridgeResult<()> {
            if let BridgeMessage::ParentChainInfoRequest(_) = msg {
                peer.send_parent_chain_info_response(ParentChainInfo {
                    nonce: 42,
                    gas_price: U256::from(25),
                })
                .await?;
            }
            self.received.lock().await.push(msg);
            Ok(())
        }
    }

    fn status(network_id: u64, chain_id: u64) -> StatusData {
        StatusData {
            protocol_version: PROTOCOL_VERSION,
            network_id,
            td: U256::one(),
            current_block: H256::zero(),
            chain_id,
        }
    }

    fn peer_set() -> Arc<BridgePeerSet> {
        Arc::new(BridgePeerSet::new(Arc::new(BridgeMetrics::new_for_testing())))
    }

    async fn wait_len(set: &BridgePeerSet, len: usize) {
        let mut rx = set.subscribe_len();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|n| *n == len))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_request_response_over_connection() {
        let (child_io, parent_io) = tokio::io::duplex(64 * 1024);
        let metrics = Arc::new(BridgeMetrics::new_for_testing());
        let cancel = CancellationToken::new();
        let (child_peers, parent_peers) = (peer_set(), peer_set());
        let child_handler = Arc::new(RecordingHandler::default());
        let parent_handler = Arc::new(RecordingHandler::default());

        let child = tokio::spawn(run_peer(
            "parent".into(),
            child_io,
            status(1, CHILD_CHAIN_ID),
            child_peers.clone(),
            child_handler.clone(),
            metrics.clone(),
            cancel.clone(),
        ));
        let parent = tokio::spawn(run_peer(
            "child".into(),
            parent_io,
            status(1, PARENT_CHAIN_ID),
            parent_peers.clone(),
            parent_handler.clone(),
            metrics.clone(),
            cancel.clone(),
        ));
        wait_len(&child_peers, 1).await;
        wait_len(&parent_peers, 1).await;

        let to_parent = child_peers.peer("parent").await.unwrap();
        assert_eq!(to_parent.chain_id(), PARENT_CHAIN_ID);
        to_parent
            .send_parent_chain_info_request(Address::repeat_byte(1))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while child_handler.received.lock().await.is_empty() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            child_handler.received.lock().await[0],
            BridgeMessage::ParentChainInfoResponse(ParentChainInfo {
                nonce: 42,
                gas_price: U256::from(25),
            })
        );
        assert_eq!(
            parent_handler.received.lock().await[0],
            BridgeMessage::ParentChainInfoRequest(Address::repeat_byte(1))
        );

        // closing one side tears down both
        to_parent.close();
        child.await.unwrap().unwrap();
        parent.await.unwrap().unwrap();
        assert!(child_peers.is_empty().await);
        assert!(parent_peers.is_empty().await);
    }

    #[tokio::test]
    async fn test_handshake_rejects_other_network() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut left = Framed::new(a, BridgeCodec::default());
        let mut right = Framed::new(b, BridgeCodec::default());
        let (l, r) = tokio::join!(
            handshake(&mut left, status(1, CHILD_CHAIN_ID)),
            handshake(&mut right, status(2, PARENT_CHAIN_ID)),
        );
        assert_eq!(
            l,
            Err(ProtocolError::NetworkIdMismatch { local: 1, remote: 2 })
        );
        assert_eq!(
            r,
            Err(ProtocolError::NetworkIdMismatch { local: 2, remote: 1 })
        );
    }

    #[tokio::test]
    async fn test_peer_set_registration() {
        let set = peer_set();
        let (tx, _rx) = mpsc::channel(1);
        let peer = Arc::new(BridgePeer::new("a".into(), status(1, 1), tx));
        set.register(peer.clone()).await.unwrap();
        assert_eq!(
            set.register(peer.clone()).await,
            Err(PeerSetError::AlreadyRegistered("a".into()))
        );
        assert_eq!(*set.subscribe_len().borrow(), 1);
        set.unregister("a").await.unwrap();
        assert_eq!(
            set.unregister("a").await.unwrap_err(),
            PeerSetError::NotRegistered("a".into())
        );
        set.close().await;
        assert_eq!(set.register(peer).await, Err(PeerSetError::Closed));
    }

    #[tokio::test]
    async fn test_known_txs_are_not_resent() {
        let (tx, mut rx) = mpsc::channel(8);
        let peer = BridgePeer::new("a".into(), status(1, 1), tx);
        let wallet = crate::test_utils::random_wallet();
        let txs: Vec<_> = (0..3)
            .map(|n| crate::test_utils::signed_value_transfer(&wallet, n, PARENT_CHAIN_ID))
            .collect();
        assert_eq!(peer.send_service_chain_txs(txs[..2].to_vec()).await.unwrap(), 2);
        assert_eq!(peer.send_service_chain_txs(txs.clone()).await.unwrap(), 1);
        assert_eq!(peer.send_service_chain_txs(txs).await.unwrap(), 0);
        assert!(matches!(rx.recv().await, Some(BridgeMessage::ServiceChainTxs(t)) if t.len() == 2));
        assert!(matches!(rx.recv().await, Some(BridgeMessage::ServiceChainTxs(t)) if t.len() == 1));
    }
}
