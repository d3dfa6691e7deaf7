// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Parent side service: accepts child bridge nodes and indexes the parent
//! chain for anchoring transactions.

use crate::chain_backend::{spawn_head_poller, ChainBackend};
use crate::main_bridge_handler::{MainBridgeHandler, MainChainEventHandler};
use crate::metrics::BridgeMetrics;
use crate::peer::{local_status, run_peer, BridgePeerSet, PeerMessageHandler};
use crate::types::Block;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const PARENT_HEAD_POLL_INTERVAL: Duration = Duration::from_secs(1);
const CHAIN_HEAD_CHANNEL_SIZE: usize = 64;

pub struct MainBridge {
    network_id: u64,
    max_peer: usize,
    handler: Arc<MainBridgeHandler>,
    event_handler: Arc<MainChainEventHandler>,
    peers: Arc<BridgePeerSet>,
    parent_backend: Arc<dyn ChainBackend>,
    metrics: Arc<BridgeMetrics>,
    cancel: CancellationToken,
}

impl MainBridge {
    pub async fn new(
        network_id: u64,
        max_peer: usize,
        parent_backend: Arc<dyn ChainBackend>,
        metrics: Arc<BridgeMetrics>,
    ) -> anyhow::Result<Arc<Self>> {
        let chain_id = parent_backend.chain_id().await?;
        Ok(Arc::new(Self {
            network_id,
            max_peer,
            handler: Arc::new(MainBridgeHandler::new(chain_id, parent_backend.clone())),
            event_handler: Arc::new(MainChainEventHandler::new(parent_backend.clone())),
            peers: Arc::new(BridgePeerSet::new(metrics.clone())),
            parent_backend,
            metrics,
            cancel: CancellationToken::new(),
        }))
    }

    pub fn peers(&self) -> &Arc<BridgePeerSet> {
        &self.peers
    }

    pub fn event_handler(&self) -> &Arc<MainChainEventHandler> {
        &self.event_handler
    }

    /// Spawns the accept loop on `listener` and the parent chain head loop.
    pub fn start(self: &Arc<Self>, listener: TcpListener) -> Vec<JoinHandle<()>> {
        let (head_tx, head_rx) = mpsc::channel(CHAIN_HEAD_CHANNEL_SIZE);
        vec![
            spawn_head_poller(
                self.parent_backend.clone(),
                PARENT_HEAD_POLL_INTERVAL,
                head_tx,
                self.cancel.child_token(),
            ),
            tokio::spawn(self.clone().run_head_loop(head_rx)),
            tokio::spawn(self.clone().run_accept_loop(listener)),
        ]
    }

    async fn run_head_loop(self: Arc<Self>, mut heads: mpsc::Receiver<Block>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                block = heads.recv() => {
                    let Some(block) = block else {
                        warn!("[main-bridge] Parent chain head stream ended");
                        break;
                    };
                    if let Err(e) = self.event_handler.on_parent_head(&block).await {
                        error!(
                            "[main-bridge] Failed to index parent block {}: {}",
                            block.number(),
                            e
                        );
                    }
                }
            }
        }
    }

    async fn run_accept_loop(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(address) => info!("[main-bridge] Listening for child bridges on {}", address),
            Err(e) => warn!("[main-bridge] Listener has no local address: {}", e),
        }
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let bridge = self.clone();
                        tokio::spawn(async move { bridge.serve_peer(stream, remote).await });
                    }
                    Err(e) => warn!("[main-bridge] Failed to accept connection: {}", e),
                }
            }
        }
        info!("[main-bridge] Accept loop stopped");
    }

    async fn serve_peer(&self, stream: TcpStream, remote: SocketAddr) {
        if self.peers.len().await >= self.max_peer {
            warn!(
                "[main-bridge] Refusing {}, already {} peers",
                remote, self.max_peer
            );
            return;
        }
        let status = match local_status(self.parent_backend.as_ref(), self.network_id).await {
            Ok(status) => status,
            Err(e) => {
                error!("[main-bridge] Cannot build status for {}: {}", remote, e);
                return;
            }
        };
        let handler: Arc<dyn PeerMessageHandler> = self.handler.clone();
        let result = run_peer(
            remote.to_string(),
            stream,
            status,
            self.peers.clone(),
            handler,
            self.metrics.clone(),
            self.cancel.child_token(),
        )
        .await;
        if let Err(e) = result {
            debug!("[main-bridge] Child bridge {} dropped: {}", remote, e);
        }
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        self.peers.close().await;
        info!("[main-bridge] Stopped");
    }
}
