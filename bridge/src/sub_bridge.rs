// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Child side service: follows the child chain head, keeps connections to the
//! parent bridge nodes and restores journaled bridges.

use crate::bridge_manager::BridgeManager;
use crate::bridge_pool::BridgeTxPool;
use crate::chain_backend::{spawn_head_poller, ChainBackend};
use crate::config::ServiceChainConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::metrics::BridgeMetrics;
use crate::peer::{local_status, run_peer, BridgePeerSet, PeerMessageHandler};
use crate::retry_with_max_elapsed_time;
use crate::sub_bridge_handler::SubBridgeHandler;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const RESET_BRIDGE_CYCLE: Duration = Duration::from_secs(3);
pub const RESTORE_BRIDGE_CYCLE: Duration = Duration::from_secs(3);
pub const CHILD_HEAD_POLL_INTERVAL: Duration = Duration::from_secs(1);
const CHAIN_HEAD_CHANNEL_SIZE: usize = 64;
const MAX_DIAL_ELAPSED_TIME: Duration = Duration::from_secs(120);

pub struct SubBridge {
    network_id: u64,
    max_peer: usize,
    main_bridges: Vec<String>,
    handler: Arc<SubBridgeHandler>,
    manager: Arc<BridgeManager>,
    peers: Arc<BridgePeerSet>,
    child_backend: Arc<dyn ChainBackend>,
    tx_pool: Arc<BridgeTxPool>,
    metrics: Arc<BridgeMetrics>,
    cancel: CancellationToken,
}

impl SubBridge {
    pub fn new(
        config: &ServiceChainConfig,
        handler: Arc<SubBridgeHandler>,
        manager: Arc<BridgeManager>,
        peers: Arc<BridgePeerSet>,
        child_backend: Arc<dyn ChainBackend>,
        tx_pool: Arc<BridgeTxPool>,
        metrics: Arc<BridgeMetrics>,
    ) -> anyhow::Result<Arc<Self>> {
        let main_bridges = config.main_bridges()?;
        info!(
            "[sub-bridge] {} main bridge(s) configured, max peer {}",
            main_bridges.len(),
            config.max_peer
        );
        Ok(Arc::new(Self {
            network_id: config.network_id,
            max_peer: config.max_peer,
            main_bridges,
            handler,
            manager,
            peers,
            child_backend,
            tx_pool,
            metrics,
            cancel: CancellationToken::new(),
        }))
    }

    pub fn handler(&self) -> &Arc<SubBridgeHandler> {
        &self.handler
    }

    pub fn manager(&self) -> &Arc<BridgeManager> {
        &self.manager
    }

    pub fn peers(&self) -> &Arc<BridgePeerSet> {
        &self.peers
    }

    /// Spawns the head, peer, restore and journal loops plus one dialer per
    /// configured main bridge.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let (head_tx, head_rx) = mpsc::channel(CHAIN_HEAD_CHANNEL_SIZE);
        let mut handles = vec![
            spawn_head_poller(
                self.child_backend.clone(),
                CHILD_HEAD_POLL_INTERVAL,
                head_tx,
                self.cancel.child_token(),
            ),
            tokio::spawn(self.clone().run_head_loop(head_rx)),
            tokio::spawn(self.clone().run_reset_bridge_loop()),
            tokio::spawn(self.clone().run_restore_bridge_loop()),
            self.tx_pool.spawn_rejournal_loop(self.cancel.child_token()),
        ];
        for address in self.main_bridges.iter().take(self.max_peer) {
            handles.push(tokio::spawn(self.clone().run_dial_loop(address.clone())));
        }
        handles
    }

    async fn run_head_loop(self: Arc<Self>, mut heads: mpsc::Receiver<crate::types::Block>) {
        info!("[sub-bridge] Starting child chain head loop");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                block = heads.recv() => {
                    let Some(block) = block else {
                        warn!("[sub-bridge] Child chain head stream ended");
                        break;
                    };
                    self.handler.on_child_head(&block).await;
                }
            }
        }
        info!("[sub-bridge] Child chain head loop stopped");
    }

    /// Marks the parent operator nonce unsynced when the last peer leaves and
    /// resubscribes bridge events once peers are back.
    async fn run_reset_bridge_loop(self: Arc<Self>) {
        let mut peer_count = self.peers.subscribe_len();
        let mut interval = time::interval(RESET_BRIDGE_CYCLE);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut need_reset = false;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = peer_count.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let count = *peer_count.borrow_and_update();
                    if count == 0 {
                        need_reset = true;
                        self.handler.accounts().parent.set_nonce_synced(false).await;
                        warn!("[sub-bridge] Lost every parent peer");
                    }
                }
                _ = interval.tick() => {
                    let count = *peer_count.borrow();
                    if need_reset && count > 0 {
                        match self.manager.reset_all_subscribed_events().await {
                            Ok(()) => {
                                need_reset = false;
                                info!("[sub-bridge] Bridge subscriptions reset");
                            }
                            Err(e) => warn!("[sub-bridge] Failed to reset subscriptions: {}", e),
                        }
                    }
                }
            }
        }
    }

    /// Retries restoring journaled bridges until it succeeds once.
    async fn run_restore_bridge_loop(self: Arc<Self>) {
        let mut interval = time::interval(RESTORE_BRIDGE_CYCLE);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => {
                    match self.manager.restore_bridges().await {
                        Ok(()) => return,
                        Err(e) => error!("[sub-bridge] Failed to restore bridges: {}", e),
                    }
                }
            }
        }
    }

    async fn run_dial_loop(self: Arc<Self>, address: String) {
        let target = dial_target(&address);
        loop {
            let connect = tokio::select! {
                _ = self.cancel.cancelled() => return,
                connect = async {
                    retry_with_max_elapsed_time!(
                        TcpStream::connect(target.as_str()),
                        MAX_DIAL_ELAPSED_TIME
                    )
                } => connect,
            };
            match connect {
                Ok(Ok(stream)) => {
                    if let Err(e) = self.add_peer(target.clone(), stream).await {
                        warn!("[sub-bridge] Main bridge {} dropped: {}", target, e);
                    }
                }
                _ => warn!("[sub-bridge] Cannot reach main bridge {}", target),
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = time::sleep(RESET_BRIDGE_CYCLE) => {}
            }
        }
    }

    /// Runs a connection to a parent bridge node until it closes.
    pub async fn add_peer<S>(&self, id: String, stream: S) -> BridgeResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if self.peers.len().await >= self.max_peer {
            return Err(BridgeError::Protocol(format!(
                "too many peers, max {}",
                self.max_peer
            )));
        }
        let status = local_status(self.child_backend.as_ref(), self.network_id).await?;
        let handler: Arc<dyn PeerMessageHandler> = self.handler.clone();
        debug!("[sub-bridge] Connecting to main bridge {}", id);
        run_peer(
            id,
            stream,
            status,
            self.peers.clone(),
            handler,
            self.metrics.clone(),
            self.cancel.child_token(),
        )
        .await
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        self.peers.close().await;
        self.manager.stop().await;
        info!("[sub-bridge] Stopped");
    }
}

/// `host:port` of a main bridge entry, with or without a `tcp://` scheme.
fn dial_target(address: &str) -> String {
    match url::Url::parse(address) {
        Ok(url) if url.has_host() => match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            _ => address.to_string(),
        },
        _ => address.to_string(),
    }
}
