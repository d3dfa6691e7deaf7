// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for end-to-end tests: a parent bridge node and a child
//! bridge node talking over TCP, and unified polling with diagnostics.

use crate::abi::{decode_bridge_log, request_event_topics};
use crate::chain_backend::simulated::SimulatedChain;
use crate::chain_backend::{ChainBackend, LogQuery};
use crate::config::ServiceChainConfig;
use crate::main_bridge::MainBridge;
use crate::metrics::BridgeMetrics;
use crate::peer::BridgePeerSet;
use crate::sub_bridge::SubBridge;
use crate::sub_bridge_handler::SubBridgeHandler;
use crate::test_utils::{recovery_config_for_testing, BridgePairHarness, PARENT_CHAIN_ID};
use crate::types::{BridgeEvent, RequestValueTransferEvent};
use anyhow::Context;
use ethers::types::Address;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const NETWORK_ID: u64 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Handshake,
    NonceSync,
    Anchoring,
    ValueTransfer,
    Reconnect,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Handshake => "handshake with the main bridge",
            Phase::NonceSync => "parent operator nonce sync",
            Phase::Anchoring => "anchoring through the main bridge",
            Phase::ValueTransfer => "value transfer",
            Phase::Reconnect => "reconnect after peer loss",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone)]
pub struct PollConfig {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollConfig {
    pub fn standard() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            interval: Duration::from_millis(100),
        }
    }

    pub fn fast() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            interval: Duration::from_millis(20),
        }
    }
}

pub trait Diagnostics: Send + Sync {
    fn snapshot(&self) -> String;
}

impl<F> Diagnostics for F
where
    F: Fn() -> String + Send + Sync,
{
    fn snapshot(&self) -> String {
        self()
    }
}

pub async fn poll_until<T, Fut>(
    phase: Phase,
    what: &'static str,
    cfg: PollConfig,
    mut check: impl FnMut() -> Fut,
    diagnostics: Option<&dyn Diagnostics>,
) -> anyhow::Result<T>
where
    Fut: std::future::Future<Output = anyhow::Result<Option<T>>>,
{
    let start = Instant::now();
    let mut last_err: Option<anyhow::Error> = None;

    loop {
        match check().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => last_err = Some(e),
        }

        if start.elapsed() >= cfg.timeout {
            let diag = diagnostics.map(|d| d.snapshot()).unwrap_or_default();
            let err_ctx = format_timeout_error(phase, what, &diag);
            return match last_err {
                Some(e) => Err(e).context(err_ctx),
                None => Err(anyhow::anyhow!("{err_ctx}")),
            };
        }

        tokio::time::sleep(cfg.interval).await;
    }
}

fn format_timeout_error(phase: Phase, what: &str, diag: &str) -> String {
    if diag.is_empty() {
        format!("timeout waiting for {what} ({phase})")
    } else {
        format!("timeout waiting for {what} ({phase}). diagnostics:\n{diag}")
    }
}

/// Request events `bridge` emitted on `chain`, in nonce order.
pub async fn request_events(chain: &SimulatedChain, bridge: Address) -> Vec<RequestValueTransferEvent> {
    let query = LogQuery::new(vec![bridge], request_event_topics());
    let mut events: Vec<_> = chain
        .filter_logs(&query)
        .await
        .unwrap()
        .iter()
        .filter_map(|log| match decode_bridge_log(log).unwrap() {
            Some(BridgeEvent::Request(event)) => Some(event),
            _ => None,
        })
        .collect();
    events.sort_by_key(|e| e.request_nonce());
    events
}

/// A parent bridge node serving the harness parent chain on a local port.
pub struct MainBridgeNode {
    pub bridge: Arc<MainBridge>,
    pub address: SocketAddr,
    handles: Vec<JoinHandle<()>>,
}

impl MainBridgeNode {
    pub async fn start(parent: Arc<SimulatedChain>) -> Self {
        let bridge = MainBridge::new(
            NETWORK_ID,
            4,
            parent,
            Arc::new(BridgeMetrics::new_for_testing()),
        )
        .await
        .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let handles = bridge.start(listener);
        Self {
            bridge,
            address,
            handles,
        }
    }

    pub async fn stop(self) {
        self.bridge.stop().await;
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// A child bridge node dialing one main bridge, on top of a bridge pair.
pub struct ServiceChainEnv {
    pub h: BridgePairHarness,
    pub main: Option<MainBridgeNode>,
    pub sub_bridge: Arc<SubBridge>,
    handles: Vec<JoinHandle<()>>,
}

impl ServiceChainEnv {
    pub async fn start(anchoring_period: u64) -> Self {
        let h = BridgePairHarness::new().await;
        let main = MainBridgeNode::start(h.parent.clone()).await;

        let mut config = ServiceChainConfig::new(h.dir.path(), NETWORK_ID, PARENT_CHAIN_ID);
        config.anchoring = anchoring_period > 0;
        config.anchoring_period = anchoring_period.max(1);
        config
            .save_main_bridges(&[format!("tcp://{}", main.address)])
            .unwrap();

        let mut recovery = recovery_config_for_testing(100, 100);
        recovery.enabled = false;
        let manager = h.manager(recovery).await;
        let peers = Arc::new(BridgePeerSet::new(h.metrics.clone()));
        let child: Arc<dyn ChainBackend> = h.child.clone();
        let handler = Arc::new(SubBridgeHandler::new(
            PARENT_CHAIN_ID,
            config.anchoring,
            config.anchoring_period,
            config.sent_chain_txs_limit,
            h.accounts.clone(),
            h.tx_pool.clone(),
            peers.clone(),
            child.clone(),
            h.metrics.clone(),
        ));
        // a fresh child node learns the parent nonce from its peers
        h.accounts.parent.set_nonce_synced(false).await;
        let sub_bridge = SubBridge::new(
            &config,
            handler,
            manager,
            peers,
            child,
            h.tx_pool.clone(),
            h.metrics.clone(),
        )
        .unwrap();
        let handles = sub_bridge.start();
        Self {
            h,
            main: Some(main),
            sub_bridge,
            handles,
        }
    }

    pub fn diagnostics(&self) -> impl Fn() -> String + Send + Sync {
        let parent = self.h.parent.clone();
        let child = self.h.child.clone();
        move || {
            format!(
                "child head {}, parent head {}, parent txs {}",
                child.head(),
                parent.head(),
                parent.sent_transactions().len()
            )
        }
    }

    pub async fn wait_nonce_synced(&self, phase: Phase) -> anyhow::Result<u64> {
        let parent = self.h.accounts.parent.clone();
        let diagnostics = self.diagnostics();
        poll_until(
            phase,
            "parent operator nonce synced",
            PollConfig::standard(),
            || {
                let parent = parent.clone();
                async move {
                    Ok(match parent.is_nonce_synced().await {
                        true => Some(parent.nonce().await),
                        false => None,
                    })
                }
            },
            Some(&diagnostics),
        )
        .await
    }

    pub async fn stop(mut self) {
        if let Some(main) = self.main.take() {
            main.stop().await;
        }
        self.sub_bridge.stop().await;
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
