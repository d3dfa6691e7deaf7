// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::accounts::BridgeAccounts;
use crate::bridge_manager::BridgeManager;
use crate::bridge_pool::BridgeTxPool;
use crate::chain_backend::rpc::RpcBackend;
use crate::chain_backend::ChainBackend;
use crate::config::ServiceChainConfig;
use crate::main_bridge::MainBridge;
use crate::metrics::BridgeMetrics;
use crate::peer::BridgePeerSet;
use crate::recovery::RecoveryConfig;
use crate::sub_bridge::SubBridge;
use crate::sub_bridge_handler::SubBridgeHandler;
use anyhow::{anyhow, Context};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const BRIDGE_STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// The services started by [`run_bridge_node`].
pub struct BridgeNodeHandle {
    pub sub_bridge: Option<Arc<SubBridge>>,
    pub main_bridge: Option<Arc<MainBridge>>,
    handles: Vec<JoinHandle<()>>,
}

impl BridgeNodeHandle {
    pub async fn stop(self) {
        if let Some(sub_bridge) = &self.sub_bridge {
            sub_bridge.stop().await;
        }
        if let Some(main_bridge) = &self.main_bridge {
            main_bridge.stop().await;
        }
        for handle in self.handles {
            handle.abort();
            let _ = handle.await;
        }
        info!("Bridge node stopped");
    }
}

pub async fn run_bridge_node(
    config: ServiceChainConfig,
    prometheus_registry: prometheus::Registry,
) -> anyhow::Result<BridgeNodeHandle> {
    config.validate()?;
    let metrics = Arc::new(BridgeMetrics::new(&prometheus_registry));

    let parent_url = config
        .parent_rpc_url
        .as_deref()
        .ok_or_else(|| anyhow!("parent-rpc-url is required"))?;
    let parent_backend: Arc<dyn ChainBackend> = Arc::new(RpcBackend::new_http(
        "parent",
        parent_url,
        config.rpc_timeout,
        metrics.clone(),
    )?);
    let parent_chain_id = parent_backend
        .chain_id()
        .await
        .map_err(|e| anyhow!("Failed to get parent chain id: {:?}", e))?;
    if parent_chain_id != config.parent_chain_id {
        return Err(anyhow!(
            "parent node reports chain id {}, configured {}",
            parent_chain_id,
            config.parent_chain_id
        ));
    }

    let mut handles = vec![];
    let mut node = BridgeNodeHandle {
        sub_bridge: None,
        main_bridge: None,
        handles: vec![],
    };

    if config.main_bridge {
        let main_bridge = MainBridge::new(
            config.network_id,
            config.max_peer,
            parent_backend.clone(),
            metrics.clone(),
        )
        .await?;
        let address = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            config.bridge_listen_port,
        );
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("cannot listen on {}", address))?;
        handles.extend(main_bridge.start(listener));
        node.main_bridge = Some(main_bridge);
    }

    if config.sub_bridge {
        let sub_bridge = start_sub_bridge(&config, parent_backend, metrics.clone()).await?;
        let manager = sub_bridge.manager().clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(BRIDGE_STATUS_LOG_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = manager.log_bridge_status().await {
                    warn!("Failed to collect bridge status: {}", e);
                }
            }
        }));
        handles.extend(sub_bridge.start());
        node.sub_bridge = Some(sub_bridge);
    }

    node.handles = handles;
    Ok(node)
}

async fn start_sub_bridge(
    config: &ServiceChainConfig,
    parent_backend: Arc<dyn ChainBackend>,
    metrics: Arc<BridgeMetrics>,
) -> anyhow::Result<Arc<SubBridge>> {
    let child_url = config
        .child_rpc_url
        .as_deref()
        .ok_or_else(|| anyhow!("child-rpc-url is required"))?;
    let child_backend: Arc<dyn ChainBackend> = Arc::new(RpcBackend::new_http(
        "child",
        child_url,
        config.rpc_timeout,
        metrics.clone(),
    )?);

    let accounts = Arc::new(BridgeAccounts::new(
        &config.data_dir,
        config.parent_operator_gas_limit,
        config.child_operator_gas_limit,
    )?);
    accounts.restore_fee_payers().await?;
    accounts
        .child
        .reconcile_with(child_backend.as_ref())
        .await
        .map_err(|e| anyhow!("Failed to sync child operator: {:?}", e))?;
    // the parent nonce is synced by the parent bridge nodes once connected
    accounts.parent.set_chain_id(config.parent_chain_id).await;

    let tx_pool = Arc::new(BridgeTxPool::new(config.bridge_tx_pool_config(), metrics.clone()).await?);
    let manager = BridgeManager::new(
        &config.data_dir,
        RecoveryConfig::from(config),
        parent_backend,
        child_backend.clone(),
        accounts.clone(),
        tx_pool.clone(),
        metrics.clone(),
    )?;
    let peers = Arc::new(BridgePeerSet::new(metrics.clone()));
    let handler = Arc::new(SubBridgeHandler::new(
        config.parent_chain_id,
        config.anchoring,
        config.anchoring_period,
        config.sent_chain_txs_limit,
        accounts,
        tx_pool.clone(),
        peers.clone(),
        child_backend.clone(),
        metrics.clone(),
    ));
    SubBridge::new(config, handler, manager, peers, child_backend, tx_pool, metrics)
}
