// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use anyhow::{anyhow, Context};
use bridge_config::{load_json_list, save_json_list, Config};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

pub const MAIN_BRIDGES_FILE: &str = "main-bridges.json";
pub const BRIDGE_TX_JOURNAL_FILE: &str = "bridge_transactions.rlp";
pub const MIN_REJOURNAL_INTERVAL: Duration = Duration::from_secs(1);

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BridgeTxPoolConfig {
    // Journal of pooled transactions, relative paths resolve against the data dir.
    #[serde(default = "default_bridge_tx_journal")]
    pub journal: Option<PathBuf>,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_rejournal")]
    pub rejournal: Duration,
    #[serde(default = "default_global_queue")]
    pub global_queue: u64,
}

fn default_bridge_tx_journal() -> Option<PathBuf> {
    Some(PathBuf::from(BRIDGE_TX_JOURNAL_FILE))
}

fn default_rejournal() -> Duration {
    Duration::from_secs(3600)
}

fn default_global_queue() -> u64 {
    8192
}

impl Default for BridgeTxPoolConfig {
    fn default() -> Self {
        Self {
            journal: default_bridge_tx_journal(),
            rejournal: default_rejournal(),
            global_queue: default_global_queue(),
        }
    }
}

impl BridgeTxPoolConfig {
    /// Clamps the rejournal interval and replaces an empty journal name.
    pub fn sanitize(mut self) -> Self {
        if self.rejournal < MIN_REJOURNAL_INTERVAL {
            warn!(
                "Sanitizing invalid bridge tx pool rejournal interval {:?} to {:?}",
                self.rejournal, MIN_REJOURNAL_INTERVAL
            );
            self.rejournal = MIN_REJOURNAL_INTERVAL;
        }
        if matches!(&self.journal, Some(path) if path.as_os_str().is_empty()) {
            warn!("Sanitizing empty bridge tx journal name");
            self.journal = default_bridge_tx_journal();
        }
        self
    }

    fn resolve(mut self, data_dir: &Path) -> Self {
        self.journal = self.journal.map(|path| {
            if path.is_absolute() {
                path
            } else {
                data_dir.join(path)
            }
        });
        self
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceChainConfig {
    // Directory of keystores, journals and peer lists.
    pub data_dir: PathBuf,
    // Peer protocol network id, both ends must agree.
    pub network_id: u64,
    #[serde(default = "default_max_peer")]
    pub max_peer: usize,
    pub parent_chain_id: u64,
    // Runs the parent side service answering child bridge nodes.
    #[serde(default)]
    pub main_bridge: bool,
    // Runs the child side service.
    #[serde(default)]
    pub sub_bridge: bool,
    #[serde(default)]
    pub anchoring: bool,
    #[serde(default = "default_anchoring_period")]
    pub anchoring_period: u64,
    #[serde(default = "default_sent_chain_txs_limit")]
    pub sent_chain_txs_limit: usize,
    #[serde(default = "default_vt_recovery")]
    pub vt_recovery: bool,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_vt_recovery_interval")]
    pub vt_recovery_interval: Duration,
    #[serde(default = "default_filter_logs_stride")]
    pub filter_logs_stride: u64,
    #[serde(default = "default_max_pending_txs")]
    pub max_pending_txs: usize,
    #[serde(default = "default_operator_gas_limit")]
    pub parent_operator_gas_limit: u64,
    #[serde(default = "default_operator_gas_limit")]
    pub child_operator_gas_limit: u64,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout: Duration,
    pub parent_rpc_url: Option<String>,
    pub child_rpc_url: Option<String>,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_bridge_listen_port")]
    pub bridge_listen_port: u16,
    #[serde(default)]
    pub bridge_tx_pool: BridgeTxPoolConfig,
}

fn default_max_peer() -> usize {
    1
}

fn default_anchoring_period() -> u64 {
    1
}

fn default_sent_chain_txs_limit() -> usize {
    100
}

fn default_vt_recovery() -> bool {
    true
}

fn default_vt_recovery_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_filter_logs_stride() -> u64 {
    100
}

fn default_max_pending_txs() -> usize {
    1000
}

fn default_operator_gas_limit() -> u64 {
    crate::accounts::DEFAULT_BRIDGE_TX_GAS_LIMIT
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_metrics_port() -> u16 {
    9184
}

fn default_bridge_listen_port() -> u16 {
    50505
}

impl Config for ServiceChainConfig {}

impl ServiceChainConfig {
    /// A child side config with every default, rooted at `data_dir`.
    pub fn new(data_dir: &Path, network_id: u64, parent_chain_id: u64) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            network_id,
            max_peer: default_max_peer(),
            parent_chain_id,
            main_bridge: false,
            sub_bridge: true,
            anchoring: false,
            anchoring_period: default_anchoring_period(),
            sent_chain_txs_limit: default_sent_chain_txs_limit(),
            vt_recovery: default_vt_recovery(),
            vt_recovery_interval: default_vt_recovery_interval(),
            filter_logs_stride: default_filter_logs_stride(),
            max_pending_txs: default_max_pending_txs(),
            parent_operator_gas_limit: default_operator_gas_limit(),
            child_operator_gas_limit: default_operator_gas_limit(),
            rpc_timeout: default_rpc_timeout(),
            parent_rpc_url: None,
            child_rpc_url: None,
            metrics_port: default_metrics_port(),
            bridge_listen_port: default_bridge_listen_port(),
            bridge_tx_pool: BridgeTxPoolConfig::default(),
        }
    }

    /// Checks chain and peer parameters and creates the data dir.
    pub fn validate(&self) -> anyhow::Result<()> {
        info!("Starting config validation");
        if !self.main_bridge && !self.sub_bridge {
            return Err(anyhow!("neither main-bridge nor sub-bridge is enabled"));
        }
        if self.network_id == 0 {
            return Err(anyhow!("network-id must not be 0"));
        }
        if self.sub_bridge {
            if self.max_peer == 0 {
                return Err(anyhow!("max-peer must be at least 1 for a sub bridge"));
            }
            if self.child_rpc_url.is_none() {
                return Err(anyhow!("sub bridge requires child-rpc-url"));
            }
        }
        if self.parent_rpc_url.is_none() {
            return Err(anyhow!("parent-rpc-url is required"));
        }
        for url in self.parent_rpc_url.iter().chain(self.child_rpc_url.iter()) {
            Url::parse(url).with_context(|| format!("invalid rpc url {}", url))?;
        }
        if self.anchoring_period == 0 {
            return Err(anyhow!("anchoring-period must be at least 1"));
        }
        if self.filter_logs_stride == 0 || self.max_pending_txs == 0 {
            return Err(anyhow!(
                "filter-logs-stride and max-pending-txs must be positive"
            ));
        }
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("cannot create data dir {:?}", self.data_dir))?;
        info!("Config validation complete");
        Ok(())
    }

    pub fn resolve_path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.data_dir.join(name)
    }

    /// Pool config with its journal resolved against the data dir.
    pub fn bridge_tx_pool_config(&self) -> BridgeTxPoolConfig {
        self.bridge_tx_pool.clone().sanitize().resolve(&self.data_dir)
    }

    /// URLs of the parent bridge nodes this child node connects to.
    pub fn main_bridges(&self) -> anyhow::Result<Vec<String>> {
        let path = self.resolve_path(MAIN_BRIDGES_FILE);
        let urls: Vec<String> = load_json_list(&path)
            .with_context(|| format!("malformed {:?}", path))?;
        Ok(urls)
    }

    pub fn save_main_bridges(&self, urls: &[String]) -> anyhow::Result<()> {
        save_json_list(&self.resolve_path(MAIN_BRIDGES_FILE), urls)
    }
}
