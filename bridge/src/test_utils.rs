// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::abi::BridgeMethod;
use crate::accounts::{BridgeAccounts, OperatorAccount, DEFAULT_BRIDGE_TX_GAS_LIMIT};
use crate::bridge_contract::BridgeContract;
use crate::bridge_info::{BridgeInfo, HandleTxHashStore};
use crate::bridge_manager::BridgeManager;
use crate::bridge_pool::BridgeTxPool;
use crate::chain_backend::simulated::SimulatedChain;
use crate::chain_backend::ChainBackend;
use crate::config::{BridgeTxPoolConfig, BRIDGE_TX_JOURNAL_FILE};
use crate::metrics::BridgeMetrics;
use crate::recovery::RecoveryConfig;
use crate::transaction::{Transaction, TxType};
use crate::types::{RawLogInfo, RequestTransfer, RequestValueTransferEvent, TokenType};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const CHILD_CHAIN_ID: u64 = 1000;
pub const PARENT_CHAIN_ID: u64 = 2019;

pub fn init_tracing_for_testing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

pub fn random_wallet() -> LocalWallet {
    LocalWallet::new(&mut rand::thread_rng())
}

pub fn signed_value_transfer(wallet: &LocalWallet, nonce: u64, chain_id: u64) -> Transaction {
    let mut tx = Transaction::new(
        TxType::ValueTransfer,
        wallet.address(),
        nonce,
        Some(Address::repeat_byte(0xee)),
        U256::one(),
        21_000,
        U256::from(25_000_000_000u64),
        Bytes::default(),
    );
    tx.sign_as_sender(wallet, chain_id).unwrap();
    tx
}

/// A KLAY request with a deterministic request tx hash.
pub fn klay_request_on(
    bridge: Address,
    from: Address,
    to: Address,
    nonce: u64,
    value: U256,
) -> RequestValueTransferEvent {
    RequestValueTransferEvent::Plain(RequestTransfer {
        token_type: TokenType::Klay,
        from,
        to,
        token_address: Address::zero(),
        value_or_token_id: value,
        request_nonce: nonce,
        fee: U256::zero(),
        extra_data: Bytes::default(),
        raw: RawLogInfo {
            tx_hash: H256::from(keccak256(
                [bridge.as_bytes(), &nonce.to_be_bytes()[..]].concat(),
            )),
            block_number: nonce + 1,
            bridge_address: bridge,
            log_index: 0,
        },
    })
}

pub fn klay_request(nonce: u64, value: U256) -> RequestValueTransferEvent {
    klay_request_on(
        Address::repeat_byte(0xc0),
        Address::repeat_byte(0xa1),
        Address::repeat_byte(0xb0),
        nonce,
        value,
    )
}

pub fn recovery_config_for_testing(stride: u64, max_pending_txs: usize) -> RecoveryConfig {
    RecoveryConfig {
        enabled: true,
        interval: Duration::from_millis(200),
        filter_logs_stride: stride,
        max_pending_txs,
    }
}

/// A child chain and a parent chain, each with a deployed bridge owned by
/// its side's operator.
pub struct BridgePairHarness {
    pub dir: TempDir,
    pub child: Arc<SimulatedChain>,
    pub parent: Arc<SimulatedChain>,
    pub accounts: Arc<BridgeAccounts>,
    pub child_bridge: BridgeContract,
    pub parent_bridge: BridgeContract,
    pub metrics: Arc<BridgeMetrics>,
    pub tx_pool: Arc<BridgeTxPool>,
    pub handle_tx_hashes: Arc<HandleTxHashStore>,
    pub alice: Address,
    pub receiver: Address,
    pub parent_nonce_base: u64,
}

impl BridgePairHarness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let child = Arc::new(SimulatedChain::new("child", CHILD_CHAIN_ID));
        let parent = Arc::new(SimulatedChain::new("parent", PARENT_CHAIN_ID));
        let child_account = Arc::new(OperatorAccount::new(
            "child",
            random_wallet(),
            DEFAULT_BRIDGE_TX_GAS_LIMIT,
        ));
        let parent_account = Arc::new(OperatorAccount::new(
            "parent",
            random_wallet(),
            DEFAULT_BRIDGE_TX_GAS_LIMIT,
        ));
        child_account.reconcile_with(child.as_ref()).await.unwrap();
        parent_account.reconcile_with(parent.as_ref()).await.unwrap();

        let child_backend: Arc<dyn ChainBackend> = child.clone();
        let parent_backend: Arc<dyn ChainBackend> = parent.clone();
        let child_bridge = BridgeContract::deploy(child_backend, &child_account, Bytes::default())
            .await
            .unwrap();
        let parent_bridge =
            BridgeContract::deploy(parent_backend, &parent_account, Bytes::default())
                .await
                .unwrap();
        let parent_nonce_base = parent_account.nonce().await;

        let metrics = Arc::new(BridgeMetrics::new_for_testing());
        let pool_config = BridgeTxPoolConfig {
            journal: Some(dir.path().join(BRIDGE_TX_JOURNAL_FILE)),
            rejournal: Duration::from_secs(3600),
            global_queue: 8192,
        };
        let tx_pool = Arc::new(BridgeTxPool::new(pool_config, metrics.clone()).await.unwrap());
        let accounts = Arc::new(BridgeAccounts::from_accounts(
            dir.path(),
            parent_account,
            child_account,
        ));

        let alice = Address::repeat_byte(0xa1);
        child.fund(alice, 1_000_000u64);
        Self {
            dir,
            child,
            parent,
            accounts,
            child_bridge,
            parent_bridge,
            metrics,
            tx_pool,
            handle_tx_hashes: Arc::new(HandleTxHashStore::default()),
            alice,
            receiver: Address::repeat_byte(0xb0),
            parent_nonce_base,
        }
    }

    /// Parent side bridge info, handling child chain requests.
    pub fn parent_info(&self) -> Arc<BridgeInfo> {
        Arc::new(BridgeInfo::new(
            self.parent_bridge.clone(),
            self.child_bridge.clone(),
            self.accounts.parent.clone(),
            false,
            false,
            Some(self.tx_pool.clone()),
            self.handle_tx_hashes.clone(),
            self.metrics.clone(),
        ))
    }

    pub fn child_info(&self) -> Arc<BridgeInfo> {
        Arc::new(BridgeInfo::new(
            self.child_bridge.clone(),
            self.parent_bridge.clone(),
            self.accounts.child.clone(),
            true,
            false,
            None,
            self.handle_tx_hashes.clone(),
            self.metrics.clone(),
        ))
    }

    pub async fn manager(&self, recovery: RecoveryConfig) -> Arc<BridgeManager> {
        BridgeManager::new(
            self.dir.path(),
            recovery,
            self.parent.clone(),
            self.child.clone(),
            self.accounts.clone(),
            self.tx_pool.clone(),
            self.metrics.clone(),
        )
        .unwrap()
    }

    pub fn fund_parent_bridge(&self, amount: u64) {
        self.parent.fund(self.parent_bridge.address(), amount);
    }

    /// A request as emitted by the child bridge, not mined anywhere.
    pub fn child_request(&self, nonce: u64, value: u64) -> RequestValueTransferEvent {
        klay_request_on(
            self.child_bridge.address(),
            self.alice,
            self.receiver,
            nonce,
            U256::from(value),
        )
    }

    /// Handle transactions the parent chain executed so far.
    pub fn parent_handle_txs(&self) -> usize {
        self.parent
            .sent_transactions()
            .iter()
            .filter(|tx| {
                BridgeMethod::from_selector(&tx.input) == Some(BridgeMethod::HandleKlayTransfer)
            })
            .count()
    }
}
