// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Operator accounts of both chains: signing keys, the shadow nonce and
//! fee payer delegation.

use crate::chain_backend::ChainBackend;
use crate::error::{BridgeError, BridgeResult};
use crate::transaction::{Transaction, TxType};
use bridge_config::Config;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tap::TapFallible;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const DEFAULT_BRIDGE_TX_GAS_LIMIT: u64 = 10_000_000;
pub const FEE_PAYERS_FILE: &str = "bridge_fee_payers.json";
pub const PARENT_BRIDGE_ACCOUNT_DIR: &str = "parent_bridge_account";
pub const CHILD_BRIDGE_ACCOUNT_DIR: &str = "child_bridge_account";

/// Everything needed to build and sign one transaction for an operator.
#[derive(Clone)]
pub struct TransactOpts {
    pub from: Address,
    /// `None` until the shadow nonce is synced; the chain's pending nonce is
    /// used instead.
    pub nonce: Option<u64>,
    pub chain_id: u64,
    pub gas_price: U256,
    pub gas_limit: u64,
    pub fee_payer: Option<Address>,
    signer: LocalWallet,
    fee_payer_signer: Option<LocalWallet>,
}

impl std::fmt::Debug for TransactOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactOpts")
            .field("from", &self.from)
            .field("nonce", &self.nonce)
            .field("chain_id", &self.chain_id)
            .field("gas_price", &self.gas_price)
            .field("gas_limit", &self.gas_limit)
            .field("fee_payer", &self.fee_payer)
            .finish()
    }
}

impl TransactOpts {
    /// The fee delegated flavour of `base` when a fee payer is configured.
    pub fn tx_type(&self, base: TxType) -> TxType {
        base.with_fee_delegation(self.fee_payer.is_some())
    }

    /// Signs as the operator, and as the fee payer for fee delegated types.
    pub fn sign_tx(&self, tx: &mut Transaction) -> BridgeResult<()> {
        if tx.from != self.from {
            return Err(BridgeError::Generic(format!(
                "tx sender {:?} is not operator {:?}",
                tx.from, self.from
            )));
        }
        if tx.tx_type.is_fee_delegated() {
            tx.fee_payer = self.fee_payer;
        }
        tx.sign_as_sender(&self.signer, self.chain_id)?;
        if tx.tx_type.is_fee_delegated() {
            let payer = self.fee_payer_signer.as_ref().ok_or_else(|| {
                BridgeError::Fatal(format!("no key for fee payer {:?}", self.fee_payer))
            })?;
            tx.sign_as_fee_payer(payer, self.chain_id)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct AccountState {
    nonce: u64,
    nonce_synced: bool,
    chain_id: u64,
    gas_price: U256,
    gas_limit: u64,
    fee_payer: Option<LocalWallet>,
    unlocked: bool,
    unlocked_until: Option<Instant>,
}

impl AccountState {
    fn is_unlocked(&self) -> bool {
        self.unlocked && self.unlocked_until.map_or(true, |until| Instant::now() < until)
    }
}

/// Snapshot of an operator account for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub address: Address,
    pub nonce: u64,
    pub is_nonce_synced: bool,
    pub is_unlocked: bool,
    pub chain_id: u64,
    pub gas_price: U256,
    pub fee_payer: Option<Address>,
}

/// One operator. Signing is serialized through `with_signing`.
pub struct OperatorAccount {
    name: String,
    address: Address,
    signer: LocalWallet,
    key_path: Option<PathBuf>,
    state: Mutex<AccountState>,
}

impl std::fmt::Debug for OperatorAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorAccount")
            .field("name", &self.name)
            .field("address", &self.address)
            .finish()
    }
}

impl OperatorAccount {
    pub fn new(name: &str, signer: LocalWallet, gas_limit: u64) -> Self {
        Self {
            name: name.to_string(),
            address: signer.address(),
            signer,
            key_path: None,
            state: Mutex::new(AccountState {
                nonce: 0,
                nonce_synced: false,
                chain_id: 0,
                gas_price: U256::zero(),
                gas_limit,
                fee_payer: None,
                unlocked: true,
                unlocked_until: None,
            }),
        }
    }

    pub fn from_operator_key(name: &str, key: bridge_keys::OperatorKey, gas_limit: u64) -> Self {
        let mut account = Self::new(name, key.wallet, gas_limit);
        account.key_path = Some(key.key_path);
        account
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Runs `f` with exclusive access to the account. `f` receives the
    /// signing context and returns its result and whether a transaction was
    /// accepted by the chain; only then is the nonce incremented. Any error
    /// leaves the nonce unchanged.
    pub async fn with_signing<T, F, Fut>(&self, f: F) -> BridgeResult<T>
    where
        F: FnOnce(TransactOpts) -> Fut,
        Fut: Future<Output = BridgeResult<(T, bool)>>,
    {
        let mut state = self.state.lock().await;
        if !state.is_unlocked() {
            return Err(BridgeError::AccountLocked(self.address));
        }
        let opts = TransactOpts {
            from: self.address,
            nonce: state.nonce_synced.then_some(state.nonce),
            chain_id: state.chain_id,
            gas_price: state.gas_price,
            gas_limit: state.gas_limit,
            fee_payer: state.fee_payer.as_ref().map(|w| w.address()),
            signer: self.signer.clone(),
            fee_payer_signer: state.fee_payer.clone(),
        };
        let (value, submitted) = f(opts).await?;
        if submitted {
            state.nonce += 1;
        }
        Ok(value)
    }

    /// Overwrites the shadow nonce and marks it synced.
    pub async fn set_nonce(&self, nonce: u64) {
        let mut state = self.state.lock().await;
        state.nonce = nonce;
        state.nonce_synced = true;
    }

    pub async fn inc_nonce(&self) {
        self.state.lock().await.nonce += 1;
    }

    pub async fn nonce(&self) -> u64 {
        self.state.lock().await.nonce
    }

    pub async fn is_nonce_synced(&self) -> bool {
        self.state.lock().await.nonce_synced
    }

    pub async fn set_nonce_synced(&self, synced: bool) {
        self.state.lock().await.nonce_synced = synced;
    }

    pub async fn set_chain_id(&self, chain_id: u64) {
        self.state.lock().await.chain_id = chain_id;
    }

    pub async fn chain_id(&self) -> u64 {
        self.state.lock().await.chain_id
    }

    pub async fn set_gas_price(&self, gas_price: U256) {
        self.state.lock().await.gas_price = gas_price;
    }

    pub async fn gas_price(&self) -> U256 {
        self.state.lock().await.gas_price
    }

    pub async fn fee_payer(&self) -> Option<Address> {
        self.state
            .lock()
            .await
            .fee_payer
            .as_ref()
            .map(|w| w.address())
    }

    pub async fn set_fee_payer(&self, fee_payer: Option<LocalWallet>) {
        self.state.lock().await.fee_payer = fee_payer;
    }

    /// Reads chain id, gas price and pending nonce from `backend` and marks
    /// the nonce synced.
    pub async fn reconcile_with(&self, backend: &dyn ChainBackend) -> BridgeResult<()> {
        let chain_id = backend.chain_id().await?;
        let gas_price = backend.suggest_gas_price().await?;
        let nonce = backend.pending_nonce_at(self.address).await?;
        let mut state = self.state.lock().await;
        state.chain_id = chain_id;
        state.gas_price = gas_price;
        state.nonce = nonce;
        state.nonce_synced = true;
        info!(
            "[{}] Operator {:?} synced: chain id {}, nonce {}",
            self.name, self.address, chain_id, nonce
        );
        Ok(())
    }

    pub async fn lock_account(&self) {
        let mut state = self.state.lock().await;
        state.unlocked = false;
        state.unlocked_until = None;
        info!("[{}] Locked operator {:?}", self.name, self.address);
    }

    /// Allows signing again, for `duration` or until locked when `None`.
    /// The passphrase is checked against the keystore when there is one.
    pub async fn unlock_account(
        &self,
        passphrase: &str,
        duration: Option<Duration>,
    ) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        if let Some(key_path) = &self.key_path {
            let wallet = LocalWallet::decrypt_keystore(key_path, passphrase)
                .map_err(|e| BridgeError::Generic(format!("failed to unlock: {}", e)))
                .tap_err(|e| warn!("[{}] {}", self.name, e))?;
            if wallet.address() != self.address {
                return Err(BridgeError::Generic(format!(
                    "keystore {:?} does not hold {:?}",
                    key_path, self.address
                )));
            }
        }
        let until = match duration {
            Some(d) => Some(Instant::now().checked_add(d).ok_or_else(|| {
                BridgeError::Generic("unlock duration too large".to_string())
            })?),
            None => None,
        };
        state.unlocked = true;
        state.unlocked_until = until;
        info!("[{}] Unlocked operator {:?}", self.name, self.address);
        Ok(())
    }

    pub async fn is_unlocked(&self) -> bool {
        self.state.lock().await.is_unlocked()
    }

    pub async fn account_info(&self) -> AccountInfo {
        let state = self.state.lock().await;
        AccountInfo {
            address: self.address,
            nonce: state.nonce,
            is_nonce_synced: state.nonce_synced,
            is_unlocked: state.is_unlocked(),
            chain_id: state.chain_id,
            gas_price: state.gas_price,
            fee_payer: state.fee_payer.as_ref().map(|w| w.address()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct FeePayerConfig {
    parent: Option<Address>,
    child: Option<Address>,
}

impl Config for FeePayerConfig {}

/// The parent and child operators of this bridge node.
pub struct BridgeAccounts {
    pub parent: Arc<OperatorAccount>,
    pub child: Arc<OperatorAccount>,
    data_dir: PathBuf,
}

impl BridgeAccounts {
    /// Opens (creating on first run) both operator keystores under
    /// `data_dir` and restores the persisted fee payers.
    pub fn new(data_dir: &Path, parent_gas_limit: u64, child_gas_limit: u64) -> anyhow::Result<Self> {
        let parent_key = bridge_keys::init_operator_keystore(&data_dir.join(PARENT_BRIDGE_ACCOUNT_DIR))?;
        let child_key = bridge_keys::init_operator_keystore(&data_dir.join(CHILD_BRIDGE_ACCOUNT_DIR))?;
        info!(
            "Bridge accounts loaded, parent {:?}, child {:?}",
            parent_key.address(),
            child_key.address()
        );
        let accounts = Self {
            parent: Arc::new(OperatorAccount::from_operator_key("parent", parent_key, parent_gas_limit)),
            child: Arc::new(OperatorAccount::from_operator_key("child", child_key, child_gas_limit)),
            data_dir: data_dir.to_path_buf(),
        };
        Ok(accounts)
    }

    pub fn from_accounts(
        data_dir: &Path,
        parent: Arc<OperatorAccount>,
        child: Arc<OperatorAccount>,
    ) -> Self {
        Self {
            parent,
            child,
            data_dir: data_dir.to_path_buf(),
        }
    }

    fn fee_payers_path(&self) -> PathBuf {
        self.data_dir.join(FEE_PAYERS_FILE)
    }

    fn read_fee_payers(&self) -> anyhow::Result<FeePayerConfig> {
        let path = self.fee_payers_path();
        if !path.exists() {
            return Ok(FeePayerConfig::default());
        }
        FeePayerConfig::load(&path)
    }

    /// Re-applies the fee payers stored on disk. Their keys are looked up in
    /// the keystore directory of the operator they pay for.
    pub async fn restore_fee_payers(&self) -> anyhow::Result<()> {
        let config = self.read_fee_payers()?;
        if let Some(payer) = config.parent {
            self.apply_fee_payer(&self.parent, PARENT_BRIDGE_ACCOUNT_DIR, Some(payer))
                .await?;
        }
        if let Some(payer) = config.child {
            self.apply_fee_payer(&self.child, CHILD_BRIDGE_ACCOUNT_DIR, Some(payer))
                .await?;
        }
        Ok(())
    }

    async fn apply_fee_payer(
        &self,
        account: &OperatorAccount,
        key_dir: &str,
        payer: Option<Address>,
    ) -> anyhow::Result<()> {
        let wallet = match payer {
            Some(address) => {
                Some(bridge_keys::load_operator_key(&self.data_dir.join(key_dir), &address)?.wallet)
            }
            None => None,
        };
        account.set_fee_payer(wallet).await;
        Ok(())
    }

    pub async fn set_parent_operator_fee_payer(&self, payer: Option<Address>) -> anyhow::Result<()> {
        self.apply_fee_payer(&self.parent, PARENT_BRIDGE_ACCOUNT_DIR, payer)
            .await?;
        let mut config = self.read_fee_payers()?;
        config.parent = payer;
        config.save(self.fee_payers_path())
    }

    pub async fn set_child_operator_fee_payer(&self, payer: Option<Address>) -> anyhow::Result<()> {
        self.apply_fee_payer(&self.child, CHILD_BRIDGE_ACCOUNT_DIR, payer)
            .await?;
        let mut config = self.read_fee_payers()?;
        config.child = payer;
        config.save(self.fee_payers_path())
    }

    pub async fn operators_info(&self) -> (AccountInfo, AccountInfo) {
        (
            self.parent.account_info().await,
            self.child.account_info().await,
        )
    }
}
