// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Registry of bridge pairs: journal persistence, event subscriptions and
//! routing, token pairs, operators, fees and value transfer recovery.

use crate::abi::{bridge_event_topics, decode_bridge_log, VOTE_TYPE_VALUE_TRANSFER};
use crate::accounts::{BridgeAccounts, OperatorAccount};
use crate::address_journal::{AddressJournal, ADDRESS_JOURNAL_FILE};
use crate::bridge_contract::BridgeContract;
use crate::bridge_info::{BridgeInfo, HandleTxHashStore};
use crate::bridge_pool::BridgeTxPool;
use crate::chain_backend::{ChainBackend, LogQuery, LogSubscription};
use crate::error::{BridgeError, BridgeResult};
use crate::journal::run_blocking;
use crate::metrics::BridgeMetrics;
use crate::recovery::{RecoveryConfig, ValueTransferRecovery};
use crate::types::{
    BridgeEvent, BridgeJournalEntry, HandleValueTransferEvent, RequestValueTransferEvent,
};
use ethers::types::{Address, Bytes, Log, H256, U256};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tap::TapFallible;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const BRIDGE_EVENT_CHANNEL_SIZE: usize = 10_000;

type BridgeInfoMap = Arc<RwLock<HashMap<Address, Arc<BridgeInfo>>>>;

/// Pending value transfers per direction, as reported by
/// `log_bridge_status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStatusSummary {
    pub bridge_pairs: usize,
    pub parent_to_child_pending: u64,
    pub child_to_parent_pending: u64,
}

/// Routes decoded bridge logs to the bridge info that has to act on them.
#[derive(Clone)]
struct EventRouter {
    infos: BridgeInfoMap,
    handle_tx_hashes: Arc<HandleTxHashStore>,
    metrics: Arc<BridgeMetrics>,
    request_events: broadcast::Sender<RequestValueTransferEvent>,
    handle_events: broadcast::Sender<HandleValueTransferEvent>,
}

impl EventRouter {
    async fn route_log(&self, log: &Log) -> BridgeResult<()> {
        match decode_bridge_log(log)? {
            Some(BridgeEvent::Request(event)) => self.route_request_event(event).await,
            Some(BridgeEvent::Handle(event)) => self.route_handle_event(event).await,
            None => Ok(()),
        }
    }

    /// A request emitted by bridge X is handled by X's counterpart.
    async fn route_request_event(&self, event: RequestValueTransferEvent) -> BridgeResult<()> {
        let source = event.raw().bridge_address;
        let (src, dst) = {
            let infos = self.infos.read().await;
            let src = infos
                .get(&source)
                .cloned()
                .ok_or(BridgeError::NoBridgeInfo(source))?;
            let dst = infos
                .get(&src.counterpart_address())
                .cloned()
                .ok_or(BridgeError::NoBridgeInfo(src.counterpart_address()))?;
            (src, dst)
        };
        self.metrics.vt_request_event.inc();
        debug!(
            "[bridge-manager] Request nonce {} from {:?} routed to {:?}",
            event.request_nonce(),
            source,
            dst.address()
        );
        src.update_request_nonce(event.request_nonce().saturating_add(1));
        let _ = self.request_events.send(event.clone());
        dst.add_request_value_transfer_events(vec![event]).await;
        Ok(())
    }

    /// A handle emitted by bridge Y closes nonces on Y itself.
    async fn route_handle_event(&self, event: HandleValueTransferEvent) -> BridgeResult<()> {
        let bridge = event.raw.bridge_address;
        let info = self
            .infos
            .read()
            .await
            .get(&bridge)
            .cloned()
            .ok_or(BridgeError::NoBridgeInfo(bridge))?;
        self.metrics.vt_handle_event.inc();
        info.update_lower_handle_nonce(event.lower_handle_nonce).await;
        info.mark_handled_nonce(event.handle_nonce).await;
        self.handle_tx_hashes
            .write(event.request_tx_hash, event.raw.tx_hash)
            .await;
        debug!(
            "[bridge-manager] {:?} handled nonce {}, lower handle nonce {}",
            bridge, event.handle_nonce, event.lower_handle_nonce
        );
        let _ = self.handle_events.send(event);
        Ok(())
    }
}

pub struct BridgeManager {
    recovery_config: RecoveryConfig,
    parent_backend: Arc<dyn ChainBackend>,
    child_backend: Arc<dyn ChainBackend>,
    accounts: Arc<BridgeAccounts>,
    tx_pool: Arc<BridgeTxPool>,
    metrics: Arc<BridgeMetrics>,
    router: EventRouter,
    journal: Mutex<Option<AddressJournal>>,
    subscriptions: Mutex<HashMap<Address, (CancellationToken, JoinHandle<()>)>>,
    // keyed by child bridge address
    recoveries: Mutex<HashMap<Address, Arc<ValueTransferRecovery>>>,
    cancel: CancellationToken,
}

impl BridgeManager {
    pub fn new(
        data_dir: &Path,
        recovery_config: RecoveryConfig,
        parent_backend: Arc<dyn ChainBackend>,
        child_backend: Arc<dyn ChainBackend>,
        accounts: Arc<BridgeAccounts>,
        tx_pool: Arc<BridgeTxPool>,
        metrics: Arc<BridgeMetrics>,
    ) -> BridgeResult<Arc<Self>> {
        let journal = AddressJournal::open(data_dir.join(ADDRESS_JOURNAL_FILE))
            .tap_err(|e| error!("[bridge-manager] Failed to open address journal: {}", e))?;
        let (request_events, _) = broadcast::channel(BRIDGE_EVENT_CHANNEL_SIZE);
        let (handle_events, _) = broadcast::channel(BRIDGE_EVENT_CHANNEL_SIZE);
        Ok(Arc::new(Self {
            recovery_config,
            parent_backend,
            child_backend,
            accounts,
            tx_pool,
            router: EventRouter {
                infos: Arc::new(RwLock::new(HashMap::new())),
                handle_tx_hashes: Arc::new(HandleTxHashStore::default()),
                metrics: metrics.clone(),
                request_events,
                handle_events,
            },
            metrics,
            journal: Mutex::new(Some(journal)),
            subscriptions: Mutex::new(HashMap::new()),
            recoveries: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }))
    }

    pub fn subscribe_request_events(&self) -> broadcast::Receiver<RequestValueTransferEvent> {
        self.router.request_events.subscribe()
    }

    pub fn subscribe_handle_events(&self) -> broadcast::Receiver<HandleValueTransferEvent> {
        self.router.handle_events.subscribe()
    }

    pub fn handle_tx_hashes(&self) -> &Arc<HandleTxHashStore> {
        &self.router.handle_tx_hashes
    }

    pub fn accounts(&self) -> &Arc<BridgeAccounts> {
        &self.accounts
    }

    fn side(&self, on_child_chain: bool) -> (&Arc<dyn ChainBackend>, &Arc<OperatorAccount>) {
        if on_child_chain {
            (&self.child_backend, &self.accounts.child)
        } else {
            (&self.parent_backend, &self.accounts.parent)
        }
    }

    /// Deploys a bridge contract on the child chain, or on the parent chain
    /// when `on_child_chain` is false.
    pub async fn deploy_bridge(
        &self,
        on_child_chain: bool,
        bytecode: Bytes,
    ) -> BridgeResult<BridgeContract> {
        let (backend, account) = self.side(on_child_chain);
        BridgeContract::deploy(backend.clone(), account, bytecode).await
    }

    pub async fn get_bridge_info(&self, address: &Address) -> Option<Arc<BridgeInfo>> {
        self.router.infos.read().await.get(address).cloned()
    }

    async fn bridge_info(&self, address: &Address) -> BridgeResult<Arc<BridgeInfo>> {
        self.get_bridge_info(address)
            .await
            .ok_or(BridgeError::NoBridgeInfo(*address))
    }

    /// Registers the runtime info of one bridge and starts its handler loop.
    pub async fn set_bridge_info(
        &self,
        bridge: BridgeContract,
        counterpart: BridgeContract,
        account: Arc<OperatorAccount>,
        on_child_chain: bool,
        subscribed: bool,
    ) -> BridgeResult<Arc<BridgeInfo>> {
        let address = bridge.address();
        let info = {
            let mut infos = self.router.infos.write().await;
            if infos.contains_key(&address) {
                return Err(BridgeError::DuplicatedBridgeInfo(address));
            }
            let tx_pool = (!on_child_chain).then(|| self.tx_pool.clone());
            let info = Arc::new(BridgeInfo::new(
                bridge,
                counterpart,
                account,
                on_child_chain,
                subscribed,
                tx_pool,
                self.router.handle_tx_hashes.clone(),
                self.metrics.clone(),
            ));
            infos.insert(address, info.clone());
            info
        };
        if let Err(e) = info.update_info().await {
            warn!(
                "[bridge-manager] Failed to read on-chain state of {:?}: {}",
                address, e
            );
        }
        info.spawn_handler_loop();
        Ok(info)
    }

    /// Removes the info of `address` and stops its handler loop and event
    /// dispatcher.
    pub async fn delete_bridge_info(&self, address: &Address) -> BridgeResult<()> {
        let info = self
            .router
            .infos
            .write()
            .await
            .remove(address)
            .ok_or(BridgeError::NoBridgeInfo(*address))?;
        self.stop_dispatcher(address).await;
        info.close();
        Ok(())
    }

    /// Applies a journal update off the async workers.
    async fn with_journal<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut AddressJournal) -> BridgeResult<T> + Send + 'static,
    ) -> BridgeResult<T> {
        let mut journal = self.journal.lock().await;
        run_blocking(&mut *journal, f)
            .await
            .ok_or(BridgeError::NoActiveAddressJournal)?
    }

    pub async fn set_journal(&self, local: Address, remote: Address) -> BridgeResult<()> {
        self.with_journal(move |journal| journal.insert(local, remote))
            .await
    }

    pub async fn get_all_bridge(&self) -> BridgeResult<Vec<BridgeJournalEntry>> {
        self.journal
            .lock()
            .await
            .as_ref()
            .map(AddressJournal::entries)
            .ok_or(BridgeError::NoActiveAddressJournal)
    }

    pub async fn is_in_child_addrs(&self, address: &Address) -> bool {
        self.get_all_bridge()
            .await
            .map(|entries| entries.iter().any(|e| e.local_address == *address))
            .unwrap_or(false)
    }

    pub async fn is_in_parent_addrs(&self, address: &Address) -> bool {
        self.get_all_bridge()
            .await
            .map(|entries| entries.iter().any(|e| e.remote_address == *address))
            .unwrap_or(false)
    }

    pub async fn is_valid_bridge_pair(&self, child: &Address, parent: &Address) -> bool {
        let infos = self.router.infos.read().await;
        match (infos.get(child), infos.get(parent)) {
            (Some(c), Some(p)) => {
                c.counterpart_address() == *parent
                    && p.counterpart_address() == *child
                    && c.on_child_chain()
                    && !p.on_child_chain()
            }
            _ => false,
        }
    }

    async fn pair(&self, child: &Address, parent: &Address) -> BridgeResult<(Arc<BridgeInfo>, Arc<BridgeInfo>)> {
        if !self.is_valid_bridge_pair(child, parent).await {
            return Err(BridgeError::InvalidBridgePair(*child, *parent));
        }
        Ok((self.bridge_info(child).await?, self.bridge_info(parent).await?))
    }

    async fn ensure_contract(backend: &Arc<dyn ChainBackend>, address: Address) -> BridgeResult<()> {
        if address.is_zero() {
            return Err(BridgeError::EmptyBridgeAddress);
        }
        if backend.code_at(address).await?.is_empty() {
            return Err(BridgeError::UnknownBridgeContractAddr(address));
        }
        Ok(())
    }

    /// Journals the pair and registers both infos, or neither.
    pub async fn register_bridge(&self, child: Address, parent: Address) -> BridgeResult<()> {
        Self::ensure_contract(&self.child_backend, child).await?;
        Self::ensure_contract(&self.parent_backend, parent).await?;
        self.set_journal(child, parent).await?;
        if let Err(e) = self.create_pair_infos(child, parent, false).await {
            if let Err(e) = self.with_journal(move |journal| journal.remove(&child)).await {
                error!("[bridge-manager] Failed to roll back journal of {:?}: {}", child, e);
            }
            return Err(e);
        }
        info!("[bridge-manager] Registered bridge pair {:?} <-> {:?}", child, parent);
        Ok(())
    }

    async fn create_pair_infos(
        &self,
        child: Address,
        parent: Address,
        subscribed: bool,
    ) -> BridgeResult<()> {
        let child_bridge = BridgeContract::new(child, self.child_backend.clone());
        let parent_bridge = BridgeContract::new(parent, self.parent_backend.clone());
        self.set_bridge_info(
            child_bridge.clone(),
            parent_bridge.clone(),
            self.accounts.child.clone(),
            true,
            subscribed,
        )
        .await?;
        if let Err(e) = self
            .set_bridge_info(
                parent_bridge,
                child_bridge,
                self.accounts.parent.clone(),
                false,
                subscribed,
            )
            .await
        {
            let _ = self.delete_bridge_info(&child).await;
            return Err(e);
        }
        Ok(())
    }

    /// Unsubscribes, stops recovery and forgets the pair.
    pub async fn deregister_bridge(&self, child: Address, parent: Address) -> BridgeResult<()> {
        if !self.is_valid_bridge_pair(&child, &parent).await {
            return Err(BridgeError::InvalidBridgePair(child, parent));
        }
        if let Err(e) = self.unsubscribe_event(child, parent).await {
            debug!("[bridge-manager] {}", e);
        }
        if let Err(e) = self.delete_recovery(child, parent).await {
            debug!("[bridge-manager] {}", e);
        }
        self.delete_bridge_info(&child).await?;
        self.delete_bridge_info(&parent).await?;
        self.with_journal(move |journal| journal.remove(&child).map(|_| ()))
            .await?;
        info!("[bridge-manager] Deregistered bridge pair {:?} <-> {:?}", child, parent);
        Ok(())
    }

    fn spawn_dispatcher(&self, address: Address, mut subscription: LogSubscription) -> (CancellationToken, JoinHandle<()>) {
        let router = self.router.clone();
        let cancel = self.cancel.child_token();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            debug!("[bridge-manager] Dispatching events of {:?}", address);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    log = subscription.recv() => {
                        let Some(log) = log else {
                            warn!("[bridge-manager] Event stream of {:?} ended", address);
                            break;
                        };
                        if let Err(e) = router.route_log(&log).await {
                            warn!(
                                "[bridge-manager] Failed to route log {:?} of {:?}: {}",
                                log.transaction_hash, address, e
                            );
                        }
                    }
                }
            }
            subscription.unsubscribe();
        });
        (cancel, handle)
    }

    async fn stop_dispatcher(&self, address: &Address) -> bool {
        match self.subscriptions.lock().await.remove(address) {
            Some((cancel, _)) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Starts delivering the log streams of both bridges of a pair.
    pub async fn subscribe_event(&self, child: Address, parent: Address) -> BridgeResult<()> {
        let (child_info, parent_info) = self.pair(&child, &parent).await?;
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(&child) || subscriptions.contains_key(&parent) {
            return Err(BridgeError::AlreadySubscribed(child));
        }
        let child_sub = self
            .child_backend
            .subscribe_logs(LogQuery::new(vec![child], bridge_event_topics()))
            .await?;
        let parent_sub = self
            .parent_backend
            .subscribe_logs(LogQuery::new(vec![parent], bridge_event_topics()))
            .await?;
        subscriptions.insert(child, self.spawn_dispatcher(child, child_sub));
        subscriptions.insert(parent, self.spawn_dispatcher(parent, parent_sub));
        drop(subscriptions);

        child_info.set_subscribed(true);
        parent_info.set_subscribed(true);
        self.with_journal(move |journal| journal.set_subscribed(&child, true))
            .await?;
        info!("[bridge-manager] Subscribed events of {:?} <-> {:?}", child, parent);
        Ok(())
    }

    /// Stops the log streams of a pair without removing it.
    pub async fn unsubscribe_event(&self, child: Address, parent: Address) -> BridgeResult<()> {
        let stopped_child = self.stop_dispatcher(&child).await;
        let stopped_parent = self.stop_dispatcher(&parent).await;
        if !stopped_child && !stopped_parent {
            return Err(BridgeError::NotSubscribed(child));
        }
        for address in [child, parent] {
            if let Some(info) = self.get_bridge_info(&address).await {
                info.set_subscribed(false);
            }
        }
        self.with_journal(move |journal| journal.set_subscribed(&child, false))
            .await?;
        info!("[bridge-manager] Unsubscribed events of {:?} <-> {:?}", child, parent);
        Ok(())
    }

    /// Re-creates the log streams of every subscribed pair.
    pub async fn reset_all_subscribed_events(&self) -> BridgeResult<()> {
        for entry in self.get_all_bridge().await? {
            if !entry.subscribed {
                continue;
            }
            self.stop_dispatcher(&entry.local_address).await;
            self.stop_dispatcher(&entry.remote_address).await;
            self.subscribe_event(entry.local_address, entry.remote_address)
                .await
                .tap_err(|e| {
                    warn!(
                        "[bridge-manager] Failed to resubscribe {:?}: {}",
                        entry.local_address, e
                    )
                })?;
        }
        Ok(())
    }

    /// Rebuilds every journaled pair: infos, subscriptions and recoveries.
    pub async fn restore_bridges(&self) -> BridgeResult<()> {
        self.stop_all_recoveries().await;
        let entries = self.get_all_bridge().await?;
        for entry in &entries {
            let (child, parent) = (entry.local_address, entry.remote_address);
            if !self.is_valid_bridge_pair(&child, &parent).await {
                for address in [child, parent] {
                    if self.get_bridge_info(&address).await.is_some() {
                        self.delete_bridge_info(&address).await?;
                    }
                }
                self.create_pair_infos(child, parent, entry.subscribed)
                    .await?;
            }
            if entry.subscribed {
                match self.subscribe_event(child, parent).await {
                    Ok(()) | Err(BridgeError::AlreadySubscribed(_)) => {}
                    Err(e) => return Err(e),
                }
                self.add_recovery(child, parent).await?;
            }
        }
        info!("[bridge-manager] Restored {} bridge pairs", entries.len());
        Ok(())
    }

    /// Starts value transfer recovery for a pair. A no-op when recovery is
    /// disabled.
    pub async fn add_recovery(&self, child: Address, parent: Address) -> BridgeResult<()> {
        if !self.recovery_config.enabled {
            info!("[bridge-manager] Value transfer recovery is disabled");
            return Ok(());
        }
        let (child_info, parent_info) = self.pair(&child, &parent).await?;
        let mut recoveries = self.recoveries.lock().await;
        if recoveries.contains_key(&child) {
            return Err(BridgeError::VtrAlreadyStarted);
        }
        let recovery = Arc::new(ValueTransferRecovery::new(
            self.recovery_config.clone(),
            child_info,
            parent_info,
            self.metrics.clone(),
        ));
        recovery.start().await?;
        recoveries.insert(child, recovery);
        Ok(())
    }

    pub async fn delete_recovery(&self, child: Address, parent: Address) -> BridgeResult<()> {
        let recovery = {
            let mut recoveries = self.recoveries.lock().await;
            let known = recoveries
                .get(&child)
                .map_or(false, |r| r.parent_address() == parent);
            if known {
                recoveries.remove(&child)
            } else {
                None
            }
        }
        .ok_or(BridgeError::NoRecovery(child))?;
        recovery.stop().await;
        Ok(())
    }

    pub async fn get_recovery(&self, child: &Address) -> Option<Arc<ValueTransferRecovery>> {
        self.recoveries.lock().await.get(child).cloned()
    }

    pub async fn stop_all_recoveries(&self) {
        let recoveries: Vec<_> = self.recoveries.lock().await.drain().collect();
        for (_, recovery) in recoveries {
            recovery.stop().await;
        }
    }

    /// Registers a token pair on both contracts and in both infos.
    pub async fn register_token(
        &self,
        child: Address,
        parent: Address,
        child_token: Address,
        parent_token: Address,
    ) -> BridgeResult<()> {
        let (child_info, parent_info) = self.pair(&child, &parent).await?;
        if child_info.tokens().await.contains_key(&child_token) {
            return Err(BridgeError::DuplicatedToken(child_token));
        }
        if parent_info.tokens().await.contains_key(&parent_token) {
            return Err(BridgeError::DuplicatedToken(parent_token));
        }
        child_info
            .bridge()
            .register_token(child_info.account(), child_token, parent_token)
            .await?;
        parent_info
            .bridge()
            .register_token(parent_info.account(), parent_token, child_token)
            .await?;
        child_info.register_token(child_token, parent_token).await?;
        if let Err(e) = parent_info.register_token(parent_token, child_token).await {
            let _ = child_info.deregister_token(child_token).await;
            return Err(e);
        }
        info!(
            "[bridge-manager] Registered token pair {:?} <-> {:?}",
            child_token, parent_token
        );
        Ok(())
    }

    pub async fn deregister_token(
        &self,
        child: Address,
        parent: Address,
        child_token: Address,
        parent_token: Address,
    ) -> BridgeResult<()> {
        let (child_info, parent_info) = self.pair(&child, &parent).await?;
        let registered = child_info.tokens().await.get(&child_token).copied();
        let counter = parent_info.tokens().await.get(&parent_token).copied();
        if registered != Some(parent_token) || counter != Some(child_token) {
            return Err(BridgeError::InvalidTokenPair(child_token, parent_token));
        }
        child_info
            .bridge()
            .deregister_token(child_info.account(), child_token)
            .await?;
        parent_info
            .bridge()
            .deregister_token(parent_info.account(), parent_token)
            .await?;
        child_info.deregister_token(child_token).await?;
        parent_info.deregister_token(parent_token).await?;
        Ok(())
    }

    pub async fn register_operator(&self, bridge: Address, operator: Address) -> BridgeResult<H256> {
        let info = self.bridge_info(&bridge).await?;
        let tx = info.bridge().register_operator(info.account(), operator).await?;
        Ok(tx.hash())
    }

    pub async fn deregister_operator(&self, bridge: Address, operator: Address) -> BridgeResult<H256> {
        let info = self.bridge_info(&bridge).await?;
        let tx = info
            .bridge()
            .deregister_operator(info.account(), operator)
            .await?;
        Ok(tx.hash())
    }

    pub async fn get_operators(&self, bridge: Address) -> BridgeResult<Vec<Address>> {
        self.bridge_info(&bridge).await?.bridge().operators().await
    }

    pub async fn set_value_transfer_operator_threshold(
        &self,
        bridge: Address,
        threshold: u8,
    ) -> BridgeResult<H256> {
        let info = self.bridge_info(&bridge).await?;
        let tx = info
            .bridge()
            .set_operator_threshold(info.account(), VOTE_TYPE_VALUE_TRANSFER, threshold)
            .await?;
        Ok(tx.hash())
    }

    pub async fn get_value_transfer_operator_threshold(&self, bridge: Address) -> BridgeResult<u8> {
        self.bridge_info(&bridge)
            .await?
            .bridge()
            .operator_threshold(VOTE_TYPE_VALUE_TRANSFER)
            .await
    }

    pub async fn set_klay_fee(&self, bridge: Address, fee: U256) -> BridgeResult<H256> {
        let info = self.bridge_info(&bridge).await?;
        Ok(info.bridge().set_klay_fee(info.account(), fee).await?.hash())
    }

    pub async fn set_erc20_fee(&self, bridge: Address, token: Address, fee: U256) -> BridgeResult<H256> {
        let info = self.bridge_info(&bridge).await?;
        Ok(info
            .bridge()
            .set_erc20_fee(info.account(), token, fee)
            .await?
            .hash())
    }

    pub async fn set_fee_receiver(&self, bridge: Address, receiver: Address) -> BridgeResult<H256> {
        let info = self.bridge_info(&bridge).await?;
        Ok(info
            .bridge()
            .set_fee_receiver(info.account(), receiver)
            .await?
            .hash())
    }

    pub async fn get_klay_fee(&self, bridge: Address) -> BridgeResult<U256> {
        self.bridge_info(&bridge).await?.bridge().fee_of_klay().await
    }

    pub async fn get_erc20_fee(&self, bridge: Address, token: Address) -> BridgeResult<U256> {
        self.bridge_info(&bridge)
            .await?
            .bridge()
            .fee_of_erc20(token)
            .await
    }

    pub async fn get_fee_receiver(&self, bridge: Address) -> BridgeResult<Address> {
        self.bridge_info(&bridge).await?.bridge().fee_receiver().await
    }

    /// Logs request and handle nonces of every pair and the pending totals
    /// per direction.
    pub async fn log_bridge_status(&self) -> BridgeResult<BridgeStatusSummary> {
        let mut summary = BridgeStatusSummary::default();
        for entry in self.get_all_bridge().await? {
            let (Some(child), Some(parent)) = (
                self.get_bridge_info(&entry.local_address).await,
                self.get_bridge_info(&entry.remote_address).await,
            ) else {
                continue;
            };
            summary.bridge_pairs += 1;
            // requests of the parent bridge are handled on the child bridge
            let p2c = child
                .request_nonce_from_counterpart()
                .saturating_sub(child.lower_handle_nonce());
            let c2p = parent
                .request_nonce_from_counterpart()
                .saturating_sub(parent.lower_handle_nonce());
            summary.parent_to_child_pending += p2c;
            summary.child_to_parent_pending += c2p;
            for info in [&child, &parent] {
                let status = info.status().await;
                debug!(
                    "[bridge-manager] {:?} request {} counterpart request {} handle {} lower {} pending events {}",
                    status.address,
                    status.request_nonce,
                    status.request_nonce_from_counterpart,
                    status.handle_nonce,
                    status.lower_handle_nonce,
                    status.pending_events
                );
            }
        }
        if summary.bridge_pairs > 0 {
            info!(
                "[bridge-manager] VT: parent -> child pending {}, child -> parent pending {}, {} pairs",
                summary.parent_to_child_pending, summary.child_to_parent_pending, summary.bridge_pairs
            );
        }
        Ok(summary)
    }

    /// Stops dispatchers, handler loops and recoveries, then closes the
    /// journal.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.stop_all_recoveries().await;
        let dispatchers: Vec<_> = self.subscriptions.lock().await.drain().collect();
        for (_, (cancel, handle)) in dispatchers {
            cancel.cancel();
            let _ = handle.await;
        }
        for info in self.router.infos.read().await.values() {
            info.close();
        }
        let mut journal = self.journal.lock().await;
        if let Some(Err(e)) = run_blocking(&mut *journal, |j| j.close()).await {
            error!("[bridge-manager] Failed to close address journal: {}", e);
        }
        *journal = None;
        info!("[bridge-manager] Stopped");
    }
}
