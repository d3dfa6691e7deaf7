// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Runtime state of one bridge contract and the ordered pipeline that turns
//! counterpart request events into handle transactions on it.

use crate::accounts::OperatorAccount;
use crate::bridge_contract::{BridgeContract, HandleCall};
use crate::bridge_pool::BridgeTxPool;
use crate::error::{BridgeError, BridgeResult};
use crate::metrics::BridgeMetrics;
use crate::revert::{classify_error, RevertKind};
use crate::transaction::Transaction;
use crate::types::{RequestValueTransferEvent, TokenType};
use ethers::types::{Address, H256};
use lru::LruCache;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Upper bound of request events buffered per bridge.
pub const MAX_PENDING_NONCE_DIFF: usize = 1000;
/// Events handed to one processing pass.
pub const MAX_READY_EVENTS: usize = MAX_PENDING_NONCE_DIFF / 2;
pub const HANDLE_TX_HASH_CACHE_SIZE: usize = 10_000;
const BRIDGE_LOOP_INTERVAL: Duration = Duration::from_secs(1);

/// Request events keyed by request nonce.
#[derive(Debug, Default)]
pub struct PendingRequestEvents {
    events: BTreeMap<u64, RequestValueTransferEvent>,
}

impl PendingRequestEvents {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn contains(&self, nonce: u64) -> bool {
        self.events.contains_key(&nonce)
    }

    pub fn nonces(&self) -> Vec<u64> {
        self.events.keys().copied().collect()
    }

    /// Inserts `event` unless its nonce is already buffered. When the buffer
    /// is full a smaller nonce evicts the largest one. Returns whether the
    /// event was stored.
    pub fn put(&mut self, event: RequestValueTransferEvent) -> bool {
        let nonce = event.request_nonce();
        if self.events.contains_key(&nonce) {
            return false;
        }
        if self.events.len() >= MAX_PENDING_NONCE_DIFF {
            let Some(max_nonce) = self.events.keys().next_back().copied() else {
                return false;
            };
            if nonce >= max_nonce {
                return false;
            }
            self.events.remove(&max_nonce);
            trace!(
                "Pending list full, nonce {} evicts nonce {}",
                nonce,
                max_nonce
            );
        }
        self.events.insert(nonce, event);
        true
    }

    pub fn remove(&mut self, nonce: u64) -> Option<RequestValueTransferEvent> {
        self.events.remove(&nonce)
    }

    /// Drops every event whose nonce is below `nonce`. Returns how many.
    pub fn drop_below(&mut self, nonce: u64) -> usize {
        let kept = self.events.split_off(&nonce);
        let dropped = self.events.len();
        self.events = kept;
        dropped
    }

    /// Pops the run of consecutive nonces starting at `next`, at most
    /// `limit` of them. Stops at the first gap.
    pub fn pop_ready(&mut self, next: u64, limit: usize) -> Vec<RequestValueTransferEvent> {
        let mut ready = Vec::new();
        let mut nonce = next;
        while ready.len() < limit {
            match self.events.remove(&nonce) {
                Some(event) => ready.push(event),
                None => break,
            }
            nonce += 1;
        }
        ready
    }
}

/// Handle tx hashes by the request tx hash they answer.
pub struct HandleTxHashStore {
    inner: Mutex<LruCache<H256, H256>>,
}

impl Default for HandleTxHashStore {
    fn default() -> Self {
        Self::new(HANDLE_TX_HASH_CACHE_SIZE)
    }
}

impl HandleTxHashStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn write(&self, request_tx_hash: H256, handle_tx_hash: H256) {
        self.inner.lock().await.put(request_tx_hash, handle_tx_hash);
    }

    pub async fn read(&self, request_tx_hash: &H256) -> Option<H256> {
        self.inner.lock().await.get(request_tx_hash).copied()
    }
}

/// Snapshot used for status logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeInfoStatus {
    pub address: Address,
    pub counterpart_address: Address,
    pub on_child_chain: bool,
    pub subscribed: bool,
    pub is_running: bool,
    pub request_nonce: u64,
    pub request_nonce_from_counterpart: u64,
    pub handle_nonce: u64,
    pub lower_handle_nonce: u64,
    pub next_handle_nonce: u64,
    pub pending_events: usize,
}

/// Outcome of handling one event.
enum Handled {
    Submitted(Transaction),
    Skipped,
}

pub struct BridgeInfo {
    address: Address,
    counterpart_address: Address,
    on_child_chain: bool,
    bridge: BridgeContract,
    counterpart_bridge: BridgeContract,
    account: Arc<OperatorAccount>,
    // parent side only, handles are resent through the peers
    tx_pool: Option<Arc<BridgeTxPool>>,
    handle_tx_hashes: Arc<HandleTxHashStore>,
    metrics: Arc<BridgeMetrics>,
    label: String,

    subscribed: AtomicBool,
    is_running: AtomicBool,
    request_nonce: AtomicU64,
    request_nonce_from_counterpart: AtomicU64,
    handle_nonce: AtomicU64,
    lower_handle_nonce: AtomicU64,
    next_handle_nonce: AtomicU64,

    // local token -> counterpart token
    tokens: RwLock<HashMap<Address, Address>>,
    pending: Mutex<PendingRequestEvents>,
    // one processing pass at a time
    processing: Mutex<()>,
    new_event: Notify,
    closed: CancellationToken,
}

impl std::fmt::Debug for BridgeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeInfo")
            .field("address", &self.address)
            .field("counterpart_address", &self.counterpart_address)
            .field("on_child_chain", &self.on_child_chain)
            .finish()
    }
}

impl BridgeInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bridge: BridgeContract,
        counterpart_bridge: BridgeContract,
        account: Arc<OperatorAccount>,
        on_child_chain: bool,
        subscribed: bool,
        tx_pool: Option<Arc<BridgeTxPool>>,
        handle_tx_hashes: Arc<HandleTxHashStore>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        let address = bridge.address();
        Self {
            address,
            counterpart_address: counterpart_bridge.address(),
            on_child_chain,
            bridge,
            counterpart_bridge,
            account,
            tx_pool,
            handle_tx_hashes,
            metrics,
            label: format!("{:?}", address),
            subscribed: AtomicBool::new(subscribed),
            is_running: AtomicBool::new(true),
            request_nonce: AtomicU64::new(0),
            request_nonce_from_counterpart: AtomicU64::new(0),
            handle_nonce: AtomicU64::new(0),
            lower_handle_nonce: AtomicU64::new(0),
            next_handle_nonce: AtomicU64::new(0),
            tokens: RwLock::new(HashMap::new()),
            pending: Mutex::new(PendingRequestEvents::default()),
            processing: Mutex::new(()),
            new_event: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn counterpart_address(&self) -> Address {
        self.counterpart_address
    }

    pub fn on_child_chain(&self) -> bool {
        self.on_child_chain
    }

    pub fn bridge(&self) -> &BridgeContract {
        &self.bridge
    }

    pub fn counterpart_bridge(&self) -> &BridgeContract {
        &self.counterpart_bridge
    }

    pub fn account(&self) -> &Arc<OperatorAccount> {
        &self.account
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn set_subscribed(&self, subscribed: bool) {
        self.subscribed.store(subscribed, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn request_nonce(&self) -> u64 {
        self.request_nonce.load(Ordering::SeqCst)
    }

    pub fn request_nonce_from_counterpart(&self) -> u64 {
        self.request_nonce_from_counterpart.load(Ordering::SeqCst)
    }

    pub fn handle_nonce(&self) -> u64 {
        self.handle_nonce.load(Ordering::SeqCst)
    }

    pub fn lower_handle_nonce(&self) -> u64 {
        self.lower_handle_nonce.load(Ordering::SeqCst)
    }

    pub fn next_handle_nonce(&self) -> u64 {
        self.next_handle_nonce.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn pending_nonces(&self) -> Vec<u64> {
        self.pending.lock().await.nonces()
    }

    pub async fn status(&self) -> BridgeInfoStatus {
        BridgeInfoStatus {
            address: self.address,
            counterpart_address: self.counterpart_address,
            on_child_chain: self.on_child_chain,
            subscribed: self.is_subscribed(),
            is_running: self.is_running(),
            request_nonce: self.request_nonce(),
            request_nonce_from_counterpart: self.request_nonce_from_counterpart(),
            handle_nonce: self.handle_nonce(),
            lower_handle_nonce: self.lower_handle_nonce(),
            next_handle_nonce: self.next_handle_nonce(),
            pending_events: self.pending_len().await,
        }
    }

    pub async fn register_token(&self, local: Address, remote: Address) -> BridgeResult<()> {
        let mut tokens = self.tokens.write().await;
        if tokens.contains_key(&local) {
            return Err(BridgeError::DuplicatedToken(local));
        }
        tokens.insert(local, remote);
        Ok(())
    }

    pub async fn deregister_token(&self, local: Address) -> BridgeResult<Address> {
        self.tokens
            .write()
            .await
            .remove(&local)
            .ok_or(BridgeError::InvalidTokenPair(local, Address::zero()))
    }

    pub async fn tokens(&self) -> HashMap<Address, Address> {
        self.tokens.read().await.clone()
    }

    /// Local token paired with the counterpart chain token `remote`.
    pub async fn local_token_of(&self, remote: Address) -> Option<Address> {
        self.tokens
            .read()
            .await
            .iter()
            .find(|(_, r)| **r == remote)
            .map(|(local, _)| *local)
    }

    /// Re-reads the nonces and the running flag from both contracts.
    pub async fn update_info(&self) -> BridgeResult<()> {
        self.update_request_nonce(self.bridge.request_nonce().await?);
        let handle_nonce = self.bridge.handle_nonce().await?;
        let lower_handle_nonce = self.bridge.lower_handle_nonce().await?;
        self.update_lower_handle_nonce(lower_handle_nonce).await;
        self.update_handle_nonce(handle_nonce.max(lower_handle_nonce));
        self.update_request_nonce_from_counterpart(self.counterpart_bridge.request_nonce().await?);
        let running = self.bridge.is_running().await?;
        self.is_running.store(running, Ordering::SeqCst);
        debug!(
            "[bridge-info {:?}] Updated info: lower {} handle {} running {}",
            self.address,
            self.lower_handle_nonce(),
            self.handle_nonce(),
            running
        );
        Ok(())
    }

    pub fn update_request_nonce(&self, nonce: u64) {
        self.request_nonce.fetch_max(nonce, Ordering::SeqCst);
    }

    pub fn update_request_nonce_from_counterpart(&self, nonce: u64) {
        let prev = self
            .request_nonce_from_counterpart
            .fetch_max(nonce, Ordering::SeqCst);
        if prev < nonce {
            self.metrics
                .vt_request_nonce_count
                .with_label_values(&[&self.label])
                .set(nonce as i64);
        }
    }

    pub fn update_handle_nonce(&self, nonce: u64) {
        let prev = self.handle_nonce.fetch_max(nonce, Ordering::SeqCst);
        if prev < nonce {
            self.metrics
                .vt_handle_nonce_count
                .with_label_values(&[&self.label])
                .set(nonce as i64);
        }
        self.update_request_nonce_from_counterpart(nonce);
    }

    /// Records that the handle of request `nonce` was accepted on chain.
    pub async fn mark_handled_nonce(&self, nonce: u64) {
        self.update_handle_nonce(nonce.saturating_add(1));
        let mut pending = self.pending.lock().await;
        if pending.remove(nonce).is_some() {
            self.set_pending_gauge(pending.len());
        }
    }

    /// Moves the low-water mark forward and forgets every buffered event
    /// below it.
    pub async fn update_lower_handle_nonce(&self, nonce: u64) {
        let prev = self.lower_handle_nonce.fetch_max(nonce, Ordering::SeqCst);
        if prev >= nonce {
            return;
        }
        self.metrics
            .vt_lower_handle_nonce_count
            .with_label_values(&[&self.label])
            .set(nonce as i64);
        self.update_handle_nonce(nonce);
        self.next_handle_nonce.fetch_max(nonce, Ordering::SeqCst);
        let mut pending = self.pending.lock().await;
        let dropped = pending.drop_below(nonce);
        if dropped > 0 {
            trace!(
                "[bridge-info {:?}] Dropped {} closed request events below {}",
                self.address,
                dropped,
                nonce
            );
            self.set_pending_gauge(pending.len());
        }
    }

    fn set_pending_gauge(&self, len: usize) {
        self.metrics
            .vt_pending_request_event
            .with_label_values(&[&self.label])
            .set(len as i64);
    }

    /// Buffers counterpart request events. Re-adding a buffered nonce is a
    /// no-op, and so is adding a nonce that is already closed.
    pub async fn add_request_value_transfer_events(&self, events: Vec<RequestValueTransferEvent>) {
        let lower = self.lower_handle_nonce();
        let mut added = 0;
        {
            let mut pending = self.pending.lock().await;
            for event in events {
                let nonce = event.request_nonce();
                self.update_request_nonce_from_counterpart(nonce.saturating_add(1));
                if nonce < lower {
                    continue;
                }
                if pending.put(event) {
                    added += 1;
                }
            }
            self.set_pending_gauge(pending.len());
            trace!(
                "[bridge-info {:?}] Added {} request events, {} pending",
                self.address,
                added,
                pending.len()
            );
        }
        if added > 0 {
            self.new_event.notify_one();
        }
    }

    /// Buffers events found by recovery. A recovered nonce below
    /// `next_handle_nonce` was submitted but never accepted, so the pipeline
    /// rewinds to it. A handle still in flight may be submitted twice after
    /// an explicit `recover()`; the contract rejects the second vote as
    /// already handled, which is absorbed.
    pub async fn add_recovered_events(&self, events: Vec<RequestValueTransferEvent>) {
        let lower = self.lower_handle_nonce();
        if let Some(min) = events
            .iter()
            .map(|e| e.request_nonce())
            .filter(|n| *n >= lower)
            .min()
        {
            let prev = self.next_handle_nonce.fetch_min(min, Ordering::SeqCst);
            if min < prev {
                info!(
                    "[bridge-info {:?}] Rewinding next handle nonce {} -> {}",
                    self.address, prev, min
                );
            }
        }
        self.add_request_value_transfer_events(events).await;
    }

    /// Handles buffered events in ascending nonce order starting at
    /// `next_handle_nonce`. Stops at the first gap or failed submission;
    /// unprocessed events go back to the buffer. Returns the number of
    /// events consumed.
    pub async fn process_pending_request_events(&self) -> BridgeResult<usize> {
        let _guard = self.processing.lock().await;
        let lower = self.lower_handle_nonce();
        self.next_handle_nonce.fetch_max(lower, Ordering::SeqCst);
        let next = self.next_handle_nonce();
        let ready = {
            let mut pending = self.pending.lock().await;
            // below `next` means already submitted
            pending.drop_below(next);
            let ready = pending.pop_ready(next, MAX_READY_EVENTS);
            self.set_pending_gauge(pending.len());
            ready
        };
        if ready.is_empty() {
            return Ok(0);
        }
        trace!(
            "[bridge-info {:?}] {} ready request events from nonce {}",
            self.address,
            ready.len(),
            next
        );

        let mut consumed = 0;
        let mut iter = ready.into_iter();
        while let Some(event) = iter.next() {
            let nonce = event.request_nonce();
            match self.handle_request_value_transfer_event(&event).await {
                Ok(handled) => {
                    if let Handled::Submitted(tx) = handled {
                        self.metrics
                            .handle_tx_submitted
                            .with_label_values(&[&event.token_type().to_string()])
                            .inc();
                        self.handle_tx_hashes.write(event.raw().tx_hash, tx.hash()).await;
                    }
                    self.next_handle_nonce.fetch_max(nonce.saturating_add(1), Ordering::SeqCst);
                    consumed += 1;
                }
                Err(err) => {
                    let kind = classify_error(&err, self.address);
                    if let Some(kind) = kind.filter(RevertKind::advances_nonce) {
                        debug!(
                            "[bridge-info {:?}] Request {} already voted ({}), moving on",
                            self.address, nonce, kind
                        );
                        self.next_handle_nonce.fetch_max(nonce.saturating_add(1), Ordering::SeqCst);
                        consumed += 1;
                        continue;
                    }
                    self.metrics
                        .err_handle_tx_submission
                        .with_label_values(&[err.error_type()])
                        .inc();
                    let mut rest = vec![event];
                    rest.extend(iter);
                    let rest_len = rest.len();
                    {
                        let mut pending = self.pending.lock().await;
                        for event in rest {
                            pending.put(event);
                        }
                        self.set_pending_gauge(pending.len());
                    }
                    if kind.as_ref().is_some_and(RevertKind::is_absorbed) {
                        warn!(
                            "[bridge-info {:?}] Request {} postponed: {}",
                            self.address, nonce, err
                        );
                        return Ok(consumed);
                    }
                    debug!(
                        "[bridge-info {:?}] Failed to handle request {}, re-put {} events: {}",
                        self.address, nonce, rest_len, err
                    );
                    return Err(err);
                }
            }
        }
        Ok(consumed)
    }

    async fn handle_request_value_transfer_event(
        &self,
        event: &RequestValueTransferEvent,
    ) -> BridgeResult<Handled> {
        if self.bridge.handled_request_tx(event.raw().tx_hash).await? {
            debug!(
                "[bridge-info {:?}] Request tx {:?} already handled",
                self.address,
                event.raw().tx_hash
            );
            return Ok(Handled::Skipped);
        }

        let token_type = event.token_type();
        let token_address = match token_type {
            TokenType::Klay => Address::zero(),
            _ => self.counterpart_token(event.token_address()).await?,
        };
        let token_uri = match token_type {
            TokenType::Erc721 => self.token_uri(event).await?,
            _ => String::new(),
        };
        let call = HandleCall {
            request_tx_hash: event.raw().tx_hash,
            from: event.from(),
            to: event.to(),
            token_address,
            value_or_token_id: event.value_or_token_id(),
            request_nonce: event.request_nonce(),
            request_block_number: event.raw().block_number,
            token_uri,
            extra_data: event.extra_data().clone(),
        };
        let tx = match token_type {
            TokenType::Klay => self.bridge.handle_klay_transfer(&self.account, &call).await?,
            TokenType::Erc20 => self.bridge.handle_erc20_transfer(&self.account, &call).await?,
            TokenType::Erc721 => self.bridge.handle_erc721_transfer(&self.account, &call).await?,
        };
        trace!(
            "[bridge-info {:?}] Submitted {} handle for nonce {}: {:?}",
            self.address,
            token_type,
            call.request_nonce,
            tx.hash()
        );

        if let Some(pool) = &self.tx_pool {
            match pool.add_local(tx.clone()).await {
                Ok(()) | Err(BridgeError::KnownTx(_)) => {}
                Err(e) => warn!(
                    "[bridge-info {:?}] Handle tx {:?} not pooled for resend: {}",
                    self.address,
                    tx.hash(),
                    e
                ),
            }
        }
        Ok(Handled::Submitted(tx))
    }

    /// This side's token for a counterpart token, learned from the
    /// counterpart contract the first time it is seen.
    async fn counterpart_token(&self, remote: Address) -> BridgeResult<Address> {
        if let Some(local) = self.local_token_of(remote).await {
            return Ok(local);
        }
        warn!(
            "[bridge-info {:?}] Unregistered counterpart token {:?}",
            self.address, remote
        );
        let local = self.counterpart_bridge.registered_token(remote).await?;
        if local.is_zero() {
            return Err(BridgeError::InvalidTokenPair(Address::zero(), remote));
        }
        match self.register_token(local, remote).await {
            Ok(()) | Err(BridgeError::DuplicatedToken(_)) => {}
            Err(e) => return Err(e),
        }
        info!(
            "[bridge-info {:?}] Registered token pair {:?} <-> {:?}",
            self.address, local, remote
        );
        Ok(local)
    }

    async fn token_uri(&self, event: &RequestValueTransferEvent) -> BridgeResult<String> {
        if let Some(uri) = event.token_uri()? {
            return Ok(uri);
        }
        match self
            .counterpart_bridge
            .token_uri(event.token_address(), event.value_or_token_id())
            .await
        {
            Ok(uri) => Ok(uri),
            Err(BridgeError::OnChainRevert(info)) => {
                debug!(
                    "[bridge-info {:?}] No URI for token {} of {:?}: {}",
                    self.address,
                    event.value_or_token_id(),
                    event.token_address(),
                    info
                );
                Ok(String::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Processes the buffer whenever events arrive and once per second.
    pub fn spawn_handler_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let info = self.clone();
        tokio::spawn(async move {
            info!(
                "[bridge-info {:?}] Starting bridge loop, on child chain: {}",
                info.address, info.on_child_chain
            );
            let mut interval = time::interval(BRIDGE_LOOP_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = info.closed.cancelled() => {
                        info!("[bridge-info {:?}] Stopping bridge loop", info.address);
                        break;
                    }
                    _ = info.new_event.notified() => {}
                    _ = interval.tick() => {}
                }
                if let Err(e) = info.process_pending_request_events().await {
                    if e.is_transient() {
                        debug!("[bridge-info {:?}] Processing postponed: {}", info.address, e);
                    } else {
                        error!("[bridge-info {:?}] Processing failed: {}", info.address, e);
                    }
                }
            }
        })
    }
}
