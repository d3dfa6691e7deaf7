// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Value transfer recovery: finds request events whose handle never landed
//! on the destination bridge and feeds them back into the event pipeline.

use crate::abi::{decode_bridge_log, request_event_topics};
use crate::bridge_info::BridgeInfo;
use crate::chain_backend::LogQuery;
use crate::config::ServiceChainConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::metrics::BridgeMetrics;
use crate::types::{BridgeEvent, RequestValueTransferEvent};
use ethers::types::Address;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use tap::TapFallible;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RUNNING_STATUS_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub filter_logs_stride: u64,
    pub max_pending_txs: usize,
}

impl From<&ServiceChainConfig> for RecoveryConfig {
    fn from(config: &ServiceChainConfig) -> Self {
        Self {
            enabled: config.vt_recovery,
            interval: config.vt_recovery_interval,
            filter_logs_stride: config.filter_logs_stride.max(1),
            max_pending_txs: config.max_pending_txs.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
pub enum Direction {
    #[strum(serialize = "child_to_parent")]
    ChildToParent,
    #[strum(serialize = "parent_to_child")]
    ParentToChild,
}

/// Where one direction stands. `handle_nonce` is the destination's lower
/// handle nonce, everything below it is closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValueTransferHint {
    pub block_number: u64,
    pub request_nonce: u64,
    pub handle_nonce: u64,
    pub prev_handle_nonce: u64,
    pub candidate: bool,
}

impl ValueTransferHint {
    pub fn is_pending(&self) -> bool {
        self.request_nonce > self.handle_nonce
    }
}

#[derive(Default)]
struct RecoveryState {
    child_to_parent: Option<ValueTransferHint>,
    parent_to_child: Option<ValueTransferHint>,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

impl RecoveryState {
    fn hint_mut(&mut self, direction: Direction) -> &mut Option<ValueTransferHint> {
        match direction {
            Direction::ChildToParent => &mut self.child_to_parent,
            Direction::ParentToChild => &mut self.parent_to_child,
        }
    }
}

/// Recovery of one bridge pair, both directions.
pub struct ValueTransferRecovery {
    config: RecoveryConfig,
    child_info: Arc<BridgeInfo>,
    parent_info: Arc<BridgeInfo>,
    metrics: Arc<BridgeMetrics>,
    state: Mutex<RecoveryState>,
    running: AtomicBool,
}

impl ValueTransferRecovery {
    pub fn new(
        config: RecoveryConfig,
        child_info: Arc<BridgeInfo>,
        parent_info: Arc<BridgeInfo>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            config,
            child_info,
            parent_info,
            metrics,
            state: Mutex::new(RecoveryState::default()),
            running: AtomicBool::new(false),
        }
    }

    pub fn child_address(&self) -> Address {
        self.child_info.address()
    }

    pub fn parent_address(&self) -> Address {
        self.parent_info.address()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Source info (where requests are emitted) and destination info (where
    /// they are handled) of `direction`.
    fn infos(&self, direction: Direction) -> (&Arc<BridgeInfo>, &Arc<BridgeInfo>) {
        match direction {
            Direction::ChildToParent => (&self.child_info, &self.parent_info),
            Direction::ParentToChild => (&self.parent_info, &self.child_info),
        }
    }

    /// Starts the recovery ticker.
    pub async fn start(self: &Arc<Self>) -> BridgeResult<()> {
        if !self.config.enabled {
            return Err(BridgeError::VtrDisabled);
        }
        let mut state = self.state.lock().await;
        if state.task.is_some() {
            return Err(BridgeError::VtrAlreadyStarted);
        }
        state.child_to_parent = None;
        state.parent_to_child = None;

        let cancel = CancellationToken::new();
        let recovery = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            info!(
                "[recovery] Started for {:?} <-> {:?}, interval {:?}",
                recovery.child_info.address(),
                recovery.parent_info.address(),
                recovery.config.interval
            );
            recovery.running.store(true, Ordering::SeqCst);
            let mut interval = time::interval(recovery.config.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = recovery.recover_cycle(true).await {
                            warn!("[recovery] Cycle failed: {}", e);
                        }
                    }
                }
            }
            recovery.running.store(false, Ordering::SeqCst);
            info!(
                "[recovery] Stopped for {:?} <-> {:?}",
                recovery.child_info.address(),
                recovery.parent_info.address()
            );
        });
        state.task = Some((cancel, handle));
        Ok(())
    }

    /// Stops the ticker and waits for it to exit.
    pub async fn stop(&self) {
        let task = self.state.lock().await.task.take();
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("[recovery] Ticker task ended abnormally: {}", e);
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Polls until the ticker reports `expected` or `timeout` passes.
    pub async fn wait_running_status(&self, expected: bool, timeout: Duration) -> BridgeResult<()> {
        let deadline = Instant::now() + timeout;
        while self.is_running() != expected {
            if Instant::now() >= deadline {
                return Err(BridgeError::Timeout(format!(
                    "recovery running status {}",
                    expected
                )));
            }
            time::sleep(RUNNING_STATUS_POLL_INTERVAL).await;
        }
        Ok(())
    }

    /// One ungated recovery pass over both directions.
    pub async fn recover(&self) -> BridgeResult<()> {
        self.recover_cycle(false).await
    }

    async fn recover_cycle(&self, gated: bool) -> BridgeResult<()> {
        for direction in [Direction::ChildToParent, Direction::ParentToChild] {
            let (previous, hint) = self.update_recovery_hint(direction).await?;
            if !hint.is_pending() {
                continue;
            }
            if gated && !(hint.candidate && previous.map_or(true, |p| p.candidate)) {
                debug!(
                    "[recovery] {} handle nonce moved to {}, waiting another cycle",
                    direction, hint.handle_nonce
                );
                continue;
            }
            let events = self.retrieve_pending_events(direction, &hint).await?;
            self.recover_pending_events(direction, events).await?;
        }
        Ok(())
    }

    /// Reads the request nonce of the source and the lower handle nonce and
    /// recovery block of the destination. Returns the previous hint as well.
    pub async fn update_recovery_hint(
        &self,
        direction: Direction,
    ) -> BridgeResult<(Option<ValueTransferHint>, ValueTransferHint)> {
        let (src, dst) = self.infos(direction);
        let request_nonce = src
            .bridge()
            .request_nonce()
            .await
            .tap_err(|e| warn!("[recovery] {} request nonce: {}", direction, e))?;
        let handle_nonce = dst
            .bridge()
            .lower_handle_nonce()
            .await
            .tap_err(|e| warn!("[recovery] {} lower handle nonce: {}", direction, e))?;
        let block_number = dst.bridge().last_handled_request_block_number().await?;
        src.update_request_nonce(request_nonce);
        dst.update_request_nonce_from_counterpart(request_nonce);

        let mut state = self.state.lock().await;
        let slot = state.hint_mut(direction);
        let previous = *slot;
        let hint = ValueTransferHint {
            block_number,
            request_nonce,
            handle_nonce,
            prev_handle_nonce: previous.map_or(handle_nonce, |p| p.handle_nonce),
            candidate: request_nonce > handle_nonce
                && previous.map_or(true, |p| p.handle_nonce == handle_nonce),
        };
        *slot = Some(hint);
        debug!("[recovery] {} hint {:?}", direction, hint);
        Ok((previous, hint))
    }

    /// Scans source logs from the hint's block in stride windows and returns
    /// the requests with nonces in `[handle_nonce, handle_nonce + max)`.
    pub async fn retrieve_pending_events(
        &self,
        direction: Direction,
        hint: &ValueTransferHint,
    ) -> BridgeResult<Vec<RequestValueTransferEvent>> {
        let (src, _) = self.infos(direction);
        let backend = src.bridge().backend();
        let head = backend.current_block_number().await?;
        let lower = hint.handle_nonce;
        let upper = lower.saturating_add(self.config.max_pending_txs as u64);
        let wanted = hint.request_nonce.min(upper) - lower.min(hint.request_nonce);
        let stride = self.config.filter_logs_stride.max(1);

        let mut found = BTreeMap::new();
        let mut from = hint.block_number;
        while from <= head && (found.len() as u64) < wanted {
            let to = from.saturating_add(stride - 1).min(head);
            let query = LogQuery::new(vec![src.address()], request_event_topics())
                .with_range(from, Some(to));
            for log in backend.filter_logs(&query).await? {
                match decode_bridge_log(&log) {
                    Ok(Some(BridgeEvent::Request(event))) => {
                        let nonce = event.request_nonce();
                        if nonce >= lower && nonce < upper {
                            found.entry(nonce).or_insert(event);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("[recovery] Undecodable log {:?}: {}", log.transaction_hash, e),
                }
            }
            from = to + 1;
        }
        debug!(
            "[recovery] {} found {} of {} pending events",
            direction,
            found.len(),
            wanted
        );
        Ok(found.into_values().collect())
    }

    /// Hands recovered events to the destination and processes them.
    pub async fn recover_pending_events(
        &self,
        direction: Direction,
        events: Vec<RequestValueTransferEvent>,
    ) -> BridgeResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let (_, dst) = self.infos(direction);
        info!(
            "[recovery] {} recovering {} events, nonces {}..={}",
            direction,
            events.len(),
            events.first().map(|e| e.request_nonce()).unwrap_or_default(),
            events.last().map(|e| e.request_nonce()).unwrap_or_default()
        );
        self.metrics
            .vt_recovered_request_event
            .with_label_values(&[&direction.to_string()])
            .inc_by(events.len() as u64);
        dst.add_recovered_events(events).await;
        dst.process_pending_request_events().await?;
        Ok(())
    }
}
