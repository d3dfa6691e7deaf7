// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Why a handle transaction failed, and what the event pipeline does about it.

use crate::error::{BridgeError, RevertInfo};
use crate::transaction::Receipt;
use ethers::types::Address;
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RevertKind {
    /// The request was closed by earlier votes.
    AlreadyHandled,
    /// The vote was stored but the threshold is not reached yet.
    QuorumNotMet,
    /// The bridge or the operator cannot pay for the transfer.
    InsufficientFunds,
    /// A contract other than the bridge reverted, e.g. a receiving contract.
    UserContractReverted,
    /// Mined with a failure status but without a message.
    Unexecuted,
    OutOfGas,
    Other,
}

impl RevertKind {
    /// Reverts the pipeline logs and swallows instead of surfacing.
    pub fn is_absorbed(&self) -> bool {
        matches!(
            self,
            RevertKind::AlreadyHandled | RevertKind::QuorumNotMet | RevertKind::InsufficientFunds
        )
    }

    /// Reverts after which the request counts as delivered by this operator.
    pub fn advances_nonce(&self) -> bool {
        matches!(self, RevertKind::AlreadyHandled | RevertKind::QuorumNotMet)
    }
}

/// Classifies a revert raised against `bridge`.
pub fn classify_revert(info: &RevertInfo, bridge: Address) -> RevertKind {
    let reason = info.reason.to_lowercase();
    if reason.contains("vote closed")
        || reason.contains("already handled")
        || reason.contains("removed vote")
    {
        return RevertKind::AlreadyHandled;
    }
    if reason.contains("quorum") || reason.contains("not enough vote") {
        return RevertKind::QuorumNotMet;
    }
    if reason.contains("out of gas") {
        return RevertKind::OutOfGas;
    }
    if let Some(address) = info.address {
        if address != bridge {
            return RevertKind::UserContractReverted;
        }
    }
    if reason.contains("insufficient") || reason.contains("not enough balance") {
        return RevertKind::InsufficientFunds;
    }
    RevertKind::Other
}

/// Revert kind of a failed error, `None` for errors that are not reverts.
pub fn classify_error(err: &BridgeError, bridge: Address) -> Option<RevertKind> {
    match err {
        BridgeError::OnChainRevert(info) => Some(classify_revert(info, bridge)),
        _ => None,
    }
}

/// Outcome of a mined handle transaction. `None` when it succeeded.
pub fn classify_receipt(receipt: &Receipt, bridge: Address) -> Option<RevertKind> {
    if receipt.is_successful() {
        return None;
    }
    Some(match &receipt.revert_reason {
        Some(reason) => classify_revert(&RevertInfo::new(Some(bridge), reason.clone()), bridge),
        None => RevertKind::Unexecuted,
    })
}
