// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use ethers::types::{Address, H256};

/// Why a contract call or transaction was rejected on chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertInfo {
    /// Contract that reverted, when the node reported it
    pub address: Option<Address>,
    /// Revert message as returned by the node
    pub reason: String,
}

impl RevertInfo {
    pub fn new(address: Option<Address>, reason: impl Into<String>) -> Self {
        Self {
            address,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for RevertInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.address {
            Some(address) => write!(f, "reverted by {:?}: {}", address, self.reason),
            None => write!(f, "reverted: {}", self.reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    // Malformed on-disk or command line configuration
    ConfigError(String),
    // A bridge info is already registered for the address
    DuplicatedBridgeInfo(Address),
    // Token already registered on the bridge
    DuplicatedToken(Address),
    // Address already appears in the address journal
    DuplicatedJournal(Address),
    // Transaction already in the bridge tx pool
    KnownTx(H256),
    // Another transaction with the same sender and nonce is pooled
    DuplicatedNonceTx(Address, u64),
    // Bridge event stream already live
    AlreadySubscribed(Address),
    // Bridge event stream not live
    NotSubscribed(Address),
    // No bridge info registered for the address
    NoBridgeInfo(Address),
    // Transaction hash unknown to the pool
    UnknownTx(H256),
    // No recovery registered for the bridge
    NoRecovery(Address),
    // Address is not a known bridge contract
    UnknownBridgeContractAddr(Address),
    // Token pair does not exist or does not match
    InvalidTokenPair(Address, Address),
    // The two bridges are not registered as counterparts
    InvalidBridgePair(Address, Address),
    // No connected parent bridge peer
    NoPeer,
    // Local shadow nonce diverged from the chain
    NonceDesync { local: u64, remote: u64 },
    // Contract rejected the call
    OnChainRevert(RevertInfo),
    // RPC or stream failure
    Transport(String),
    // RPC call exceeded its deadline
    Timeout(String),
    // Bridge tx pool reached its global capacity
    PoolFull(usize),
    // Zero address given as a bridge address
    EmptyBridgeAddress,
    // Address journal not opened or already closed
    NoActiveAddressJournal,
    // Value transfer recovery disabled by config
    VtrDisabled,
    // Value transfer recovery already running
    VtrAlreadyStarted,
    // Block or header could not be read or decoded
    InvalidBlock(String),
    // Peer protocol violation
    Protocol(String),
    // Failure to decode chain data
    Decode(String),
    // Operator account signing is locked
    AccountLocked(Address),
    // Unrecoverable local failure (keystore, journal)
    Fatal(String),
    // Uncategorized error
    Generic(String),
}

impl BridgeError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            BridgeError::ConfigError(_) => "config_error",
            BridgeError::DuplicatedBridgeInfo(_) => "duplicated_bridge_info",
            BridgeError::DuplicatedToken(_) => "duplicated_token",
            BridgeError::DuplicatedJournal(_) => "duplicated_journal",
            BridgeError::KnownTx(_) => "known_tx",
            BridgeError::DuplicatedNonceTx(_, _) => "duplicated_nonce_tx",
            BridgeError::AlreadySubscribed(_) => "already_subscribed",
            BridgeError::NotSubscribed(_) => "not_subscribed",
            BridgeError::NoBridgeInfo(_) => "no_bridge_info",
            BridgeError::UnknownTx(_) => "unknown_tx",
            BridgeError::NoRecovery(_) => "no_recovery",
            BridgeError::UnknownBridgeContractAddr(_) => "unknown_bridge_contract_addr",
            BridgeError::InvalidTokenPair(_, _) => "invalid_token_pair",
            BridgeError::InvalidBridgePair(_, _) => "invalid_bridge_pair",
            BridgeError::NoPeer => "no_peer",
            BridgeError::NonceDesync { .. } => "nonce_desync",
            BridgeError::OnChainRevert(_) => "on_chain_revert",
            BridgeError::Transport(_) => "transport",
            BridgeError::Timeout(_) => "timeout",
            BridgeError::PoolFull(_) => "pool_full",
            BridgeError::EmptyBridgeAddress => "empty_bridge_address",
            BridgeError::NoActiveAddressJournal => "no_active_address_journal",
            BridgeError::VtrDisabled => "vtr_disabled",
            BridgeError::VtrAlreadyStarted => "vtr_already_started",
            BridgeError::InvalidBlock(_) => "invalid_block",
            BridgeError::Protocol(_) => "protocol",
            BridgeError::Decode(_) => "decode",
            BridgeError::AccountLocked(_) => "account_locked",
            BridgeError::Fatal(_) => "fatal",
            BridgeError::Generic(_) => "generic",
        }
    }

    /// Errors a later head tick or recovery cycle may clear by itself.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::Transport(_)
                | BridgeError::Timeout(_)
                | BridgeError::NoPeer
                | BridgeError::NonceDesync { .. }
                | BridgeError::PoolFull(_)
        )
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            BridgeError::DuplicatedBridgeInfo(_)
                | BridgeError::DuplicatedToken(_)
                | BridgeError::DuplicatedJournal(_)
                | BridgeError::KnownTx(_)
                | BridgeError::DuplicatedNonceTx(_, _)
                | BridgeError::AlreadySubscribed(_)
        )
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::ConfigError(msg) => write!(f, "config error: {}", msg),
            BridgeError::DuplicatedBridgeInfo(addr) => {
                write!(f, "bridge info already exists for {:?}", addr)
            }
            BridgeError::DuplicatedToken(addr) => write!(f, "token {:?} already registered", addr),
            BridgeError::DuplicatedJournal(addr) => {
                write!(f, "address {:?} already journaled", addr)
            }
            BridgeError::KnownTx(hash) => write!(f, "known transaction {:?}", hash),
            BridgeError::DuplicatedNonceTx(sender, nonce) => {
                write!(f, "sender {:?} already pooled nonce {}", sender, nonce)
            }
            BridgeError::AlreadySubscribed(addr) => write!(f, "bridge {:?} already subscribed", addr),
            BridgeError::NotSubscribed(addr) => write!(f, "bridge {:?} not subscribed", addr),
            BridgeError::NoBridgeInfo(addr) => write!(f, "no bridge info for {:?}", addr),
            BridgeError::UnknownTx(hash) => write!(f, "unknown transaction {:?}", hash),
            BridgeError::NoRecovery(addr) => write!(f, "no recovery for bridge {:?}", addr),
            BridgeError::UnknownBridgeContractAddr(addr) => {
                write!(f, "unknown bridge contract address {:?}", addr)
            }
            BridgeError::InvalidTokenPair(local, remote) => {
                write!(f, "invalid token pair {:?} <-> {:?}", local, remote)
            }
            BridgeError::InvalidBridgePair(a, b) => {
                write!(f, "invalid bridge pair {:?} <-> {:?}", a, b)
            }
            BridgeError::NoPeer => write!(f, "no parent bridge peer connected"),
            BridgeError::NonceDesync { local, remote } => {
                write!(f, "nonce desync: local {} remote {}", local, remote)
            }
            BridgeError::OnChainRevert(info) => write!(f, "{}", info),
            BridgeError::Transport(msg) => write!(f, "transport error: {}", msg),
            BridgeError::Timeout(msg) => write!(f, "timeout: {}", msg),
            BridgeError::PoolFull(cap) => write!(f, "bridge tx pool is full ({})", cap),
            BridgeError::EmptyBridgeAddress => write!(f, "empty bridge address"),
            BridgeError::NoActiveAddressJournal => write!(f, "no active address journal"),
            BridgeError::VtrDisabled => write!(f, "value transfer recovery is disabled"),
            BridgeError::VtrAlreadyStarted => {
                write!(f, "value transfer recovery is already started")
            }
            BridgeError::InvalidBlock(msg) => write!(f, "invalid block: {}", msg),
            BridgeError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            BridgeError::Decode(msg) => write!(f, "decode error: {}", msg),
            BridgeError::AccountLocked(addr) => write!(f, "account {:?} is locked", addr),
            BridgeError::Fatal(msg) => write!(f, "fatal: {}", msg),
            BridgeError::Generic(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Fatal(format!("io: {}", err))
    }
}

impl From<ethers::utils::rlp::DecoderError> for BridgeError {
    fn from(err: ethers::utils::rlp::DecoderError) -> Self {
        BridgeError::Decode(err.to_string())
    }
}

impl From<ethers::abi::Error> for BridgeError {
    fn from(err: ethers::abi::Error) -> Self {
        BridgeError::Decode(format!("abi: {}", err))
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
