// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Child chain block anchoring: payload formats, the per-period tx counter
//! and the store of anchoring receipts returned by the parent chain.

use crate::transaction::Receipt;
use crate::types::{Block, BlockHeader};
use ethers::types::{H256, U256};
use ethers::utils::rlp::{self, Decodable, DecoderError, Encodable, Rlp, RlpStream};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

pub const ANCHORING_DATA_TYPE0: u8 = 0;
pub const ANCHORING_TX_GAS_LIMIT: u64 = 100_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AnchoringError {
    #[error("unknown anchoring data type {0}")]
    UnknownDataType(u8),
    #[error("malformed anchoring data: {0}")]
    Malformed(String),
}

impl From<AnchoringError> for crate::error::BridgeError {
    fn from(err: AnchoringError) -> Self {
        crate::error::BridgeError::Decode(err.to_string())
    }
}

/// Type-0 anchoring payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnchoringDataType0 {
    pub block_hash: H256,
    pub tx_hash: H256,
    pub parent_hash: H256,
    pub receipt_hash: H256,
    pub state_root_hash: H256,
    pub block_number: U256,
    pub block_count: U256,
    pub tx_count: U256,
}

impl AnchoringDataType0 {
    pub fn new(header: &BlockHeader, block_count: u64, tx_count: u64) -> Self {
        Self {
            block_hash: header.hash,
            tx_hash: header.transactions_root,
            parent_hash: header.parent_hash,
            receipt_hash: header.receipts_root,
            state_root_hash: header.state_root,
            block_number: U256::from(header.number),
            block_count: U256::from(block_count),
            tx_count: U256::from(tx_count),
        }
    }
}

impl Encodable for AnchoringDataType0 {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(8);
        s.append(&self.block_hash);
        s.append(&self.tx_hash);
        s.append(&self.parent_hash);
        s.append(&self.receipt_hash);
        s.append(&self.state_root_hash);
        s.append(&self.block_number);
        s.append(&self.block_count);
        s.append(&self.tx_count);
    }
}

impl Decodable for AnchoringDataType0 {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 8 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            block_hash: rlp.val_at(0)?,
            tx_hash: rlp.val_at(1)?,
            parent_hash: rlp.val_at(2)?,
            receipt_hash: rlp.val_at(3)?,
            state_root_hash: rlp.val_at(4)?,
            block_number: rlp.val_at(5)?,
            block_count: rlp.val_at(6)?,
            tx_count: rlp.val_at(7)?,
        })
    }
}

/// Anchoring payload written before typed envelopes existed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnchoringDataLegacy {
    pub block_hash: H256,
    pub tx_hash: H256,
    pub parent_hash: H256,
    pub receipt_hash: H256,
    pub state_root_hash: H256,
    pub block_number: U256,
}

impl Encodable for AnchoringDataLegacy {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(6);
        s.append(&self.block_hash);
        s.append(&self.tx_hash);
        s.append(&self.parent_hash);
        s.append(&self.receipt_hash);
        s.append(&self.state_root_hash);
        s.append(&self.block_number);
    }
}

impl Decodable for AnchoringDataLegacy {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 6 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            block_hash: rlp.val_at(0)?,
            tx_hash: rlp.val_at(1)?,
            parent_hash: rlp.val_at(2)?,
            receipt_hash: rlp.val_at(3)?,
            state_root_hash: rlp.val_at(4)?,
            block_number: rlp.val_at(5)?,
        })
    }
}

/// Any anchoring payload found on the parent chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchoringData {
    Type0(AnchoringDataType0),
    Legacy(AnchoringDataLegacy),
}

impl AnchoringData {
    pub fn block_hash(&self) -> H256 {
        match self {
            AnchoringData::Type0(data) => data.block_hash,
            AnchoringData::Legacy(data) => data.block_hash,
        }
    }

    pub fn block_number(&self) -> u64 {
        match self {
            AnchoringData::Type0(data) => data.block_number.low_u64(),
            AnchoringData::Legacy(data) => data.block_number.low_u64(),
        }
    }

    /// Always emits the `{type, data}` envelope.
    pub fn encode_type0(data: &AnchoringDataType0) -> Vec<u8> {
        let mut s = RlpStream::new_list(2);
        s.append(&ANCHORING_DATA_TYPE0);
        s.append(&rlp::encode(data).to_vec());
        s.out().to_vec()
    }

    /// Accepts the `{type, data}` envelope, falling back to the legacy layout.
    pub fn decode(raw: &[u8]) -> Result<Self, AnchoringError> {
        let outer = Rlp::new(raw);
        if outer.is_list() && matches!(outer.item_count(), Ok(2)) {
            let data_type: u8 = outer
                .val_at(0)
                .map_err(|e| AnchoringError::Malformed(e.to_string()))?;
            let data: Vec<u8> = outer
                .val_at(1)
                .map_err(|e| AnchoringError::Malformed(e.to_string()))?;
            return match data_type {
                ANCHORING_DATA_TYPE0 => rlp::decode::<AnchoringDataType0>(&data)
                    .map(AnchoringData::Type0)
                    .map_err(|e| AnchoringError::Malformed(e.to_string())),
                other => Err(AnchoringError::UnknownDataType(other)),
            };
        }
        rlp::decode::<AnchoringDataLegacy>(raw)
            .map(AnchoringData::Legacy)
            .map_err(|e| AnchoringError::Malformed(e.to_string()))
    }
}

/// Counts child chain transactions and decides when a block is anchored.
///
/// Counting starts at the first block `n >= head` with `(n - 1) % period == 0`
/// and a block is anchored when `number % period == 0`, so every anchor after
/// the first covers exactly `period` blocks.
#[derive(Debug, Clone)]
pub struct AnchoringPipeline {
    period: u64,
    tx_count_enabled_block_number: u64,
    latest_tx_count_added_block_number: u64,
    tx_count: u64,
}

impl AnchoringPipeline {
    pub fn new(period: u64) -> Self {
        Self {
            period: period.max(1),
            tx_count_enabled_block_number: 0,
            latest_tx_count_added_block_number: 0,
            tx_count: 0,
        }
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    pub fn tx_count(&self) -> u64 {
        self.tx_count
    }

    pub fn tx_count_enabled_block_number(&self) -> u64 {
        self.tx_count_enabled_block_number
    }

    pub fn latest_tx_count_added_block_number(&self) -> u64 {
        self.latest_tx_count_added_block_number
    }

    pub fn first_counting_block(current: u64, period: u64) -> u64 {
        let period = period.max(1);
        if current <= 1 {
            return 1;
        }
        let offset = (current - 1) % period;
        if offset == 0 {
            current
        } else {
            current + period - offset
        }
    }

    /// Forgets the counting epoch; the next head starts a new one.
    pub fn reset(&mut self) {
        self.tx_count_enabled_block_number = 0;
        self.latest_tx_count_added_block_number = 0;
        self.tx_count = 0;
    }

    /// Blocks whose tx counts are still missing when `head` arrives. Starts
    /// the epoch on the first call after a reset.
    pub fn blocks_to_count(&mut self, head: u64) -> Option<RangeInclusive<u64>> {
        if self.tx_count_enabled_block_number == 0 {
            self.tx_count_enabled_block_number = Self::first_counting_block(head, self.period);
            self.latest_tx_count_added_block_number = 0;
            self.tx_count = 0;
        }
        if head < self.tx_count_enabled_block_number {
            return None;
        }
        let start = (self.latest_tx_count_added_block_number + 1)
            .max(self.tx_count_enabled_block_number);
        if start > head {
            return None;
        }
        Some(start..=head)
    }

    pub fn add_block_tx_count(&mut self, number: u64, tx_count: u64) {
        if number < self.tx_count_enabled_block_number
            || number <= self.latest_tx_count_added_block_number
        {
            return;
        }
        self.tx_count += tx_count;
        self.latest_tx_count_added_block_number = number;
    }

    /// Payload to anchor for `block` when it closes a period.
    pub fn anchoring_data(&self, block: &Block) -> Option<AnchoringDataType0> {
        let number = block.number();
        if self.tx_count_enabled_block_number == 0
            || number < self.tx_count_enabled_block_number
            || number % self.period != 0
            || self.latest_tx_count_added_block_number != number
        {
            return None;
        }
        let block_count = number - self.tx_count_enabled_block_number + 1;
        Some(AnchoringDataType0::new(
            &block.header,
            block_count,
            self.tx_count,
        ))
    }

    /// Closes the period ending at `number` once its anchor is queued.
    pub fn commit(&mut self, number: u64) {
        self.tx_count = 0;
        self.tx_count_enabled_block_number = number + 1;
    }
}

/// Child side record of what the parent chain confirmed.
#[derive(Debug, Default)]
pub struct AnchorStore {
    latest_anchored_block_number: AtomicU64,
    receipts: RwLock<HashMap<H256, Receipt>>,
}

impl AnchorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest_anchored_block_number(&self) -> u64 {
        self.latest_anchored_block_number.load(Ordering::SeqCst)
    }

    /// Advances the anchored block number, ignoring stale values. Returns
    /// whether it moved.
    pub fn write_anchored_block_number(&self, number: u64) -> bool {
        self.latest_anchored_block_number.fetch_max(number, Ordering::SeqCst) < number
    }

    pub async fn write_receipt_from_parent_chain(&self, block_hash: H256, receipt: Receipt) {
        self.receipts.write().await.insert(block_hash, receipt);
    }

    pub async fn receipt_from_parent_chain(&self, block_hash: &H256) -> Option<Receipt> {
        self.receipts.read().await.get(block_hash).cloned()
    }
}
