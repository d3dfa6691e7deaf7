// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::abi::decode_encoded_payload;
use crate::error::BridgeResult;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Asset kind moved by a value transfer, as encoded by the bridge contract.
#[derive(
    Debug,
    Serialize,
    Deserialize,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    TryFromPrimitive,
    IntoPrimitive,
    Display,
)]
#[repr(u8)]
pub enum TokenType {
    #[strum(serialize = "KLAY")]
    Klay = 0,
    #[strum(serialize = "ERC20")]
    Erc20 = 1,
    #[strum(serialize = "ERC721")]
    Erc721 = 2,
}

/// Where a decoded log came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawLogInfo {
    pub tx_hash: H256,
    pub block_number: u64,
    pub bridge_address: Address,
    pub log_index: u64,
}

/// Fields shared by both shapes of request event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTransfer {
    pub token_type: TokenType,
    pub from: Address,
    pub to: Address,
    pub token_address: Address,
    pub value_or_token_id: U256,
    pub request_nonce: u64,
    pub fee: U256,
    pub extra_data: Bytes,
    pub raw: RawLogInfo,
}

/// A value transfer requested on the source bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestValueTransferEvent {
    Plain(RequestTransfer),
    Encoded {
        transfer: RequestTransfer,
        ver: u8,
        encoded_data: Bytes,
    },
}

impl RequestValueTransferEvent {
    pub fn transfer(&self) -> &RequestTransfer {
        match self {
            RequestValueTransferEvent::Plain(transfer) => transfer,
            RequestValueTransferEvent::Encoded { transfer, .. } => transfer,
        }
    }

    pub fn token_type(&self) -> TokenType {
        self.transfer().token_type
    }

    pub fn from(&self) -> Address {
        self.transfer().from
    }

    pub fn to(&self) -> Address {
        self.transfer().to
    }

    pub fn token_address(&self) -> Address {
        self.transfer().token_address
    }

    pub fn value_or_token_id(&self) -> U256 {
        self.transfer().value_or_token_id
    }

    pub fn request_nonce(&self) -> u64 {
        self.transfer().request_nonce
    }

    pub fn fee(&self) -> U256 {
        self.transfer().fee
    }

    pub fn extra_data(&self) -> &Bytes {
        &self.transfer().extra_data
    }

    pub fn raw(&self) -> &RawLogInfo {
        &self.transfer().raw
    }

    /// Token URI carried by an encoded ERC721 request. `Ok(None)` for plain
    /// events, whose URI has to be read from the token contract.
    pub fn token_uri(&self) -> BridgeResult<Option<String>> {
        match self {
            RequestValueTransferEvent::Plain(_) => Ok(None),
            RequestValueTransferEvent::Encoded {
                ver, encoded_data, ..
            } => Ok(decode_encoded_payload(*ver, encoded_data)?.token_uri),
        }
    }
}

/// A handle accepted (quorum reached) on the destination bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleValueTransferEvent {
    pub request_tx_hash: H256,
    pub token_type: TokenType,
    pub from: Address,
    pub to: Address,
    pub token_address: Address,
    pub value_or_token_id: U256,
    pub handle_nonce: u64,
    pub lower_handle_nonce: u64,
    pub extra_data: Bytes,
    pub raw: RawLogInfo,
}

/// Log events the bridge contract emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Request(RequestValueTransferEvent),
    Handle(HandleValueTransferEvent),
}

/// Journaled bridge pair, `local` on the child chain and `remote` on the
/// parent chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeJournalEntry {
    pub local_address: Address,
    pub remote_address: Address,
    pub subscribed: bool,
}

impl BridgeJournalEntry {
    pub fn new(local_address: Address, remote_address: Address) -> Self {
        Self {
            local_address,
            remote_address,
            subscribed: false,
        }
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.local_address == *address || self.remote_address == *address
    }

    pub fn counterpart_of(&self, address: &Address) -> Option<Address> {
        if self.local_address == *address {
            Some(self.remote_address)
        } else if self.remote_address == *address {
            Some(self.local_address)
        } else {
            None
        }
    }
}

impl Encodable for BridgeJournalEntry {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.local_address);
        s.append(&self.remote_address);
        s.append(&self.subscribed);
    }
}

impl Decodable for BridgeJournalEntry {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 3 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            local_address: rlp.val_at(0)?,
            remote_address: rlp.val_at(1)?,
            subscribed: rlp.val_at(2)?,
        })
    }
}

/// Transaction as seen in a block, enough to count and index it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTransaction {
    pub hash: H256,
    pub tx_type: u8,
    pub input: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
    pub transactions_root: H256,
    pub receipts_root: H256,
    pub state_root: H256,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<BlockTransaction>,
}

impl Block {
    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn hash(&self) -> H256 {
        self.header.hash
    }

    pub fn tx_count(&self) -> u64 {
        self.transactions.len() as u64
    }
}
