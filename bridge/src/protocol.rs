// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wire format of the `servicechain` protocol spoken between a child bridge
//! node and a parent bridge node.
//!
//! Every frame is length delimited and carries `code (u64, big endian) ||
//! RLP body`.

use crate::error::BridgeError;
use crate::transaction::{Receipt, Transaction};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use ethers::types::{Address, H256, U256};
use ethers::utils::rlp::{self, Decodable, DecoderError, Encodable, Rlp, RlpStream};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::time::Duration;
use strum_macros::Display;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

pub const PROTOCOL_NAME: &str = "servicechain";
pub const PROTOCOL_VERSION: u64 = 1;
pub const PROTOCOL_MAX_MSG_SIZE: usize = 10 * 1024 * 1024;
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const MSG_CODE_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum MsgCode {
    Status = 0,
    ServiceChainTxs = 1,
    ServiceChainReceiptResponse = 2,
    ServiceChainReceiptRequest = 3,
    ServiceChainParentChainInfoResponse = 4,
    ServiceChainParentChainInfoRequest = 5,
    ServiceChainCall = 6,
    ServiceChainResponse = 7,
    ServiceChainNotify = 8,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Message too long: {0} > {max}", max = PROTOCOL_MAX_MSG_SIZE)]
    MsgTooLarge(usize),
    #[error("Invalid message: {0}")]
    Decode(String),
    #[error("Invalid message code: {0}")]
    InvalidMsgCode(u64),
    #[error("Protocol version mismatch: {remote} (!= {local})")]
    ProtocolVersionMismatch { local: u64, remote: u64 },
    #[error("NetworkId mismatch: {remote} (!= {local})")]
    NetworkIdMismatch { local: u64, remote: u64 },
    #[error("No status message: first msg has code {0}")]
    NoStatusMsg(MsgCode),
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::InvalidData {
            // LengthDelimitedCodec reports oversized frames this way
            return ProtocolError::Decode(err.to_string());
        }
        ProtocolError::Io(err.to_string())
    }
}

impl From<DecoderError> for ProtocolError {
    fn from(err: DecoderError) -> Self {
        ProtocolError::Decode(err.to_string())
    }
}

impl From<ProtocolError> for BridgeError {
    fn from(err: ProtocolError) -> Self {
        BridgeError::Protocol(err.to_string())
    }
}

/// Handshake payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusData {
    pub protocol_version: u64,
    pub network_id: u64,
    pub td: U256,
    pub current_block: H256,
    pub chain_id: u64,
}

impl Encodable for StatusData {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(5);
        s.append(&self.protocol_version);
        s.append(&self.network_id);
        s.append(&self.td);
        s.append(&self.current_block);
        s.append(&self.chain_id);
    }
}

impl Decodable for StatusData {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 5 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            protocol_version: rlp.val_at(0)?,
            network_id: rlp.val_at(1)?,
            td: rlp.val_at(2)?,
            current_block: rlp.val_at(3)?,
            chain_id: rlp.val_at(4)?,
        })
    }
}

/// What the parent node tells a child node about the parent operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentChainInfo {
    pub nonce: u64,
    pub gas_price: U256,
}

impl Encodable for ParentChainInfo {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.nonce);
        s.append(&self.gas_price);
    }
}

impl Decodable for ParentChainInfo {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 2 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            nonce: rlp.val_at(0)?,
            gas_price: rlp.val_at(1)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeMessage {
    Status(StatusData),
    ServiceChainTxs(Vec<Transaction>),
    ReceiptResponse(Vec<Receipt>),
    ReceiptRequest(Vec<H256>),
    ParentChainInfoResponse(ParentChainInfo),
    ParentChainInfoRequest(Address),
    Call(Bytes),
    Response(Bytes),
    Notify(Bytes),
}

impl BridgeMessage {
    pub fn code(&self) -> MsgCode {
        match self {
            BridgeMessage::Status(_) => MsgCode::Status,
            BridgeMessage::ServiceChainTxs(_) => MsgCode::ServiceChainTxs,
            BridgeMessage::ReceiptResponse(_) => MsgCode::ServiceChainReceiptResponse,
            BridgeMessage::ReceiptRequest(_) => MsgCode::ServiceChainReceiptRequest,
            BridgeMessage::ParentChainInfoResponse(_) => {
                MsgCode::ServiceChainParentChainInfoResponse
            }
            BridgeMessage::ParentChainInfoRequest(_) => MsgCode::ServiceChainParentChainInfoRequest,
            BridgeMessage::Call(_) => MsgCode::ServiceChainCall,
            BridgeMessage::Response(_) => MsgCode::ServiceChainResponse,
            BridgeMessage::Notify(_) => MsgCode::ServiceChainNotify,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        match self {
            BridgeMessage::Status(status) => rlp::encode(status).to_vec(),
            BridgeMessage::ServiceChainTxs(txs) => rlp::encode_list::<Transaction, _>(txs).to_vec(),
            BridgeMessage::ReceiptResponse(receipts) => {
                rlp::encode_list::<Receipt, _>(receipts).to_vec()
            }
            BridgeMessage::ReceiptRequest(hashes) => rlp::encode_list::<H256, _>(hashes).to_vec(),
            BridgeMessage::ParentChainInfoResponse(info) => rlp::encode(info).to_vec(),
            BridgeMessage::ParentChainInfoRequest(address) => rlp::encode(address).to_vec(),
            BridgeMessage::Call(payload)
            | BridgeMessage::Response(payload)
            | BridgeMessage::Notify(payload) => rlp::encode(&payload.to_vec()).to_vec(),
        }
    }

    fn decode_body(code: MsgCode, body: &[u8]) -> Result<Self, ProtocolError> {
        let rlp = Rlp::new(body);
        let msg = match code {
            MsgCode::Status => BridgeMessage::Status(rlp.as_val()?),
            MsgCode::ServiceChainTxs => BridgeMessage::ServiceChainTxs(rlp.as_list()?),
            MsgCode::ServiceChainReceiptResponse => BridgeMessage::ReceiptResponse(rlp.as_list()?),
            MsgCode::ServiceChainReceiptRequest => BridgeMessage::ReceiptRequest(rlp.as_list()?),
            MsgCode::ServiceChainParentChainInfoResponse => {
                BridgeMessage::ParentChainInfoResponse(rlp.as_val()?)
            }
            MsgCode::ServiceChainParentChainInfoRequest => {
                BridgeMessage::ParentChainInfoRequest(rlp.as_val()?)
            }
            MsgCode::ServiceChainCall => BridgeMessage::Call(rlp.as_val::<Vec<u8>>()?.into()),
            MsgCode::ServiceChainResponse => {
                BridgeMessage::Response(rlp.as_val::<Vec<u8>>()?.into())
            }
            MsgCode::ServiceChainNotify => BridgeMessage::Notify(rlp.as_val::<Vec<u8>>()?.into()),
        };
        Ok(msg)
    }
}

/// Frames `BridgeMessage`s over any byte stream.
#[derive(Debug)]
pub struct BridgeCodec {
    frames: LengthDelimitedCodec,
}

impl Default for BridgeCodec {
    fn default() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(PROTOCOL_MAX_MSG_SIZE)
                .new_codec(),
        }
    }
}

impl Encoder<BridgeMessage> for BridgeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: BridgeMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = msg.encode_body();
        let size = MSG_CODE_LEN + body.len();
        if size > PROTOCOL_MAX_MSG_SIZE {
            return Err(ProtocolError::MsgTooLarge(size));
        }
        let mut payload = BytesMut::with_capacity(size);
        payload.put_u64(msg.code().into());
        payload.extend_from_slice(&body);
        self.frames.encode(payload.freeze(), dst)?;
        Ok(())
    }
}

impl Decoder for BridgeCodec {
    type Item = BridgeMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(mut frame) = self.frames.decode(src)? else {
            return Ok(None);
        };
        if frame.len() < MSG_CODE_LEN {
            return Err(ProtocolError::Decode(format!(
                "frame of {} bytes has no message code",
                frame.len()
            )));
        }
        let raw_code = frame.get_u64();
        let code =
            MsgCode::try_from(raw_code).map_err(|_| ProtocolError::InvalidMsgCode(raw_code))?;
        BridgeMessage::decode_body(code, &frame).map(Some)
    }
}

/// Checks a peer's status against ours.
pub fn validate_status(
    local_network_id: u64,
    remote: &StatusData,
) -> Result<(), ProtocolError> {
    if remote.network_id != local_network_id {
        return Err(ProtocolError::NetworkIdMismatch {
            local: local_network_id,
            remote: remote.network_id,
        });
    }
    if remote.protocol_version != PROTOCOL_VERSION {
        return Err(ProtocolError::ProtocolVersionMismatch {
            local: PROTOCOL_VERSION,
            remote: remote.protocol_version,
        });
    }
    Ok(())
}
