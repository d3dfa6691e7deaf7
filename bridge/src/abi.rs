// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! ABI of the bridge contract: call encoding, view decoding and log decoding.

use crate::error::{BridgeError, BridgeResult};
use crate::types::{
    BridgeEvent, HandleValueTransferEvent, RawLogInfo, RequestTransfer,
    RequestValueTransferEvent, TokenType,
};
use ethers::abi::{decode, encode, ParamType, Token};
use ethers::types::{Address, Bytes, Log, H256, U256};
use ethers::utils::{id, keccak256};
use once_cell::sync::Lazy;

/// `ver` of an encoded request whose payload is an ERC721 token URI.
pub const ENCODING_VER_ERC721_URI: u8 = 2;

pub const VOTE_TYPE_VALUE_TRANSFER: u8 = 0;
pub const VOTE_TYPE_CONFIGURATION: u8 = 1;

const REQUEST_VALUE_TRANSFER_SIG: &str =
    "RequestValueTransfer(uint8,address,address,address,uint256,uint64,uint256,bytes)";
const REQUEST_VALUE_TRANSFER_ENCODED_SIG: &str =
    "RequestValueTransferEncoded(uint8,address,address,address,uint256,uint64,uint256,bytes,uint8,bytes)";
const HANDLE_VALUE_TRANSFER_SIG: &str =
    "HandleValueTransfer(bytes32,uint8,address,address,address,uint256,uint64,uint64,bytes)";

pub static REQUEST_VALUE_TRANSFER_TOPIC: Lazy<H256> =
    Lazy::new(|| H256::from(keccak256(REQUEST_VALUE_TRANSFER_SIG)));
pub static REQUEST_VALUE_TRANSFER_ENCODED_TOPIC: Lazy<H256> =
    Lazy::new(|| H256::from(keccak256(REQUEST_VALUE_TRANSFER_ENCODED_SIG)));
pub static HANDLE_VALUE_TRANSFER_TOPIC: Lazy<H256> =
    Lazy::new(|| H256::from(keccak256(HANDLE_VALUE_TRANSFER_SIG)));

/// Topic0 of every log the bridge listens to.
pub fn bridge_event_topics() -> Vec<H256> {
    vec![
        *REQUEST_VALUE_TRANSFER_TOPIC,
        *REQUEST_VALUE_TRANSFER_ENCODED_TOPIC,
        *HANDLE_VALUE_TRANSFER_TOPIC,
    ]
}

pub fn request_event_topics() -> Vec<H256> {
    vec![
        *REQUEST_VALUE_TRANSFER_TOPIC,
        *REQUEST_VALUE_TRANSFER_ENCODED_TOPIC,
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum BridgeMethod {
    RequestKlayTransfer,
    HandleKlayTransfer,
    HandleErc20Transfer,
    HandleErc721Transfer,
    RegisterToken,
    DeregisterToken,
    RegisterOperator,
    DeregisterOperator,
    SetOperatorThreshold,
    SetKlayFee,
    SetErc20Fee,
    SetFeeReceiver,
    Start,
    RequestNonce,
    HandleNonce,
    LowerHandleNonce,
    UpperHandleNonce,
    RecoveryBlockNumber,
    HandledRequestTx,
    IsRunning,
    RegisteredTokens,
    GetOperatorList,
    OperatorThresholds,
    FeeOfKlay,
    FeeOfErc20,
    FeeReceiver,
    ConfigurationNonce,
    TokenUri,
}

impl BridgeMethod {
    pub const ALL: [BridgeMethod; 28] = [
        BridgeMethod::RequestKlayTransfer,
        BridgeMethod::HandleKlayTransfer,
        BridgeMethod::HandleErc20Transfer,
        BridgeMethod::HandleErc721Transfer,
        BridgeMethod::RegisterToken,
        BridgeMethod::DeregisterToken,
        BridgeMethod::RegisterOperator,
        BridgeMethod::DeregisterOperator,
        BridgeMethod::SetOperatorThreshold,
        BridgeMethod::SetKlayFee,
        BridgeMethod::SetErc20Fee,
        BridgeMethod::SetFeeReceiver,
        BridgeMethod::Start,
        BridgeMethod::RequestNonce,
        BridgeMethod::HandleNonce,
        BridgeMethod::LowerHandleNonce,
        BridgeMethod::UpperHandleNonce,
        BridgeMethod::RecoveryBlockNumber,
        BridgeMethod::HandledRequestTx,
        BridgeMethod::IsRunning,
        BridgeMethod::RegisteredTokens,
        BridgeMethod::GetOperatorList,
        BridgeMethod::OperatorThresholds,
        BridgeMethod::FeeOfKlay,
        BridgeMethod::FeeOfErc20,
        BridgeMethod::FeeReceiver,
        BridgeMethod::ConfigurationNonce,
        BridgeMethod::TokenUri,
    ];

    pub fn signature(&self) -> &'static str {
        match self {
            BridgeMethod::RequestKlayTransfer => "requestKLAYTransfer(address,uint256,bytes)",
            BridgeMethod::HandleKlayTransfer => {
                "handleKLAYTransfer(bytes32,address,address,uint256,uint64,uint64,bytes)"
            }
            BridgeMethod::HandleErc20Transfer => {
                "handleERC20Transfer(bytes32,address,address,address,uint256,uint64,uint64,bytes)"
            }
            BridgeMethod::HandleErc721Transfer => {
                "handleERC721Transfer(bytes32,address,address,address,uint256,uint64,uint64,string,bytes)"
            }
            BridgeMethod::RegisterToken => "registerToken(address,address)",
            BridgeMethod::DeregisterToken => "deregisterToken(address)",
            BridgeMethod::RegisterOperator => "registerOperator(address)",
            BridgeMethod::DeregisterOperator => "deregisterOperator(address)",
            BridgeMethod::SetOperatorThreshold => "setOperatorThreshold(uint8,uint8)",
            BridgeMethod::SetKlayFee => "setKLAYFee(uint256,uint64)",
            BridgeMethod::SetErc20Fee => "setERC20Fee(address,uint256,uint64)",
            BridgeMethod::SetFeeReceiver => "setFeeReceiver(address)",
            BridgeMethod::Start => "start(bool)",
            BridgeMethod::RequestNonce => "requestNonce()",
            BridgeMethod::HandleNonce => "handleNonce()",
            BridgeMethod::LowerHandleNonce => "lowerHandleNonce()",
            BridgeMethod::UpperHandleNonce => "upperHandleNonce()",
            BridgeMethod::RecoveryBlockNumber => "recoveryBlockNumber()",
            BridgeMethod::HandledRequestTx => "handledRequestTx(bytes32)",
            BridgeMethod::IsRunning => "isRunning()",
            BridgeMethod::RegisteredTokens => "registeredTokens(address)",
            BridgeMethod::GetOperatorList => "getOperatorList()",
            BridgeMethod::OperatorThresholds => "operatorThresholds(uint8)",
            BridgeMethod::FeeOfKlay => "feeOfKLAY()",
            BridgeMethod::FeeOfErc20 => "feeOfERC20(address)",
            BridgeMethod::FeeReceiver => "feeReceiver()",
            BridgeMethod::ConfigurationNonce => "configurationNonce()",
            BridgeMethod::TokenUri => "tokenURI(uint256)",
        }
    }

    pub fn inputs(&self) -> Vec<ParamType> {
        use ParamType::*;
        match self {
            BridgeMethod::RequestKlayTransfer => vec![Address, Uint(256), Bytes],
            BridgeMethod::HandleKlayTransfer => vec![
                FixedBytes(32),
                Address,
                Address,
                Uint(256),
                Uint(64),
                Uint(64),
                Bytes,
            ],
            BridgeMethod::HandleErc20Transfer => vec![
                FixedBytes(32),
                Address,
                Address,
                Address,
                Uint(256),
                Uint(64),
                Uint(64),
                Bytes,
            ],
            BridgeMethod::HandleErc721Transfer => vec![
                FixedBytes(32),
                Address,
                Address,
                Address,
                Uint(256),
                Uint(64),
                Uint(64),
                String,
                Bytes,
            ],
            BridgeMethod::RegisterToken => vec![Address, Address],
            BridgeMethod::DeregisterToken
            | BridgeMethod::RegisterOperator
            | BridgeMethod::DeregisterOperator
            | BridgeMethod::SetFeeReceiver
            | BridgeMethod::RegisteredTokens
            | BridgeMethod::FeeOfErc20 => vec![Address],
            BridgeMethod::SetOperatorThreshold => vec![Uint(8), Uint(8)],
            BridgeMethod::SetKlayFee => vec![Uint(256), Uint(64)],
            BridgeMethod::SetErc20Fee => vec![Address, Uint(256), Uint(64)],
            BridgeMethod::Start => vec![Bool],
            BridgeMethod::HandledRequestTx => vec![FixedBytes(32)],
            BridgeMethod::OperatorThresholds => vec![Uint(8)],
            BridgeMethod::TokenUri => vec![Uint(256)],
            BridgeMethod::RequestNonce
            | BridgeMethod::HandleNonce
            | BridgeMethod::LowerHandleNonce
            | BridgeMethod::UpperHandleNonce
            | BridgeMethod::RecoveryBlockNumber
            | BridgeMethod::IsRunning
            | BridgeMethod::GetOperatorList
            | BridgeMethod::FeeOfKlay
            | BridgeMethod::FeeReceiver
            | BridgeMethod::ConfigurationNonce => vec![],
        }
    }

    pub fn selector(&self) -> [u8; 4] {
        id(self.signature())
    }

    pub fn from_selector(data: &[u8]) -> Option<BridgeMethod> {
        let selector = data.get(..4)?;
        BridgeMethod::ALL
            .iter()
            .copied()
            .find(|method| method.selector() == selector)
    }

    pub fn encode_call(&self, tokens: &[Token]) -> Bytes {
        let mut data = self.selector().to_vec();
        data.extend(encode(tokens));
        data.into()
    }

    pub fn decode_input(&self, data: &[u8]) -> BridgeResult<Vec<Token>> {
        if data.len() < 4 || data[..4] != self.selector() {
            return Err(BridgeError::Decode(format!("not a {} call", self)));
        }
        Ok(decode(&self.inputs(), &data[4..])?)
    }
}

pub fn decode_single(kind: ParamType, data: &[u8]) -> BridgeResult<Token> {
    decode(&[kind.clone()], data)?
        .pop()
        .ok_or_else(|| BridgeError::Decode(format!("empty {:?} output", kind)))
}

/// Narrows an ABI uint, rejecting values that do not fit.
pub fn checked_u8(raw: U256) -> BridgeResult<u8> {
    if raw > U256::from(u8::MAX) {
        return Err(BridgeError::Decode(format!("{} overflows uint8", raw)));
    }
    Ok(raw.low_u32() as u8)
}

pub fn checked_u64(raw: U256) -> BridgeResult<u64> {
    if raw > U256::from(u64::MAX) {
        return Err(BridgeError::Decode(format!("{} overflows uint64", raw)));
    }
    Ok(raw.low_u64())
}

pub fn decode_u8(data: &[u8]) -> BridgeResult<u8> {
    decode_u256(data).and_then(checked_u8)
}

pub fn decode_u64(data: &[u8]) -> BridgeResult<u64> {
    decode_u256(data).and_then(checked_u64)
}

pub fn decode_u256(data: &[u8]) -> BridgeResult<U256> {
    match decode_single(ParamType::Uint(256), data)? {
        Token::Uint(v) => Ok(v),
        other => Err(BridgeError::Decode(format!("expected uint, got {:?}", other))),
    }
}

pub fn decode_bool(data: &[u8]) -> BridgeResult<bool> {
    match decode_single(ParamType::Bool, data)? {
        Token::Bool(v) => Ok(v),
        other => Err(BridgeError::Decode(format!("expected bool, got {:?}", other))),
    }
}

pub fn decode_address(data: &[u8]) -> BridgeResult<Address> {
    match decode_single(ParamType::Address, data)? {
        Token::Address(v) => Ok(v),
        other => Err(BridgeError::Decode(format!(
            "expected address, got {:?}",
            other
        ))),
    }
}

pub fn decode_address_list(data: &[u8]) -> BridgeResult<Vec<Address>> {
    match decode_single(ParamType::Array(Box::new(ParamType::Address)), data)? {
        Token::Array(items) => items
            .into_iter()
            .map(|t| {
                t.into_address()
                    .ok_or_else(|| BridgeError::Decode("expected address item".to_string()))
            })
            .collect(),
        other => Err(BridgeError::Decode(format!(
            "expected address[], got {:?}",
            other
        ))),
    }
}

pub fn decode_string(data: &[u8]) -> BridgeResult<String> {
    match decode_single(ParamType::String, data)? {
        Token::String(v) => Ok(v),
        other => Err(BridgeError::Decode(format!(
            "expected string, got {:?}",
            other
        ))),
    }
}

/// Solidity `Error(string)` revert payload.
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    let selector = id("Error(string)");
    if data.len() < 4 || data[..4] != selector {
        return None;
    }
    decode_string(&data[4..]).ok()
}

pub fn encode_revert_reason(reason: &str) -> Bytes {
    let mut data = id("Error(string)").to_vec();
    data.extend(encode(&[Token::String(reason.to_string())]));
    data.into()
}

/// Decoded payload of a `RequestValueTransferEncoded` event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedPayload {
    pub token_uri: Option<String>,
}

/// Decoder table for `encodedData`, keyed by `encodingVer`.
pub fn decode_encoded_payload(ver: u8, data: &[u8]) -> BridgeResult<EncodedPayload> {
    match ver {
        ENCODING_VER_ERC721_URI => Ok(EncodedPayload {
            token_uri: Some(decode_string(data)?),
        }),
        other => Err(BridgeError::Decode(format!(
            "unsupported encoded payload version {}",
            other
        ))),
    }
}

pub fn encode_erc721_uri_payload(uri: &str) -> Bytes {
    encode(&[Token::String(uri.to_string())]).into()
}

fn raw_log_info(log: &Log) -> RawLogInfo {
    RawLogInfo {
        tx_hash: log.transaction_hash.unwrap_or_default(),
        block_number: log.block_number.map(|n| n.as_u64()).unwrap_or_default(),
        bridge_address: log.address,
        log_index: log.log_index.map(|n| n.low_u64()).unwrap_or_default(),
    }
}

fn indexed_address(log: &Log, position: usize) -> BridgeResult<Address> {
    log.topics
        .get(position)
        .map(|topic| Address::from_slice(&topic.as_bytes()[12..]))
        .ok_or_else(|| BridgeError::Decode(format!("log misses topic {}", position)))
}

fn token_type_of(token: &Token) -> BridgeResult<TokenType> {
    let raw = token
        .clone()
        .into_uint()
        .ok_or_else(|| BridgeError::Decode("token type is not uint".to_string()))?;
    TokenType::try_from(checked_u8(raw)?)
        .map_err(|_| BridgeError::Decode(format!("unknown token type {}", raw)))
}

fn take_uint(tokens: &[Token], i: usize) -> BridgeResult<U256> {
    tokens
        .get(i)
        .cloned()
        .and_then(Token::into_uint)
        .ok_or_else(|| BridgeError::Decode(format!("log field {} is not uint", i)))
}

fn take_bytes(tokens: &[Token], i: usize) -> BridgeResult<Bytes> {
    tokens
        .get(i)
        .cloned()
        .and_then(Token::into_bytes)
        .map(Bytes::from)
        .ok_or_else(|| BridgeError::Decode(format!("log field {} is not bytes", i)))
}

/// Decodes a bridge contract log. `Ok(None)` for logs of other events.
pub fn decode_bridge_log(log: &Log) -> BridgeResult<Option<BridgeEvent>> {
    let Some(topic0) = log.topics.first() else {
        return Ok(None);
    };
    if *topic0 == *REQUEST_VALUE_TRANSFER_TOPIC || *topic0 == *REQUEST_VALUE_TRANSFER_ENCODED_TOPIC
    {
        let encoded = *topic0 == *REQUEST_VALUE_TRANSFER_ENCODED_TOPIC;
        let mut params = vec![
            ParamType::Uint(8),
            ParamType::Uint(256),
            ParamType::Uint(64),
            ParamType::Uint(256),
            ParamType::Bytes,
        ];
        if encoded {
            params.extend([ParamType::Uint(8), ParamType::Bytes]);
        }
        let tokens = decode(&params, &log.data)?;
        let transfer = RequestTransfer {
            token_type: token_type_of(&tokens[0])?,
            from: indexed_address(log, 1)?,
            to: indexed_address(log, 2)?,
            token_address: indexed_address(log, 3)?,
            value_or_token_id: take_uint(&tokens, 1)?,
            request_nonce: checked_u64(take_uint(&tokens, 2)?)?,
            fee: take_uint(&tokens, 3)?,
            extra_data: take_bytes(&tokens, 4)?,
            raw: raw_log_info(log),
        };
        let event = if encoded {
            RequestValueTransferEvent::Encoded {
                transfer,
                ver: checked_u8(take_uint(&tokens, 5)?)?,
                encoded_data: take_bytes(&tokens, 6)?,
            }
        } else {
            RequestValueTransferEvent::Plain(transfer)
        };
        return Ok(Some(BridgeEvent::Request(event)));
    }
    if *topic0 == *HANDLE_VALUE_TRANSFER_TOPIC {
        let params = [
            ParamType::FixedBytes(32),
            ParamType::Uint(8),
            ParamType::Uint(256),
            ParamType::Uint(64),
            ParamType::Uint(64),
            ParamType::Bytes,
        ];
        let tokens = decode(&params, &log.data)?;
        let request_tx_hash = tokens[0]
            .clone()
            .into_fixed_bytes()
            .map(|b| H256::from_slice(&b))
            .ok_or_else(|| BridgeError::Decode("request tx hash".to_string()))?;
        return Ok(Some(BridgeEvent::Handle(HandleValueTransferEvent {
            request_tx_hash,
            token_type: token_type_of(&tokens[1])?,
            from: indexed_address(log, 1)?,
            to: indexed_address(log, 2)?,
            token_address: indexed_address(log, 3)?,
            value_or_token_id: take_uint(&tokens, 2)?,
            handle_nonce: checked_u64(take_uint(&tokens, 3)?)?,
            lower_handle_nonce: checked_u64(take_uint(&tokens, 4)?)?,
            extra_data: take_bytes(&tokens, 5)?,
            raw: raw_log_info(log),
        })));
    }
    Ok(None)
}

fn address_topic(address: Address) -> H256 {
    H256::from(address)
}

/// Builds the `RequestValueTransfer(Encoded)` log a bridge contract emits.
pub fn encode_request_log(bridge: Address, event: &RequestValueTransferEvent) -> Log {
    let transfer = event.transfer();
    let mut data = vec![
        Token::Uint(U256::from(u8::from(transfer.token_type))),
        Token::Uint(transfer.value_or_token_id),
        Token::Uint(U256::from(transfer.request_nonce)),
        Token::Uint(transfer.fee),
        Token::Bytes(transfer.extra_data.to_vec()),
    ];
    let topic0 = match event {
        RequestValueTransferEvent::Plain(_) => *REQUEST_VALUE_TRANSFER_TOPIC,
        RequestValueTransferEvent::Encoded {
            ver, encoded_data, ..
        } => {
            data.push(Token::Uint(U256::from(*ver)));
            data.push(Token::Bytes(encoded_data.to_vec()));
            *REQUEST_VALUE_TRANSFER_ENCODED_TOPIC
        }
    };
    Log {
        address: bridge,
        topics: vec![
            topic0,
            address_topic(transfer.from),
            address_topic(transfer.to),
            address_topic(transfer.token_address),
        ],
        data: encode(&data).into(),
        ..Default::default()
    }
}

/// Builds the `HandleValueTransfer` log a bridge contract emits.
pub fn encode_handle_log(bridge: Address, event: &HandleValueTransferEvent) -> Log {
    let data = encode(&[
        Token::FixedBytes(event.request_tx_hash.as_bytes().to_vec()),
        Token::Uint(U256::from(u8::from(event.token_type))),
        Token::Uint(event.value_or_token_id),
        Token::Uint(U256::from(event.handle_nonce)),
        Token::Uint(U256::from(event.lower_handle_nonce)),
        Token::Bytes(event.extra_data.to_vec()),
    ]);
    Log {
        address: bridge,
        topics: vec![
            *HANDLE_VALUE_TRANSFER_TOPIC,
            address_topic(event.from),
            address_topic(event.to),
            address_topic(event.token_address),
        ],
        data: data.into(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U64;

    #[test]
    fn test_selectors_are_unique_and_resolvable() {
        let mut seen = std::collections::HashSet::new();
        for method in BridgeMethod::ALL {
            assert!(seen.insert(method.selector()), "{} collides", method);
            let call = method.encode_call(&[]);
            assert_eq!(BridgeMethod::from_selector(&call), Some(method));
        }
        assert_eq!(BridgeMethod::from_selector(&[0u8, 1]), None);
    }

    #[test]
    fn test_handle_call_input_decodes() {
        let tokens = vec![
            Token::FixedBytes(H256::repeat_byte(9).as_bytes().to_vec()),
            Token::Address(Address::repeat_byte(1)),
            Token::Address(Address::repeat_byte(2)),
            Token::Uint(U256::from(321)),
            Token::Uint(U256::from(0)),
            Token::Uint(U256::from(100_000)),
            Token::Bytes(vec![]),
        ];
        let call = BridgeMethod::HandleKlayTransfer.encode_call(&tokens);
        assert_eq!(
            BridgeMethod::HandleKlayTransfer.decode_input(&call).unwrap(),
            tokens
        );
        assert!(BridgeMethod::HandleErc20Transfer.decode_input(&call).is_err());
    }

    #[test]
    fn test_request_log_decoding() {
        let bridge = Address::repeat_byte(0xcc);
        let event = RequestValueTransferEvent::Plain(RequestTransfer {
            token_type: TokenType::Klay,
            from: Address::repeat_byte(1),
            to: Address::repeat_byte(2),
            token_address: Address::zero(),
            value_or_token_id: U256::from(321),
            request_nonce: 4,
            fee: U256::from(1),
            extra_data: Bytes::from(vec![7u8]),
            raw: RawLogInfo::default(),
        });
        let mut log = encode_request_log(bridge, &event);
        log.transaction_hash = Some(H256::repeat_byte(5));
        log.block_number = Some(U64::from(12));

        let Some(BridgeEvent::Request(decoded)) = decode_bridge_log(&log).unwrap() else {
            panic!("expected request event");
        };
        assert_eq!(decoded.request_nonce(), 4);
        assert_eq!(decoded.to(), Address::repeat_byte(2));
        assert_eq!(decoded.raw().tx_hash, H256::repeat_byte(5));
        assert_eq!(decoded.raw().block_number, 12);
        assert_eq!(decoded.raw().bridge_address, bridge);
    }

    #[test]
    fn test_request_log_with_oversized_token_type_is_rejected() {
        let event = RequestValueTransferEvent::Plain(RequestTransfer {
            token_type: TokenType::Klay,
            from: Address::repeat_byte(1),
            to: Address::repeat_byte(2),
            token_address: Address::zero(),
            value_or_token_id: U256::from(1),
            request_nonce: 0,
            fee: U256::zero(),
            extra_data: Bytes::default(),
            raw: RawLogInfo::default(),
        });
        let params = [
            ParamType::Uint(8),
            ParamType::Uint(256),
            ParamType::Uint(64),
            ParamType::Uint(256),
            ParamType::Bytes,
        ];
        for token_type in [256u64, 258] {
            let mut log = encode_request_log(Address::repeat_byte(0xcc), &event);
            let mut tokens = decode(&params, &log.data).unwrap();
            tokens[0] = Token::Uint(U256::from(token_type));
            log.data = encode(&tokens).into();
            assert!(matches!(decode_bridge_log(&log), Err(BridgeError::Decode(_))));
        }
    }

    #[test]
    fn test_narrowing_rejects_overflow() {
        assert_eq!(checked_u8(U256::from(255)).unwrap(), 255);
        assert!(checked_u8(U256::from(256)).is_err());
        assert_eq!(checked_u64(U256::from(u64::MAX)).unwrap(), u64::MAX);
        assert!(checked_u64(U256::from(u64::MAX) + 1).is_err());
        let encoded = encode(&[Token::Uint(U256::from(300))]);
        assert!(matches!(decode_u8(&encoded), Err(BridgeError::Decode(_))));
    }

    #[test]
    fn test_encoded_request_log_carries_uri() {
        let event = RequestValueTransferEvent::Encoded {
            transfer: RequestTransfer {
                token_type: TokenType::Erc721,
                from: Address::repeat_byte(1),
                to: Address::repeat_byte(2),
                token_address: Address::repeat_byte(3),
                value_or_token_id: U256::from(10),
                request_nonce: 0,
                fee: U256::zero(),
                extra_data: Bytes::default(),
                raw: RawLogInfo::default(),
            },
            ver: ENCODING_VER_ERC721_URI,
            encoded_data: encode_erc721_uri_payload("https://nft/10"),
        };
        let log = encode_request_log(Address::repeat_byte(0xcc), &event);
        let Some(BridgeEvent::Request(decoded)) = decode_bridge_log(&log).unwrap() else {
            panic!("expected request event");
        };
        assert_eq!(decoded.token_uri().unwrap().as_deref(), Some("https://nft/10"));
        assert!(decode_encoded_payload(9, &[]).is_err());
    }

    #[test]
    fn test_handle_log_decoding_and_unrelated_logs() {
        let event = HandleValueTransferEvent {
            request_tx_hash: H256::repeat_byte(1),
            token_type: TokenType::Klay,
            from: Address::repeat_byte(2),
            to: Address::repeat_byte(3),
            token_address: Address::zero(),
            value_or_token_id: U256::from(321),
            handle_nonce: 0,
            lower_handle_nonce: 1,
            extra_data: Bytes::default(),
            raw: RawLogInfo::default(),
        };
        let log = encode_handle_log(Address::repeat_byte(0xdd), &event);
        let Some(BridgeEvent::Handle(decoded)) = decode_bridge_log(&log).unwrap() else {
            panic!("expected handle event");
        };
        assert_eq!(decoded.lower_handle_nonce, 1);
        assert_eq!(decoded.request_tx_hash, H256::repeat_byte(1));

        let unrelated = Log {
            topics: vec![H256::repeat_byte(0x42)],
            ..Default::default()
        };
        assert!(decode_bridge_log(&unrelated).unwrap().is_none());
    }

    #[test]
    fn test_revert_reason_round_trip() {
        let data = encode_revert_reason("vote closed");
        assert_eq!(decode_revert_reason(&data).as_deref(), Some("vote closed"));
        assert_eq!(decode_revert_reason(&[1, 2, 3]), None);
    }
}
