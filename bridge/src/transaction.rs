// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Typed transactions and receipts shared by the parent and child chains.
//!
//! A raw transaction is `type || rlp(fields ++ [signatures] (++ [feePayer, feePayerSignatures]))`.
//! The sender signs `keccak(rlp([rlp([type] ++ fields), chainId, 0, 0]))`,
//! the fee payer signs the same with `feePayer` inserted before `chainId`.

use crate::error::{BridgeError, BridgeResult};
use ethers::signers::LocalWallet;
use ethers::types::{Address, Bytes, Log, RecoveryMessage, Signature, H256, U256};
use ethers::utils::keccak256;
use ethers::utils::rlp::{self, Decodable, DecoderError, Encodable, Rlp, RlpStream};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

pub const RECEIPT_STATUS_FAILED: u64 = 0;
pub const RECEIPT_STATUS_SUCCESSFUL: u64 = 1;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum TxType {
    ValueTransfer = 0x08,
    FeeDelegatedValueTransfer = 0x09,
    SmartContractDeploy = 0x28,
    FeeDelegatedSmartContractDeploy = 0x29,
    SmartContractExecution = 0x30,
    FeeDelegatedSmartContractExecution = 0x31,
    ChainDataAnchoring = 0x48,
    FeeDelegatedChainDataAnchoring = 0x49,
}

impl TxType {
    pub fn is_fee_delegated(&self) -> bool {
        u8::from(*self) & 0x01 == 0x01
    }

    pub fn is_anchoring(&self) -> bool {
        matches!(
            self,
            TxType::ChainDataAnchoring | TxType::FeeDelegatedChainDataAnchoring
        )
    }

    /// Same kind of transaction, with or without fee delegation.
    pub fn with_fee_delegation(self, delegated: bool) -> TxType {
        let base = u8::from(self) & !0x01;
        let raw = if delegated { base | 0x01 } else { base };
        TxType::try_from(raw).unwrap_or(self)
    }

    fn has_recipient(&self) -> bool {
        !self.is_anchoring()
    }

    fn has_input(&self) -> bool {
        !matches!(
            self,
            TxType::ValueTransfer | TxType::FeeDelegatedValueTransfer
        )
    }

    fn is_deploy(&self) -> bool {
        matches!(
            self,
            TxType::SmartContractDeploy | TxType::FeeDelegatedSmartContractDeploy
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxSignature {
    pub v: u64,
    pub r: U256,
    pub s: U256,
}

impl TxSignature {
    /// Converts a recoverable 27/28 signature into the chain-id bound form.
    fn from_signature(signature: Signature, chain_id: u64) -> Self {
        Self {
            v: signature.v.saturating_sub(27) + chain_id * 2 + 35,
            r: signature.r,
            s: signature.s,
        }
    }

    fn to_signature(self, chain_id: u64) -> BridgeResult<Signature> {
        let base = chain_id * 2 + 35;
        if self.v < base || self.v > base + 1 {
            return Err(BridgeError::Decode(format!(
                "signature v {} does not match chain id {}",
                self.v, chain_id
            )));
        }
        Ok(Signature {
            r: self.r,
            s: self.s,
            v: self.v - base + 27,
        })
    }
}

impl Encodable for TxSignature {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.v);
        s.append(&self.r);
        s.append(&self.s);
    }
}

impl Decodable for TxSignature {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            v: rlp.val_at(0)?,
            r: rlp.val_at(1)?,
            s: rlp.val_at(2)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_type: TxType,
    pub nonce: u64,
    pub gas_price: U256,
    pub gas: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub from: Address,
    pub input: Bytes,
    pub signatures: Vec<TxSignature>,
    pub fee_payer: Option<Address>,
    pub fee_payer_signatures: Vec<TxSignature>,
}

impl Transaction {
    pub fn new(
        tx_type: TxType,
        from: Address,
        nonce: u64,
        to: Option<Address>,
        value: U256,
        gas: u64,
        gas_price: U256,
        input: Bytes,
    ) -> Self {
        Self {
            tx_type,
            nonce,
            gas_price,
            gas,
            to,
            value,
            from,
            input,
            signatures: vec![],
            fee_payer: None,
            fee_payer_signatures: vec![],
        }
    }

    fn append_fields(&self, s: &mut RlpStream) {
        s.append(&self.nonce);
        s.append(&self.gas_price);
        s.append(&self.gas);
        if self.tx_type.has_recipient() {
            match &self.to {
                Some(to) => s.append(to),
                None => s.append_empty_data(),
            };
            s.append(&self.value);
        }
        s.append(&self.from);
        if self.tx_type.has_input() {
            s.append(&self.input.to_vec());
        }
        if self.tx_type.is_deploy() {
            // humanReadable, codeFormat
            s.append(&false);
            s.append(&0u8);
        }
    }

    fn field_count(&self) -> usize {
        let mut count = 4;
        if self.tx_type.has_recipient() {
            count += 2;
        }
        if self.tx_type.has_input() {
            count += 1;
        }
        if self.tx_type.is_deploy() {
            count += 2;
        }
        count
    }

    fn type_and_fields(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(self.field_count() + 1);
        s.append(&u8::from(self.tx_type));
        self.append_fields(&mut s);
        s.out().to_vec()
    }

    pub fn sender_sig_hash(&self, chain_id: u64) -> H256 {
        let mut s = RlpStream::new_list(4);
        s.append(&self.type_and_fields());
        s.append(&chain_id);
        s.append(&0u8);
        s.append(&0u8);
        H256::from(keccak256(s.out()))
    }

    pub fn fee_payer_sig_hash(&self, chain_id: u64) -> H256 {
        let mut s = RlpStream::new_list(5);
        s.append(&self.type_and_fields());
        s.append(&self.fee_payer.unwrap_or_default());
        s.append(&chain_id);
        s.append(&0u8);
        s.append(&0u8);
        H256::from(keccak256(s.out()))
    }

    /// Signs as sender with `wallet`, which must own `from`.
    pub fn sign_as_sender(&mut self, wallet: &LocalWallet, chain_id: u64) -> BridgeResult<()> {
        let signature = wallet
            .sign_hash(self.sender_sig_hash(chain_id))
            .map_err(|e| BridgeError::Fatal(format!("failed to sign tx: {}", e)))?;
        self.signatures = vec![TxSignature::from_signature(signature, chain_id)];
        Ok(())
    }

    pub fn sign_as_fee_payer(&mut self, wallet: &LocalWallet, chain_id: u64) -> BridgeResult<()> {
        if !self.tx_type.is_fee_delegated() {
            return Err(BridgeError::Generic(format!(
                "{:?} is not fee delegated",
                self.tx_type
            )));
        }
        let signature = wallet
            .sign_hash(self.fee_payer_sig_hash(chain_id))
            .map_err(|e| BridgeError::Fatal(format!("failed to sign tx as fee payer: {}", e)))?;
        self.fee_payer_signatures = vec![TxSignature::from_signature(signature, chain_id)];
        Ok(())
    }

    /// Checks that the sender (and fee payer) signatures recover to the
    /// declared accounts.
    pub fn verify_signatures(&self, chain_id: u64) -> BridgeResult<()> {
        let signature = self
            .signatures
            .first()
            .ok_or_else(|| BridgeError::Decode("unsigned transaction".to_string()))?;
        recover_and_check(*signature, chain_id, self.sender_sig_hash(chain_id), self.from)?;
        if self.tx_type.is_fee_delegated() {
            let fee_payer = self
                .fee_payer
                .ok_or_else(|| BridgeError::Decode("fee payer missing".to_string()))?;
            let signature = self
                .fee_payer_signatures
                .first()
                .ok_or_else(|| BridgeError::Decode("fee payer signature missing".to_string()))?;
            recover_and_check(
                *signature,
                chain_id,
                self.fee_payer_sig_hash(chain_id),
                fee_payer,
            )?;
        }
        Ok(())
    }

    pub fn raw_bytes(&self) -> Bytes {
        let delegated = self.tx_type.is_fee_delegated();
        let mut s = RlpStream::new_list(self.field_count() + if delegated { 3 } else { 1 });
        self.append_fields(&mut s);
        s.append_list(&self.signatures);
        if delegated {
            s.append(&self.fee_payer.unwrap_or_default());
            s.append_list(&self.fee_payer_signatures);
        }
        let mut raw = vec![u8::from(self.tx_type)];
        raw.extend_from_slice(&s.out());
        raw.into()
    }

    pub fn decode_raw(raw: &[u8]) -> BridgeResult<Self> {
        let (type_byte, body) = raw
            .split_first()
            .ok_or_else(|| BridgeError::Decode("empty transaction".to_string()))?;
        let tx_type = TxType::try_from(*type_byte)
            .map_err(|_| BridgeError::Decode(format!("unknown tx type {:#x}", type_byte)))?;
        let rlp = Rlp::new(body);
        let mut tx = Transaction::new(
            tx_type,
            Address::zero(),
            0,
            None,
            U256::zero(),
            0,
            U256::zero(),
            Bytes::default(),
        );
        let mut i = 0;
        let mut next = || {
            let current = i;
            i += 1;
            current
        };
        tx.nonce = rlp.val_at(next())?;
        tx.gas_price = rlp.val_at(next())?;
        tx.gas = rlp.val_at(next())?;
        if tx_type.has_recipient() {
            let to = rlp.at(next())?;
            tx.to = if to.is_empty() { None } else { Some(to.as_val()?) };
            tx.value = rlp.val_at(next())?;
        }
        tx.from = rlp.val_at(next())?;
        if tx_type.has_input() {
            tx.input = rlp.val_at::<Vec<u8>>(next())?.into();
        }
        if tx_type.is_deploy() {
            next();
            next();
        }
        tx.signatures = rlp.list_at(next())?;
        if tx_type.is_fee_delegated() {
            tx.fee_payer = Some(rlp.val_at(next())?);
            tx.fee_payer_signatures = rlp.list_at(next())?;
        }
        Ok(tx)
    }

    pub fn hash(&self) -> H256 {
        H256::from(keccak256(self.raw_bytes()))
    }
}

fn recover_and_check(
    signature: TxSignature,
    chain_id: u64,
    hash: H256,
    expected: Address,
) -> BridgeResult<()> {
    let recovered = signature
        .to_signature(chain_id)?
        .recover(RecoveryMessage::Hash(hash))
        .map_err(|e| BridgeError::Decode(format!("invalid signature: {}", e)))?;
    if recovered != expected {
        return Err(BridgeError::Decode(format!(
            "signature recovers {:?}, expected {:?}",
            recovered, expected
        )));
    }
    Ok(())
}

impl Encodable for Transaction {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.append(&self.raw_bytes().to_vec());
    }
}

impl Decodable for Transaction {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Transaction::decode_raw(rlp.data()?)
            .map_err(|_| DecoderError::Custom("invalid typed transaction"))
    }
}

/// Execution outcome of a transaction. Logs are not carried on the peer wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Receipt {
    pub tx_hash: H256,
    pub status: u64,
    pub gas_used: u64,
    pub block_number: u64,
    pub contract_address: Option<Address>,
    pub logs: Vec<Log>,
    pub revert_reason: Option<String>,
}

impl Receipt {
    pub fn is_successful(&self) -> bool {
        self.status == RECEIPT_STATUS_SUCCESSFUL
    }
}

impl Encodable for Receipt {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(6);
        s.append(&self.tx_hash);
        s.append(&self.status);
        s.append(&self.gas_used);
        s.append(&self.block_number);
        match &self.contract_address {
            Some(address) => s.append(address),
            None => s.append_empty_data(),
        };
        s.append(&self.revert_reason.clone().unwrap_or_default());
    }
}

impl Decodable for Receipt {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let contract = rlp.at(4)?;
        let reason: String = rlp.val_at(5)?;
        Ok(Self {
            tx_hash: rlp.val_at(0)?,
            status: rlp.val_at(1)?,
            gas_used: rlp.val_at(2)?,
            block_number: rlp.val_at(3)?,
            contract_address: if contract.is_empty() {
                None
            } else {
                Some(contract.as_val()?)
            },
            logs: vec![],
            revert_reason: if reason.is_empty() { None } else { Some(reason) },
        })
    }
}

pub fn encode_transactions(txs: &[Transaction]) -> Vec<u8> {
    rlp::encode_list::<Transaction, _>(txs).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::Signer;

    fn wallet() -> LocalWallet {
        "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
            .parse()
            .unwrap()
    }

    fn execution_tx(from: Address) -> Transaction {
        Transaction::new(
            TxType::SmartContractExecution,
            from,
            7,
            Some(Address::repeat_byte(0xbb)),
            U256::from(10),
            10_000_000,
            U256::from(25_000_000_000u64),
            Bytes::from(vec![1, 2, 3]),
        )
    }

    #[test]
    fn test_tx_type_flags() {
        assert!(TxType::FeeDelegatedChainDataAnchoring.is_fee_delegated());
        assert!(TxType::FeeDelegatedChainDataAnchoring.is_anchoring());
        assert!(!TxType::SmartContractExecution.is_fee_delegated());
        assert_eq!(
            TxType::SmartContractExecution.with_fee_delegation(true),
            TxType::FeeDelegatedSmartContractExecution
        );
        assert_eq!(
            TxType::FeeDelegatedChainDataAnchoring.with_fee_delegation(false),
            TxType::ChainDataAnchoring
        );
    }

    #[test]
    fn test_signed_tx_raw_round_trip_and_verification() {
        let wallet = wallet();
        let mut tx = execution_tx(wallet.address());
        tx.sign_as_sender(&wallet, 1000).unwrap();
        tx.verify_signatures(1000).unwrap();
        assert!(tx.verify_signatures(1001).is_err());

        let decoded = Transaction::decode_raw(&tx.raw_bytes()).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.hash(), tx.hash());
    }

    #[test]
    fn test_fee_delegated_anchoring_tx_needs_both_signatures() {
        let sender = wallet();
        let payer = LocalWallet::new(&mut rand::thread_rng());
        let mut tx = Transaction::new(
            TxType::FeeDelegatedChainDataAnchoring,
            sender.address(),
            0,
            None,
            U256::zero(),
            100_000,
            U256::from(1),
            Bytes::from(vec![0xc0]),
        );
        tx.fee_payer = Some(payer.address());
        tx.sign_as_sender(&sender, 2019).unwrap();
        assert!(tx.verify_signatures(2019).is_err());
        tx.sign_as_fee_payer(&payer, 2019).unwrap();
        tx.verify_signatures(2019).unwrap();

        let decoded: Transaction = rlp::decode(&rlp::encode(&tx)).unwrap();
        assert_eq!(decoded.fee_payer, Some(payer.address()));
        assert_eq!(decoded.to, None);
        decoded.verify_signatures(2019).unwrap();
    }

    #[test]
    fn test_receipt_wire_format_drops_logs() {
        let receipt = Receipt {
            tx_hash: H256::repeat_byte(3),
            status: RECEIPT_STATUS_FAILED,
            gas_used: 21000,
            block_number: 88,
            contract_address: None,
            logs: vec![Log::default()],
            revert_reason: Some("vote closed".to_string()),
        };
        let decoded: Receipt = rlp::decode(&rlp::encode(&receipt)).unwrap();
        assert!(decoded.logs.is_empty());
        assert_eq!(decoded.revert_reason.as_deref(), Some("vote closed"));
        assert!(!decoded.is_successful());
    }
}
