// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Typed access to one deployed bridge contract.

use crate::abi::{
    decode_address, decode_address_list, decode_bool, decode_string, decode_u256, decode_u64,
    decode_u8, BridgeMethod,
};
use crate::accounts::{OperatorAccount, TransactOpts};
use crate::chain_backend::{CallMsg, ChainBackend};
use crate::error::{BridgeError, BridgeResult};
use crate::transaction::{Receipt, Transaction, TxType};
use ethers::abi::Token;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::get_contract_address;
use std::sync::Arc;
use std::time::Duration;
use tap::TapFallible;
use tracing::{debug, info, warn};

pub const DEPLOY_RECEIPT_TIMEOUT: Duration = Duration::from_secs(60);
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Arguments of one handle call, shared by the three token types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleCall {
    pub request_tx_hash: H256,
    pub from: Address,
    pub to: Address,
    pub token_address: Address,
    pub value_or_token_id: U256,
    pub request_nonce: u64,
    pub request_block_number: u64,
    pub token_uri: String,
    pub extra_data: Bytes,
}

#[derive(Clone)]
pub struct BridgeContract {
    address: Address,
    backend: Arc<dyn ChainBackend>,
}

impl std::fmt::Debug for BridgeContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeContract")
            .field("address", &self.address)
            .field("chain", &self.backend.name())
            .finish()
    }
}

/// Polls for the receipt of `hash` until it shows up or `timeout` passes.
pub async fn wait_receipt(
    backend: &dyn ChainBackend,
    hash: H256,
    timeout: Duration,
) -> BridgeResult<Receipt> {
    let poll = async {
        loop {
            if let Some(receipt) = backend.transaction_receipt(hash).await? {
                return Ok(receipt);
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| BridgeError::Timeout(format!("receipt of {:?}", hash)))?
}

/// Nonce to sign with: the shadow nonce when synced, else the chain's view.
async fn resolve_nonce(backend: &dyn ChainBackend, opts: &TransactOpts) -> BridgeResult<u64> {
    match opts.nonce {
        Some(nonce) => Ok(nonce),
        None => backend.pending_nonce_at(opts.from).await,
    }
}

impl BridgeContract {
    pub fn new(address: Address, backend: Arc<dyn ChainBackend>) -> Self {
        Self { address, backend }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn backend(&self) -> &Arc<dyn ChainBackend> {
        &self.backend
    }

    /// Deploys a bridge owned by `account` and waits for it to be mined.
    pub async fn deploy(
        backend: Arc<dyn ChainBackend>,
        account: &OperatorAccount,
        bytecode: Bytes,
    ) -> BridgeResult<BridgeContract> {
        let chain = backend.clone();
        let tx = account
            .with_signing(|opts| async move {
                let nonce = resolve_nonce(chain.as_ref(), &opts).await?;
                let mut tx = Transaction::new(
                    opts.tx_type(TxType::SmartContractDeploy),
                    opts.from,
                    nonce,
                    None,
                    U256::zero(),
                    opts.gas_limit,
                    opts.gas_price,
                    bytecode,
                );
                opts.sign_tx(&mut tx)?;
                chain.send_transaction(&tx).await?;
                Ok((tx, true))
            })
            .await
            .tap_err(|e| warn!("[{}] Failed to deploy bridge: {}", backend.name(), e))?;

        let receipt = wait_receipt(backend.as_ref(), tx.hash(), DEPLOY_RECEIPT_TIMEOUT).await?;
        if !receipt.is_successful() {
            return Err(BridgeError::Generic(format!(
                "bridge deployment {:?} failed: {}",
                tx.hash(),
                receipt.revert_reason.unwrap_or_default()
            )));
        }
        let address = receipt
            .contract_address
            .unwrap_or_else(|| get_contract_address(tx.from, tx.nonce));
        info!(
            "[{}] Bridge deployed at {:?} by {:?}",
            backend.name(),
            address,
            tx.from
        );
        Ok(BridgeContract::new(address, backend))
    }

    async fn call_view(&self, method: BridgeMethod, args: &[Token]) -> BridgeResult<Bytes> {
        let msg = CallMsg::new(None, self.address, method.encode_call(args));
        self.backend.call_contract(&msg).await
    }

    /// Builds, preflights, signs and submits a call to the bridge. The
    /// account nonce moves only when the node accepted the transaction.
    pub async fn transact(
        &self,
        account: &OperatorAccount,
        method: BridgeMethod,
        args: &[Token],
        value: U256,
    ) -> BridgeResult<Transaction> {
        let data = method.encode_call(args);
        let backend = self.backend.clone();
        let to = self.address;
        account
            .with_signing(|opts| async move {
                let msg = CallMsg {
                    from: Some(opts.from),
                    to: Some(to),
                    data: data.clone(),
                    value,
                    gas: Some(opts.gas_limit),
                };
                backend.call_contract(&msg).await?;
                let nonce = resolve_nonce(backend.as_ref(), &opts).await?;
                let mut tx = Transaction::new(
                    opts.tx_type(TxType::SmartContractExecution),
                    opts.from,
                    nonce,
                    Some(to),
                    value,
                    opts.gas_limit,
                    opts.gas_price,
                    data,
                );
                opts.sign_tx(&mut tx)?;
                match backend.send_transaction(&tx).await {
                    Ok(_) => {}
                    Err(BridgeError::KnownTx(hash)) => {
                        debug!("[{}] {:?} already known to the node", backend.name(), hash)
                    }
                    Err(e) => return Err(e),
                }
                Ok((tx, true))
            })
            .await
            .tap_err(|e| {
                debug!(
                    "[{}] {} on {:?} not submitted: {}",
                    self.backend.name(),
                    method,
                    self.address,
                    e
                )
            })
    }

    pub async fn handle_klay_transfer(
        &self,
        account: &OperatorAccount,
        call: &HandleCall,
    ) -> BridgeResult<Transaction> {
        let args = [
            Token::FixedBytes(call.request_tx_hash.as_bytes().to_vec()),
            Token::Address(call.from),
            Token::Address(call.to),
            Token::Uint(call.value_or_token_id),
            Token::Uint(call.request_nonce.into()),
            Token::Uint(call.request_block_number.into()),
            Token::Bytes(call.extra_data.to_vec()),
        ];
        self.transact(account, BridgeMethod::HandleKlayTransfer, &args, U256::zero())
            .await
    }

    pub async fn handle_erc20_transfer(
        &self,
        account: &OperatorAccount,
        call: &HandleCall,
    ) -> BridgeResult<Transaction> {
        let args = [
            Token::FixedBytes(call.request_tx_hash.as_bytes().to_vec()),
            Token::Address(call.from),
            Token::Address(call.to),
            Token::Address(call.token_address),
            Token::Uint(call.value_or_token_id),
            Token::Uint(call.request_nonce.into()),
            Token::Uint(call.request_block_number.into()),
            Token::Bytes(call.extra_data.to_vec()),
        ];
        self.transact(account, BridgeMethod::HandleErc20Transfer, &args, U256::zero())
            .await
    }

    pub async fn handle_erc721_transfer(
        &self,
        account: &OperatorAccount,
        call: &HandleCall,
    ) -> BridgeResult<Transaction> {
        let args = [
            Token::FixedBytes(call.request_tx_hash.as_bytes().to_vec()),
            Token::Address(call.from),
            Token::Address(call.to),
            Token::Address(call.token_address),
            Token::Uint(call.value_or_token_id),
            Token::Uint(call.request_nonce.into()),
            Token::Uint(call.request_block_number.into()),
            Token::String(call.token_uri.clone()),
            Token::Bytes(call.extra_data.to_vec()),
        ];
        self.transact(account, BridgeMethod::HandleErc721Transfer, &args, U256::zero())
            .await
    }

    pub async fn request_klay_transfer(
        &self,
        account: &OperatorAccount,
        to: Address,
        value: U256,
        extra_data: Bytes,
    ) -> BridgeResult<Transaction> {
        let fee = self.fee_of_klay().await?;
        let args = [
            Token::Address(to),
            Token::Uint(value),
            Token::Bytes(extra_data.to_vec()),
        ];
        self.transact(account, BridgeMethod::RequestKlayTransfer, &args, value + fee)
            .await
    }

    pub async fn register_token(
        &self,
        account: &OperatorAccount,
        local: Address,
        remote: Address,
    ) -> BridgeResult<Transaction> {
        let args = [Token::Address(local), Token::Address(remote)];
        self.transact(account, BridgeMethod::RegisterToken, &args, U256::zero())
            .await
    }

    pub async fn deregister_token(
        &self,
        account: &OperatorAccount,
        local: Address,
    ) -> BridgeResult<Transaction> {
        self.transact(
            account,
            BridgeMethod::DeregisterToken,
            &[Token::Address(local)],
            U256::zero(),
        )
        .await
    }

    pub async fn register_operator(
        &self,
        account: &OperatorAccount,
        operator: Address,
    ) -> BridgeResult<Transaction> {
        self.transact(
            account,
            BridgeMethod::RegisterOperator,
            &[Token::Address(operator)],
            U256::zero(),
        )
        .await
    }

    pub async fn deregister_operator(
        &self,
        account: &OperatorAccount,
        operator: Address,
    ) -> BridgeResult<Transaction> {
        self.transact(
            account,
            BridgeMethod::DeregisterOperator,
            &[Token::Address(operator)],
            U256::zero(),
        )
        .await
    }

    pub async fn set_operator_threshold(
        &self,
        account: &OperatorAccount,
        vote_type: u8,
        threshold: u8,
    ) -> BridgeResult<Transaction> {
        let args = [
            Token::Uint(vote_type.into()),
            Token::Uint(threshold.into()),
        ];
        self.transact(account, BridgeMethod::SetOperatorThreshold, &args, U256::zero())
            .await
    }

    pub async fn set_klay_fee(
        &self,
        account: &OperatorAccount,
        fee: U256,
    ) -> BridgeResult<Transaction> {
        let nonce = self.configuration_nonce().await?;
        let args = [Token::Uint(fee), Token::Uint(nonce.into())];
        self.transact(account, BridgeMethod::SetKlayFee, &args, U256::zero())
            .await
    }

    pub async fn set_erc20_fee(
        &self,
        account: &OperatorAccount,
        token: Address,
        fee: U256,
    ) -> BridgeResult<Transaction> {
        let nonce = self.configuration_nonce().await?;
        let args = [
            Token::Address(token),
            Token::Uint(fee),
            Token::Uint(nonce.into()),
        ];
        self.transact(account, BridgeMethod::SetErc20Fee, &args, U256::zero())
            .await
    }

    pub async fn set_fee_receiver(
        &self,
        account: &OperatorAccount,
        receiver: Address,
    ) -> BridgeResult<Transaction> {
        self.transact(
            account,
            BridgeMethod::SetFeeReceiver,
            &[Token::Address(receiver)],
            U256::zero(),
        )
        .await
    }

    pub async fn start(&self, account: &OperatorAccount, running: bool) -> BridgeResult<Transaction> {
        self.transact(account, BridgeMethod::Start, &[Token::Bool(running)], U256::zero())
            .await
    }

    pub async fn request_nonce(&self) -> BridgeResult<u64> {
        decode_u64(&self.call_view(BridgeMethod::RequestNonce, &[]).await?)
    }

    pub async fn handle_nonce(&self) -> BridgeResult<u64> {
        decode_u64(&self.call_view(BridgeMethod::HandleNonce, &[]).await?)
    }

    pub async fn lower_handle_nonce(&self) -> BridgeResult<u64> {
        decode_u64(&self.call_view(BridgeMethod::LowerHandleNonce, &[]).await?)
    }

    pub async fn upper_handle_nonce(&self) -> BridgeResult<u64> {
        decode_u64(&self.call_view(BridgeMethod::UpperHandleNonce, &[]).await?)
    }

    /// Source block number of the last request closed in order.
    pub async fn last_handled_request_block_number(&self) -> BridgeResult<u64> {
        decode_u64(&self.call_view(BridgeMethod::RecoveryBlockNumber, &[]).await?)
    }

    pub async fn handled_request_tx(&self, request_tx_hash: H256) -> BridgeResult<bool> {
        let args = [Token::FixedBytes(request_tx_hash.as_bytes().to_vec())];
        decode_bool(&self.call_view(BridgeMethod::HandledRequestTx, &args).await?)
    }

    pub async fn is_running(&self) -> BridgeResult<bool> {
        decode_bool(&self.call_view(BridgeMethod::IsRunning, &[]).await?)
    }

    /// Counterpart token of `local`, zero when not registered.
    pub async fn registered_token(&self, local: Address) -> BridgeResult<Address> {
        decode_address(
            &self
                .call_view(BridgeMethod::RegisteredTokens, &[Token::Address(local)])
                .await?,
        )
    }

    pub async fn operators(&self) -> BridgeResult<Vec<Address>> {
        decode_address_list(&self.call_view(BridgeMethod::GetOperatorList, &[]).await?)
    }

    pub async fn operator_threshold(&self, vote_type: u8) -> BridgeResult<u8> {
        let out = self
            .call_view(BridgeMethod::OperatorThresholds, &[Token::Uint(vote_type.into())])
            .await?;
        decode_u8(&out)
    }

    pub async fn fee_of_klay(&self) -> BridgeResult<U256> {
        decode_u256(&self.call_view(BridgeMethod::FeeOfKlay, &[]).await?)
    }

    pub async fn fee_of_erc20(&self, token: Address) -> BridgeResult<U256> {
        decode_u256(
            &self
                .call_view(BridgeMethod::FeeOfErc20, &[Token::Address(token)])
                .await?,
        )
    }

    pub async fn fee_receiver(&self) -> BridgeResult<Address> {
        decode_address(&self.call_view(BridgeMethod::FeeReceiver, &[]).await?)
    }

    pub async fn configuration_nonce(&self) -> BridgeResult<u64> {
        decode_u64(&self.call_view(BridgeMethod::ConfigurationNonce, &[]).await?)
    }

    /// `tokenURI(id)` of an ERC721 token contract on the same chain.
    pub async fn token_uri(&self, token: Address, id: U256) -> BridgeResult<String> {
        let msg = CallMsg::new(None, token, BridgeMethod::TokenUri.encode_call(&[Token::Uint(id)]));
        decode_string(&self.backend.call_contract(&msg).await?)
    }
}
