// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory chain that executes the bridge contract, used by tests.

use super::{CallMsg, ChainBackend, LogQuery, LogSubscription};
use crate::abi::{decode_single, BridgeMethod, VOTE_TYPE_VALUE_TRANSFER};
use crate::error::{BridgeError, BridgeResult, RevertInfo};
use crate::transaction::{
    Receipt, Transaction, TxType, RECEIPT_STATUS_FAILED, RECEIPT_STATUS_SUCCESSFUL,
};
use crate::types::{
    Block, BlockHeader, BlockTransaction, HandleValueTransferEvent, RawLogInfo, RequestTransfer,
    RequestValueTransferEvent, TokenType,
};
use async_trait::async_trait;
use ethers::abi::{encode, ParamType, Token};
use ethers::types::{Address, Bytes, Log, H256, U256, U64};
use ethers::utils::{get_contract_address, keccak256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const SIMULATED_GAS_PRICE: u64 = 25_000_000_000;
const SIMULATED_GAS_USED: u64 = 21_000;
const SIMULATED_ESTIMATED_GAS: u64 = 100_000;

pub const REVERT_NOT_RUNNING: &str = "not running";
pub const REVERT_NOT_OPERATOR: &str = "msg.sender is not an operator";
pub const REVERT_NOT_OWNER: &str = "caller is not the owner";
pub const REVERT_VOTE_CLOSED: &str = "vote closed";
pub const REVERT_ALREADY_HANDLED: &str = "already handled";
pub const REVERT_INSUFFICIENT_BRIDGE_BALANCE: &str = "insufficient bridge balance";

#[derive(Debug, Clone)]
pub struct BridgeContractState {
    pub owner: Address,
    pub running: bool,
    pub operators: Vec<Address>,
    pub thresholds: [u8; 2],
    pub request_nonce: u64,
    pub handle_nonce: u64,
    pub lower_handle_nonce: u64,
    pub upper_handle_nonce: u64,
    pub recovery_block_number: u64,
    pub configuration_nonce: u64,
    pub fee_of_klay: U256,
    pub fee_of_erc20: HashMap<Address, U256>,
    pub fee_receiver: Address,
    pub tokens: HashMap<Address, Address>,
    handle_nonces_to_block_nums: HashMap<u64, u64>,
    closed_votes: HashSet<u64>,
    votes: HashMap<(u64, H256), HashSet<Address>>,
    handled_request_tx: HashSet<H256>,
}

impl BridgeContractState {
    fn new(owner: Address) -> Self {
        Self {
            owner,
            running: true,
            operators: vec![owner],
            thresholds: [1, 1],
            request_nonce: 0,
            handle_nonce: 0,
            lower_handle_nonce: 0,
            upper_handle_nonce: 0,
            recovery_block_number: 1,
            configuration_nonce: 0,
            fee_of_klay: U256::zero(),
            fee_of_erc20: HashMap::new(),
            fee_receiver: Address::zero(),
            tokens: HashMap::new(),
            handle_nonces_to_block_nums: HashMap::new(),
            closed_votes: HashSet::new(),
            votes: HashMap::new(),
            handled_request_tx: HashSet::new(),
        }
    }

    fn update_handle_nonce(&mut self, request_nonce: u64) {
        self.upper_handle_nonce = self.upper_handle_nonce.max(request_nonce);
        self.handle_nonce = self.handle_nonce.max(request_nonce + 1);
        let mut i = self.lower_handle_nonce;
        while i <= self.upper_handle_nonce {
            let Some(block) = self.handle_nonces_to_block_nums.remove(&i) else {
                break;
            };
            self.recovery_block_number = block;
            self.closed_votes.remove(&i);
            i += 1;
        }
        self.lower_handle_nonce = i;
    }
}

#[derive(Debug, Clone, Default)]
struct WorldState {
    balances: HashMap<Address, U256>,
    nonces: HashMap<Address, u64>,
    bridges: HashMap<Address, BridgeContractState>,
    erc20_balances: HashMap<(Address, Address), U256>,
    nft_owners: HashMap<(Address, U256), Address>,
    token_uris: HashMap<(Address, U256), String>,
}

struct CallContext<'a> {
    from: Address,
    to: Address,
    value: U256,
    input: &'a [u8],
}

type ExecResult = Result<(Bytes, Vec<Log>), String>;

fn uint(v: impl Into<U256>) -> Bytes {
    encode(&[Token::Uint(v.into())]).into()
}

fn arg_address(tokens: &[Token], i: usize) -> Result<Address, String> {
    tokens
        .get(i)
        .cloned()
        .and_then(Token::into_address)
        .ok_or_else(|| format!("argument {} is not an address", i))
}

fn arg_uint(tokens: &[Token], i: usize) -> Result<U256, String> {
    tokens
        .get(i)
        .cloned()
        .and_then(Token::into_uint)
        .ok_or_else(|| format!("argument {} is not a uint", i))
}

fn arg_hash(tokens: &[Token], i: usize) -> Result<H256, String> {
    tokens
        .get(i)
        .cloned()
        .and_then(Token::into_fixed_bytes)
        .map(|b| H256::from_slice(&b))
        .ok_or_else(|| format!("argument {} is not bytes32", i))
}

fn arg_bytes(tokens: &[Token], i: usize) -> Result<Bytes, String> {
    tokens
        .get(i)
        .cloned()
        .and_then(Token::into_bytes)
        .map(Bytes::from)
        .ok_or_else(|| format!("argument {} is not bytes", i))
}

impl WorldState {
    fn balance(&self, address: &Address) -> U256 {
        self.balances.get(address).copied().unwrap_or_default()
    }

    fn transfer(&mut self, from: Address, to: Address, value: U256) -> Result<(), String> {
        if value.is_zero() {
            return Ok(());
        }
        let balance = self.balance(&from);
        if balance < value {
            return Err("insufficient funds".to_string());
        }
        self.balances.insert(from, balance - value);
        *self.balances.entry(to).or_default() += value;
        Ok(())
    }

    fn execute(&mut self, ctx: CallContext) -> ExecResult {
        self.transfer(ctx.from, ctx.to, ctx.value)?;
        if ctx.input.is_empty() {
            return Ok((Bytes::default(), vec![]));
        }
        let method = BridgeMethod::from_selector(ctx.input)
            .ok_or_else(|| "unknown method".to_string())?;
        let args = method
            .decode_input(ctx.input)
            .map_err(|e| e.to_string())?;
        if method == BridgeMethod::TokenUri {
            let id = arg_uint(&args, 0)?;
            let uri = self
                .token_uris
                .get(&(ctx.to, id))
                .cloned()
                .ok_or_else(|| "nonexistent token".to_string())?;
            return Ok((encode(&[Token::String(uri)]).into(), vec![]));
        }
        if !self.bridges.contains_key(&ctx.to) {
            return Ok((Bytes::default(), vec![]));
        }
        self.execute_bridge(method, &args, &ctx)
    }

    fn execute_bridge(&mut self, method: BridgeMethod, args: &[Token], ctx: &CallContext) -> ExecResult {
        let bridge_address = ctx.to;
        let bridge = self
            .bridges
            .get(&bridge_address)
            .cloned()
            .ok_or_else(|| "no bridge".to_string())?;
        let view = |out: Bytes| -> ExecResult { Ok((out, vec![])) };
        match method {
            BridgeMethod::RequestNonce => view(uint(bridge.request_nonce)),
            BridgeMethod::HandleNonce => view(uint(bridge.handle_nonce)),
            BridgeMethod::LowerHandleNonce => view(uint(bridge.lower_handle_nonce)),
            BridgeMethod::UpperHandleNonce => view(uint(bridge.upper_handle_nonce)),
            BridgeMethod::RecoveryBlockNumber => view(uint(bridge.recovery_block_number)),
            BridgeMethod::ConfigurationNonce => view(uint(bridge.configuration_nonce)),
            BridgeMethod::IsRunning => view(encode(&[Token::Bool(bridge.running)]).into()),
            BridgeMethod::FeeOfKlay => view(uint(bridge.fee_of_klay)),
            BridgeMethod::FeeReceiver => {
                view(encode(&[Token::Address(bridge.fee_receiver)]).into())
            }
            BridgeMethod::FeeOfErc20 => {
                let token = arg_address(args, 0)?;
                view(uint(bridge.fee_of_erc20.get(&token).copied().unwrap_or_default()))
            }
            BridgeMethod::HandledRequestTx => {
                let hash = arg_hash(args, 0)?;
                view(encode(&[Token::Bool(bridge.handled_request_tx.contains(&hash))]).into())
            }
            BridgeMethod::RegisteredTokens => {
                let token = arg_address(args, 0)?;
                let remote = bridge.tokens.get(&token).copied().unwrap_or_default();
                view(encode(&[Token::Address(remote)]).into())
            }
            BridgeMethod::GetOperatorList => view(
                encode(&[Token::Array(
                    bridge.operators.iter().copied().map(Token::Address).collect(),
                )])
                .into(),
            ),
            BridgeMethod::OperatorThresholds => {
                let vote_type = arg_uint(args, 0)?.low_u32() as usize;
                let threshold = bridge.thresholds.get(vote_type).copied().unwrap_or_default();
                view(uint(threshold))
            }
            BridgeMethod::RequestKlayTransfer => self.request_klay(bridge_address, args, ctx),
            BridgeMethod::HandleKlayTransfer
            | BridgeMethod::HandleErc20Transfer
            | BridgeMethod::HandleErc721Transfer => {
                self.handle_transfer(bridge_address, method, args, ctx)
            }
            _ => self.configure(bridge_address, method, args, ctx),
        }
    }

    fn bridge_mut(&mut self, address: Address) -> Result<&mut BridgeContractState, String> {
        self.bridges
            .get_mut(&address)
            .ok_or_else(|| "no bridge".to_string())
    }

    fn configure(
        &mut self,
        bridge_address: Address,
        method: BridgeMethod,
        args: &[Token],
        ctx: &CallContext,
    ) -> ExecResult {
        let bridge = self.bridge_mut(bridge_address)?;
        if bridge.owner != ctx.from {
            return Err(REVERT_NOT_OWNER.to_string());
        }
        match method {
            BridgeMethod::RegisterToken => {
                let local = arg_address(args, 0)?;
                if bridge.tokens.contains_key(&local) {
                    return Err("token already registered".to_string());
                }
                bridge.tokens.insert(local, arg_address(args, 1)?);
            }
            BridgeMethod::DeregisterToken => {
                let local = arg_address(args, 0)?;
                if bridge.tokens.remove(&local).is_none() {
                    return Err("invalid token".to_string());
                }
            }
            BridgeMethod::RegisterOperator => {
                let operator = arg_address(args, 0)?;
                if bridge.operators.contains(&operator) {
                    return Err("exist operator".to_string());
                }
                bridge.operators.push(operator);
            }
            BridgeMethod::DeregisterOperator => {
                let operator = arg_address(args, 0)?;
                bridge.operators.retain(|o| *o != operator);
            }
            BridgeMethod::SetOperatorThreshold => {
                let vote_type = arg_uint(args, 0)?.low_u32() as usize;
                let threshold = arg_uint(args, 1)?.low_u32() as u8;
                if vote_type >= bridge.thresholds.len() || threshold == 0 {
                    return Err("invalid threshold".to_string());
                }
                bridge.thresholds[vote_type] = threshold;
            }
            BridgeMethod::SetKlayFee => bridge.fee_of_klay = arg_uint(args, 0)?,
            BridgeMethod::SetErc20Fee => {
                let token = arg_address(args, 0)?;
                bridge.fee_of_erc20.insert(token, arg_uint(args, 1)?);
            }
            BridgeMethod::SetFeeReceiver => bridge.fee_receiver = arg_address(args, 0)?,
            BridgeMethod::Start => {
                bridge.running = args
                    .first()
                    .cloned()
                    .and_then(Token::into_bool)
                    .ok_or_else(|| "argument 0 is not a bool".to_string())?
            }
            other => return Err(format!("{} is not callable", other)),
        }
        bridge.configuration_nonce += 1;
        Ok((Bytes::default(), vec![]))
    }

    fn request_klay(&mut self, bridge_address: Address, args: &[Token], ctx: &CallContext) -> ExecResult {
        let to = arg_address(args, 0)?;
        let value = arg_uint(args, 1)?;
        let extra_data = arg_bytes(args, 2)?;
        let bridge = self.bridge_mut(bridge_address)?;
        if !bridge.running {
            return Err(REVERT_NOT_RUNNING.to_string());
        }
        let fee = bridge.fee_of_klay;
        if ctx.value < value + fee {
            return Err("insufficient amount".to_string());
        }
        let request_nonce = bridge.request_nonce;
        bridge.request_nonce += 1;
        let fee_receiver = bridge.fee_receiver;
        if !fee_receiver.is_zero() {
            self.transfer(bridge_address, fee_receiver, fee)?;
        }
        let event = RequestValueTransferEvent::Plain(RequestTransfer {
            token_type: TokenType::Klay,
            from: ctx.from,
            to,
            token_address: Address::zero(),
            value_or_token_id: value,
            request_nonce,
            fee,
            extra_data,
            raw: RawLogInfo::default(),
        });
        Ok((
            Bytes::default(),
            vec![crate::abi::encode_request_log(bridge_address, &event)],
        ))
    }

    fn handle_transfer(
        &mut self,
        bridge_address: Address,
        method: BridgeMethod,
        args: &[Token],
        ctx: &CallContext,
    ) -> ExecResult {
        let request_tx_hash = arg_hash(args, 0)?;
        let from = arg_address(args, 1)?;
        let to = arg_address(args, 2)?;
        let (token_type, token_address, offset) = match method {
            BridgeMethod::HandleKlayTransfer => (TokenType::Klay, Address::zero(), 3),
            BridgeMethod::HandleErc20Transfer => (TokenType::Erc20, arg_address(args, 3)?, 4),
            _ => (TokenType::Erc721, arg_address(args, 3)?, 4),
        };
        let value = arg_uint(args, offset)?;
        let request_nonce = arg_uint(args, offset + 1)?.low_u64();
        let request_block_number = arg_uint(args, offset + 2)?.low_u64();
        let extra_data = arg_bytes(args, args.len() - 1)?;
        let digest = H256::from(keccak256(ctx.input));

        let bridge = self.bridge_mut(bridge_address)?;
        if !bridge.running {
            return Err(REVERT_NOT_RUNNING.to_string());
        }
        if !bridge.operators.contains(&ctx.from) {
            return Err(REVERT_NOT_OPERATOR.to_string());
        }
        if request_nonce < bridge.lower_handle_nonce {
            return Err(REVERT_ALREADY_HANDLED.to_string());
        }
        if bridge.closed_votes.contains(&request_nonce) {
            return Err(REVERT_VOTE_CLOSED.to_string());
        }
        if bridge.handled_request_tx.contains(&request_tx_hash) {
            return Err(REVERT_ALREADY_HANDLED.to_string());
        }
        let threshold = bridge.thresholds[VOTE_TYPE_VALUE_TRANSFER as usize] as usize;
        let voters = bridge.votes.entry((request_nonce, digest)).or_default();
        if !voters.insert(ctx.from) || voters.len() < threshold {
            return Ok((Bytes::default(), vec![]));
        }
        bridge.votes.retain(|(nonce, _), _| *nonce != request_nonce);
        bridge.closed_votes.insert(request_nonce);
        bridge.handled_request_tx.insert(request_tx_hash);
        bridge
            .handle_nonces_to_block_nums
            .insert(request_nonce, request_block_number.max(1));
        bridge.update_handle_nonce(request_nonce);
        let lower_handle_nonce = bridge.lower_handle_nonce;

        match token_type {
            TokenType::Klay => {
                if self.balance(&bridge_address) < value {
                    return Err(REVERT_INSUFFICIENT_BRIDGE_BALANCE.to_string());
                }
                self.transfer(bridge_address, to, value)?;
            }
            TokenType::Erc20 => {
                *self.erc20_balances.entry((token_address, to)).or_default() += value;
            }
            TokenType::Erc721 => {
                self.nft_owners.insert((token_address, value), to);
                if let Some(uri) = args.get(7).cloned().and_then(Token::into_string) {
                    self.token_uris.insert((token_address, value), uri);
                }
            }
        }

        let event = HandleValueTransferEvent {
            request_tx_hash,
            token_type,
            from,
            to,
            token_address,
            value_or_token_id: value,
            handle_nonce: request_nonce,
            lower_handle_nonce,
            extra_data,
            raw: RawLogInfo::default(),
        };
        Ok((
            Bytes::default(),
            vec![crate::abi::encode_handle_log(bridge_address, &event)],
        ))
    }
}

#[derive(Default)]
struct ChainState {
    world: WorldState,
    blocks: Vec<Block>,
    logs: Vec<Log>,
    receipts: HashMap<H256, Receipt>,
    queued: BTreeMap<(Address, u64), Transaction>,
    sent: Vec<Transaction>,
    subscribers: Vec<(LogQuery, mpsc::Sender<Log>, CancellationToken)>,
    fail_sends: bool,
}

impl ChainState {
    fn head(&self) -> u64 {
        self.blocks.len() as u64 - 1
    }

    fn mine(&mut self, transactions: Vec<BlockTransaction>, mut receipts: Vec<Receipt>) -> u64 {
        let number = self.blocks.len() as u64;
        let parent_hash = self.blocks.last().map(Block::hash).unwrap_or_default();
        let hash = H256::from(keccak256(
            [parent_hash.as_bytes(), &number.to_be_bytes()[..]].concat(),
        ));
        let mut log_index = 0u64;
        for receipt in receipts.iter_mut() {
            receipt.block_number = number;
            for log in receipt.logs.iter_mut() {
                log.block_number = Some(U64::from(number));
                log.block_hash = Some(hash);
                log.transaction_hash = Some(receipt.tx_hash);
                log.log_index = Some(U256::from(log_index));
                log_index += 1;
                self.logs.push(log.clone());
                self.subscribers.retain(|(query, sender, cancel)| {
                    if cancel.is_cancelled() || sender.is_closed() {
                        return false;
                    }
                    if query.matches(log) {
                        let _ = sender.try_send(log.clone());
                    }
                    true
                });
            }
            self.receipts.insert(receipt.tx_hash, receipt.clone());
        }
        self.blocks.push(Block {
            header: BlockHeader {
                number,
                hash,
                parent_hash,
                transactions_root: H256::from(keccak256(hash.as_bytes())),
                ..Default::default()
            },
            transactions,
        });
        number
    }

    fn apply(&mut self, tx: Transaction) -> H256 {
        let hash = tx.hash();
        let nonce = self.world.nonces.entry(tx.from).or_default();
        *nonce += 1;
        let mut world = self.world.clone();
        let result = match tx.tx_type {
            TxType::ValueTransfer | TxType::FeeDelegatedValueTransfer => world
                .transfer(tx.from, tx.to.unwrap_or_default(), tx.value)
                .map(|_| (Bytes::default(), vec![])),
            TxType::SmartContractDeploy | TxType::FeeDelegatedSmartContractDeploy => {
                let address = get_contract_address(tx.from, tx.nonce);
                world
                    .bridges
                    .insert(address, BridgeContractState::new(tx.from));
                Ok((Bytes::default(), vec![]))
            }
            TxType::SmartContractExecution | TxType::FeeDelegatedSmartContractExecution => world
                .execute(CallContext {
                    from: tx.from,
                    to: tx.to.unwrap_or_default(),
                    value: tx.value,
                    input: &tx.input,
                }),
            TxType::ChainDataAnchoring | TxType::FeeDelegatedChainDataAnchoring => {
                Ok((Bytes::default(), vec![]))
            }
        };
        let mut receipt = Receipt {
            tx_hash: hash,
            gas_used: SIMULATED_GAS_USED,
            ..Default::default()
        };
        if matches!(
            tx.tx_type,
            TxType::SmartContractDeploy | TxType::FeeDelegatedSmartContractDeploy
        ) {
            receipt.contract_address = Some(get_contract_address(tx.from, tx.nonce));
        }
        match result {
            Ok((_, logs)) => {
                self.world = world;
                receipt.status = RECEIPT_STATUS_SUCCESSFUL;
                receipt.logs = logs;
            }
            Err(reason) => {
                receipt.status = RECEIPT_STATUS_FAILED;
                receipt.revert_reason = Some(reason);
            }
        }
        let block_tx = BlockTransaction {
            hash,
            tx_type: tx.tx_type.into(),
            input: tx.input.clone(),
        };
        self.sent.push(tx);
        self.mine(vec![block_tx], vec![receipt]);
        hash
    }
}

/// A single-node chain that mines one block per accepted transaction.
pub struct SimulatedChain {
    name: String,
    chain_id: u64,
    state: Mutex<ChainState>,
}

impl SimulatedChain {
    pub fn new(name: &str, chain_id: u64) -> Self {
        let mut state = ChainState::default();
        state.mine(vec![], vec![]);
        Self {
            name: name.to_string(),
            chain_id,
            state: Mutex::new(state),
        }
    }

    pub fn fund(&self, address: Address, amount: impl Into<U256>) {
        let mut state = self.state.lock().unwrap();
        *state.world.balances.entry(address).or_default() += amount.into();
    }

    pub fn balance(&self, address: Address) -> U256 {
        self.state.lock().unwrap().world.balance(&address)
    }

    pub fn erc20_balance(&self, token: Address, owner: Address) -> U256 {
        self.state
            .lock()
            .unwrap()
            .world
            .erc20_balances
            .get(&(token, owner))
            .copied()
            .unwrap_or_default()
    }

    pub fn nft_owner(&self, token: Address, id: U256) -> Option<Address> {
        self.state
            .lock()
            .unwrap()
            .world
            .nft_owners
            .get(&(token, id))
            .copied()
    }

    pub fn set_token_uri(&self, token: Address, id: U256, uri: &str) {
        self.state
            .lock()
            .unwrap()
            .world
            .token_uris
            .insert((token, id), uri.to_string());
    }

    pub fn bridge_state(&self, bridge: Address) -> Option<BridgeContractState> {
        self.state.lock().unwrap().world.bridges.get(&bridge).cloned()
    }

    /// Makes every following `send_transaction` fail as if the node were down.
    pub fn set_fail_sends(&self, fail: bool) {
        self.state.lock().unwrap().fail_sends = fail;
    }

    /// Every transaction accepted so far, in execution order.
    pub fn sent_transactions(&self) -> Vec<Transaction> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn head(&self) -> u64 {
        self.state.lock().unwrap().head()
    }

    /// Mines empty blocks.
    pub fn advance_blocks(&self, count: u64) -> u64 {
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            state.mine(vec![], vec![]);
        }
        state.head()
    }

    /// Mines one block holding `tx_count` value transfers nobody signed.
    pub fn mine_block_with_dummy_txs(&self, tx_count: usize) -> u64 {
        let mut state = self.state.lock().unwrap();
        let number = state.head() + 1;
        let transactions = (0..tx_count)
            .map(|i| BlockTransaction {
                hash: H256::from(keccak256(
                    [number.to_be_bytes(), (i as u64).to_be_bytes()].concat(),
                )),
                tx_type: TxType::ValueTransfer.into(),
                input: Bytes::default(),
            })
            .collect();
        state.mine(transactions, vec![])
    }

    /// Executes a call as `from` without a signature, the way a user wallet
    /// would, and mines it.
    pub fn execute_as(&self, from: Address, to: Address, value: U256, input: Bytes) -> Receipt {
        let mut state = self.state.lock().unwrap();
        let nonce = state.world.nonces.get(&from).copied().unwrap_or_default();
        let tx = Transaction::new(
            TxType::SmartContractExecution,
            from,
            nonce,
            Some(to),
            value,
            SIMULATED_ESTIMATED_GAS,
            U256::from(SIMULATED_GAS_PRICE),
            input,
        );
        let hash = state.apply(tx);
        state.receipts[&hash].clone()
    }

    /// `requestKLAYTransfer` by `from` on `bridge`.
    pub fn request_klay_transfer(
        &self,
        bridge: Address,
        from: Address,
        to: Address,
        value: U256,
    ) -> Receipt {
        let fee = self
            .bridge_state(bridge)
            .map(|b| b.fee_of_klay)
            .unwrap_or_default();
        let input = BridgeMethod::RequestKlayTransfer.encode_call(&[
            Token::Address(to),
            Token::Uint(value),
            Token::Bytes(vec![]),
        ]);
        self.execute_as(from, bridge, value + fee, input)
    }

    /// Mines a block carrying a request log for `event` on `bridge` and
    /// bumps the bridge's request nonce past it.
    pub fn emit_request_event(&self, bridge: Address, event: &RequestValueTransferEvent) -> Log {
        let mut state = self.state.lock().unwrap();
        if let Some(b) = state.world.bridges.get_mut(&bridge) {
            b.request_nonce = b.request_nonce.max(event.request_nonce() + 1);
        }
        let tx_hash = H256::from(keccak256(
            [bridge.as_bytes(), &event.request_nonce().to_be_bytes()[..]].concat(),
        ));
        let receipt = Receipt {
            tx_hash,
            status: RECEIPT_STATUS_SUCCESSFUL,
            logs: vec![crate::abi::encode_request_log(bridge, event)],
            ..Default::default()
        };
        let block_tx = BlockTransaction {
            hash: tx_hash,
            tx_type: TxType::SmartContractExecution.into(),
            input: Bytes::default(),
        };
        state.mine(vec![block_tx], vec![receipt]);
        state.logs.last().cloned().unwrap_or_default()
    }

    fn call(&self, msg: &CallMsg) -> BridgeResult<Bytes> {
        let to = msg
            .to
            .ok_or_else(|| BridgeError::Generic("call without recipient".to_string()))?;
        let mut world = self.state.lock().unwrap().world.clone();
        world
            .execute(CallContext {
                from: msg.from.unwrap_or_default(),
                to,
                value: msg.value,
                input: &msg.data,
            })
            .map(|(out, _)| out)
            .map_err(|reason| BridgeError::OnChainRevert(RevertInfo::new(Some(to), reason)))
    }
}

#[async_trait]
impl ChainBackend for SimulatedChain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chain_id(&self) -> BridgeResult<u64> {
        Ok(self.chain_id)
    }

    async fn current_block_number(&self) -> BridgeResult<u64> {
        Ok(self.head())
    }

    async fn block_by_number(&self, number: u64) -> BridgeResult<Option<Block>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .blocks
            .get(number as usize)
            .cloned())
    }

    async fn code_at(&self, address: Address) -> BridgeResult<Bytes> {
        let state = self.state.lock().unwrap();
        Ok(if state.world.bridges.contains_key(&address) {
            Bytes::from(vec![0x60, 0x80])
        } else {
            Bytes::default()
        })
    }

    async fn balance_at(&self, address: Address) -> BridgeResult<U256> {
        Ok(self.balance(address))
    }

    async fn pending_nonce_at(&self, address: Address) -> BridgeResult<u64> {
        let state = self.state.lock().unwrap();
        let mut nonce = state.world.nonces.get(&address).copied().unwrap_or_default();
        while state.queued.contains_key(&(address, nonce)) {
            nonce += 1;
        }
        Ok(nonce)
    }

    async fn suggest_gas_price(&self) -> BridgeResult<U256> {
        Ok(U256::from(SIMULATED_GAS_PRICE))
    }

    async fn call_contract(&self, msg: &CallMsg) -> BridgeResult<Bytes> {
        self.call(msg)
    }

    async fn estimate_gas(&self, msg: &CallMsg) -> BridgeResult<u64> {
        self.call(msg).map(|_| SIMULATED_ESTIMATED_GAS)
    }

    async fn send_transaction(&self, tx: &Transaction) -> BridgeResult<H256> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sends {
            return Err(BridgeError::Transport(format!(
                "[{}] simulated outage",
                self.name
            )));
        }
        tx.verify_signatures(self.chain_id)
            .map_err(|e| BridgeError::Transport(format!("invalid transaction: {}", e)))?;
        let hash = tx.hash();
        if state.receipts.contains_key(&hash) || state.queued.contains_key(&(tx.from, tx.nonce)) {
            return Err(BridgeError::KnownTx(hash));
        }
        let expected = state.world.nonces.get(&tx.from).copied().unwrap_or_default();
        if tx.nonce < expected {
            return Err(BridgeError::Transport(format!(
                "nonce too low: {} < {}",
                tx.nonce, expected
            )));
        }
        state.queued.insert((tx.from, tx.nonce), tx.clone());
        loop {
            let next = state.world.nonces.get(&tx.from).copied().unwrap_or_default();
            let Some(ready) = state.queued.remove(&(tx.from, next)) else {
                break;
            };
            state.apply(ready);
        }
        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: H256) -> BridgeResult<Option<Receipt>> {
        Ok(self.state.lock().unwrap().receipts.get(&hash).cloned())
    }

    async fn filter_logs(&self, query: &LogQuery) -> BridgeResult<Vec<Log>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .logs
            .iter()
            .filter(|log| query.matches(log))
            .cloned()
            .collect())
    }

    async fn subscribe_logs(&self, query: LogQuery) -> BridgeResult<LogSubscription> {
        let (sender, cancel, subscription) = LogSubscription::channel();
        self.state
            .lock()
            .unwrap()
            .subscribers
            .push((query, sender, cancel));
        Ok(subscription)
    }

    async fn raw_rpc(&self, payload: &[u8]) -> BridgeResult<Vec<u8>> {
        let request: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| BridgeError::Decode(format!("rpc payload: {}", e)))?;
        let id = request.get("id").cloned().unwrap_or_default();
        let response = match request.get("method").and_then(|m| m.as_str()) {
            Some("klay_blockNumber") => serde_json::json!({
                "jsonrpc": "2.0", "id": id, "result": U64::from(self.head()),
            }),
            Some("klay_chainID") => serde_json::json!({
                "jsonrpc": "2.0", "id": id, "result": U64::from(self.chain_id),
            }),
            _ => serde_json::json!({
                "jsonrpc": "2.0", "id": id,
                "error": { "code": -32601, "message": "method not found" },
            }),
        };
        serde_json::to_vec(&response).map_err(|e| BridgeError::Decode(e.to_string()))
    }
}

/// Decodes a `uint` view result returned by the simulated chain.
pub fn decode_view_u64(data: &[u8]) -> u64 {
    decode_single(ParamType::Uint(256), data)
        .ok()
        .and_then(Token::into_uint)
        .map(|v| v.low_u64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::{LocalWallet, Signer};

    const CHAIN_ID: u64 = 1000;

    fn signed(
        wallet: &LocalWallet,
        nonce: u64,
        tx_type: TxType,
        to: Option<Address>,
        input: Bytes,
    ) -> Transaction {
        let mut tx = Transaction::new(
            tx_type,
            wallet.address(),
            nonce,
            to,
            U256::zero(),
            SIMULATED_ESTIMATED_GAS,
            U256::from(SIMULATED_GAS_PRICE),
            input,
        );
        tx.sign_as_sender(wallet, CHAIN_ID).unwrap();
        tx
    }

    async fn deploy(chain: &SimulatedChain, owner: &LocalWallet) -> Address {
        let nonce = chain.pending_nonce_at(owner.address()).await.unwrap();
        let tx = signed(owner, nonce, TxType::SmartContractDeploy, None, Bytes::default());
        let hash = chain.send_transaction(&tx).await.unwrap();
        chain
            .transaction_receipt(hash)
            .await
            .unwrap()
            .unwrap()
            .contract_address
            .unwrap()
    }

    #[tokio::test]
    async fn test_future_nonce_is_queued_until_gap_closes() {
        let chain = SimulatedChain::new("child", CHAIN_ID);
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let to = Some(Address::repeat_byte(1));
        let later = signed(&wallet, 1, TxType::ValueTransfer, to, Bytes::default());
        chain.send_transaction(&later).await.unwrap();
        assert_eq!(chain.transaction_receipt(later.hash()).await.unwrap(), None);
        assert_eq!(chain.pending_nonce_at(wallet.address()).await.unwrap(), 0);

        let first = signed(&wallet, 0, TxType::ValueTransfer, to, Bytes::default());
        chain.send_transaction(&first).await.unwrap();
        assert!(chain.transaction_receipt(later.hash()).await.unwrap().is_some());
        assert_eq!(chain.pending_nonce_at(wallet.address()).await.unwrap(), 2);
        assert!(matches!(
            chain.send_transaction(&first).await,
            Err(BridgeError::KnownTx(_))
        ));
    }

    #[tokio::test]
    async fn test_request_emits_log_and_bumps_nonce() {
        let chain = SimulatedChain::new("child", CHAIN_ID);
        let owner = LocalWallet::new(&mut rand::thread_rng());
        let bridge = deploy(&chain, &owner).await;
        let alice = Address::repeat_byte(0xa1);
        chain.fund(alice, 1_000u64);

        let mut subscription = chain
            .subscribe_logs(LogQuery::new(vec![bridge], crate::abi::request_event_topics()))
            .await
            .unwrap();
        let receipt =
            chain.request_klay_transfer(bridge, alice, Address::repeat_byte(0xb0), U256::from(321));
        assert!(receipt.is_successful());
        assert_eq!(chain.bridge_state(bridge).unwrap().request_nonce, 1);
        assert_eq!(chain.balance(bridge), U256::from(321));

        let log = subscription.recv().await.unwrap();
        assert_eq!(log.transaction_hash, Some(receipt.tx_hash));
        let input = BridgeMethod::RequestNonce.encode_call(&[]);
        let out = chain
            .call_contract(&CallMsg::new(None, bridge, input))
            .await
            .unwrap();
        assert_eq!(decode_view_u64(&out), 1);
    }

    #[tokio::test]
    async fn test_reverted_call_reports_reason() {
        let chain = SimulatedChain::new("parent", CHAIN_ID);
        let owner = LocalWallet::new(&mut rand::thread_rng());
        let bridge = deploy(&chain, &owner).await;
        let input = BridgeMethod::RegisterOperator.encode_call(&[Token::Address(Address::zero())]);
        let err = chain
            .call_contract(&CallMsg::new(Some(Address::repeat_byte(7)), bridge, input))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BridgeError::OnChainRevert(RevertInfo::new(Some(bridge), REVERT_NOT_OWNER))
        );
    }
}
