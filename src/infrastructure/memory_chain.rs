//! 进程内 EVM 沙盒链
//!
//! 供 `memory://<name>` 端点使用：接收真实签名的原始交易，恢复发送方，
//! 校验 nonce 与余额，按 gas 上限 × 单价扣费，执行原生转账和 ERC-20
//! `transfer`，并生成带 Transfer 事件的收据。每笔交易单独出块。

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use ethers::{
    types::{
        Address, Bytes, Transaction, TransactionReceipt, H256, U256, U64,
    },
    utils::keccak256,
};

use crate::{
    error::{Result, WalletError},
    infrastructure::rpc_gateway::{ChainRpc, FeeData},
    service::erc20,
};

/// 沙盒链默认 chain id
pub const MEMORY_CHAIN_ID: u64 = 1337;

const NATIVE_TRANSFER_GAS: u64 = 21_000;

/// ERC-20 transfer 的模拟 gas 消耗
pub const TOKEN_TRANSFER_GAS: u64 = 65_000;

struct TokenLedger {
    decimals: u8,
    balances: HashMap<Address, U256>,
}

struct ChainState {
    balances: HashMap<Address, U256>,
    nonces: HashMap<Address, U256>,
    fee_data: FeeData,
    tokens: HashMap<Address, TokenLedger>,
    transactions: HashMap<H256, Transaction>,
    receipts: HashMap<H256, TransactionReceipt>,
    block_number: u64,
    failing_reads: u32,
    broadcast_allowance: Option<u32>,
    reverting_targets: HashSet<Address>,
    hold_receipts: bool,
}

pub struct MemoryChain {
    endpoint: String,
    chain_id: u64,
    state: Mutex<ChainState>,
}

impl MemoryChain {
    pub fn new(name: &str) -> Self {
        Self::with_chain_id(name, MEMORY_CHAIN_ID)
    }

    pub fn with_chain_id(name: &str, chain_id: u64) -> Self {
        Self {
            endpoint: format!("memory://{}", name),
            chain_id,
            state: Mutex::new(ChainState {
                balances: HashMap::new(),
                nonces: HashMap::new(),
                fee_data: FeeData::legacy(U256::exp10(9)),
                tokens: HashMap::new(),
                transactions: HashMap::new(),
                receipts: HashMap::new(),
                block_number: 0,
                failing_reads: 0,
                broadcast_allowance: None,
                reverting_targets: HashSet::new(),
                hold_receipts: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        // 状态只在同步代码中修改，中毒后继续使用内部数据
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── 测试与沙盒控制 ──

    pub fn fund(&self, address: Address, amount: U256) {
        let mut state = self.state();
        let balance = state.balances.entry(address).or_default();
        *balance = balance.saturating_add(amount);
    }

    pub fn native_balance(&self, address: Address) -> U256 {
        self.state().balances.get(&address).copied().unwrap_or_default()
    }

    pub fn set_fee_data(&self, fee_data: FeeData) {
        self.state().fee_data = fee_data;
    }

    pub fn deploy_token(&self, contract: Address, decimals: u8) {
        self.state().tokens.insert(
            contract,
            TokenLedger {
                decimals,
                balances: HashMap::new(),
            },
        );
    }

    pub fn mint_token(&self, contract: Address, holder: Address, amount: U256) {
        let mut state = self.state();
        if let Some(ledger) = state.tokens.get_mut(&contract) {
            let balance = ledger.balances.entry(holder).or_default();
            *balance = balance.saturating_add(amount);
        }
    }

    pub fn token_balance(&self, contract: Address, holder: Address) -> U256 {
        self.state()
            .tokens
            .get(&contract)
            .and_then(|t| t.balances.get(&holder).copied())
            .unwrap_or_default()
    }

    /// 接下来 n 次只读调用返回 `NetworkUnavailable`
    pub fn fail_next_reads(&self, n: u32) {
        self.state().failing_reads = n;
    }

    /// 再接受 n 笔广播，之后全部拒绝
    pub fn fail_broadcasts_after(&self, n: u32) {
        self.state().broadcast_allowance = Some(n);
    }

    /// 发往该地址的交易上链但执行失败 (status = 0)
    pub fn revert_calls_to(&self, target: Address) {
        self.state().reverting_targets.insert(target);
    }

    /// 交易进入内存池但不出块
    pub fn hold_receipts(&self, hold: bool) {
        self.state().hold_receipts = hold;
    }

    pub fn transaction_count(&self) -> usize {
        self.state().transactions.len()
    }

    fn check_read(&self) -> Result<()> {
        let mut state = self.state();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(WalletError::NetworkUnavailable(format!(
                "{}: injected read failure",
                self.endpoint
            )));
        }
        Ok(())
    }

    fn execute(&self, raw: &[u8]) -> Result<H256> {
        let tx: Transaction = ethers::utils::rlp::decode(raw)
            .map_err(|e| WalletError::InvalidArgument(format!("undecodable transaction: {}", e)))?;
        let hash = H256::from(keccak256(raw));

        if let Some(chain_id) = tx.chain_id {
            if chain_id != U256::from(self.chain_id) {
                return Err(WalletError::InvalidArgument(format!(
                    "chain id mismatch: {} != {}",
                    chain_id, self.chain_id
                )));
            }
        }

        let mut state = self.state();
        if let Some(remaining) = state.broadcast_allowance.as_mut() {
            if *remaining == 0 {
                return Err(WalletError::NetworkUnavailable(format!(
                    "{}: broadcast rejected",
                    self.endpoint
                )));
            }
            *remaining -= 1;
        }

        let from = tx.recover_from().map_err(|e| {
            WalletError::InvalidArgument(format!("invalid transaction signature: {}", e))
        })?;
        let expected_nonce = state.nonces.get(&from).copied().unwrap_or_default();
        if tx.nonce != expected_nonce {
            return Err(WalletError::InvalidArgument(format!(
                "nonce mismatch for {:?}: got {}, expected {}",
                from, tx.nonce, expected_nonce
            )));
        }

        let price = tx
            .gas_price
            .or(tx.max_fee_per_gas)
            .unwrap_or_default();
        let fee = tx.gas.saturating_mul(price);
        let balance = state.balances.get(&from).copied().unwrap_or_default();
        let upfront = fee.saturating_add(tx.value);
        if balance < upfront {
            return Err(WalletError::InvalidArgument(format!(
                "insufficient funds for gas * price + value: have {} want {}",
                balance, upfront
            )));
        }

        // 扣费后执行
        state.balances.insert(from, balance - fee);
        state.nonces.insert(from, expected_nonce + U256::one());
        state.block_number += 1;

        let to = tx.to.unwrap_or_default();
        let mut logs = Vec::new();
        let mut succeeded = !state.reverting_targets.contains(&to);

        if succeeded {
            if let Some(ledger) = state.tokens.get_mut(&to) {
                match erc20::decode_transfer_call(&tx.input) {
                    Some((recipient, amount)) => {
                        let held = ledger.balances.get(&from).copied().unwrap_or_default();
                        if held < amount {
                            succeeded = false;
                        } else {
                            ledger.balances.insert(from, held - amount);
                            let dest = ledger.balances.entry(recipient).or_default();
                            *dest = dest.saturating_add(amount);
                            logs.push(erc20::transfer_log(to, from, recipient, amount));
                        }
                    }
                    None => succeeded = false,
                }
            }
        }

        if succeeded && !tx.value.is_zero() {
            let sender = state.balances.get(&from).copied().unwrap_or_default();
            state.balances.insert(from, sender - tx.value);
            let dest = state.balances.entry(to).or_default();
            *dest = dest.saturating_add(tx.value);
        }

        let mined = !state.hold_receipts;
        let block_number = U64::from(state.block_number);
        let block_hash = H256::from(keccak256(block_number.as_u64().to_be_bytes()));

        let mut stored = tx.clone();
        stored.hash = hash;
        stored.from = from;
        if mined {
            stored.block_number = Some(block_number);
            stored.block_hash = Some(block_hash);
            stored.transaction_index = Some(U64::zero());

            for (i, log) in logs.iter_mut().enumerate() {
                log.block_number = Some(block_number);
                log.block_hash = Some(block_hash);
                log.transaction_hash = Some(hash);
                log.log_index = Some(U256::from(i));
            }

            let receipt = TransactionReceipt {
                transaction_hash: hash,
                transaction_index: U64::zero(),
                block_hash: Some(block_hash),
                block_number: Some(block_number),
                from,
                to: tx.to,
                cumulative_gas_used: tx.gas,
                gas_used: Some(tx.gas),
                logs,
                status: Some(U64::from(u64::from(succeeded))),
                transaction_type: tx.transaction_type,
                effective_gas_price: Some(price),
                ..Default::default()
            };
            state.receipts.insert(hash, receipt);
        }
        state.transactions.insert(hash, stored);

        Ok(hash)
    }

    fn token_call(&self, contract: Address, data: &[u8]) -> Result<Bytes> {
        let state = self.state();
        let Some(ledger) = state.tokens.get(&contract) else {
            // 调用普通账户返回空数据
            return Ok(Bytes::new());
        };
        if data.len() >= 4 && data[..4] == erc20::DECIMALS_SELECTOR {
            return Ok(erc20::encode_uint256(U256::from(ledger.decimals)));
        }
        if let Some(owner) = erc20::decode_balance_of_call(data) {
            let balance = ledger.balances.get(&owner).copied().unwrap_or_default();
            return Ok(erc20::encode_uint256(balance));
        }
        Err(WalletError::RpcRejected("execution reverted".into()))
    }
}

#[async_trait]
impl ChainRpc for MemoryChain {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn chain_id(&self) -> Result<u64> {
        self.check_read()?;
        Ok(self.chain_id)
    }

    async fn fee_data(&self) -> Result<FeeData> {
        self.check_read()?;
        Ok(self.state().fee_data.clone())
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        self.check_read()?;
        Ok(self.native_balance(address))
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        self.check_read()?;
        self.token_call(to, &data)
    }

    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        _value: U256,
        data: Bytes,
    ) -> Result<U256> {
        self.check_read()?;
        if data.is_empty() {
            return Ok(U256::from(NATIVE_TRANSFER_GAS));
        }
        let state = self.state();
        if let Some(ledger) = state.tokens.get(&to) {
            // 与节点一致：模拟执行失败时 eth_estimateGas 返回回滚错误
            let Some((_, amount)) = erc20::decode_transfer_call(&data) else {
                return Err(WalletError::RpcRejected("execution reverted".into()));
            };
            let held = ledger.balances.get(&from).copied().unwrap_or_default();
            if held < amount {
                return Err(WalletError::RpcRejected(
                    "execution reverted: ERC20: transfer amount exceeds balance".into(),
                ));
            }
            return Ok(U256::from(TOKEN_TRANSFER_GAS));
        }
        Ok(U256::from(NATIVE_TRANSFER_GAS + 16 * data.len() as u64))
    }

    async fn pending_nonce(&self, address: Address) -> Result<U256> {
        self.check_read()?;
        Ok(self.state().nonces.get(&address).copied().unwrap_or_default())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256> {
        let hash = self.execute(&raw)?;
        tracing::debug!(endpoint = %self.endpoint, tx_hash = ?hash, "memory chain accepted transaction");
        Ok(hash)
    }

    async fn transaction(&self, hash: H256) -> Result<Option<Transaction>> {
        self.check_read()?;
        Ok(self.state().transactions.get(&hash).cloned())
    }

    async fn receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>> {
        self.check_read()?;
        Ok(self.state().receipts.get(&hash).cloned())
    }
}

#[cfg(test)]
mod tests {
    use ethers::{
        signers::{LocalWallet, Signer},
        types::{
            transaction::eip2718::TypedTransaction, Eip1559TransactionRequest, TransactionRequest,
        },
    };

    use super::*;

    fn wallet() -> LocalWallet {
        // 固定测试私钥
        "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
            .parse::<LocalWallet>()
            .unwrap()
            .with_chain_id(MEMORY_CHAIN_ID)
    }

    fn signed(wallet: &LocalWallet, tx: TransactionRequest) -> Bytes {
        let tx: TypedTransaction = tx.chain_id(MEMORY_CHAIN_ID).into();
        let sig = wallet.sign_transaction_sync(&tx).unwrap();
        tx.rlp_signed(&sig)
    }

    #[tokio::test]
    async fn test_native_transfer_moves_value_and_charges_gas() {
        let chain = MemoryChain::new("t1");
        let wallet = wallet();
        let to = Address::repeat_byte(0x22);
        chain.fund(wallet.address(), U256::exp10(18));

        let raw = signed(
            &wallet,
            TransactionRequest::new()
                .from(wallet.address())
                .to(to)
                .value(1000u64)
                .gas(21_000u64)
                .gas_price(10u64)
                .nonce(0u64),
        );
        let hash = chain.send_raw_transaction(raw).await.unwrap();

        assert_eq!(chain.native_balance(to), U256::from(1000u64));
        assert_eq!(
            chain.native_balance(wallet.address()),
            U256::exp10(18) - U256::from(1000u64 + 210_000u64)
        );
        let receipt = chain.receipt(hash).await.unwrap().unwrap();
        assert_eq!(receipt.status, Some(U64::one()));
        assert_eq!(chain.transaction(hash).await.unwrap().unwrap().from, wallet.address());
    }

    #[tokio::test]
    async fn test_nonce_replay_rejected() {
        let chain = MemoryChain::new("t2");
        let wallet = wallet();
        chain.fund(wallet.address(), U256::exp10(18));
        let tx = TransactionRequest::new()
            .from(wallet.address())
            .to(Address::repeat_byte(0x33))
            .value(1u64)
            .gas(21_000u64)
            .gas_price(1u64)
            .nonce(0u64);
        chain.send_raw_transaction(signed(&wallet, tx.clone())).await.unwrap();
        assert!(chain.send_raw_transaction(signed(&wallet, tx)).await.is_err());
    }

    #[tokio::test]
    async fn test_eip1559_sender_is_recovered_from_signature() {
        let chain = MemoryChain::new("t4");
        let wallet = wallet();
        let to = Address::repeat_byte(0x44);
        chain.fund(wallet.address(), U256::exp10(18));

        let tx: TypedTransaction = Eip1559TransactionRequest::new()
            .from(wallet.address())
            .to(to)
            .value(5u64)
            .gas(21_000u64)
            .max_fee_per_gas(20u64)
            .max_priority_fee_per_gas(2u64)
            .nonce(0u64)
            .chain_id(MEMORY_CHAIN_ID)
            .into();
        let sig = wallet.sign_transaction_sync(&tx).unwrap();
        let hash = chain.send_raw_transaction(tx.rlp_signed(&sig)).await.unwrap();

        let stored = chain.transaction(hash).await.unwrap().unwrap();
        assert_eq!(stored.from, wallet.address());
        assert_eq!(chain.receipt(hash).await.unwrap().unwrap().from, wallet.address());
        assert_eq!(
            chain.native_balance(wallet.address()),
            U256::exp10(18) - U256::from(5u64 + 21_000u64 * 20)
        );
        assert_eq!(chain.pending_nonce(wallet.address()).await.unwrap(), U256::one());
        assert!(chain.native_balance(Address::zero()).is_zero());
    }

    #[tokio::test]
    async fn test_estimate_gas_reverts_on_short_token_balance() {
        let chain = MemoryChain::new("t5");
        let token = Address::repeat_byte(0xaa);
        let holder = Address::repeat_byte(0x01);
        let to = Address::repeat_byte(0x02);
        chain.deploy_token(token, 6);
        chain.mint_token(token, holder, U256::from(100u64));

        let gas = chain
            .estimate_gas(holder, token, U256::zero(), erc20::encode_transfer(to, U256::from(100u64)))
            .await
            .unwrap();
        assert_eq!(gas, U256::from(TOKEN_TRANSFER_GAS));

        let err = chain
            .estimate_gas(holder, token, U256::zero(), erc20::encode_transfer(to, U256::from(101u64)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "rpc_rejected");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_token_balance_call() {
        let chain = MemoryChain::new("t3");
        let token = Address::repeat_byte(0xaa);
        let holder = Address::repeat_byte(0x01);
        chain.deploy_token(token, 6);
        chain.mint_token(token, holder, U256::from(5_000_000u64));

        let raw = chain.call(token, erc20::encode_balance_of(holder)).await.unwrap();
        assert_eq!(erc20::decode_uint256(&raw).unwrap(), U256::from(5_000_000u64));
        let raw = chain.call(token, erc20::encode_decimals()).await.unwrap();
        assert_eq!(erc20::decode_decimals(&raw).unwrap(), 6);
    }
}
