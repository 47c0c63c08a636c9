//! 转账构建器
//!
//! 流程：手续费报价 → 余额校验 → 构造并签名 → 广播 → （可选）等待收据。
//! 余额不足在广播前返回 `InsufficientFunds`，不会发出任何交易。
//! 金额全部为十进制字符串，按币种精度换算为 `U256`，不使用浮点数。

use std::{sync::Arc, time::Duration};

use ethers::{
    signers::{LocalWallet, Signer},
    types::{
        transaction::eip2718::TypedTransaction, Address, Bytes, Eip1559TransactionRequest,
        TransactionReceipt, TransactionRequest, H256, U256, U64,
    },
};
use serde::{Deserialize, Serialize};

use crate::{
    config::RpcConfig,
    domain::{
        address::parse_evm_address,
        currency::{CurrencyConfig, CurrencyDirectory, SmartContract},
        units::{format_base_units, parse_base_units},
    },
    error::{Result, WalletError},
    infrastructure::{
        log_redact::redact_evm_address,
        rpc_gateway::{ChainRpc, RpcGateway},
    },
    service::{
        balance_reader::BalanceReader,
        erc20,
        fee_estimator::{FeeEstimator, FeeQuote},
        transaction_inspector::wait_for_receipt,
    },
};

/// 拆分转账的一个输出
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferOutput {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub amount: String,
}

impl TransferOutput {
    pub fn new(to: impl Into<String>, amount: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            amount: amount.into(),
        }
    }
}

/// 单笔转账结果（已确认）
#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    pub currency: String,
    pub from: String,
    pub to: String,
    pub amount: String,
    pub amount_base_units: U256,
    pub tx_hash: H256,
    pub nonce: U256,
    pub fee: FeeQuote,
    pub receipt: TransactionReceipt,
}

/// 拆分转账中单个输出的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    /// 已广播，未等待收据
    Sent,
    Confirmed,
    /// 已上链但执行失败
    Reverted,
    /// 广播失败
    Failed,
    /// 前面的输出失败，未发送
    NotAttempted,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputOutcome {
    pub to: String,
    pub amount: String,
    pub amount_base_units: U256,
    pub status: OutputStatus,
    pub tx_hash: Option<H256>,
    pub nonce: Option<U256>,
    pub receipt: Option<TransactionReceipt>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SplitTransferResult {
    pub currency: String,
    pub from: String,
    pub total_out: String,
    pub total_out_base_units: U256,
    pub required_base_units: U256,
    pub fee: FeeQuote,
    pub outputs: Vec<OutputOutcome>,
}

impl SplitTransferResult {
    pub fn all_succeeded(&self) -> bool {
        self.outputs
            .iter()
            .all(|o| matches!(o.status, OutputStatus::Sent | OutputStatus::Confirmed))
    }

    pub fn tx_hashes(&self) -> Vec<H256> {
        self.outputs.iter().filter_map(|o| o.tx_hash).collect()
    }
}

struct ParsedOutput {
    to: Address,
    to_display: String,
    amount: String,
    value: U256,
}

fn receipt_succeeded(receipt: &TransactionReceipt) -> bool {
    receipt.status.map_or(true, |s| s == U64::one())
}

/// 按报价构造交易：legacy 使用 gasPrice，EIP-1559 使用 maxFee = 单价
pub fn build_transaction(
    from: Address,
    to: Address,
    value: U256,
    data: Bytes,
    nonce: U256,
    chain_id: u64,
    fee: &FeeQuote,
) -> TypedTransaction {
    if fee.is_eip1559 {
        let tip = fee
            .max_priority_fee_per_gas
            .unwrap_or_default()
            .min(fee.fee_per_gas_wei);
        Eip1559TransactionRequest::new()
            .from(from)
            .to(to)
            .value(value)
            .data(data)
            .nonce(nonce)
            .gas(fee.gas_limit_per_tx)
            .max_fee_per_gas(fee.fee_per_gas_wei)
            .max_priority_fee_per_gas(tip)
            .chain_id(chain_id)
            .into()
    } else {
        TransactionRequest::new()
            .from(from)
            .to(to)
            .value(value)
            .data(data)
            .nonce(nonce)
            .gas(fee.gas_limit_per_tx)
            .gas_price(fee.fee_per_gas_wei)
            .chain_id(chain_id)
            .into()
    }
}

pub struct TransferBuilder {
    gateway: Arc<RpcGateway>,
    currencies: Arc<CurrencyDirectory>,
    fees: Arc<FeeEstimator>,
    balances: Arc<BalanceReader>,
    poll_interval: Duration,
    receipt_timeout: Duration,
}

impl TransferBuilder {
    pub fn new(
        gateway: Arc<RpcGateway>,
        currencies: Arc<CurrencyDirectory>,
        fees: Arc<FeeEstimator>,
        balances: Arc<BalanceReader>,
        rpc: &RpcConfig,
    ) -> Self {
        Self {
            gateway,
            currencies,
            fees,
            balances,
            poll_interval: Duration::from_millis(rpc.receipt_poll_interval_ms),
            receipt_timeout: Duration::from_secs(rpc.receipt_timeout_secs),
        }
    }

    fn evm_currency(&self, currency_id: &str) -> Result<&CurrencyConfig> {
        let currency = self.currencies.get(currency_id)?;
        if !currency.network_class().is_evm() {
            return Err(WalletError::UnsupportedNetwork(format!(
                "transfers are EVM only: {}",
                currency.network
            )));
        }
        Ok(currency)
    }

    fn parse_amount(field: &str, amount: &str, decimals: u32) -> Result<U256> {
        if amount.trim().is_empty() {
            return Err(WalletError::MissingField(field.to_string()));
        }
        let value = parse_base_units(amount, decimals)?;
        if value.is_zero() {
            return Err(WalletError::InvalidArgument(format!(
                "{} must be positive",
                field
            )));
        }
        Ok(value)
    }

    async fn chain_signer(
        &self,
        client: &dyn ChainRpc,
        signer: &LocalWallet,
    ) -> Result<(LocalWallet, u64)> {
        let chain_id = client.chain_id().await?;
        Ok((signer.clone().with_chain_id(chain_id), chain_id))
    }

    async fn sign_and_send(
        &self,
        client: &dyn ChainRpc,
        wallet: &LocalWallet,
        tx: &TypedTransaction,
    ) -> Result<H256> {
        let signature = wallet
            .sign_transaction_sync(tx)
            .map_err(|e| WalletError::InvalidKey(format!("sign transaction: {}", e)))?;
        client.send_raw_transaction(tx.rlp_signed(&signature)).await
    }

    /// 单笔转账（原生币或 ERC-20），等待确认后返回收据
    pub async fn single_transfer(
        &self,
        signer: &LocalWallet,
        currency_id: &str,
        from: &str,
        to: &str,
        amount: &str,
    ) -> Result<TransferResult> {
        let currency = self.evm_currency(currency_id)?;
        let from_addr = parse_evm_address("from", from)?;
        let to_addr = parse_evm_address("to", to)?;
        if from_addr != signer.address() {
            return Err(WalletError::InvalidArgument(
                "from address does not match signing key".into(),
            ));
        }
        let value = Self::parse_amount("amount", amount, currency.decimals)?;

        let client = self.gateway.client(&currency.rpc_url).await?;
        let (wallet, chain_id) = self.chain_signer(client.as_ref(), signer).await?;
        let network = currency.network.name.as_str();

        let (tx_to, tx_value, data, fee) = match currency.contract {
            SmartContract::Native => {
                let fee = self.fees.estimate(&currency.id, 1).await?;
                let balance = self.balances.native_balance_base_units(from_addr, network).await?;
                let required = value
                    .checked_add(fee.total_wei)
                    .ok_or_else(|| WalletError::InvalidArgument("amount overflows".into()))?;
                if balance < required {
                    return Err(WalletError::insufficient(required, balance));
                }
                (to_addr, value, Bytes::new(), fee)
            }
            SmartContract::Token(token) => {
                // 先查代币余额，余额不足时节点的 eth_estimateGas 会直接回滚
                let (token_balance, _) = self
                    .balances
                    .token_balance_base_units(from_addr, token, network)
                    .await?;
                if token_balance < value {
                    return Err(WalletError::insufficient(value, token_balance));
                }

                let data = erc20::encode_transfer(to_addr, value);
                let gas = client
                    .estimate_gas(from_addr, token, U256::zero(), data.clone())
                    .await?;
                let fee = self.fees.estimate_with_gas_limit(&currency.id, gas, 1).await?;

                let native = self.balances.native_balance_base_units(from_addr, network).await?;
                if native < fee.total_wei {
                    return Err(WalletError::insufficient(fee.total_wei, native));
                }
                (token, U256::zero(), data, fee)
            }
        };

        let nonce = client.pending_nonce(from_addr).await?;
        let tx = build_transaction(from_addr, tx_to, tx_value, data, nonce, chain_id, &fee);
        let tx_hash = self.sign_and_send(client.as_ref(), &wallet, &tx).await?;

        tracing::info!(
            currency = %currency.id,
            tx_hash = ?tx_hash,
            nonce = %nonce,
            to = %redact_evm_address(&to_addr),
            amount = %amount,
            is_eip1559 = fee.is_eip1559,
            "transfer broadcast"
        );

        let receipt =
            wait_for_receipt(client.as_ref(), tx_hash, self.poll_interval, self.receipt_timeout)
                .await?;
        if !receipt_succeeded(&receipt) {
            tracing::warn!(tx_hash = ?tx_hash, "transfer reverted");
            return Err(WalletError::TransactionReverted(format!("{:?}", tx_hash)));
        }

        Ok(TransferResult {
            currency: currency.id.clone(),
            from: ethers::utils::to_checksum(&from_addr, None),
            to: ethers::utils::to_checksum(&to_addr, None),
            amount: format_base_units(value, currency.decimals)?,
            amount_base_units: value,
            tx_hash,
            nonce,
            fee,
            receipt,
        })
    }

    fn parse_outputs(outputs: &[TransferOutput], decimals: u32) -> Result<Vec<ParsedOutput>> {
        if outputs.is_empty() {
            return Err(WalletError::MissingField("outputs".into()));
        }
        outputs
            .iter()
            .enumerate()
            .map(|(i, output)| -> Result<ParsedOutput> {
                let to = parse_evm_address(&format!("outputs[{}].to", i), &output.to)?;
                let value =
                    Self::parse_amount(&format!("outputs[{}].amount", i), &output.amount, decimals)?;
                Ok(ParsedOutput {
                    to,
                    to_display: ethers::utils::to_checksum(&to, None),
                    amount: format_base_units(value, decimals)?,
                    value,
                })
            })
            .collect()
    }

    /// 原生币拆分转账：一次报价、一次余额校验，按顺序逐笔发送
    ///
    /// 校验失败返回错误且不发送任何交易；发送开始后，第一笔失败的输出之后的
    /// 输出标记为 `NotAttempted`。
    pub async fn split_native_transfer(
        &self,
        signer: &LocalWallet,
        currency_id: &str,
        outputs: &[TransferOutput],
        wait_for_receipts: bool,
    ) -> Result<SplitTransferResult> {
        let currency = self.evm_currency(currency_id)?;
        if currency.is_token() {
            return Err(WalletError::InvalidArgument(format!(
                "split transfers support native currency only, got {}",
                currency.id
            )));
        }
        let parsed = Self::parse_outputs(outputs, currency.decimals)?;

        let total_out = parsed
            .iter()
            .try_fold(U256::zero(), |acc, o| acc.checked_add(o.value))
            .ok_or_else(|| WalletError::InvalidArgument("output total overflows".into()))?;

        let from_addr = signer.address();
        let client = self.gateway.client(&currency.rpc_url).await?;
        let (wallet, chain_id) = self.chain_signer(client.as_ref(), signer).await?;

        let fee = self.fees.estimate(&currency.id, parsed.len()).await?;
        let balance = self
            .balances
            .native_balance_base_units(from_addr, &currency.network.name)
            .await?;
        let required = total_out
            .checked_add(fee.total_wei)
            .ok_or_else(|| WalletError::InvalidArgument("required total overflows".into()))?;
        if balance < required {
            return Err(WalletError::insufficient(required, balance));
        }

        let base_nonce = client.pending_nonce(from_addr).await?;
        let mut outcomes = Vec::with_capacity(parsed.len());
        let mut halted = false;

        for (i, output) in parsed.iter().enumerate() {
            let mut outcome = OutputOutcome {
                to: output.to_display.clone(),
                amount: output.amount.clone(),
                amount_base_units: output.value,
                status: OutputStatus::NotAttempted,
                tx_hash: None,
                nonce: None,
                receipt: None,
                error: None,
            };
            if halted {
                outcomes.push(outcome);
                continue;
            }

            let nonce = base_nonce + U256::from(i);
            let tx = build_transaction(
                from_addr,
                output.to,
                output.value,
                Bytes::new(),
                nonce,
                chain_id,
                &fee,
            );
            outcome.nonce = Some(nonce);

            match self.sign_and_send(client.as_ref(), &wallet, &tx).await {
                Ok(tx_hash) => {
                    outcome.tx_hash = Some(tx_hash);
                    outcome.status = OutputStatus::Sent;
                    tracing::info!(
                        currency = %currency.id,
                        output = i,
                        tx_hash = ?tx_hash,
                        nonce = %nonce,
                        to = %redact_evm_address(&output.to),
                        "split output broadcast"
                    );

                    if wait_for_receipts {
                        match wait_for_receipt(
                            client.as_ref(),
                            tx_hash,
                            self.poll_interval,
                            self.receipt_timeout,
                        )
                        .await
                        {
                            Ok(receipt) => {
                                if receipt_succeeded(&receipt) {
                                    outcome.status = OutputStatus::Confirmed;
                                } else {
                                    outcome.status = OutputStatus::Reverted;
                                    outcome.error = Some("execution reverted".into());
                                    halted = true;
                                }
                                outcome.receipt = Some(receipt);
                            }
                            Err(e) => {
                                outcome.error = Some(e.to_string());
                                halted = true;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        currency = %currency.id,
                        output = i,
                        error = %e,
                        "split output failed, halting remaining outputs"
                    );
                    outcome.status = OutputStatus::Failed;
                    outcome.error = Some(e.to_string());
                    halted = true;
                }
            }
            outcomes.push(outcome);
        }

        Ok(SplitTransferResult {
            currency: currency.id.clone(),
            from: ethers::utils::to_checksum(&from_addr, None),
            total_out: format_base_units(total_out, currency.decimals)?,
            total_out_base_units: total_out,
            required_base_units: required,
            fee,
            outputs: outcomes,
        })
    }
}
