// 手续费估算服务
//
// 每次估算只查询一次费率数据：
// - 节点返回 gas_price ⇒ legacy，单价 = gas_price
// - 否则 EIP-1559，单价 = max_fee > 0 ? min(max_fee, base + tip) : base + tip
// 总费用 = gas_limit × 单价 × 交易笔数

use std::sync::Arc;

use ethers::types::U256;
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        currency::{CurrencyConfig, CurrencyDirectory},
        units::{format_base_units, NATIVE_DECIMALS},
    },
    error::{Result, WalletError},
    infrastructure::rpc_gateway::{FeeData, RpcGateway},
};

/// 原生币转账的固定 gas 上限
pub const NATIVE_TRANSFER_GAS_LIMIT: u64 = 21_000;

/// 手续费报价（全部为 wei）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeQuote {
    pub gas_limit_per_tx: U256,
    pub fee_per_gas_wei: U256,
    pub total_wei: U256,
    pub is_eip1559: bool,
    pub max_priority_fee_per_gas: Option<U256>,
    pub tx_count: usize,
}

impl FeeQuote {
    /// 由节点费率数据计算报价（纯函数）
    pub fn from_fee_data(data: &FeeData, gas_limit: U256, tx_count: usize) -> Result<Self> {
        if tx_count == 0 {
            return Err(WalletError::InvalidArgument(
                "transaction count must be positive".into(),
            ));
        }

        let (fee_per_gas, is_eip1559, priority) = match data.gas_price {
            Some(gas_price) => (gas_price, false, None),
            None => {
                if data.base_fee_per_gas.is_none() && data.max_fee_per_gas.is_none() {
                    return Err(WalletError::NetworkUnavailable(
                        "node returned no fee data".into(),
                    ));
                }
                let base = data.base_fee_per_gas.unwrap_or_default();
                let tip = data.max_priority_fee_per_gas.unwrap_or_default();
                let sum = base.saturating_add(tip);
                let fee = match data.max_fee_per_gas {
                    Some(max_fee) if !max_fee.is_zero() => max_fee.min(sum),
                    _ => sum,
                };
                (fee, true, Some(tip.min(fee)))
            }
        };

        let total = gas_limit
            .checked_mul(fee_per_gas)
            .and_then(|per_tx| per_tx.checked_mul(U256::from(tx_count)))
            .ok_or_else(|| WalletError::InvalidArgument("fee total overflows".into()))?;

        Ok(Self {
            gas_limit_per_tx: gas_limit,
            fee_per_gas_wei: fee_per_gas,
            total_wei: total,
            is_eip1559,
            max_priority_fee_per_gas: priority,
            tx_count,
        })
    }

    /// 单笔交易的费用
    pub fn per_tx_wei(&self) -> U256 {
        self.gas_limit_per_tx.saturating_mul(self.fee_per_gas_wei)
    }

    /// 总费用（原生币十进制字符串）
    pub fn total_native(&self) -> Result<String> {
        format_base_units(self.total_wei, NATIVE_DECIMALS)
    }
}

pub struct FeeEstimator {
    gateway: Arc<RpcGateway>,
    currencies: Arc<CurrencyDirectory>,
}

impl FeeEstimator {
    pub fn new(gateway: Arc<RpcGateway>, currencies: Arc<CurrencyDirectory>) -> Self {
        Self {
            gateway,
            currencies,
        }
    }

    fn evm_currency(&self, currency_id: &str) -> Result<&CurrencyConfig> {
        let currency = self.currencies.get(currency_id)?;
        if !currency.network_class().is_evm() {
            return Err(WalletError::UnsupportedNetwork(format!(
                "fee estimation is EVM only: {}",
                currency.network
            )));
        }
        Ok(currency)
    }

    /// 原生币转账报价（gas 上限 21000）
    pub async fn estimate(&self, currency_id: &str, tx_count: usize) -> Result<FeeQuote> {
        self.estimate_with_gas_limit(currency_id, U256::from(NATIVE_TRANSFER_GAS_LIMIT), tx_count)
            .await
    }

    /// 指定 gas 上限的报价（代币转账使用 eth_estimateGas 的结果）
    pub async fn estimate_with_gas_limit(
        &self,
        currency_id: &str,
        gas_limit: U256,
        tx_count: usize,
    ) -> Result<FeeQuote> {
        if tx_count == 0 {
            return Err(WalletError::InvalidArgument(
                "transaction count must be positive".into(),
            ));
        }
        let currency = self.evm_currency(currency_id)?;
        let client = self.gateway.client(&currency.rpc_url).await?;
        let fee_data = client.fee_data().await?;
        let quote = FeeQuote::from_fee_data(&fee_data, gas_limit, tx_count)?;

        tracing::debug!(
            currency = %currency.id,
            network = %currency.network.name,
            is_eip1559 = quote.is_eip1559,
            fee_per_gas_wei = %quote.fee_per_gas_wei,
            tx_count,
            total_wei = %quote.total_wei,
            "fee estimated"
        );
        Ok(quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gwei(n: u64) -> U256 {
        U256::from(n) * U256::exp10(9)
    }

    #[test]
    fn test_legacy_when_gas_price_present() {
        let quote =
            FeeQuote::from_fee_data(&FeeData::legacy(gwei(5)), U256::from(21_000u64), 2).unwrap();
        assert!(!quote.is_eip1559);
        assert_eq!(quote.fee_per_gas_wei, gwei(5));
        assert_eq!(quote.total_wei, U256::from(210_000_000_000_000u64));
    }

    #[test]
    fn test_dual_component_uses_min_of_max_fee_and_sum() {
        let data = FeeData {
            gas_price: None,
            base_fee_per_gas: Some(gwei(10)),
            max_fee_per_gas: Some(gwei(11)),
            max_priority_fee_per_gas: Some(gwei(2)),
        };
        let quote = FeeQuote::from_fee_data(&data, U256::from(21_000u64), 1).unwrap();
        assert!(quote.is_eip1559);
        assert_eq!(quote.fee_per_gas_wei, gwei(11));
        assert_eq!(quote.max_priority_fee_per_gas, Some(gwei(2)));

        let data = FeeData {
            max_fee_per_gas: Some(U256::zero()),
            ..data
        };
        let quote = FeeQuote::from_fee_data(&data, U256::from(21_000u64), 1).unwrap();
        assert_eq!(quote.fee_per_gas_wei, gwei(12));
    }

    #[test]
    fn test_zero_tx_count_rejected() {
        let err = FeeQuote::from_fee_data(&FeeData::legacy(gwei(1)), U256::from(21_000u64), 0)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }

    #[test]
    fn test_empty_fee_data_rejected() {
        assert!(FeeQuote::from_fee_data(&FeeData::default(), U256::from(21_000u64), 1).is_err());
    }

    #[test]
    fn test_total_native_formatting() {
        let quote =
            FeeQuote::from_fee_data(&FeeData::legacy(gwei(5)), U256::from(21_000u64), 2).unwrap();
        assert_eq!(quote.total_native().unwrap(), "0.00021");
        assert_eq!(quote.per_tx_wei(), U256::from(105_000_000_000_000u64));
    }
}
