// 余额查询服务
//
// 原生币使用币种配置中的精度；代币精度以合约 decimals() 为准。

use std::sync::Arc;

use ethers::types::{Address, U256};

use crate::{
    domain::{
        address::parse_evm_address,
        currency::{CurrencyDirectory, SmartContract},
        units::format_base_units,
    },
    error::{Result, WalletError},
    infrastructure::{log_redact::redact_evm_address, rpc_gateway::RpcGateway},
    service::erc20,
};

pub struct BalanceReader {
    gateway: Arc<RpcGateway>,
    currencies: Arc<CurrencyDirectory>,
}

impl BalanceReader {
    pub fn new(gateway: Arc<RpcGateway>, currencies: Arc<CurrencyDirectory>) -> Self {
        Self {
            gateway,
            currencies,
        }
    }

    fn ensure_evm(&self, network: &str) -> Result<()> {
        let network = self.currencies.network(network)?;
        if !network.class.is_evm() {
            return Err(WalletError::UnsupportedNetwork(format!(
                "balance queries are EVM only: {}",
                network
            )));
        }
        Ok(())
    }

    /// 原生币余额（wei）
    pub async fn native_balance_base_units(&self, address: Address, network: &str) -> Result<U256> {
        self.ensure_evm(network)?;
        let native = self.currencies.native_for(network)?;
        let client = self.gateway.client(&native.rpc_url).await?;
        let balance = client.balance(address).await?;

        tracing::debug!(
            network = %native.network.name,
            address = %redact_evm_address(&address),
            balance_wei = %balance,
            "native balance fetched"
        );
        Ok(balance)
    }

    /// 原生币余额（十进制字符串）
    pub async fn native_balance(&self, address: &str, network: &str) -> Result<String> {
        let address = parse_evm_address("address", address)?;
        let native = self.currencies.native_for(network)?;
        let balance = self.native_balance_base_units(address, network).await?;
        format_base_units(balance, native.decimals)
    }

    /// 合约 decimals()
    pub async fn token_decimals(&self, token: Address, network: &str) -> Result<u32> {
        self.ensure_evm(network)?;
        let route = self.currencies.route_for(network)?;
        let client = self.gateway.client(&route.rpc_url).await?;
        let raw = client.call(token, erc20::encode_decimals()).await?;
        erc20::decode_decimals(&raw)
    }

    /// 代币余额（最小单位）及合约精度
    pub async fn token_balance_base_units(
        &self,
        address: Address,
        token: Address,
        network: &str,
    ) -> Result<(U256, u32)> {
        self.ensure_evm(network)?;
        let route = self.currencies.route_for(network)?;
        let client = self.gateway.client(&route.rpc_url).await?;

        let raw = client.call(token, erc20::encode_balance_of(address)).await?;
        let balance = erc20::decode_uint256(&raw)?;
        let decimals = self.token_decimals(token, network).await?;

        tracing::debug!(
            network = %route.network.name,
            token = %redact_evm_address(&token),
            address = %redact_evm_address(&address),
            balance = %balance,
            decimals,
            "token balance fetched"
        );
        Ok((balance, decimals))
    }

    /// 代币余额（按合约精度格式化）
    pub async fn token_balance(
        &self,
        address: &str,
        token_contract: &str,
        network: &str,
    ) -> Result<String> {
        let address = parse_evm_address("address", address)?;
        let token = parse_evm_address("token_contract", token_contract)?;
        let (balance, decimals) = self.token_balance_base_units(address, token, network).await?;
        format_base_units(balance, decimals)
    }

    /// 按币种 id 分派
    pub async fn balance_of(&self, address: &str, currency_id: &str) -> Result<String> {
        let currency = self.currencies.get(currency_id)?;
        match currency.contract {
            SmartContract::Native => self.native_balance(address, &currency.network.name).await,
            SmartContract::Token(token) => {
                let owner = parse_evm_address("address", address)?;
                let (balance, decimals) = self
                    .token_balance_base_units(owner, token, &currency.network.name)
                    .await?;
                format_base_units(balance, decimals)
            }
        }
    }
}
