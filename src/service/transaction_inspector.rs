// 交易查询与收据等待

use std::{str::FromStr, sync::Arc, time::Duration};

use ethers::types::{Transaction, TransactionReceipt, H256};

use crate::{
    config::RpcConfig,
    domain::currency::{CurrencyConfig, CurrencyDirectory},
    error::{Result, WalletError},
    infrastructure::rpc_gateway::{ChainRpc, RpcGateway},
    service::erc20::{self, TokenTransfer},
};

pub fn parse_tx_hash(hash: &str) -> Result<H256> {
    let hash = hash.trim();
    if hash.is_empty() {
        return Err(WalletError::MissingField("tx_hash".into()));
    }
    if !hash.starts_with("0x") || hash.len() != 66 {
        return Err(WalletError::InvalidArgument(format!(
            "malformed transaction hash: {}",
            hash
        )));
    }
    H256::from_str(hash)
        .map_err(|e| WalletError::InvalidArgument(format!("malformed transaction hash: {}", e)))
}

/// 轮询收据直到出块或超时
pub async fn wait_for_receipt(
    client: &dyn ChainRpc,
    hash: H256,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<TransactionReceipt> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(receipt) = client.receipt(hash).await? {
            if receipt.block_number.is_some() {
                return Ok(receipt);
            }
        }
        if tokio::time::Instant::now() + poll_interval > deadline {
            tracing::warn!(tx_hash = ?hash, timeout_secs = timeout.as_secs(), "receipt wait timed out");
            return Err(WalletError::ConfirmationTimeout(format!("{:?}", hash)));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

pub struct TransactionInspector {
    gateway: Arc<RpcGateway>,
    currencies: Arc<CurrencyDirectory>,
    poll_interval: Duration,
    timeout: Duration,
}

impl TransactionInspector {
    pub fn new(gateway: Arc<RpcGateway>, currencies: Arc<CurrencyDirectory>, rpc: &RpcConfig) -> Self {
        Self {
            gateway,
            currencies,
            poll_interval: Duration::from_millis(rpc.receipt_poll_interval_ms),
            timeout: Duration::from_secs(rpc.receipt_timeout_secs),
        }
    }

    async fn client_for(&self, currency_id: &str) -> Result<(&CurrencyConfig, Arc<dyn ChainRpc>)> {
        let currency = self.currencies.get(currency_id)?;
        if !currency.network_class().is_evm() {
            return Err(WalletError::UnsupportedNetwork(currency.network.to_string()));
        }
        let client = self.gateway.client(&currency.rpc_url).await?;
        Ok((currency, client))
    }

    pub async fn get_transaction(&self, hash: &str, currency_id: &str) -> Result<Transaction> {
        let tx_hash = parse_tx_hash(hash)?;
        let (_, client) = self.client_for(currency_id).await?;
        client
            .transaction(tx_hash)
            .await?
            .ok_or_else(|| WalletError::TransactionNotFound(hash.to_string()))
    }

    pub async fn get_receipt(&self, hash: &str, currency_id: &str) -> Result<TransactionReceipt> {
        let tx_hash = parse_tx_hash(hash)?;
        let (_, client) = self.client_for(currency_id).await?;
        client
            .receipt(tx_hash)
            .await?
            .ok_or_else(|| WalletError::TransactionNotFound(hash.to_string()))
    }

    /// 等待收据（使用配置的轮询间隔与超时）
    pub async fn await_receipt(&self, hash: &str, currency_id: &str) -> Result<TransactionReceipt> {
        let tx_hash = parse_tx_hash(hash)?;
        let (_, client) = self.client_for(currency_id).await?;
        wait_for_receipt(client.as_ref(), tx_hash, self.poll_interval, self.timeout).await
    }

    /// 解码收据中的 Transfer 事件；代币币种只保留该合约的事件
    pub async fn decode_token_transfers(
        &self,
        hash: &str,
        currency_id: &str,
    ) -> Result<Vec<TokenTransfer>> {
        let receipt = self.get_receipt(hash, currency_id).await?;
        let contract = self.currencies.get(currency_id)?.contract.token_address();

        let transfers: Vec<TokenTransfer> = receipt
            .logs
            .iter()
            .filter_map(erc20::decode_transfer_log)
            .filter(|t| contract.map_or(true, |c| t.contract == c))
            .collect();

        tracing::debug!(tx_hash = %hash, count = transfers.len(), "token transfers decoded");
        Ok(transfers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tx_hash() {
        let hash = format!("0x{}", "ab".repeat(32));
        assert!(parse_tx_hash(&hash).is_ok());
        assert_eq!(parse_tx_hash("").unwrap_err().code(), "missing_field");
        assert_eq!(parse_tx_hash("0x1234").unwrap_err().code(), "invalid_argument");
    }
}
