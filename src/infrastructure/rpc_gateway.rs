//! 链 RPC 网关
//!
//! 每个不同的 RPC 端点只创建一个客户端并复用。`memory://<name>` 端点解析为
//! 进程内的沙盒链，其余端点使用 ethers `Provider<Http>`。
//! 只读调用在 `NetworkUnavailable` 时按指数退避重试，广播从不重试。

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use ethers::{
    providers::{Http, Middleware, Provider},
    types::{
        transaction::eip2718::TypedTransaction, Address, BlockId, BlockNumber, Bytes,
        Transaction, TransactionReceipt, TransactionRequest, H256, U256,
    },
};
use tokio::sync::RwLock;

use crate::{
    config::RpcConfig,
    error::{Result, WalletError},
    infrastructure::memory_chain::MemoryChain,
};

/// 内存链端点前缀
pub const MEMORY_SCHEME: &str = "memory://";

/// RPC 不支持 eth_maxPriorityFeePerGas 时的默认小费 (1.5 gwei)
const DEFAULT_PRIORITY_FEE_WEI: u64 = 1_500_000_000;

/// 节点返回的费率数据
///
/// 不支持 EIP-1559 的链只返回 `gas_price`；支持的链返回基础费与小费，
/// `gas_price` 为空。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeeData {
    pub gas_price: Option<U256>,
    pub base_fee_per_gas: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
}

impl FeeData {
    pub fn legacy(gas_price: U256) -> Self {
        Self {
            gas_price: Some(gas_price),
            ..Default::default()
        }
    }

    /// maxFee 按 2 × base + tip 计算
    pub fn eip1559(base_fee: U256, priority_fee: U256) -> Self {
        Self {
            gas_price: None,
            base_fee_per_gas: Some(base_fee),
            max_fee_per_gas: Some(base_fee.saturating_mul(U256::from(2)) + priority_fee),
            max_priority_fee_per_gas: Some(priority_fee),
        }
    }
}

/// EVM 节点的最小读写接口
#[async_trait]
pub trait ChainRpc: Send + Sync {
    fn endpoint(&self) -> &str;

    async fn chain_id(&self) -> Result<u64>;

    async fn fee_data(&self) -> Result<FeeData>;

    async fn balance(&self, address: Address) -> Result<U256>;

    /// eth_call
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes>;

    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        value: U256,
        data: Bytes,
    ) -> Result<U256>;

    /// 包含 pending 交易的 nonce
    async fn pending_nonce(&self, address: Address) -> Result<U256>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256>;

    async fn transaction(&self, hash: H256) -> Result<Option<Transaction>>;

    async fn receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ethers HTTP 客户端
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EthersRpc {
    endpoint: String,
    provider: Provider<Http>,
}

impl EthersRpc {
    pub fn new(endpoint: &str, config: &RpcConfig) -> Result<Self> {
        let url = reqwest::Url::parse(endpoint)
            .map_err(|e| WalletError::Config(format!("invalid rpc url {}: {}", endpoint, e)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| WalletError::NetworkUnavailable(format!("http client: {}", e)))?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            provider: Provider::new(Http::new_with_client(url, client)),
        })
    }

    async fn priority_fee(&self) -> U256 {
        let params: Vec<serde_json::Value> = Vec::new();
        match self
            .provider
            .request::<_, U256>("eth_maxPriorityFeePerGas", params)
            .await
        {
            Ok(fee) => fee,
            Err(e) => {
                tracing::warn!(
                    endpoint = %self.endpoint,
                    error = %e,
                    "eth_maxPriorityFeePerGas unsupported, using default tip"
                );
                U256::from(DEFAULT_PRIORITY_FEE_WEI)
            }
        }
    }
}

#[async_trait]
impl ChainRpc for EthersRpc {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn chain_id(&self) -> Result<u64> {
        Ok(self.provider.get_chainid().await?.as_u64())
    }

    async fn fee_data(&self) -> Result<FeeData> {
        let block = self.provider.get_block(BlockNumber::Latest).await?;
        match block.and_then(|b| b.base_fee_per_gas) {
            Some(base_fee) => Ok(FeeData::eip1559(base_fee, self.priority_fee().await)),
            None => Ok(FeeData::legacy(self.provider.get_gas_price().await?)),
        }
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        Ok(self.provider.get_balance(address, None).await?)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        Ok(self.provider.call(&tx, None).await?)
    }

    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        value: U256,
        data: Bytes,
    ) -> Result<U256> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(from)
            .to(to)
            .value(value)
            .data(data)
            .into();
        Ok(self.provider.estimate_gas(&tx, None).await?)
    }

    async fn pending_nonce(&self, address: Address) -> Result<U256> {
        Ok(self
            .provider
            .get_transaction_count(address, Some(BlockId::Number(BlockNumber::Pending)))
            .await?)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256> {
        let pending = self.provider.send_raw_transaction(raw).await?;
        Ok(pending.tx_hash())
    }

    async fn transaction(&self, hash: H256) -> Result<Option<Transaction>> {
        Ok(self.provider.get_transaction(hash).await?)
    }

    async fn receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>> {
        Ok(self.provider.get_transaction_receipt(hash).await?)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 重试装饰器
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// 只读调用的有界重试
pub struct RetryingRpc {
    inner: Arc<dyn ChainRpc>,
    max_retries: u32,
    backoff: Duration,
}

impl RetryingRpc {
    pub fn new(inner: Arc<dyn ChainRpc>, max_retries: u32, backoff: Duration) -> Self {
        Self {
            inner,
            max_retries,
            backoff,
        }
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut attempt = 0u32;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(WalletError::NetworkUnavailable(reason)) if attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.backoff * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        endpoint = %self.inner.endpoint(),
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "RPC call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ChainRpc for RetryingRpc {
    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    async fn chain_id(&self) -> Result<u64> {
        self.with_retry("chain_id", move || self.inner.chain_id()).await
    }

    async fn fee_data(&self) -> Result<FeeData> {
        self.with_retry("fee_data", move || self.inner.fee_data()).await
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        self.with_retry("balance", move || self.inner.balance(address))
            .await
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        self.with_retry("call", move || self.inner.call(to, data.clone()))
            .await
    }

    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        value: U256,
        data: Bytes,
    ) -> Result<U256> {
        self.with_retry("estimate_gas", move || {
            self.inner.estimate_gas(from, to, value, data.clone())
        })
        .await
    }

    async fn pending_nonce(&self, address: Address) -> Result<U256> {
        self.with_retry("pending_nonce", move || self.inner.pending_nonce(address))
            .await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256> {
        self.inner.send_raw_transaction(raw).await
    }

    async fn transaction(&self, hash: H256) -> Result<Option<Transaction>> {
        self.with_retry("transaction", move || self.inner.transaction(hash))
            .await
    }

    async fn receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>> {
        self.with_retry("receipt", move || self.inner.receipt(hash)).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 网关
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// 按端点缓存 RPC 客户端
pub struct RpcGateway {
    config: RpcConfig,
    clients: RwLock<HashMap<String, Arc<dyn ChainRpc>>>,
    memory_chains: RwLock<HashMap<String, Arc<MemoryChain>>>,
}

impl RpcGateway {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            config,
            clients: RwLock::new(HashMap::new()),
            memory_chains: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// 获取（或创建）端点的客户端
    pub async fn client(&self, rpc_url: &str) -> Result<Arc<dyn ChainRpc>> {
        let key = rpc_url.trim().to_string();
        if key.is_empty() {
            return Err(WalletError::ConfigNotFound("empty rpc url".into()));
        }

        if let Some(client) = self.clients.read().await.get(&key) {
            return Ok(client.clone());
        }

        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let inner: Arc<dyn ChainRpc> = if let Some(name) = key.strip_prefix(MEMORY_SCHEME) {
            self.memory_chain(name).await
        } else if key.starts_with("http://") || key.starts_with("https://") {
            Arc::new(EthersRpc::new(&key, &self.config)?)
        } else {
            return Err(WalletError::Config(format!(
                "unsupported rpc scheme: {}",
                key
            )));
        };

        let client: Arc<dyn ChainRpc> = Arc::new(RetryingRpc::new(
            inner,
            self.config.max_retries,
            Duration::from_millis(self.config.retry_backoff_ms),
        ));
        tracing::debug!(endpoint = %key, "RPC client created");
        clients.insert(key, client.clone());
        Ok(client)
    }

    /// 获取（或创建）命名内存链，同名端点共享同一状态
    pub async fn memory_chain(&self, name: &str) -> Arc<MemoryChain> {
        let mut chains = self.memory_chains.write().await;
        chains
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryChain::new(name)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> RpcConfig {
        RpcConfig {
            connect_timeout_secs: 1,
            request_timeout_secs: 1,
            max_retries: 2,
            retry_backoff_ms: 1,
            receipt_poll_interval_ms: 5,
            receipt_timeout_secs: 1,
        }
    }

    #[tokio::test]
    async fn test_client_reused_per_endpoint() {
        let gateway = RpcGateway::new(fast_config());
        let a = gateway.client("memory://eth").await.unwrap();
        let b = gateway.client("memory://eth").await.unwrap();
        let c = gateway.client("memory://bsc").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_unknown_scheme_rejected() {
        let gateway = RpcGateway::new(fast_config());
        assert!(gateway.client("ftp://node").await.is_err());
        assert_eq!(
            gateway.client("  ").await.err().map(|e| e.code()),
            Some("config_not_found")
        );
    }

    #[tokio::test]
    async fn test_reads_retry_within_limit() {
        let gateway = RpcGateway::new(fast_config());
        let chain = gateway.memory_chain("flaky").await;
        let client = gateway.client("memory://flaky").await.unwrap();
        let who = Address::repeat_byte(0x11);
        chain.fund(who, U256::from(7u64));

        chain.fail_next_reads(2);
        assert_eq!(client.balance(who).await.unwrap(), U256::from(7u64));

        chain.fail_next_reads(3);
        let err = client.balance(who).await.unwrap_err();
        assert_eq!(err.code(), "network_unavailable");
    }

    #[test]
    fn test_eip1559_fee_data_max_fee() {
        let data = FeeData::eip1559(U256::from(100u64), U256::from(2u64));
        assert_eq!(data.max_fee_per_gas, Some(U256::from(202u64)));
        assert!(data.gas_price.is_none());
    }
}
