//! 测试辅助模块
//! 基于内存链和内存注册表组装完整引擎，不依赖外部服务

#![allow(dead_code)]

use std::sync::Arc;

use ethers::types::{Address, U256};
use ironcore_engine::{
    config::{Config, RegistryBackend, RpcConfig},
    domain::{CurrencyEntry, SeedPhrase},
    infrastructure::{logging::init_default_logging, memory_chain::MemoryChain},
    repository::InMemoryAddressRegistry,
    EngineContext,
};

pub const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

/// 以太坊沙盒链上的两个代币（精度不同）
pub const USDC_CONTRACT: &str = "0x00000000000000000000000000000000000000aa";
pub const WBTC_CONTRACT: &str = "0x00000000000000000000000000000000000000bb";

fn currency(id: &str, network: &str, contract: &str, decimals: u32, rpc_url: &str) -> CurrencyEntry {
    CurrencyEntry {
        id: id.to_string(),
        network: network.to_string(),
        network_class: None,
        decimals,
        is_token: contract != "main",
        smart_contract_address: contract.to_string(),
        rpc_url: rpc_url.to_string(),
    }
}

/// 测试配置：内存注册表 + memory:// 端点 + 快速收据轮询
pub fn test_config() -> Config {
    let mut config = Config::from_env().unwrap();
    config.engine.registry_backend = RegistryBackend::Memory;
    config.engine.use_distributed_lock = false;
    config.engine.default_start_index = 0;
    config.engine.allocation_retry_limit = 8;
    config.rpc = RpcConfig {
        connect_timeout_secs: 1,
        request_timeout_secs: 1,
        max_retries: 2,
        retry_backoff_ms: 1,
        receipt_poll_interval_ms: 5,
        receipt_timeout_secs: 1,
    };
    config.currencies = vec![
        currency("ETH", "ethereum", "main", 18, "memory://ethereum"),
        currency("USDC", "ethereum", USDC_CONTRACT, 6, "memory://ethereum"),
        currency("WBTC", "ethereum", WBTC_CONTRACT, 8, "memory://ethereum"),
        currency("BNB", "bsc", "main", 18, "memory://bsc"),
        currency("BTC", "bitcoin", "main", 8, "memory://bitcoin"),
    ];
    config
}

pub async fn test_engine() -> EngineContext {
    test_engine_with(test_config()).await
}

pub async fn test_engine_with(config: Config) -> EngineContext {
    init_default_logging();
    EngineContext::build(
        config,
        &SeedPhrase::new(TEST_MNEMONIC),
        Arc::new(InMemoryAddressRegistry::new()),
    )
    .await
    .unwrap()
}

pub async fn ethereum(ctx: &EngineContext) -> Arc<MemoryChain> {
    ctx.gateway.memory_chain("ethereum").await
}

pub fn eth(n: u64) -> U256 {
    U256::from(n) * U256::exp10(18)
}

pub fn gwei(n: u64) -> U256 {
    U256::from(n) * U256::exp10(9)
}

pub fn checksum(address: Address) -> String {
    ethers::utils::to_checksum(&address, None)
}

pub fn contract(address: &str) -> Address {
    address.parse().unwrap()
}
