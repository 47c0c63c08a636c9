//! IronCore Engine 主入口
//! 加载配置、组装引擎并探测每个币种的 RPC 路由

use anyhow::Result;
use ironcore_engine::{
    config::Config,
    infrastructure::{log_redact::redact_evm_address, logging::init_logging},
    EngineContext,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载环境变量
    dotenvy::dotenv().ok();

    // 2. 加载配置（CONFIG_PATH 指向的文件优先）
    let config_path = std::env::var("CONFIG_PATH").ok();
    let config = Config::from_env_and_file(config_path.as_deref())?;
    config.validate()?;

    // 3. 初始化日志
    init_logging(&config.logging).map_err(|e| anyhow::anyhow!("Failed to init logging: {}", e))?;

    tracing::info!(
        currencies = config.currencies.len(),
        registry_backend = ?config.engine.registry_backend,
        distributed_lock = config.engine.use_distributed_lock,
        "Starting IronCore engine"
    );

    // 4. 组装引擎
    let ctx = EngineContext::from_config(config).await?;
    let treasury = ctx.signer(0)?;
    tracing::info!(
        address = %redact_evm_address(&ethers::signers::Signer::address(&treasury)),
        "Seed loaded"
    );

    // 5. 探测 RPC 路由
    let mut unreachable = 0usize;
    for currency in ctx.currencies.iter() {
        if !currency.network_class().is_evm() {
            tracing::debug!(currency = %currency.id, network = %currency.network, "Skipping non-EVM route");
            continue;
        }
        let probe = async {
            let client = ctx.gateway.client(&currency.rpc_url).await?;
            client.chain_id().await
        };
        match probe.await {
            Ok(chain_id) => tracing::info!(
                currency = %currency.id,
                network = %currency.network.name,
                chain_id,
                "RPC route reachable"
            ),
            Err(e) => {
                unreachable += 1;
                tracing::warn!(
                    currency = %currency.id,
                    network = %currency.network.name,
                    error = %e,
                    "RPC route unreachable"
                );
            }
        }
    }

    tracing::info!(unreachable, "Engine ready");
    Ok(())
}
