use std::{sync::Arc, time::Duration};

use anyhow::Context;
use ethers::signers::LocalWallet;

use crate::{
    config::{Config, RegistryBackend},
    domain::{
        address::DerivedAddress,
        currency::CurrencyDirectory,
        derivation::{KeyDerivationService, MasterSigner, SeedPhrase},
        network::Network,
    },
    error::WalletError,
    infrastructure::{
        db,
        distributed_lock::{AllocationLock, DistributedLock},
        rpc_gateway::RpcGateway,
    },
    repository::{AddressRegistry, InMemoryAddressRegistry, PgAddressRegistry},
    service::{
        AccountKeys, AddressAllocationCoordinator, BalanceReader, FeeEstimator,
        TransactionInspector, TransferBuilder,
    },
};

/// 引擎上下文
/// 进程内共享的全部服务句柄
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<Config>,
    pub currencies: Arc<CurrencyDirectory>,
    pub gateway: Arc<RpcGateway>,
    pub fees: Arc<FeeEstimator>,
    pub balances: Arc<BalanceReader>,
    pub transfers: Arc<TransferBuilder>,
    pub inspector: Arc<TransactionInspector>,
    pub allocator: Arc<AddressAllocationCoordinator>,
    master: Arc<MasterSigner>,
}

impl EngineContext {
    /// 用给定的种子和注册表组装上下文
    pub async fn build(
        config: Config,
        seed: &SeedPhrase,
        registry: Arc<dyn AddressRegistry>,
    ) -> anyhow::Result<Self> {
        let currencies = Arc::new(config.currency_directory()?);
        let master = Arc::new(KeyDerivationService::master_from_seed(seed)?);
        let keys = AccountKeys::from_master(&master)?;

        let lock = if config.engine.use_distributed_lock {
            let remote = DistributedLock::new(&config.redis.url)
                .await
                .context("Failed to initialize allocation lock")?;
            tracing::info!("Redis allocation lock enabled");
            AllocationLock::with_remote(
                remote,
                config.engine.lock_ttl_secs,
                Duration::from_millis(config.engine.lock_wait_ms),
            )
        } else {
            AllocationLock::local_only()
        };

        let gateway = Arc::new(RpcGateway::new(config.rpc.clone()));
        let fees = Arc::new(FeeEstimator::new(gateway.clone(), currencies.clone()));
        let balances = Arc::new(BalanceReader::new(gateway.clone(), currencies.clone()));
        let transfers = Arc::new(TransferBuilder::new(
            gateway.clone(),
            currencies.clone(),
            fees.clone(),
            balances.clone(),
            &config.rpc,
        ));
        let inspector = Arc::new(TransactionInspector::new(
            gateway.clone(),
            currencies.clone(),
            &config.rpc,
        ));
        let allocator = Arc::new(AddressAllocationCoordinator::new(
            registry,
            keys,
            lock,
            &config.engine,
        ));

        Ok(Self {
            config: Arc::new(config),
            currencies,
            gateway,
            fees,
            balances,
            transfers,
            inspector,
            allocator,
            master,
        })
    }

    /// 按配置组装：种子来自环境变量，注册表按后端选择
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let seed = SeedPhrase::from_env(&config.engine.seed_env)?;

        let registry: Arc<dyn AddressRegistry> = match config.engine.registry_backend {
            RegistryBackend::Postgres => {
                let pool = db::init_pool(&config.database)
                    .await
                    .context("Failed to connect to address registry")?;
                tracing::info!("Address registry connected");
                Arc::new(PgAddressRegistry::new(pool))
            }
            RegistryBackend::Memory => {
                tracing::warn!("Using in-memory address registry, allocations are not persisted");
                Arc::new(InMemoryAddressRegistry::new())
            }
        };

        Self::build(config, &seed, registry).await
    }

    /// 第 `index` 个 EVM 地址的签名钱包
    pub fn signer(&self, index: u32) -> crate::error::Result<LocalWallet> {
        self.master.evm_signer(index)
    }

    /// 已分配 EVM 地址对应的签名钱包
    pub fn signer_for(&self, address: &DerivedAddress) -> crate::error::Result<LocalWallet> {
        let network = Network::resolve(&address.network);
        if !network.class.is_evm() {
            return Err(WalletError::UnsupportedNetwork(format!(
                "signing is EVM only: {}",
                network
            )));
        }
        self.master.evm_signer(address.index)
    }
}
