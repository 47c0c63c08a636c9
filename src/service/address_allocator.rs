//! 地址分配协调器
//!
//! 为 (owner, network) 分配派生索引并持久化地址。
//!
//! # 解析顺序
//! 1. 本轮分配缓存 (`AllocationPass`)
//! 2. 注册表中 (network, owner) 的已有记录
//! 3. 分配范围内 owner 已占用的索引（EVM 网络共享，原样复用）
//! 4. 新索引 = 范围内最大索引 + 1，范围为空时取配置的起始索引
//!
//! 同一 owner 的分配串行执行（进程内锁 + 可选 Redis 锁）；不同 owner 之间
//! 依靠注册表唯一约束检测冲突，冲突后有限次重试。
//! 派生只使用账户级扩展公钥。

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use uuid::Uuid;

use crate::{
    config::EngineConfig,
    domain::{
        address::{AllocationScope, AllocationState, DerivedAddress},
        derivation::{ExtendedPublicKey, KeyDerivationService, MasterSigner},
        network::{Network, NetworkClass},
    },
    error::{Result, WalletError},
    infrastructure::{
        distributed_lock::AllocationLock,
        log_redact::{redact_address, redact_path},
    },
    repository::AddressRegistry,
};

/// 各网络类别的账户级扩展公钥
#[derive(Clone, Default)]
pub struct AccountKeys {
    keys: HashMap<NetworkClass, ExtendedPublicKey>,
}

impl AccountKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, class: NetworkClass, key: ExtendedPublicKey) -> Self {
        self.keys.insert(class, key);
        self
    }

    /// 导出全部支持类别的 xpub，之后不再需要私钥
    pub fn from_master(master: &MasterSigner) -> Result<Self> {
        let mut keys = HashMap::new();
        for class in [NetworkClass::Evm, NetworkClass::Utxo] {
            keys.insert(class, master.account_xpub(class)?);
        }
        Ok(Self { keys })
    }

    pub fn get(&self, class: NetworkClass) -> Result<&ExtendedPublicKey> {
        self.keys.get(&class).ok_or_else(|| {
            WalletError::UnsupportedNetwork(format!("no extended key for {} networks", class))
        })
    }
}

/// 单个 owner 的一轮分配
///
/// 同一轮内 EVM 网络直接复用已选定的索引，不再查询注册表。
/// 已派生但尚未落库的记录处于 `InPassCached`，落库重试时原样复用。
#[derive(Debug)]
pub struct AllocationPass {
    owner_id: Uuid,
    addresses: HashMap<String, DerivedAddress>,
    pending: HashMap<String, DerivedAddress>,
    states: HashMap<String, AllocationState>,
    scope_indices: HashMap<AllocationScope, u32>,
}

impl AllocationPass {
    pub fn new(owner_id: Uuid) -> Self {
        Self {
            owner_id,
            addresses: HashMap::new(),
            pending: HashMap::new(),
            states: HashMap::new(),
            scope_indices: HashMap::new(),
        }
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    pub fn get(&self, network: &str) -> Option<&DerivedAddress> {
        self.addresses.get(&Network::resolve(network).name)
    }

    pub fn state(&self, network: &str) -> AllocationState {
        self.states
            .get(&Network::resolve(network).name)
            .copied()
            .unwrap_or(AllocationState::Unallocated)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &DerivedAddress> {
        self.addresses.values()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    fn cache(&mut self, address: DerivedAddress) {
        let state = self
            .states
            .entry(address.network.clone())
            .or_insert(AllocationState::Unallocated);
        if *state == AllocationState::Unallocated {
            *state = state.advance();
        }
        self.pending.insert(address.network.clone(), address);
    }

    fn mark_persisted(&mut self, address: DerivedAddress) {
        if let Some(scope) = AllocationScope::from_key(&address.scope) {
            self.scope_indices.insert(scope, address.index);
        }
        self.pending.remove(&address.network);
        self.states
            .insert(address.network.clone(), AllocationState::Persisted);
        self.addresses.insert(address.network.clone(), address);
    }
}

pub struct AddressAllocationCoordinator {
    registry: Arc<dyn AddressRegistry>,
    keys: AccountKeys,
    lock: AllocationLock,
    default_start_index: u32,
    retry_limit: u32,
}

impl AddressAllocationCoordinator {
    pub fn new(
        registry: Arc<dyn AddressRegistry>,
        keys: AccountKeys,
        lock: AllocationLock,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            keys,
            lock,
            default_start_index: config.default_start_index,
            retry_limit: config.allocation_retry_limit,
        }
    }

    pub fn registry(&self) -> &Arc<dyn AddressRegistry> {
        &self.registry
    }

    /// 为 owner 在指定网络分配（或复用）地址
    pub async fn allocate(&self, owner_id: Uuid, network: &str) -> Result<DerivedAddress> {
        let _guard = self.lock.acquire(owner_id).await?;
        let mut pass = AllocationPass::new(owner_id);
        self.allocate_in_pass(&mut pass, network).await
    }

    /// 一次持锁为 owner 分配多个网络的地址
    pub async fn allocate_many(&self, owner_id: Uuid, networks: &[&str]) -> Result<AllocationPass> {
        let _guard = self.lock.acquire(owner_id).await?;
        let mut pass = AllocationPass::new(owner_id);
        for network in networks {
            self.allocate_in_pass(&mut pass, network).await?;
        }
        Ok(pass)
    }

    async fn allocate_in_pass(
        &self,
        pass: &mut AllocationPass,
        network: &str,
    ) -> Result<DerivedAddress> {
        let network = Network::resolve(network);
        if network.class == NetworkClass::Other {
            return Err(WalletError::UnsupportedNetwork(network.to_string()));
        }
        if let Some(cached) = pass.addresses.get(&network.name) {
            return Ok(cached.clone());
        }

        let owner_id = pass.owner_id;
        if let Some(existing) = self.registry.find_by_owner(&network.name, owner_id).await? {
            tracing::debug!(
                owner_id = %owner_id,
                network = %network.name,
                index = existing.index,
                "reusing persisted address"
            );
            pass.mark_persisted(existing.clone());
            return Ok(existing);
        }

        let scope = AllocationScope::for_network(&network);
        let mut attempt = 0u32;
        loop {
            match self.try_allocate(pass, &network, &scope).await {
                Ok(address) => return Ok(address),
                Err(WalletError::AllocationConflict(reason)) if attempt < self.retry_limit => {
                    attempt += 1;
                    tracing::warn!(
                        owner_id = %owner_id,
                        network = %network.name,
                        attempt,
                        reason = %reason,
                        "allocation conflict, retrying"
                    );
                    pass.scope_indices.remove(&scope);
                    if let Some(existing) =
                        self.registry.find_by_owner(&network.name, owner_id).await?
                    {
                        pass.mark_persisted(existing.clone());
                        return Ok(existing);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn next_index(&self, pass: &AllocationPass, scope: &AllocationScope) -> Result<u32> {
        if let Some(index) = pass.scope_indices.get(scope) {
            return Ok(*index);
        }
        if let Some(index) = self.registry.find_claim(scope, pass.owner_id).await? {
            return Ok(index);
        }
        match self.registry.max_index(scope).await? {
            Some(max) => max.checked_add(1).ok_or_else(|| {
                WalletError::Registry(format!("index space exhausted in scope {}", scope))
            }),
            None => Ok(self.default_start_index),
        }
    }

    async fn try_allocate(
        &self,
        pass: &mut AllocationPass,
        network: &Network,
        scope: &AllocationScope,
    ) -> Result<DerivedAddress> {
        let owner_id = pass.owner_id;
        let index = self.next_index(pass, scope).await?;
        self.registry.claim_index(scope, index, owner_id).await?;
        pass.scope_indices.insert(scope.clone(), index);

        let reusable = pass
            .pending
            .get(&network.name)
            .filter(|cached| cached.index == index && cached.scope == scope.key())
            .cloned();
        let record = match reusable {
            Some(cached) => cached,
            None => {
                let key = self.keys.get(network.class)?;
                let derived = KeyDerivationService::derive_address(key, network.class, index)?;
                let record = DerivedAddress {
                    owner_id,
                    network: network.name.clone(),
                    scope: scope.key(),
                    index,
                    address: derived.address,
                    public_key: derived.public_key,
                    derivation_path: derived.path,
                    created_at: Utc::now(),
                };
                pass.cache(record.clone());
                record
            }
        };

        if let Some(holder) = self
            .registry
            .find_by_address(&network.name, &record.address)
            .await?
        {
            if holder.owner_id == owner_id {
                pass.mark_persisted(holder.clone());
                return Ok(holder);
            }
            return Err(WalletError::Registry(format!(
                "address at index {} on {} is registered to another owner",
                index, network.name
            )));
        }

        match self.registry.insert(&record).await {
            Ok(()) => {}
            Err(WalletError::AllocationConflict(reason)) => {
                // 并发写入者可能已为同一 owner 落库
                if let Some(existing) = self.registry.find_by_owner(&network.name, owner_id).await? {
                    pass.mark_persisted(existing.clone());
                    return Ok(existing);
                }
                return Err(WalletError::AllocationConflict(reason));
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            owner_id = %owner_id,
            network = %record.network,
            scope = %record.scope,
            index,
            path = %redact_path(&record.derivation_path),
            address = %redact_address(&record.address),
            "address allocated"
        );
        pass.mark_persisted(record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{domain::derivation::SeedPhrase, repository::InMemoryAddressRegistry};

    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn engine_config(start: u32, retry_limit: u32) -> EngineConfig {
        EngineConfig {
            default_start_index: start,
            allocation_retry_limit: retry_limit,
            ..EngineConfig::default()
        }
    }

    fn coordinator_with_retries(
        registry: Arc<InMemoryAddressRegistry>,
        start: u32,
        retry_limit: u32,
    ) -> AddressAllocationCoordinator {
        let master = KeyDerivationService::master_from_seed(&SeedPhrase::new(TEST_MNEMONIC)).unwrap();
        AddressAllocationCoordinator::new(
            registry,
            AccountKeys::from_master(&master).unwrap(),
            AllocationLock::local_only(),
            &engine_config(start, retry_limit),
        )
    }

    fn coordinator(registry: Arc<InMemoryAddressRegistry>, start: u32) -> AddressAllocationCoordinator {
        coordinator_with_retries(registry, start, 3)
    }

    #[tokio::test]
    async fn test_first_allocation_uses_start_index() {
        let registry = Arc::new(InMemoryAddressRegistry::new());
        let coordinator = coordinator(registry.clone(), 0);

        let address = coordinator.allocate(Uuid::new_v4(), "ethereum").await.unwrap();
        assert_eq!(address.index, 0);
        assert_eq!(address.address, "0x9858EfFD232B4033E47d90003D41EC34EcaEda94");
        assert_eq!(address.derivation_path, "m/44'/60'/0'/0/0");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_allocation_is_idempotent() {
        let registry = Arc::new(InMemoryAddressRegistry::new());
        let coordinator = coordinator(registry.clone(), 5);
        let owner = Uuid::new_v4();

        let first = coordinator.allocate(owner, "ethereum").await.unwrap();
        let second = coordinator.allocate(owner, "eth").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.index, 5);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_evm_networks_share_index() {
        let registry = Arc::new(InMemoryAddressRegistry::new());
        let coordinator = coordinator(registry, 0);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let alice_eth = coordinator.allocate(alice, "ethereum").await.unwrap();
        let bob_eth = coordinator.allocate(bob, "ethereum").await.unwrap();
        let alice_bsc = coordinator.allocate(alice, "bsc").await.unwrap();

        assert_eq!(bob_eth.index, 1);
        assert_eq!(alice_bsc.index, alice_eth.index);
        assert_eq!(alice_bsc.address, alice_eth.address);
        assert_eq!(alice_bsc.network, "bsc");
    }

    #[tokio::test]
    async fn test_utxo_scope_is_independent() {
        let registry = Arc::new(InMemoryAddressRegistry::new());
        let coordinator = coordinator(registry, 0);

        coordinator.allocate(Uuid::new_v4(), "ethereum").await.unwrap();
        coordinator.allocate(Uuid::new_v4(), "ethereum").await.unwrap();
        let btc = coordinator.allocate(Uuid::new_v4(), "bitcoin").await.unwrap();

        assert_eq!(btc.index, 0);
        assert_eq!(btc.scope, "net:bitcoin");
        assert_eq!(btc.address, "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu");
    }

    #[tokio::test]
    async fn test_allocate_many_tracks_states() {
        let registry = Arc::new(InMemoryAddressRegistry::new());
        let coordinator = coordinator(registry, 0);
        let owner = Uuid::new_v4();

        let pass = coordinator
            .allocate_many(owner, &["ethereum", "polygon", "bitcoin"])
            .await
            .unwrap();

        assert_eq!(pass.len(), 3);
        assert_eq!(pass.state("polygon"), AllocationState::Persisted);
        assert_eq!(pass.state("arbitrum"), AllocationState::Unallocated);
        assert_eq!(
            pass.get("ethereum").map(|a| a.index),
            pass.get("polygon").map(|a| a.index)
        );
    }

    /// 前 n 次写入失败的注册表
    struct FailingInserts {
        inner: InMemoryAddressRegistry,
        remaining: AtomicU32,
    }

    #[async_trait]
    impl AddressRegistry for FailingInserts {
        async fn find_by_owner(&self, network: &str, owner_id: Uuid) -> Result<Option<DerivedAddress>> {
            self.inner.find_by_owner(network, owner_id).await
        }

        async fn find_by_address(
            &self,
            network: &str,
            address: &str,
        ) -> Result<Option<DerivedAddress>> {
            self.inner.find_by_address(network, address).await
        }

        async fn find_claim(&self, scope: &AllocationScope, owner_id: Uuid) -> Result<Option<u32>> {
            self.inner.find_claim(scope, owner_id).await
        }

        async fn max_index(&self, scope: &AllocationScope) -> Result<Option<u32>> {
            self.inner.max_index(scope).await
        }

        async fn claim_index(&self, scope: &AllocationScope, index: u32, owner_id: Uuid) -> Result<()> {
            self.inner.claim_index(scope, index, owner_id).await
        }

        async fn insert(&self, address: &DerivedAddress) -> Result<()> {
            let failed = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(WalletError::Registry("write failed".into()));
            }
            self.inner.insert(address).await
        }

        async fn list_by_owner(&self, owner_id: Uuid) -> Result<Vec<DerivedAddress>> {
            self.inner.list_by_owner(owner_id).await
        }
    }

    #[tokio::test]
    async fn test_cached_record_survives_failed_write() {
        let registry = Arc::new(FailingInserts {
            inner: InMemoryAddressRegistry::new(),
            remaining: AtomicU32::new(1),
        });
        let master = KeyDerivationService::master_from_seed(&SeedPhrase::new(TEST_MNEMONIC)).unwrap();
        let coordinator = AddressAllocationCoordinator::new(
            registry.clone(),
            AccountKeys::from_master(&master).unwrap(),
            AllocationLock::local_only(),
            &engine_config(0, 3),
        );
        let mut pass = AllocationPass::new(Uuid::new_v4());

        let err = coordinator.allocate_in_pass(&mut pass, "ethereum").await.unwrap_err();
        assert_eq!(err.code(), "registry_error");
        assert_eq!(pass.state("ethereum"), AllocationState::InPassCached);
        assert!(pass.get("ethereum").is_none());
        let cached = pass.pending.get("ethereum").cloned().unwrap();
        assert_eq!(cached.index, 0);

        let address = coordinator.allocate_in_pass(&mut pass, "ethereum").await.unwrap();
        assert_eq!(pass.state("ethereum"), AllocationState::Persisted);
        assert!(pass.pending.is_empty());
        assert_eq!(address, cached);
        assert_eq!(registry.inner.len().await, 1);
    }

    #[tokio::test]
    async fn test_unsupported_network_rejected() {
        let registry = Arc::new(InMemoryAddressRegistry::new());
        let coordinator = coordinator(registry.clone(), 0);
        let err = coordinator.allocate(Uuid::new_v4(), "solana").await.unwrap_err();
        assert_eq!(err.code(), "unsupported_network");
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_owners_get_distinct_indices() {
        let registry = Arc::new(InMemoryAddressRegistry::new());
        // 最坏情况下每个任务都要与其余任务各冲突一次
        let coordinator = Arc::new(coordinator_with_retries(registry, 0, 8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.allocate(Uuid::new_v4(), "ethereum").await })
            })
            .collect();

        let mut indices = Vec::new();
        for handle in handles {
            indices.push(handle.await.unwrap().unwrap().index);
        }
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), 8);
    }
}
