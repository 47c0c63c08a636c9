// 派生地址注册表 Repository
//
// 两张表：
// - derived_addresses: UNIQUE(network, address), UNIQUE(network, owner_id)
// - address_index_claims: PRIMARY KEY(scope, idx), UNIQUE(scope, owner_id)
// 索引一旦被某个 owner 占用就不会再分配给其他 owner。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    domain::address::{AllocationScope, DerivedAddress},
    error::{Result, WalletError},
};

// ============ Repository Trait ============

#[async_trait]
pub trait AddressRegistry: Send + Sync {
    /// 按 (network, owner) 查询
    async fn find_by_owner(&self, network: &str, owner_id: Uuid) -> Result<Option<DerivedAddress>>;

    /// 按 (network, address) 查询
    async fn find_by_address(&self, network: &str, address: &str)
        -> Result<Option<DerivedAddress>>;

    /// owner 在分配范围内占用的索引
    async fn find_claim(&self, scope: &AllocationScope, owner_id: Uuid) -> Result<Option<u32>>;

    /// 分配范围内已占用的最大索引
    async fn max_index(&self, scope: &AllocationScope) -> Result<Option<u32>>;

    /// 占用索引；已被其他 owner 占用时返回 `AllocationConflict`
    async fn claim_index(&self, scope: &AllocationScope, index: u32, owner_id: Uuid) -> Result<()>;

    /// 写入派生地址；违反唯一约束时返回 `AllocationConflict`
    async fn insert(&self, address: &DerivedAddress) -> Result<()>;

    /// 列出 owner 的全部地址
    async fn list_by_owner(&self, owner_id: Uuid) -> Result<Vec<DerivedAddress>>;
}

fn index_from_db(idx: i64) -> Result<u32> {
    u32::try_from(idx).map_err(|_| WalletError::Registry(format!("index out of range: {}", idx)))
}

// ============ PostgreSQL 实现 ============

type AddressRow = (Uuid, String, String, i64, String, String, String, DateTime<Utc>);

const ADDRESS_COLUMNS: &str = "owner_id, network, scope, address_index, address, public_key, derivation_path, created_at";

fn row_to_address(row: AddressRow) -> Result<DerivedAddress> {
    let (owner_id, network, scope, idx, address, public_key, derivation_path, created_at) = row;
    Ok(DerivedAddress {
        owner_id,
        network,
        scope,
        index: index_from_db(idx)?,
        address,
        public_key,
        derivation_path,
        created_at,
    })
}

pub struct PgAddressRegistry {
    pool: PgPool,
}

impl PgAddressRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AddressRegistry for PgAddressRegistry {
    async fn find_by_owner(&self, network: &str, owner_id: Uuid) -> Result<Option<DerivedAddress>> {
        let row = sqlx::query_as::<_, AddressRow>(&format!(
            "SELECT {} FROM derived_addresses WHERE network = $1 AND owner_id = $2",
            ADDRESS_COLUMNS
        ))
        .bind(network)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_address).transpose()
    }

    async fn find_by_address(
        &self,
        network: &str,
        address: &str,
    ) -> Result<Option<DerivedAddress>> {
        let row = sqlx::query_as::<_, AddressRow>(&format!(
            "SELECT {} FROM derived_addresses WHERE network = $1 AND lower(address) = lower($2)",
            ADDRESS_COLUMNS
        ))
        .bind(network)
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_address).transpose()
    }

    async fn find_claim(&self, scope: &AllocationScope, owner_id: Uuid) -> Result<Option<u32>> {
        let idx: Option<i64> = sqlx::query_scalar(
            "SELECT idx FROM address_index_claims WHERE scope = $1 AND owner_id = $2",
        )
        .bind(scope.key())
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        idx.map(index_from_db).transpose()
    }

    async fn max_index(&self, scope: &AllocationScope) -> Result<Option<u32>> {
        let idx: Option<i64> =
            sqlx::query_scalar("SELECT MAX(idx) FROM address_index_claims WHERE scope = $1")
                .bind(scope.key())
                .fetch_one(&self.pool)
                .await?;

        idx.map(index_from_db).transpose()
    }

    async fn claim_index(&self, scope: &AllocationScope, index: u32, owner_id: Uuid) -> Result<()> {
        sqlx::query(
            "INSERT INTO address_index_claims (scope, idx, owner_id, created_at)
             VALUES ($1, $2, $3, CURRENT_TIMESTAMP)
             ON CONFLICT DO NOTHING",
        )
        .bind(scope.key())
        .bind(i64::from(index))
        .bind(owner_id)
        .execute(&self.pool)
        .await?;

        let holder: Option<Uuid> = sqlx::query_scalar(
            "SELECT owner_id FROM address_index_claims WHERE scope = $1 AND idx = $2",
        )
        .bind(scope.key())
        .bind(i64::from(index))
        .fetch_optional(&self.pool)
        .await?;

        match holder {
            Some(holder) if holder == owner_id => Ok(()),
            _ => Err(WalletError::AllocationConflict(format!(
                "index {} in scope {} is not available to owner",
                index, scope
            ))),
        }
    }

    async fn insert(&self, address: &DerivedAddress) -> Result<()> {
        sqlx::query(
            "INSERT INTO derived_addresses
                (owner_id, network, scope, address_index, address, public_key, derivation_path, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(address.owner_id)
        .bind(&address.network)
        .bind(&address.scope)
        .bind(i64::from(address.index))
        .bind(&address.address)
        .bind(&address.public_key)
        .bind(&address.derivation_path)
        .bind(address.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_by_owner(&self, owner_id: Uuid) -> Result<Vec<DerivedAddress>> {
        let rows = sqlx::query_as::<_, AddressRow>(&format!(
            "SELECT {} FROM derived_addresses WHERE owner_id = $1 ORDER BY created_at, network",
            ADDRESS_COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_address).collect()
    }
}

// ============ 内存实现（测试与沙盒） ============

#[derive(Default)]
struct MemoryRegistryState {
    addresses: Vec<DerivedAddress>,
    claims: HashMap<(String, u32), Uuid>,
}

/// 与 Postgres 实现约束一致的内存注册表
#[derive(Default)]
pub struct InMemoryAddressRegistry {
    state: Mutex<MemoryRegistryState>,
}

impl InMemoryAddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.addresses.len()
    }
}

#[async_trait]
impl AddressRegistry for InMemoryAddressRegistry {
    async fn find_by_owner(&self, network: &str, owner_id: Uuid) -> Result<Option<DerivedAddress>> {
        let state = self.state.lock().await;
        Ok(state
            .addresses
            .iter()
            .find(|a| a.network == network && a.owner_id == owner_id)
            .cloned())
    }

    async fn find_by_address(
        &self,
        network: &str,
        address: &str,
    ) -> Result<Option<DerivedAddress>> {
        let state = self.state.lock().await;
        Ok(state
            .addresses
            .iter()
            .find(|a| a.network == network && a.address.eq_ignore_ascii_case(address))
            .cloned())
    }

    async fn find_claim(&self, scope: &AllocationScope, owner_id: Uuid) -> Result<Option<u32>> {
        let key = scope.key();
        let state = self.state.lock().await;
        Ok(state
            .claims
            .iter()
            .find(|((s, _), owner)| *s == key && **owner == owner_id)
            .map(|((_, idx), _)| *idx))
    }

    async fn max_index(&self, scope: &AllocationScope) -> Result<Option<u32>> {
        let key = scope.key();
        let state = self.state.lock().await;
        Ok(state
            .claims
            .keys()
            .filter(|(s, _)| *s == key)
            .map(|(_, idx)| *idx)
            .max())
    }

    async fn claim_index(&self, scope: &AllocationScope, index: u32, owner_id: Uuid) -> Result<()> {
        let key = scope.key();
        let mut state = self.state.lock().await;

        if let Some(holder) = state.claims.get(&(key.clone(), index)) {
            if *holder == owner_id {
                return Ok(());
            }
            return Err(WalletError::AllocationConflict(format!(
                "index {} in scope {} already claimed",
                index, scope
            )));
        }
        if state
            .claims
            .iter()
            .any(|((s, _), owner)| *s == key && *owner == owner_id)
        {
            return Err(WalletError::AllocationConflict(format!(
                "owner already holds an index in scope {}",
                scope
            )));
        }

        state.claims.insert((key, index), owner_id);
        Ok(())
    }

    async fn insert(&self, address: &DerivedAddress) -> Result<()> {
        let mut state = self.state.lock().await;
        let duplicate = state.addresses.iter().any(|a| {
            a.network == address.network
                && (a.owner_id == address.owner_id
                    || a.address.eq_ignore_ascii_case(&address.address))
        });
        if duplicate {
            return Err(WalletError::AllocationConflict(format!(
                "address or owner already registered on {}",
                address.network
            )));
        }
        state.addresses.push(address.clone());
        Ok(())
    }

    async fn list_by_owner(&self, owner_id: Uuid) -> Result<Vec<DerivedAddress>> {
        let state = self.state.lock().await;
        Ok(state
            .addresses
            .iter()
            .filter(|a| a.owner_id == owner_id)
            .cloned()
            .collect())
    }
}
