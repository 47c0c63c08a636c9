//! 派生地址记录

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::network::{Network, NetworkClass},
    error::{Result, WalletError},
};

/// 解析 EVM 地址（0x + 40 位十六进制，大小写均可）
pub fn parse_evm_address(field: &str, value: &str) -> Result<Address> {
    let value = value.trim();
    if value.is_empty() {
        return Err(WalletError::MissingField(field.to_string()));
    }
    if !value.starts_with("0x") || value.len() != 42 {
        return Err(WalletError::InvalidArgument(format!(
            "{} is not an EVM address: {}",
            field, value
        )));
    }
    Address::from_str(value)
        .map_err(|e| WalletError::InvalidArgument(format!("{} is not an EVM address: {}", field, e)))
}

/// 索引分配范围
///
/// 所有 EVM 网络共享同一范围（同一索引 = 同一地址），其他网络各自独立。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AllocationScope {
    Evm,
    Network(String),
}

impl AllocationScope {
    pub fn for_network(network: &Network) -> Self {
        match network.class {
            NetworkClass::Evm => AllocationScope::Evm,
            _ => AllocationScope::Network(network.name.clone()),
        }
    }

    /// 持久化使用的键
    pub fn key(&self) -> String {
        match self {
            AllocationScope::Evm => "evm".to_string(),
            AllocationScope::Network(name) => format!("net:{}", name),
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        if key == "evm" {
            return Some(AllocationScope::Evm);
        }
        key.strip_prefix("net:")
            .map(|name| AllocationScope::Network(name.to_string()))
    }
}

impl fmt::Display for AllocationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// 已分配的派生地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedAddress {
    pub owner_id: Uuid,
    pub network: String,
    pub scope: String,
    pub index: u32,
    pub address: String,
    pub public_key: String,
    pub derivation_path: String,
    pub created_at: DateTime<Utc>,
}

/// (owner, network) 的分配状态，Persisted 为终态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    Unallocated,
    InPassCached,
    Persisted,
}

impl AllocationState {
    pub fn advance(self) -> Self {
        match self {
            AllocationState::Unallocated => AllocationState::InPassCached,
            AllocationState::InPassCached | AllocationState::Persisted => {
                AllocationState::Persisted
            }
        }
    }
}
