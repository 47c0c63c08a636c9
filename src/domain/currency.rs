//! 币种配置
//!
//! 每个币种绑定一个网络和 RPC 端点。合约地址 "main" 表示链原生币。

use std::{collections::HashMap, fmt, str::FromStr};

use ethers::types::Address;
use serde::{Deserialize, Serialize};

use crate::{
    domain::network::{canonical_network_name, Network, NetworkClass},
    error::{Result, WalletError},
};

/// 原生币哨兵值
pub const NATIVE_CONTRACT_SENTINEL: &str = "main";

/// 币种对应的合约
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmartContract {
    Native,
    Token(Address),
}

impl SmartContract {
    pub fn token_address(&self) -> Option<Address> {
        match self {
            SmartContract::Native => None,
            SmartContract::Token(addr) => Some(*addr),
        }
    }
}

impl FromStr for SmartContract {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case(NATIVE_CONTRACT_SENTINEL) || s.is_empty() {
            return Ok(SmartContract::Native);
        }
        Address::from_str(s)
            .map(SmartContract::Token)
            .map_err(|e| WalletError::Config(format!("invalid contract address {}: {}", s, e)))
    }
}

impl fmt::Display for SmartContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmartContract::Native => f.write_str(NATIVE_CONTRACT_SENTINEL),
            SmartContract::Token(addr) => write!(f, "{:?}", addr),
        }
    }
}

/// 配置文件中的币种条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrencyEntry {
    pub id: String,
    pub network: String,
    /// 缺省时按网络名解析
    #[serde(default)]
    pub network_class: Option<NetworkClass>,
    pub decimals: u32,
    #[serde(default)]
    pub is_token: bool,
    #[serde(default = "default_contract")]
    pub smart_contract_address: String,
    pub rpc_url: String,
}

fn default_contract() -> String {
    NATIVE_CONTRACT_SENTINEL.to_string()
}

/// 已解析的币种配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrencyConfig {
    pub id: String,
    pub network: Network,
    pub decimals: u32,
    pub contract: SmartContract,
    pub rpc_url: String,
}

impl CurrencyConfig {
    pub fn is_token(&self) -> bool {
        matches!(self.contract, SmartContract::Token(_))
    }

    pub fn network_class(&self) -> NetworkClass {
        self.network.class
    }
}

impl TryFrom<CurrencyEntry> for CurrencyConfig {
    type Error = WalletError;

    fn try_from(entry: CurrencyEntry) -> Result<Self> {
        let contract: SmartContract = entry.smart_contract_address.parse()?;
        if entry.is_token != matches!(contract, SmartContract::Token(_)) {
            return Err(WalletError::Config(format!(
                "currency {}: is_token={} does not match contract '{}'",
                entry.id, entry.is_token, entry.smart_contract_address
            )));
        }
        if entry.rpc_url.trim().is_empty() {
            return Err(WalletError::Config(format!(
                "currency {}: rpc_url is empty",
                entry.id
            )));
        }
        let network = match entry.network_class {
            Some(class) => Network::new(&entry.network, class),
            None => Network::resolve(&entry.network),
        };
        Ok(Self {
            id: entry.id.to_uppercase(),
            network,
            decimals: entry.decimals,
            contract,
            rpc_url: entry.rpc_url,
        })
    }
}

/// 币种目录（外部配置的只读视图）
#[derive(Debug, Clone, Default)]
pub struct CurrencyDirectory {
    by_id: HashMap<String, CurrencyConfig>,
}

impl CurrencyDirectory {
    pub fn new(currencies: impl IntoIterator<Item = CurrencyConfig>) -> Self {
        let by_id = currencies
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        Self { by_id }
    }

    pub fn from_entries(entries: &[CurrencyEntry]) -> Result<Self> {
        let configs = entries
            .iter()
            .cloned()
            .map(CurrencyConfig::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(configs))
    }

    pub fn get(&self, currency_id: &str) -> Result<&CurrencyConfig> {
        self.by_id
            .get(&currency_id.to_uppercase())
            .ok_or_else(|| WalletError::ConfigNotFound(format!("currency {}", currency_id)))
    }

    /// 网络的原生币配置
    pub fn native_for(&self, network: &str) -> Result<&CurrencyConfig> {
        let name = canonical_network_name(network);
        self.by_id
            .values()
            .find(|c| c.network.name == name && !c.is_token())
            .ok_or_else(|| WalletError::ConfigNotFound(format!("native currency on {}", name)))
    }

    /// 网络的任意 RPC 路由（优先原生币）
    pub fn route_for(&self, network: &str) -> Result<&CurrencyConfig> {
        let name = canonical_network_name(network);
        self.native_for(&name).or_else(|_| {
            self.by_id
                .values()
                .find(|c| c.network.name == name)
                .ok_or_else(|| WalletError::ConfigNotFound(format!("rpc route for {}", name)))
        })
    }

    pub fn network(&self, network: &str) -> Result<Network> {
        self.route_for(network).map(|c| c.network.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = &CurrencyConfig> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, network: &str, contract: &str, decimals: u32) -> CurrencyEntry {
        CurrencyEntry {
            id: id.to_string(),
            network: network.to_string(),
            network_class: None,
            decimals,
            is_token: contract != NATIVE_CONTRACT_SENTINEL,
            smart_contract_address: contract.to_string(),
            rpc_url: "memory://test".to_string(),
        }
    }

    #[test]
    fn test_main_sentinel_is_native() {
        assert_eq!("main".parse::<SmartContract>().unwrap(), SmartContract::Native);
        assert_eq!("MAIN".parse::<SmartContract>().unwrap(), SmartContract::Native);
    }

    #[test]
    fn test_directory_lookup() {
        let dir = CurrencyDirectory::from_entries(&[
            entry("eth", "ethereum", "main", 18),
            entry(
                "usdc",
                "ethereum",
                "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48",
                6,
            ),
        ])
        .unwrap();

        assert_eq!(dir.get("ETH").unwrap().decimals, 18);
        assert!(dir.get("usdc").unwrap().is_token());
        assert_eq!(dir.native_for("eth").unwrap().id, "ETH");
        assert!(dir.get("BTC").is_err());
        assert_eq!(dir.route_for("polygon").unwrap_err().code(), "config_not_found");
    }

    #[test]
    fn test_mismatched_token_flag_rejected() {
        let mut bad = entry("eth", "ethereum", "main", 18);
        bad.is_token = true;
        assert!(CurrencyConfig::try_from(bad).is_err());
    }
}
