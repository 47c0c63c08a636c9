//! 网络分类
//!
//! 网络名在边界处解析一次为 `NetworkClass`，之后只传递枚举值，
//! 不再重复做 "是否 EVM" 的字符串判断。

use std::fmt;

use serde::{Deserialize, Serialize};

/// 网络类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkClass {
    /// 以太坊兼容链，共用同一派生路径与地址
    Evm,
    /// UTXO 链 (Bitcoin 系)
    Utxo,
    /// 其他链，无派生策略
    Other,
}

impl NetworkClass {
    pub fn is_evm(self) -> bool {
        matches!(self, NetworkClass::Evm)
    }

    /// 根据网络名/别名解析类别，未知网络归为 `Other`
    pub fn resolve(network: &str) -> NetworkClass {
        let name = canonical_network_name(network);
        if EVM_NETWORKS.contains(&name.as_str()) {
            NetworkClass::Evm
        } else if UTXO_NETWORKS.contains(&name.as_str()) {
            NetworkClass::Utxo
        } else {
            NetworkClass::Other
        }
    }
}

impl fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkClass::Evm => "evm",
            NetworkClass::Utxo => "utxo",
            NetworkClass::Other => "other",
        };
        f.write_str(s)
    }
}

const EVM_NETWORKS: &[&str] = &[
    "ethereum",
    "sepolia",
    "bsc",
    "polygon",
    "arbitrum",
    "optimism",
    "avalanche",
    "base",
];

const UTXO_NETWORKS: &[&str] = &["bitcoin", "litecoin", "dogecoin"];

/// 别名 → 规范名（小写）
const ALIASES: &[(&str, &str)] = &[
    ("eth", "ethereum"),
    ("mainnet", "ethereum"),
    ("binance", "bsc"),
    ("bnb", "bsc"),
    ("matic", "polygon"),
    ("arb", "arbitrum"),
    ("op", "optimism"),
    ("avax", "avalanche"),
    ("btc", "bitcoin"),
    ("ltc", "litecoin"),
    ("doge", "dogecoin"),
];

/// 标准化网络标识符
pub fn canonical_network_name(network: &str) -> String {
    let lower = network.trim().to_lowercase();
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == lower)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(lower)
}

/// 已解析的网络
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub class: NetworkClass,
}

impl Network {
    pub fn new(name: impl AsRef<str>, class: NetworkClass) -> Self {
        Self {
            name: canonical_network_name(name.as_ref()),
            class,
        }
    }

    /// 按名称解析网络类别
    pub fn resolve(name: impl AsRef<str>) -> Self {
        let name = canonical_network_name(name.as_ref());
        let class = NetworkClass::resolve(&name);
        Self { name, class }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.class)
    }
}
