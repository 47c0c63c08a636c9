//! 配置管理模块
//! 支持从环境变量和配置文件加载配置

use std::{path::Path, str::FromStr};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::currency::{CurrencyDirectory, CurrencyEntry};

/// 引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    /// 币种目录（只能从配置文件提供）
    #[serde(default)]
    pub currencies: Vec<CurrencyEntry>,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Redis配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

/// 地址注册表后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    Postgres,
    Memory,
}

impl FromStr for RegistryBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(RegistryBackend::Postgres),
            "memory" => Ok(RegistryBackend::Memory),
            other => anyhow::bail!("unknown registry backend: {}", other),
        }
    }
}

/// 派生与地址分配配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 保存助记词的环境变量名（值本身不进配置）
    pub seed_env: String,
    /// EVM 范围内没有任何分配时的起始索引
    pub default_start_index: u32,
    /// 索引/地址冲突时的重试次数
    pub allocation_retry_limit: u32,
    /// 多实例部署时启用 Redis 锁
    pub use_distributed_lock: bool,
    pub lock_ttl_secs: u64,
    pub lock_wait_ms: u64,
    pub registry_backend: RegistryBackend,
}

/// RPC 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// 只读调用的最大重试次数（广播不重试）
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub receipt_poll_interval_ms: u64,
    pub receipt_timeout_secs: u64,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://root@localhost:5432/wallet_engine".into()),
            max_connections: env_parse("DB_MAX_CONNS", 16),
            min_connections: env_parse("DB_MIN_CONNS", 2),
            acquire_timeout_secs: env_parse("DB_ACQ_TIMEOUT_SECS", 5),
            idle_timeout_secs: env_parse("DB_IDLE_TIMEOUT_SECS", 300),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into()),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".into()),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed_env: std::env::var("WALLET_SEED_ENV").unwrap_or_else(|_| "WALLET_SEED".into()),
            default_start_index: env_parse("DEFAULT_START_INDEX", 0),
            allocation_retry_limit: env_parse("ALLOCATION_RETRY_LIMIT", 3),
            use_distributed_lock: env_flag("USE_DISTRIBUTED_LOCK", false),
            lock_ttl_secs: env_parse("ALLOCATION_LOCK_TTL_SECS", 30),
            lock_wait_ms: env_parse("ALLOCATION_LOCK_WAIT_MS", 5000),
            registry_backend: std::env::var("REGISTRY_BACKEND")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(RegistryBackend::Postgres),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: env_parse("RPC_CONNECT_TIMEOUT_SECS", 10),
            request_timeout_secs: env_parse("RPC_REQUEST_TIMEOUT_SECS", 30),
            max_retries: env_parse("RPC_MAX_RETRIES", 3),
            retry_backoff_ms: env_parse("RPC_RETRY_BACKOFF_MS", 500),
            receipt_poll_interval_ms: env_parse("RECEIPT_POLL_INTERVAL_MS", 2000),
            receipt_timeout_secs: env_parse("RECEIPT_TIMEOUT_SECS", 180),
        }
    }
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database: DatabaseConfig::default(),
            redis: RedisConfig::default(),
            logging: LoggingConfig::default(),
            engine: EngineConfig::default(),
            rpc: RpcConfig::default(),
            currencies: Vec::new(),
        })
    }

    /// 从配置文件加载配置（缺省段落回落到环境变量默认值）
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// 从环境变量和配置文件合并加载（配置文件优先级更高）
    pub fn from_env_and_file<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut config = Self::from_env()?;

        if let Some(path) = path {
            if path.as_ref().exists() {
                config = Self::from_file(path)?;
            }
        }

        Ok(config)
    }

    /// 构建币种目录
    pub fn currency_directory(&self) -> Result<CurrencyDirectory> {
        CurrencyDirectory::from_entries(&self.currencies)
            .with_context(|| "Invalid currency configuration")
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        if self.engine.registry_backend == RegistryBackend::Postgres
            && !self.database.url.starts_with("postgres://")
            && !self.database.url.starts_with("postgresql://")
        {
            anyhow::bail!("DATABASE_URL must start with postgres:// or postgresql://");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("LOG_LEVEL must be one of: {:?}", valid_levels);
        }

        if self.logging.format != "json" && self.logging.format != "text" {
            anyhow::bail!("LOG_FORMAT must be 'json' or 'text'");
        }

        if self.engine.seed_env.trim().is_empty() {
            anyhow::bail!("engine.seed_env must name an environment variable");
        }

        if self.engine.allocation_retry_limit == 0 {
            anyhow::bail!("engine.allocation_retry_limit must be at least 1");
        }

        if self.rpc.receipt_poll_interval_ms == 0 || self.rpc.receipt_timeout_secs == 0 {
            anyhow::bail!("rpc receipt polling interval and timeout must be positive");
        }

        let mut seen = std::collections::HashSet::new();
        for entry in &self.currencies {
            if !seen.insert(entry.id.to_uppercase()) {
                anyhow::bail!("duplicate currency id: {}", entry.id);
            }
        }
        self.currency_directory()?;

        Ok(())
    }
}
