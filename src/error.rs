//! 引擎错误类型
//!
//! 所有服务统一返回 `WalletError`，调用方根据 `code()` 和 `is_retryable()`
//! 决定重试或直接上报。

use ethers::providers::{ProviderError, RpcError};
use thiserror::Error;

pub type Result<T, E = WalletError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum WalletError {
    /// 助记词校验失败
    #[error("invalid seed phrase: {0}")]
    InvalidSeed(String),

    /// 扩展公钥/派生路径格式错误
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// 币种或网络没有配置 RPC 路由
    #[error("no configuration found for {0}")]
    ConfigNotFound(String),

    /// RPC 连接失败或超时（可重试）
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// 余额不足，金额均为最小单位
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: String, available: String },

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    /// 网络类别没有可用的派生策略
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    /// 索引或地址已被其他分配占用
    #[error("allocation conflict: {0}")]
    AllocationConflict(String),

    /// 交易已上链但执行失败 (status = 0)
    #[error("transaction reverted: {0}")]
    TransactionReverted(String),

    /// 节点返回 JSON-RPC 错误响应（执行回滚、nonce 过低等），重试无意义
    #[error("rpc request rejected: {0}")]
    RpcRejected(String),

    #[error("timed out waiting for confirmation of {0}")]
    ConfirmationTimeout(String),

    #[error("address registry error: {0}")]
    Registry(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl WalletError {
    /// 稳定的错误码，供上层记录和映射
    pub fn code(&self) -> &'static str {
        match self {
            WalletError::InvalidSeed(_) => "invalid_seed",
            WalletError::InvalidKey(_) => "invalid_key",
            WalletError::ConfigNotFound(_) => "config_not_found",
            WalletError::NetworkUnavailable(_) => "network_unavailable",
            WalletError::InsufficientFunds { .. } => "insufficient_funds",
            WalletError::MissingField(_) => "missing_field",
            WalletError::InvalidArgument(_) => "invalid_argument",
            WalletError::TransactionNotFound(_) => "transaction_not_found",
            WalletError::UnsupportedNetwork(_) => "unsupported_network",
            WalletError::AllocationConflict(_) => "allocation_conflict",
            WalletError::TransactionReverted(_) => "transaction_reverted",
            WalletError::RpcRejected(_) => "rpc_rejected",
            WalletError::ConfirmationTimeout(_) => "confirmation_timeout",
            WalletError::Registry(_) => "registry_error",
            WalletError::Config(_) => "config_error",
        }
    }

    /// 调用方可以安全重试的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WalletError::NetworkUnavailable(_)
                | WalletError::AllocationConflict(_)
                | WalletError::ConfirmationTimeout(_)
        )
    }

    pub fn insufficient(required: impl ToString, available: impl ToString) -> Self {
        WalletError::InsufficientFunds {
            required: required.to_string(),
            available: available.to_string(),
        }
    }
}

impl From<ProviderError> for WalletError {
    fn from(e: ProviderError) -> Self {
        // 节点已应答的错误不是网络故障
        if let ProviderError::JsonRpcClientError(inner) = &e {
            if let Some(resp) = inner.as_error_response() {
                return WalletError::RpcRejected(format!("{} (code {})", resp.message, resp.code));
            }
        }
        WalletError::NetworkUnavailable(e.to_string())
    }
}

impl From<sqlx::Error> for WalletError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                WalletError::AllocationConflict(db.message().to_string())
            }
            _ => WalletError::Registry(e.to_string()),
        }
    }
}

impl From<redis::RedisError> for WalletError {
    fn from(e: redis::RedisError) -> Self {
        WalletError::NetworkUnavailable(format!("redis: {}", e))
    }
}
