//! IronCore Engine - EVM 钱包派生、转账与地址分配引擎
//!
//! 非托管模式：种子只驻留内存，地址分配只使用扩展公钥

pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod repository;
pub mod service;

// 重新导出常用类型
pub use app_state::EngineContext;
pub use error::{Result, WalletError};

pub mod prelude {
    pub use crate::{
        app_state::EngineContext,
        domain::{
            CurrencyDirectory, DerivedAddress, KeyDerivationService, NetworkClass, SeedPhrase,
        },
        error::{Result, WalletError},
        service::{
            AddressAllocationCoordinator, BalanceReader, FeeEstimator, FeeQuote,
            TransactionInspector, TransferBuilder, TransferOutput,
        },
    };
}
