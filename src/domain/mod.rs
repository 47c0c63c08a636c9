//! 领域层：网络、币种、金额与密钥派生

pub mod address;
pub mod currency;
pub mod derivation;
pub mod network;
pub mod units;

pub use address::{AllocationScope, AllocationState, DerivedAddress};
pub use currency::{CurrencyConfig, CurrencyDirectory, CurrencyEntry, SmartContract};
pub use derivation::{
    DerivationStrategy, DerivationStrategyFactory, DerivedKey, ExtendedPublicKey,
    KeyDerivationService, MasterSigner, SeedPhrase,
};
pub use network::{Network, NetworkClass};
