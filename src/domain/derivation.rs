//! 钱包派生策略
//!
//! 地址派生是纯函数：相同的 (种子, 网络类别, 索引) 永远得到相同的地址和公钥。
//! 所有 EVM 网络使用同一路径模板 `m/44'/60'/0'/0/{index}`，只有索引不同。
//! 地址分配只用账户级扩展公钥；私钥只存在于 `MasterSigner` 的内存里。

use std::{fmt, str::FromStr};

use bip39::{Language, Mnemonic};
use coins_bip32::{
    enc::{MainnetEncoder, XKeyEncoder},
    prelude::*,
};
use ethers::signers::{LocalWallet, Signer};
use k256::ecdsa::{SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};
use zeroize::Zeroizing;

use crate::{
    domain::network::NetworkClass,
    error::{Result, WalletError},
    infrastructure::log_redact::redact_hex_string,
};

/// 非硬化索引上限
const HARDENED_BIT: u32 = 0x8000_0000;

/// 外部地址链 (change = 0)
const EXTERNAL_CHAIN: u32 = 0;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 种子
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// 助记词，仅驻留内存，drop 时清零
pub struct SeedPhrase(Zeroizing<String>);

impl SeedPhrase {
    pub fn new(phrase: impl Into<String>) -> Self {
        Self(Zeroizing::new(phrase.into()))
    }

    /// 从环境变量读取（变量名来自配置，变量值不落盘）
    pub fn from_env(var: &str) -> Result<Self> {
        std::env::var(var)
            .map(Self::new)
            .map_err(|_| WalletError::Config(format!("seed variable {} is not set", var)))
    }

    fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for SeedPhrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SeedPhrase(<redacted>)")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 扩展公钥
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// 账户级扩展公钥 (BIP32 xpub, base58)
#[derive(Clone)]
pub struct ExtendedPublicKey {
    encoded: String,
    key: XPub,
}

impl ExtendedPublicKey {
    fn from_xpub(key: XPub) -> Result<Self> {
        let encoded = MainnetEncoder::xpub_to_base58(&key)
            .map_err(|e| WalletError::InvalidKey(format!("encode xpub: {}", e)))?;
        Ok(Self { encoded, key })
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

impl FromStr for ExtendedPublicKey {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        let key = MainnetEncoder::xpub_from_base58(s.trim())
            .map_err(|e| WalletError::InvalidKey(format!("malformed extended key: {}", e)))?;
        Ok(Self {
            encoded: s.trim().to_string(),
            key,
        })
    }
}

impl fmt::Display for ExtendedPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl fmt::Debug for ExtendedPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtendedPublicKey({})", redact_hex_string(&self.encoded, 8))
    }
}

/// 派生结果（只含公开信息）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKey {
    pub path: String,
    pub address: String,
    pub public_key: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 策略
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// 钱包派生策略 trait
pub trait DerivationStrategy: Send + Sync {
    /// 账户级路径（硬化部分）
    fn account_path(&self) -> &'static str;

    /// 公钥 → (地址, 公钥 hex)
    fn encode(&self, key: &VerifyingKey) -> Result<(String, String)>;

    fn full_path(&self, index: u32) -> String {
        format!("{}/{}/{}", self.account_path(), EXTERNAL_CHAIN, index)
    }
}

/// EVM 策略 (ETH, BSC, Polygon, L2 ...)
pub struct EvmStrategy;

impl DerivationStrategy for EvmStrategy {
    fn account_path(&self) -> &'static str {
        "m/44'/60'/0'"
    }

    fn encode(&self, key: &VerifyingKey) -> Result<(String, String)> {
        let uncompressed = key.to_encoded_point(false);
        // 去掉 0x04 前缀后做 Keccak256，取后 20 字节
        let hash = Keccak256::digest(&uncompressed.as_bytes()[1..]);
        let address = ethers::types::Address::from_slice(&hash[12..]);
        let compressed = key.to_encoded_point(true);
        Ok((
            ethers::utils::to_checksum(&address, None),
            format!("0x{}", hex::encode(compressed.as_bytes())),
        ))
    }
}

/// UTXO 策略 (BIP84 native segwit)
pub struct UtxoStrategy;

impl DerivationStrategy for UtxoStrategy {
    fn account_path(&self) -> &'static str {
        "m/84'/0'/0'"
    }

    fn encode(&self, key: &VerifyingKey) -> Result<(String, String)> {
        use bitcoin::{secp256k1::PublicKey as Secp256k1PublicKey, Address, PublicKey};

        let compressed = key.to_encoded_point(true);
        let secp_pubkey = Secp256k1PublicKey::from_slice(compressed.as_bytes())
            .map_err(|e| WalletError::InvalidKey(format!("secp256k1 public key: {}", e)))?;
        let address = Address::p2wpkh(&PublicKey::new(secp_pubkey), bitcoin::Network::Bitcoin)
            .map_err(|e| WalletError::InvalidKey(format!("p2wpkh address: {}", e)))?;
        Ok((address.to_string(), hex::encode(compressed.as_bytes())))
    }
}

/// 策略工厂
pub struct DerivationStrategyFactory;

impl DerivationStrategyFactory {
    pub fn create_strategy(class: NetworkClass) -> Result<Box<dyn DerivationStrategy>> {
        match class {
            NetworkClass::Evm => Ok(Box::new(EvmStrategy)),
            NetworkClass::Utxo => Ok(Box::new(UtxoStrategy)),
            NetworkClass::Other => Err(WalletError::UnsupportedNetwork(format!(
                "no derivation strategy for network class {}",
                class
            ))),
        }
    }
}

fn check_index(index: u32) -> Result<()> {
    if index >= HARDENED_BIT {
        return Err(WalletError::InvalidArgument(format!(
            "derivation index {} is out of range",
            index
        )));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 服务
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// 密钥派生服务（无状态）
pub struct KeyDerivationService;

impl KeyDerivationService {
    /// 从账户级扩展公钥派生第 `index` 个外部地址
    pub fn derive_address(
        extended_key: &ExtendedPublicKey,
        class: NetworkClass,
        index: u32,
    ) -> Result<DerivedKey> {
        check_index(index)?;
        let strategy = DerivationStrategyFactory::create_strategy(class)?;
        let child = extended_key
            .key
            .derive_child(EXTERNAL_CHAIN)
            .and_then(|k| k.derive_child(index))
            .map_err(|e| WalletError::InvalidKey(format!("derive child {}: {}", index, e)))?;
        let verifying_key: &VerifyingKey = child.as_ref();
        let (address, public_key) = strategy.encode(verifying_key)?;
        Ok(DerivedKey {
            path: strategy.full_path(index),
            address,
            public_key,
        })
    }

    /// 校验助记词并生成主签名器
    pub fn master_from_seed(seed: &SeedPhrase) -> Result<MasterSigner> {
        let mnemonic = Mnemonic::parse_in(Language::English, seed.expose())
            .map_err(|e| WalletError::InvalidSeed(e.to_string()))?;
        let seed_bytes = Zeroizing::new(mnemonic.to_seed(""));
        let root = XPriv::root_from_seed(seed_bytes.as_ref(), None)
            .map_err(|e| WalletError::InvalidSeed(format!("master key: {}", e)))?;
        Ok(MasterSigner { root })
    }
}

/// 主签名器：可在任意索引派生私钥与公钥
pub struct MasterSigner {
    root: XPriv,
}

impl fmt::Debug for MasterSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSigner(<redacted>)")
    }
}

impl MasterSigner {
    fn derive_private(&self, path: &str) -> Result<XPriv> {
        self.root
            .derive_path(path)
            .map_err(|e| WalletError::InvalidKey(format!("derive {}: {}", path, e)))
    }

    /// 导出网络类别的账户级扩展公钥（只读）
    pub fn account_xpub(&self, class: NetworkClass) -> Result<ExtendedPublicKey> {
        let strategy = DerivationStrategyFactory::create_strategy(class)?;
        let account = self.derive_private(strategy.account_path())?;
        ExtendedPublicKey::from_xpub(account.verify_key())
    }

    /// 直接从种子派生完整路径
    pub fn derive(&self, class: NetworkClass, index: u32) -> Result<DerivedKey> {
        check_index(index)?;
        let strategy = DerivationStrategyFactory::create_strategy(class)?;
        let path = strategy.full_path(index);
        let key = self.derive_private(&path)?;
        let signing_key: &SigningKey = key.as_ref();
        let (address, public_key) = strategy.encode(signing_key.verifying_key())?;
        Ok(DerivedKey {
            path,
            address,
            public_key,
        })
    }

    /// EVM 签名钱包；`chain_id` 在构造交易时再设置
    pub fn evm_signer(&self, index: u32) -> Result<LocalWallet> {
        check_index(index)?;
        let path = EvmStrategy.full_path(index);
        let key = self.derive_private(&path)?;
        let signing_key: &SigningKey = key.as_ref();
        Ok(LocalWallet::from(signing_key.clone()))
    }

    /// EVM 地址（与 `evm_signer(index).address()` 一致）
    pub fn evm_address(&self, index: u32) -> Result<ethers::types::Address> {
        Ok(self.evm_signer(index)?.address())
    }
}
