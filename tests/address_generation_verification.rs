//! 地址生成算法验证测试
//!
//! 使用 BIP39 标准测试向量，验证派生结果与主流钱包一致，
//! 并验证扩展公钥派生与种子派生完全相同。
//!
//! Mnemonic: "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon
//! abandon about"

use ironcore_engine::domain::{
    ExtendedPublicKey, KeyDerivationService, NetworkClass, SeedPhrase,
};

const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

fn master() -> ironcore_engine::domain::MasterSigner {
    KeyDerivationService::master_from_seed(&SeedPhrase::new(TEST_MNEMONIC)).unwrap()
}

#[test]
fn test_ethereum_address_bip39_vector() {
    let derived = master().derive(NetworkClass::Evm, 0).unwrap();

    assert_eq!(derived.address, "0x9858EfFD232B4033E47d90003D41EC34EcaEda94");
    assert_eq!(derived.path, "m/44'/60'/0'/0/0");
    // 压缩公钥 33 字节
    assert_eq!(derived.public_key.len(), 2 + 66);
}

#[test]
fn test_ethereum_second_account() {
    let derived = master().derive(NetworkClass::Evm, 1).unwrap();
    assert_eq!(derived.address, "0x6Fac4D18c912343BF86fa7049364Dd4E424Ab9C0");
    assert_eq!(derived.path, "m/44'/60'/0'/0/1");
}

#[test]
fn test_bitcoin_native_segwit_vectors() {
    let master = master();
    let first = master.derive(NetworkClass::Utxo, 0).unwrap();
    let second = master.derive(NetworkClass::Utxo, 1).unwrap();

    assert_eq!(first.address, "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu");
    assert_eq!(first.path, "m/84'/0'/0'/0/0");
    assert_eq!(second.address, "bc1qnjg0jd8228aq7egyzacy8cys3knf9xvrerkf9g");
}

#[test]
fn test_watch_only_derivation_matches_seed() {
    let master = master();
    for class in [NetworkClass::Evm, NetworkClass::Utxo] {
        let xpub = master.account_xpub(class).unwrap();
        // 经过 base58 序列化后仍然一致
        let restored: ExtendedPublicKey = xpub.as_str().parse().unwrap();

        for index in [0u32, 1, 7, 1000] {
            let from_seed = master.derive(class, index).unwrap();
            let from_xpub = KeyDerivationService::derive_address(&restored, class, index).unwrap();
            assert_eq!(from_seed, from_xpub, "class {} index {}", class, index);
        }
    }
}

#[test]
fn test_derivation_is_deterministic() {
    let a = master().derive(NetworkClass::Evm, 42).unwrap();
    let b = master().derive(NetworkClass::Evm, 42).unwrap();
    let c = master().derive(NetworkClass::Evm, 43).unwrap();
    assert_eq!(a, b);
    assert_ne!(a.address, c.address);
}

#[test]
fn test_signer_matches_derived_address() {
    let master = master();
    for index in [0u32, 3] {
        let derived = master.derive(NetworkClass::Evm, index).unwrap();
        let signer_address = master.evm_address(index).unwrap();
        assert_eq!(
            ethers::utils::to_checksum(&signer_address, None),
            derived.address
        );
    }
}

#[test]
fn test_invalid_inputs_rejected() {
    let err = KeyDerivationService::master_from_seed(&SeedPhrase::new(
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon",
    ))
    .unwrap_err();
    assert_eq!(err.code(), "invalid_seed");

    let err = "xpub-not-a-key".parse::<ExtendedPublicKey>().unwrap_err();
    assert_eq!(err.code(), "invalid_key");

    let xpub = master().account_xpub(NetworkClass::Evm).unwrap();
    let err = KeyDerivationService::derive_address(&xpub, NetworkClass::Other, 0).unwrap_err();
    assert_eq!(err.code(), "unsupported_network");
}
