//! ERC-20 调用数据与事件解码

use ethers::{
    abi::{decode, encode, ParamType, Token},
    types::{Address, Bytes, Log, H256, U256},
    utils::keccak256,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WalletError};

/// `transfer(address,uint256)`
pub const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// `balanceOf(address)`
pub const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

/// `decimals()`
pub const DECIMALS_SELECTOR: [u8; 4] = [0x31, 0x3c, 0xe5, 0x67];

/// `Transfer(address,address,uint256)` 事件 topic0
pub fn transfer_event_topic() -> H256 {
    H256::from(keccak256("Transfer(address,address,uint256)"))
}

fn with_selector(selector: [u8; 4], args: &[Token]) -> Bytes {
    let mut data = selector.to_vec();
    data.extend(encode(args));
    Bytes::from(data)
}

pub fn encode_transfer(to: Address, amount: U256) -> Bytes {
    with_selector(TRANSFER_SELECTOR, &[Token::Address(to), Token::Uint(amount)])
}

pub fn encode_balance_of(owner: Address) -> Bytes {
    with_selector(BALANCE_OF_SELECTOR, &[Token::Address(owner)])
}

pub fn encode_decimals() -> Bytes {
    Bytes::from(DECIMALS_SELECTOR.to_vec())
}

/// 解析 `transfer` 调用数据，非 transfer 调用返回 None
pub fn decode_transfer_call(data: &[u8]) -> Option<(Address, U256)> {
    if data.len() < 4 || data[..4] != TRANSFER_SELECTOR {
        return None;
    }
    let tokens = decode(&[ParamType::Address, ParamType::Uint(256)], &data[4..]).ok()?;
    match tokens.as_slice() {
        [Token::Address(to), Token::Uint(amount)] => Some((*to, *amount)),
        _ => None,
    }
}

/// 解析 `balanceOf` 调用数据
pub fn decode_balance_of_call(data: &[u8]) -> Option<Address> {
    if data.len() < 4 || data[..4] != BALANCE_OF_SELECTOR {
        return None;
    }
    match decode(&[ParamType::Address], &data[4..]).ok()?.as_slice() {
        [Token::Address(owner)] => Some(*owner),
        _ => None,
    }
}

pub fn decode_uint256(data: &[u8]) -> Result<U256> {
    if data.len() < 32 {
        return Err(WalletError::InvalidArgument(format!(
            "expected at least 32 bytes for uint256, got {}",
            data.len()
        )));
    }
    Ok(U256::from_big_endian(&data[..32]))
}

/// `decimals()` 返回值（uint8）
pub fn decode_decimals(data: &[u8]) -> Result<u32> {
    let value = decode_uint256(data)?;
    if value > U256::from(u8::MAX) {
        return Err(WalletError::InvalidArgument(format!(
            "token decimals out of range: {}",
            value
        )));
    }
    Ok(value.as_u32())
}

pub fn encode_uint256(value: U256) -> Bytes {
    Bytes::from(encode(&[Token::Uint(value)]))
}

/// 解码后的代币转账事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransfer {
    pub contract: Address,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub log_index: Option<U256>,
}

/// 构造 Transfer 事件日志
pub fn transfer_log(contract: Address, from: Address, to: Address, value: U256) -> Log {
    Log {
        address: contract,
        topics: vec![transfer_event_topic(), H256::from(from), H256::from(to)],
        data: encode_uint256(value),
        ..Default::default()
    }
}

/// 解析 Transfer 事件；topic 不匹配或结构不完整时返回 None
pub fn decode_transfer_log(log: &Log) -> Option<TokenTransfer> {
    if log.topics.len() != 3 || log.topics[0] != transfer_event_topic() {
        return None;
    }
    let value = decode_uint256(&log.data).ok()?;
    Some(TokenTransfer {
        contract: log.address,
        from: Address::from(log.topics[1]),
        to: Address::from(log.topics[2]),
        value,
        log_index: log.log_index,
    })
}
