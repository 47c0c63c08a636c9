//! 金额换算
//!
//! 十进制金额字符串 ↔ 链上最小单位。整数与小数部分按数字串直接换算为
//! `U256`，不经过浮点数或定长十进制类型，任何 U256 范围内的金额都能精确往返。

use ethers::types::U256;

use crate::error::{Result, WalletError};

/// EVM 原生币精度
pub const NATIVE_DECIMALS: u32 = 18;

/// U256 可表示的最大十进制精度
const MAX_DECIMALS: u32 = 77;

/// 规范化十进制金额字符串
///
/// 只接受数字和至多一个小数点（拒绝负号、指数、下划线和空串），
/// 去掉整数部分前导 0 与小数部分末尾 0，如 "001.50" → "1.5"。
pub fn normalize_amount(amount: &str) -> Result<String> {
    let trimmed = amount.trim();
    if trimmed.is_empty() {
        return Err(WalletError::InvalidArgument("amount is empty".into()));
    }
    if trimmed.starts_with('-') {
        return Err(WalletError::InvalidArgument(format!(
            "amount must not be negative: {}",
            trimmed
        )));
    }
    let invalid = || WalletError::InvalidArgument(format!("invalid amount: {}", trimmed));

    let (int_part, frac_part) = match trimmed.split_once('.') {
        Some((int_part, frac_part)) => (int_part, frac_part),
        None => (trimmed, ""),
    };
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(int_part) || !all_digits(frac_part) {
        return Err(invalid());
    }
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(invalid());
    }

    let int_part = int_part.trim_start_matches('0');
    let frac_part = frac_part.trim_end_matches('0');
    let int_part = if int_part.is_empty() { "0" } else { int_part };
    if frac_part.is_empty() {
        Ok(int_part.to_string())
    } else {
        Ok(format!("{}.{}", int_part, frac_part))
    }
}

/// 解析金额字符串并换算为最小单位
///
/// 小数位超过币种精度时报错，不做截断。
pub fn parse_base_units(amount: &str, decimals: u32) -> Result<U256> {
    if decimals > MAX_DECIMALS {
        return Err(WalletError::InvalidArgument(format!(
            "unsupported decimals: {}",
            decimals
        )));
    }
    let normalized = normalize_amount(amount)?;
    let fraction_digits = normalized
        .split_once('.')
        .map(|(_, frac)| frac.len())
        .unwrap_or(0);
    if fraction_digits > decimals as usize {
        return Err(WalletError::InvalidArgument(format!(
            "amount {} has more than {} fractional digits",
            normalized, decimals
        )));
    }

    // 整数部分与补齐到精度的小数部分拼成最小单位数字串
    let (int_part, frac_part) = normalized.split_once('.').unwrap_or((normalized.as_str(), ""));
    let digits = format!("{}{:0<width$}", int_part, frac_part, width = decimals as usize);
    U256::from_dec_str(&digits)
        .map_err(|_| WalletError::InvalidArgument(format!("amount {} overflows", normalized)))
}

/// 最小单位 → 规范十进制字符串（去掉末尾 0，如 "1.5"、"0"）
pub fn format_base_units(value: U256, decimals: u32) -> Result<String> {
    let formatted = ethers::utils::format_units(value, decimals)
        .map_err(|e| WalletError::InvalidArgument(format!("format units: {}", e)))?;
    Ok(trim_fraction(&formatted))
}

fn trim_fraction(s: &str) -> String {
    if !s.contains('.') {
        return s.to_string();
    }
    let trimmed = s.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
