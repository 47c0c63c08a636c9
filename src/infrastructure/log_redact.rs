//! 日志脱敏
//! 地址与交易数据只输出前后缀；助记词与私钥不允许进入日志。

/// 脱敏十六进制字符串（显示前缀和后缀）
pub fn redact_hex_string(hex: &str, show_chars: usize) -> String {
    if hex.len() <= show_chars * 2 {
        return "*".repeat(hex.len());
    }

    let prefix = &hex[..show_chars];
    let suffix = &hex[hex.len() - show_chars..];
    format!("{}...{}", prefix, suffix)
}

/// 脱敏地址（显示前6位和后4位）
pub fn redact_address(address: &str) -> String {
    if address.len() < 10 || !address.is_ascii() {
        return "*".repeat(address.len());
    }

    let prefix = &address[..6];
    let suffix = &address[address.len() - 4..];
    format!("{}...{}", prefix, suffix)
}

/// 脱敏 EVM 地址
pub fn redact_evm_address(address: &ethers::types::Address) -> String {
    redact_address(&format!("{:?}", address))
}

/// 只保留派生路径的账户部分（索引用 * 代替）
pub fn redact_path(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((account, _)) => format!("{}/*", account),
        None => "*".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_hex_string() {
        assert_eq!(redact_hex_string("0x1234567890abcdef", 4), "0x12...cdef");
        assert_eq!(redact_hex_string("0x12", 4), "****");
    }

    #[test]
    fn test_redact_address() {
        assert_eq!(
            redact_address("0x9858EfFD232B4033E47d90003D41EC34EcaEda94"),
            "0x9858...da94"
        );
        assert_eq!(redact_address("short"), "*****");
        assert_eq!(
            redact_evm_address(&ethers::types::Address::zero()),
            "0x0000...0000"
        );
    }

    #[test]
    fn test_redact_path() {
        assert_eq!(redact_path("m/44'/60'/0'/0/7"), "m/44'/60'/0'/0/*");
    }
}
