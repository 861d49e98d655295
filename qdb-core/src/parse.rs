//! パース関連のユーティリティ関数

use anyhow::Result;

/// 数値リテラルをu64にパースする
///
/// `0x`プレフィックス付きの16進数か10進数のみを受け付けます。
/// `add` のように16進数として読めるシンボル名を数値と取り違えないよう、
/// プレフィックスなしの16進数は受け付けません。
///
/// # Examples
/// ```
/// use qdb_core::parse::parse_number;
///
/// assert_eq!(parse_number("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_number("1234").unwrap(), 1234);
/// assert!(parse_number("add").is_err());
/// ```
pub fn parse_number(s: &str) -> Result<u64> {
    let s = s.trim();

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| anyhow::anyhow!("Invalid hexadecimal number '{}': {}", s, e))
    } else {
        s.parse::<u64>()
            .map_err(|e| anyhow::anyhow!("Invalid number '{}': {}", s, e))
    }
}

/// 数値リテラルとして書かれているか
pub fn is_number(s: &str) -> bool {
    parse_number(s).is_ok()
}
