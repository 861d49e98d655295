//! 停止中のデバッギへのアクセス
//!
//! 式評価とビルトインはこのトレイト越しにレジスタ・メモリ・シンボルを参照します。

use crate::symbols::Symbolized;
use crate::Result;

/// 停止中のデバッギ
pub trait Inferior {
    /// レジスタを読む（`pc` や `eax` などの別名を受け付ける）
    fn register(&self, name: &str) -> Result<u64>;

    /// レジスタに書き込む
    fn set_register(&mut self, name: &str, value: u64) -> Result<()>;

    /// メモリを読む
    fn read_memory(&self, addr: u64, size: usize) -> Result<Vec<u8>>;

    /// メモリに書き込む
    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    /// シンボル名をアドレスに解決する
    fn resolve_symbol(&self, name: &str) -> Result<u64>;

    /// アドレスをシンボルで表す
    fn symbolize(&self, addr: u64) -> Option<Symbolized>;

    /// アドレスのソース行
    fn source_line(&self, addr: u64) -> Option<String>;

    /// 現在実行中のクエリのロケーション式
    fn query_location(&self) -> Option<&str> {
        None
    }

    /// リトルエンディアンの1/2/4/8バイト整数を読む
    fn read_uint(&self, addr: u64, size: usize) -> Result<u64> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(anyhow::anyhow!("Unsupported read size: {}", size));
        }
        let bytes = self.read_memory(addr, size)?;
        let mut buf = [0u8; 8];
        buf[..size].copy_from_slice(&bytes[..size]);
        Ok(u64::from_le_bytes(buf))
    }
}
