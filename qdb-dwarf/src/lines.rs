//! ソース行情報

use crate::loader::load_dwarf;
use crate::Result;
use std::fmt;

/// ソース行情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
}

impl fmt::Display for LineInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)?;
        if let Some(column) = self.column {
            write!(f, ":{}", column)?;
        }
        Ok(())
    }
}

/// addr2lineによるソース行情報の取得
pub struct LineInfoProvider {
    context: addr2line::Context<gimli::EndianSlice<'static, gimli::RunTimeEndian>>,
}

impl LineInfoProvider {
    /// ELFファイルのデータから行情報プロバイダを作成する
    ///
    /// DWARFを持たないファイルでも作成でき、その場合lookupは常にNoneを返します。
    pub fn new(data: &'static [u8]) -> Result<Self> {
        let dwarf = load_dwarf(data)?;
        let context = addr2line::Context::from_dwarf(dwarf)
            .map_err(|e| anyhow::anyhow!("Failed to build line table: {}", e))?;
        Ok(Self { context })
    }

    /// アドレス（ファイル上の仮想アドレス）からソース行情報を取得する
    pub fn lookup(&self, addr: u64) -> Result<Option<LineInfo>> {
        let location = self
            .context
            .find_location(addr)
            .map_err(|e| anyhow::anyhow!("Failed to look up 0x{:x}: {}", addr, e))?;

        Ok(location.and_then(|loc| {
            Some(LineInfo {
                file: loc.file?.to_string(),
                line: loc.line?,
                column: loc.column,
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_info_display() {
        let info = LineInfo {
            file: "src/main.rs".to_string(),
            line: 42,
            column: None,
        };
        assert_eq!(info.to_string(), "src/main.rs:42");

        let info = LineInfo { column: Some(7), ..info };
        assert_eq!(info.to_string(), "src/main.rs:42:7");
    }
}
