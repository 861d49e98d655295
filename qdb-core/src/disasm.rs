//! 逆アセンブル機能
//!
//! `disas()` ビルトインが使う、x86-64命令列の逆アセンブルです。

use crate::Result;
use capstone::prelude::*;
use std::fmt;

/// 逆アセンブルした1命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub size: usize,
    pub mnemonic: String,
    pub operands: String,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}  {}", self.address, self.mnemonic)?;
        if !self.operands.is_empty() {
            write!(f, " {}", self.operands)?;
        }
        Ok(())
    }
}

/// 先頭から最大 `count` 命令を逆アセンブルする
///
/// # Arguments
/// * `code` - 命令のバイト列
/// * `base_addr` - 先頭のアドレス
/// * `count` - 命令数の上限
pub fn disassemble(code: &[u8], base_addr: u64, count: usize) -> Result<Vec<Instruction>> {
    let cs = Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode64)
        .syntax(arch::x86::ArchSyntax::Intel)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create Capstone: {}", e))?;

    let insns = cs
        .disasm_count(code, base_addr, count)
        .map_err(|e| anyhow::anyhow!("Failed to disassemble at 0x{:x}: {}", base_addr, e))?;

    Ok(insns
        .as_ref()
        .iter()
        .map(|insn| Instruction {
            address: insn.address(),
            size: insn.bytes().len(),
            mnemonic: insn.mnemonic().unwrap_or("").to_string(),
            operands: insn.op_str().unwrap_or("").to_string(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disassemble_simple() {
        // 簡単な関数: mov rax, 1; ret
        let code = vec![
            0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00, // mov rax, 1
            0xc3, // ret
        ];
        let insns = disassemble(&code, 0x1000, 8).unwrap();
        assert_eq!(insns.len(), 2);
        assert_eq!(insns[0].mnemonic, "mov");
        assert_eq!(insns[0].operands, "rax, 1");
        assert_eq!(insns[0].size, 7);
        assert_eq!(insns[1].address, 0x1007);
        assert_eq!(insns[1].mnemonic, "ret");
        assert_eq!(insns[1].to_string(), "0x0000000000001007  ret");
    }

    #[test]
    fn test_disassemble_count_limit() {
        let code = vec![0x90, 0x90, 0x90, 0xc3];
        let insns = disassemble(&code, 0x2000, 2).unwrap();
        assert_eq!(insns.len(), 2);
        assert!(insns.iter().all(|i| i.mnemonic == "nop"));
    }
}
