//! ブレークポイント機能

use crate::{Memory, Result};

/// INT3命令のオペコード
pub const INT3_OPCODE: u8 = 0xCC;

/// ソフトウェアブレークポイント（INT3命令）
#[derive(Debug)]
pub struct SoftwareBreakpoint {
    address: u64,
    original_byte: u8,
    inserted: bool,
}

impl SoftwareBreakpoint {
    /// ブレークポイントを作成する（まだ挿入しない）
    pub fn new(address: u64) -> Self {
        Self {
            address,
            original_byte: 0,
            inserted: false,
        }
    }

    /// ブレークポイントのアドレスを取得する
    pub fn address(&self) -> u64 {
        self.address
    }

    /// 命令がINT3で置き換えられているか
    pub fn is_inserted(&self) -> bool {
        self.inserted
    }

    /// 元のバイトを取得する
    pub fn original_byte(&self) -> u8 {
        self.original_byte
    }

    /// 指定アドレスの命令の先頭バイトを0xCCに置き換える
    pub fn insert(&mut self, memory: &Memory) -> Result<()> {
        if self.inserted {
            return Ok(());
        }

        self.original_byte = memory.read_u8(self.address)?;
        memory.write_u8(self.address, INT3_OPCODE)?;
        self.inserted = true;
        Ok(())
    }

    /// 元のバイトを書き戻す
    pub fn remove(&mut self, memory: &Memory) -> Result<()> {
        if !self.inserted {
            return Ok(());
        }

        memory.write_u8(self.address, self.original_byte)?;
        self.inserted = false;
        Ok(())
    }
}
