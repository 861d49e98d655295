//! レジスタアクセス機能

use crate::Result;
use nix::libc::user_regs_struct;
use nix::unistd::Pid;

/// regs() 等で表示する汎用レジスタ（表示順）
pub const GENERAL_REGISTERS: &[&str] = &[
    "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12", "r13", "r14",
    "r15", "rip", "eflags",
];

/// 64ビットレジスタ名（別名を正規化済み）からフィールドへの参照を得る
fn field<'a>(regs: &'a mut user_regs_struct, name: &str) -> Option<&'a mut u64> {
    let slot = match name {
        "rax" => &mut regs.rax,
        "rbx" => &mut regs.rbx,
        "rcx" => &mut regs.rcx,
        "rdx" => &mut regs.rdx,
        "rsi" => &mut regs.rsi,
        "rdi" => &mut regs.rdi,
        "rbp" => &mut regs.rbp,
        "rsp" => &mut regs.rsp,
        "r8" => &mut regs.r8,
        "r9" => &mut regs.r9,
        "r10" => &mut regs.r10,
        "r11" => &mut regs.r11,
        "r12" => &mut regs.r12,
        "r13" => &mut regs.r13,
        "r14" => &mut regs.r14,
        "r15" => &mut regs.r15,
        "rip" => &mut regs.rip,
        "eflags" => &mut regs.eflags,
        "fs_base" => &mut regs.fs_base,
        "gs_base" => &mut regs.gs_base,
        _ => return None,
    };
    Some(slot)
}

/// レジスタ名を (64ビット名, 32ビットアクセスか) に正規化する
///
/// `pc`/`sp`/`fp` は rip/rsp/rbp の別名、`eax`や`r8d`は下位32ビットです。
pub fn canonical_name(name: &str) -> Option<(&'static str, bool)> {
    let name = name.to_ascii_lowercase();
    let wide = match name.as_str() {
        "pc" => return Some(("rip", false)),
        "sp" => return Some(("rsp", false)),
        "fp" => return Some(("rbp", false)),
        "eax" | "ebx" | "ecx" | "edx" | "esi" | "edi" | "ebp" | "esp" | "eip" => {
            return GENERAL_REGISTERS
                .iter()
                .find(|r| r[1..] == name[1..])
                .map(|r| (*r, true));
        }
        n if n.starts_with('r') && n.ends_with('d') => {
            let base = &n[..n.len() - 1];
            return GENERAL_REGISTERS.iter().find(|r| **r == base).map(|r| (*r, true));
        }
        n => n,
    };

    GENERAL_REGISTERS
        .iter()
        .chain(["fs_base", "gs_base"].iter())
        .find(|r| **r == wide)
        .map(|r| (*r, false))
}

/// レジスタ情報
pub struct Registers {
    pid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// レジスタを読み取る
    pub fn read(&self) -> Result<user_regs_struct> {
        let regs = nix::sys::ptrace::getregs(self.pid)?;
        Ok(regs)
    }

    /// レジスタに書き込む
    pub fn write(&self, regs: user_regs_struct) -> Result<()> {
        nix::sys::ptrace::setregs(self.pid, regs)?;
        Ok(())
    }

    /// 名前でレジスタ値を取得する
    pub fn get(&self, name: &str) -> Result<u64> {
        let (wide, low32) = canonical_name(name).ok_or_else(|| anyhow::anyhow!("Unknown register '{}'", name))?;
        let mut regs = self.read()?;
        let value = field(&mut regs, wide).map(|v| *v).unwrap_or_default();
        Ok(if low32 { value & 0xffff_ffff } else { value })
    }

    /// 名前でレジスタ値を設定する
    ///
    /// 32ビット名への書き込みはx86-64と同じく上位をゼロ拡張します。
    pub fn set(&self, name: &str, value: u64) -> Result<()> {
        let (wide, low32) = canonical_name(name).ok_or_else(|| anyhow::anyhow!("Unknown register '{}'", name))?;
        let mut regs = self.read()?;
        if let Some(slot) = field(&mut regs, wide) {
            *slot = if low32 { value & 0xffff_ffff } else { value };
        }
        self.write(regs)
    }

    /// プログラムカウンタ（RIP）を取得する
    pub fn get_pc(&self) -> Result<u64> {
        Ok(self.read()?.rip)
    }

    /// プログラムカウンタ（RIP）を設定する
    pub fn set_pc(&self, pc: u64) -> Result<()> {
        let mut regs = self.read()?;
        regs.rip = pc;
        self.write(regs)
    }
}
