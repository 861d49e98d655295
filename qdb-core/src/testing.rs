//! テスト用の補助
//!
//! 出力を捕捉するコンソール、メモリ上の偽デバッギ、台本どおりに動くエンジンです。

use crate::console::{Console, Verbosity};
use crate::engine::{DebugEngine, HitCounts};
use crate::errors::SessionError;
use crate::inferior::Inferior;
use crate::query::Query;
use crate::symbols::{LoadedSymbols, Symbolized, SymbolsFuture};
use crate::target::{SymbolScope, TargetDescriptor};
use crate::Result;
use qdb_dwarf::SymbolTable;
use qdb_target::registers::canonical_name;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Write};
use std::rc::Rc;

/// 共有バッファへの書き込み先
#[derive(Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 捕捉したコンソール出力
pub struct Captured {
    out: SharedBuffer,
    err: SharedBuffer,
}

impl Captured {
    pub fn stdout(&self) -> String {
        self.out.contents()
    }

    pub fn stderr(&self) -> String {
        self.err.contents()
    }
}

/// 出力を捕捉するコンソールを作成する
pub fn capture_console(verbosity: Verbosity) -> (Rc<Console>, Captured) {
    let out = SharedBuffer::default();
    let err = SharedBuffer::default();
    let console = Console::with_writers(verbosity, out.clone(), err.clone());
    (Rc::new(console), Captured { out, err })
}

/// メモリ上の偽デバッギ
#[derive(Default)]
pub struct FakeInferior {
    registers: HashMap<&'static str, u64>,
    regions: Vec<(u64, Vec<u8>)>,
    symbols: Vec<(String, u64)>,
    pub location: Option<String>,
}

impl FakeInferior {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: u64) {
        let (wide, _) = canonical_name(name).unwrap();
        self.registers.insert(wide, value);
    }

    pub fn map(&mut self, base: u64, bytes: &[u8]) {
        self.regions.push((base, bytes.to_vec()));
    }

    pub fn add_symbol(&mut self, name: &str, addr: u64) {
        self.symbols.push((name.to_string(), addr));
    }

    fn region_offset(&self, addr: u64, size: usize) -> Option<(usize, usize)> {
        self.regions.iter().enumerate().find_map(|(i, (base, bytes))| {
            let offset = addr.checked_sub(*base)? as usize;
            (offset + size <= bytes.len()).then_some((i, offset))
        })
    }
}

impl Inferior for FakeInferior {
    fn register(&self, name: &str) -> Result<u64> {
        let (wide, low32) = canonical_name(name).ok_or_else(|| anyhow::anyhow!("Unknown register '{}'", name))?;
        let value = self.registers.get(wide).copied().unwrap_or_default();
        Ok(if low32 { value & 0xffff_ffff } else { value })
    }

    fn set_register(&mut self, name: &str, value: u64) -> Result<()> {
        let (wide, low32) = canonical_name(name).ok_or_else(|| anyhow::anyhow!("Unknown register '{}'", name))?;
        self.registers.insert(wide, if low32 { value & 0xffff_ffff } else { value });
        Ok(())
    }

    fn read_memory(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let (region, offset) = self
            .region_offset(addr, size)
            .ok_or_else(|| anyhow::anyhow!("Failed to read {} bytes at 0x{:x}", size, addr))?;
        Ok(self.regions[region].1[offset..offset + size].to_vec())
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let (region, offset) = self
            .region_offset(addr, data.len())
            .ok_or_else(|| anyhow::anyhow!("Failed to write {} bytes at 0x{:x}", data.len(), addr))?;
        self.regions[region].1[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn resolve_symbol(&self, name: &str) -> Result<u64> {
        self.symbols
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, addr)| *addr)
            .ok_or_else(|| anyhow::anyhow!("Symbol not found: '{}'", name))
    }

    fn symbolize(&self, addr: u64) -> Option<Symbolized> {
        self.symbols
            .iter()
            .filter(|(_, start)| *start <= addr)
            .max_by_key(|(_, start)| *start)
            .map(|(name, start)| Symbolized {
                module: "test".to_string(),
                symbol: name.clone(),
                offset: addr - start,
            })
    }

    fn source_line(&self, _addr: u64) -> Option<String> {
        None
    }

    fn query_location(&self) -> Option<&str> {
        self.location.as_deref()
    }
}

/// 台本どおりに応答するエンジン
#[derive(Default)]
pub struct ScriptedEngine {
    pub calls: Vec<String>,
    pub symbol_failure: Option<String>,
    pub symbol_warnings: Vec<String>,
    pub query_error: Option<String>,
    pub launch_error: Option<SessionError>,
    pub attach_error: Option<SessionError>,
    pub run_error: Option<SessionError>,
    pub exit_code: Option<i32>,
    pub counts: HitCounts,
}

impl DebugEngine for ScriptedEngine {
    fn load_symbols(&mut self, _target: &TargetDescriptor, _scope: &SymbolScope) -> SymbolsFuture {
        self.calls.push("load_symbols".to_string());
        match &self.symbol_failure {
            Some(message) => SymbolsFuture::ready(Err(anyhow::anyhow!("{}", message))),
            None => SymbolsFuture::ready(Ok(LoadedSymbols {
                tables: Vec::new(),
                warnings: self.symbol_warnings.clone(),
            })),
        }
    }

    fn attach_symbols(&mut self, tables: Vec<SymbolTable>) {
        self.calls.push(format!("attach_symbols:{}", tables.len()));
    }

    fn set_init_code(&mut self, code: &str) -> Result<()> {
        self.calls.push(format!("set_init_code:{}", code));
        Ok(())
    }

    fn add_queries(&mut self, queries: &[Query]) -> Result<()> {
        if let Some(message) = &self.query_error {
            return Err(anyhow::anyhow!("{}", message));
        }
        self.calls.push(format!("add_queries:{}", queries.len()));
        Ok(())
    }

    fn launch(&mut self, command_line: &str) -> std::result::Result<(), SessionError> {
        self.calls.push(format!("launch:{}", command_line));
        self.launch_error.take().map_or(Ok(()), Err)
    }

    fn attach(&mut self, pid: i32) -> std::result::Result<(), SessionError> {
        self.calls.push(format!("attach:{}", pid));
        self.attach_error.take().map_or(Ok(()), Err)
    }

    fn run(&mut self) -> std::result::Result<(), SessionError> {
        self.calls.push("run".to_string());
        self.run_error.take().map_or(Ok(()), Err)
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn counts(&self) -> HitCounts {
        self.counts.clone()
    }
}
