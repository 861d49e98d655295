//! ブレークポイント管理
//!
//! アドレスごとに1つのソフトウェアブレークポイント（INT3）を置き、
//! そのアドレスで評価するクエリの番号を登録順に保持します。

use crate::Result;
use qdb_target::{Memory, SoftwareBreakpoint};
use std::collections::BTreeMap;

/// クエリの登録番号
pub type QueryIndex = usize;

/// ブレークポイントを置いた場所
#[derive(Debug)]
struct Site {
    breakpoint: SoftwareBreakpoint,
    queries: Vec<QueryIndex>,
}

/// ブレークポイントマネージャ
#[derive(Debug, Default)]
pub struct BreakpointManager {
    sites: BTreeMap<u64, Site>,
}

impl BreakpointManager {
    /// 新しいブレークポイントマネージャを作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// クエリをアドレスに登録し、必要ならINT3を挿入する
    pub fn add(&mut self, address: u64, query: QueryIndex, memory: &Memory) -> Result<()> {
        if let Some(site) = self.sites.get_mut(&address) {
            site.queries.push(query);
            return Ok(());
        }

        let mut breakpoint = SoftwareBreakpoint::new(address);
        breakpoint.insert(memory)?;
        tracing::debug!("inserted breakpoint at 0x{:x} for query #{}", address, query + 1);

        self.sites.insert(
            address,
            Site {
                breakpoint,
                queries: vec![query],
            },
        );
        Ok(())
    }

    pub fn contains(&self, address: u64) -> bool {
        self.sites.contains_key(&address)
    }

    /// アドレスで評価するクエリ（登録順）
    pub fn queries_at(&self, address: u64) -> &[QueryIndex] {
        self.sites.get(&address).map(|s| s.queries.as_slice()).unwrap_or_default()
    }

    /// ブレークポイントの数を取得する
    pub fn count(&self) -> usize {
        self.sites.len()
    }

    /// ステップ実行のために一時的に元の命令へ戻す
    pub fn disable(&mut self, address: u64, memory: &Memory) -> Result<()> {
        match self.sites.get_mut(&address) {
            Some(site) => site.breakpoint.remove(memory),
            None => Ok(()),
        }
    }

    /// 一時的に戻した命令を再びINT3にする
    pub fn enable(&mut self, address: u64, memory: &Memory) -> Result<()> {
        match self.sites.get_mut(&address) {
            Some(site) => site.breakpoint.insert(memory),
            None => Ok(()),
        }
    }

    /// すべてのブレークポイントを取り除く
    pub fn remove_all(&mut self, memory: &Memory) -> Result<()> {
        for site in self.sites.values_mut() {
            site.breakpoint.remove(memory)?;
        }
        self.sites.clear();
        Ok(())
    }

    /// 読み出したメモリ内のINT3を元のバイトに戻す
    pub fn patch_original(&self, addr: u64, bytes: &mut [u8]) {
        let end = addr.saturating_add(bytes.len() as u64);
        for (address, site) in self.sites.range(addr..end) {
            if site.breakpoint.is_inserted() {
                bytes[(address - addr) as usize] = site.breakpoint.original_byte();
            }
        }
    }
}
