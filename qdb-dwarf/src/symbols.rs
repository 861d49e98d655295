//! シンボル解決機能

use crate::{DwarfLoader, LineInfoProvider, Result};
use object::{Object, ObjectSymbol, SymbolKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// シンボル情報
#[derive(Debug, Clone)]
pub struct Symbol {
    /// マングルされたシンボル名
    pub name: String,
    /// デマングルされたシンボル名（ハッシュなし）
    pub demangled_name: String,
    /// ファイル上の仮想アドレス（ロードバイアス未加算）
    pub address: u64,
    pub size: u64,
}

impl Symbol {
    /// シンボルを作成し、デマングルされた名前を設定する
    pub fn new(name: String, address: u64, size: u64) -> Self {
        let demangled_name = demangle_symbol(&name);
        Self {
            name,
            demangled_name,
            address,
            size,
        }
    }

    /// 表示用の名前を取得
    pub fn display_name(&self) -> &str {
        &self.demangled_name
    }
}

/// シンボル名をデマングルする
fn demangle_symbol(name: &str) -> String {
    match rustc_demangle::try_demangle(name) {
        Ok(demangled) => format!("{:#}", demangled),
        // C/C++シンボルはそのまま
        Err(_) => name.to_string(),
    }
}

/// 1つのモジュール（ELFファイル）のシンボルテーブル
pub struct SymbolTable {
    /// モジュール名（ファイル名）
    name: String,
    path: PathBuf,
    data: &'static [u8],
    is_pie: bool,
    /// 名前（マングル名とデマングル名の両方） -> symbols_by_address のインデックス
    by_name: HashMap<String, usize>,
    /// アドレス順にソートされたシンボル
    symbols_by_address: Vec<Symbol>,
}

impl std::fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolTable")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("is_pie", &self.is_pie)
            .field("symbols", &self.symbols_by_address.len())
            .finish()
    }
}

impl SymbolTable {
    /// ローダーからシンボルテーブルを作成する
    ///
    /// .symtab と .dynsym の両方から、定義済みの関数・データシンボルを集めます。
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let object_file = loader.object_file();
        let mut symbols_by_address: Vec<Symbol> = object_file
            .symbols()
            .chain(object_file.dynamic_symbols())
            .filter(|s| s.is_definition() && matches!(s.kind(), SymbolKind::Text | SymbolKind::Data))
            .filter_map(|s| {
                let name = s.name().ok().filter(|n| !n.is_empty())?;
                Some(Symbol::new(name.to_string(), s.address(), s.size()))
            })
            .collect();

        symbols_by_address.sort_by(|a, b| a.address.cmp(&b.address).then_with(|| a.name.cmp(&b.name)));
        symbols_by_address.dedup_by(|a, b| a.address == b.address && a.name == b.name);

        let mut by_name = HashMap::new();
        for (idx, sym) in symbols_by_address.iter().enumerate() {
            by_name.entry(sym.name.clone()).or_insert(idx);
            by_name.entry(sym.demangled_name.clone()).or_insert(idx);
        }

        let path = loader.path().to_path_buf();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        tracing::debug!(module = %name, symbols = symbols_by_address.len(), "symbol table built");
        Ok(Self {
            name,
            path,
            data: loader.data(),
            is_pie: loader.is_pie(),
            by_name,
            symbols_by_address,
        })
    }

    /// ファイルを読み込んでシンボルテーブルを作成する
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(&DwarfLoader::load(path)?)
    }

    /// モジュール名（ファイル名）
    pub fn name(&self) -> &str {
        &self.name
    }

    /// モジュールのファイルパス
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// ロードバイアスの加算が必要か
    pub fn is_pie(&self) -> bool {
        self.is_pie
    }

    /// モジュール名として `name` にマッチするか
    ///
    /// `libc` は `libc.so.6` に、`libc.so` は `libc.so.6` にマッチします。
    pub fn matches_module(&self, name: &str) -> bool {
        self.name == name
            || self
                .name
                .strip_prefix(name)
                .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('-'))
    }

    /// シンボル名からアドレスを解決する（マングル名・デマングル名どちらでも可）
    pub fn resolve(&self, symbol: &str) -> Option<u64> {
        self.by_name.get(symbol).map(|&idx| self.symbols_by_address[idx].address)
    }

    /// アドレスからシンボルを解決する（アドレス以下で最も近いシンボル）
    pub fn reverse_resolve(&self, addr: u64) -> Option<&Symbol> {
        let idx = self.symbols_by_address.partition_point(|s| s.address <= addr);
        let sym = self.symbols_by_address.get(idx.checked_sub(1)?)?;
        if sym.size == 0 || addr < sym.address + sym.size {
            Some(sym)
        } else {
            None
        }
    }

    /// すべてのシンボルを取得する
    pub fn all_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols_by_address.iter()
    }

    /// パターンを含むシンボルを検索する（マングル名とデマングル名の両方）
    pub fn find_symbols(&self, pattern: &str) -> Vec<&Symbol> {
        self.symbols_by_address
            .iter()
            .filter(|s| s.name.contains(pattern) || s.demangled_name.contains(pattern))
            .collect()
    }

    /// このモジュールの行情報プロバイダを作成する
    pub fn lines(&self) -> Result<LineInfoProvider> {
        LineInfoProvider::new(self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demangle_rust_symbol() {
        let sym = Symbol::new("_ZN4core3ptr13drop_in_place17h0123456789abcdefE".to_string(), 0x1000, 16);
        assert_eq!(sym.display_name(), "core::ptr::drop_in_place");
    }

    #[test]
    fn test_plain_c_symbol() {
        let sym = Symbol::new("malloc".to_string(), 0x2000, 0);
        assert_eq!(sym.display_name(), "malloc");
    }
}
