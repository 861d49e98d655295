//! デバッグエンジンの境界
//!
//! セッションオーケストレータが駆動するエンジンのトレイトと、
//! エンジンが所有するヒットカウントの型を定義します。

use crate::errors::SessionError;
use crate::parse::parse_number;
use crate::query::Query;
use crate::symbols::SymbolsFuture;
use crate::target::{SymbolScope, TargetDescriptor};
use anyhow::Result;
use indexmap::IndexMap;
use qdb_dwarf::SymbolTable;
use std::fmt;

/// ヒットカウントのキー
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HitKey {
    /// 数値リテラルで書かれたロケーション
    Address(u64),
    /// それ以外（シンボルや式）のロケーション
    Symbol(String),
}

impl HitKey {
    /// ロケーション式からキーを決める
    pub fn for_location(location_expr: &str) -> Self {
        match parse_number(location_expr) {
            Ok(address) => HitKey::Address(address),
            Err(_) => HitKey::Symbol(location_expr.to_string()),
        }
    }
}

impl fmt::Display for HitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HitKey::Address(address) => write!(f, "0x{:x}", address),
            HitKey::Symbol(name) => f.write_str(name),
        }
    }
}

/// ロケーションごとのヒット回数（最初に記録された順を保つ）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HitCounts {
    entries: IndexMap<HitKey, u64>,
}

impl HitCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// キーのカウントを1増やす
    pub fn increment(&mut self, key: &HitKey) {
        match self.entries.get_mut(key) {
            Some(count) => *count += 1,
            None => {
                self.entries.insert(key.clone(), 1);
            }
        }
    }

    pub fn get(&self, key: &HitKey) -> Option<u64> {
        self.entries.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HitKey, u64)> {
        self.entries.iter().map(|(k, count)| (k, *count))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(HitKey, u64)> for HitCounts {
    fn from_iter<I: IntoIterator<Item = (HitKey, u64)>>(iter: I) -> Self {
        let mut entries = IndexMap::new();
        for (key, count) in iter {
            *entries.entry(key).or_insert(0) += count;
        }
        Self { entries }
    }
}

/// セッションオーケストレータが駆動するデバッグエンジン
///
/// `launch`/`attach`/`run` は境界で分類済みの `SessionError` を返します。
/// 起動失敗は文言ではなく `ReportedError::ProcessCreation` で表します。
pub trait DebugEngine {
    /// シンボル読み込みを開始する（結果はフューチャーで受け取る）
    fn load_symbols(&mut self, target: &TargetDescriptor, scope: &SymbolScope) -> SymbolsFuture;

    /// 読み込みが完了したシンボルテーブルを受け取る
    fn attach_symbols(&mut self, tables: Vec<SymbolTable>);

    /// 初期化コードを設定する（どのクエリより先に1回実行される）
    fn set_init_code(&mut self, code: &str) -> Result<()>;

    /// クエリを登録する（1つでも不正なら全体が失敗）
    fn add_queries(&mut self, queries: &[Query]) -> Result<()>;

    /// プログラムを起動する
    fn launch(&mut self, command_line: &str) -> Result<(), SessionError>;

    /// 既存のプロセスにアタッチする
    fn attach(&mut self, pid: i32) -> Result<(), SessionError>;

    /// デバッギが終了するかデタッチされるまで実行する
    fn run(&mut self) -> Result<(), SessionError>;

    /// デバッギの終了コード
    fn exit_code(&self) -> Option<i32>;

    /// ヒットカウントのスナップショット
    fn counts(&self) -> HitCounts;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_key_for_location() {
        assert_eq!(HitKey::for_location("0x401000"), HitKey::Address(0x401000));
        assert_eq!(HitKey::for_location("4198400"), HitKey::Address(0x401000));
        assert_eq!(HitKey::for_location("main"), HitKey::Symbol("main".to_string()));
        assert_eq!(
            HitKey::for_location("pc==0x401000"),
            HitKey::Symbol("pc==0x401000".to_string())
        );
    }

    #[test]
    fn test_hit_key_display() {
        assert_eq!(HitKey::Address(0x401000).to_string(), "0x401000");
        assert_eq!(HitKey::Symbol("libc!malloc".to_string()).to_string(), "libc!malloc");
    }

    #[test]
    fn test_counts_keep_first_seen_order() {
        let main = HitKey::Symbol("main".to_string());
        let addr = HitKey::Address(0x401000);

        let mut counts = HitCounts::new();
        counts.increment(&main);
        counts.increment(&addr);
        counts.increment(&addr);
        counts.increment(&main);
        counts.increment(&addr);

        let entries: Vec<_> = counts.iter().map(|(k, c)| (k.clone(), c)).collect();
        assert_eq!(entries, vec![(main.clone(), 2), (addr.clone(), 3)]);
        assert_eq!(counts.get(&addr), Some(3));
        assert_eq!(counts.get(&HitKey::Address(0)), None);
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn test_counts_from_pairs_merge_duplicates() {
        let main = HitKey::Symbol("main".to_string());
        let addr = HitKey::Address(0x401000);

        let counts: HitCounts = [(addr.clone(), 2), (main.clone(), 1), (addr.clone(), 3)].into_iter().collect();
        let entries: Vec<_> = counts.iter().map(|(k, c)| (k.clone(), c)).collect();
        assert_eq!(entries, vec![(addr, 5), (main, 1)]);
    }
}
