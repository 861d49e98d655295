//! qdb シンボル・デバッグ情報解析
//!
//! ELFのシンボルテーブル読み込み、シンボル名の解決とデマングル、
//! DWARFによるアドレスからソース行への変換を提供します。

pub mod lines;
pub mod loader;
pub mod symbols;

pub use lines::{LineInfo, LineInfoProvider};
pub use loader::DwarfLoader;
pub use symbols::{Symbol, SymbolTable};

/// DWARF解析の結果型
pub type Result<T> = anyhow::Result<T>;
