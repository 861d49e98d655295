//! デバッグ対象とシンボル読み込み範囲の指定

use crate::errors::ERR_TARGET_REQUIRED;
use anyhow::Result;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// コマンドラインの使い方の誤り
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("{}", ERR_TARGET_REQUIRED)]
    TargetRequired,
}

/// デバッグ対象（起動するか、既存プロセスにアタッチするか）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetDescriptor {
    Launch { command_line: String },
    Attach { process_id: i32 },
}

impl TargetDescriptor {
    /// コマンドラインとアタッチ先のちょうど一方から作成する
    ///
    /// 空白だけのコマンドラインと0以下のプロセスIDは指定なしとみなします。
    pub fn from_parts(command_line: Option<String>, attach: Option<i32>) -> Result<Self, UsageError> {
        let command_line = command_line.filter(|c| !c.trim().is_empty());
        let attach = attach.filter(|pid| *pid > 0);

        match (command_line, attach) {
            (Some(command_line), None) => Ok(TargetDescriptor::Launch { command_line }),
            (None, Some(process_id)) => Ok(TargetDescriptor::Attach { process_id }),
            _ => Err(UsageError::TargetRequired),
        }
    }
}

/// 読み込むシンボルの範囲
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SymbolScope {
    #[default]
    None,
    All,
    Named(BTreeSet<String>),
}

impl SymbolScope {
    /// ワイルドカードを表すトークン
    pub const WILDCARD: &'static str = "*";

    /// `-loadsyms` の値から作成する
    pub fn parse(value: Option<&str>) -> Self {
        let value = value.map(str::trim).unwrap_or_default();
        if value.is_empty() {
            SymbolScope::None
        } else if value == Self::WILDCARD {
            SymbolScope::All
        } else {
            SymbolScope::Named(value.split_whitespace().map(str::to_string).collect())
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, SymbolScope::None)
    }
}

/// コマンドライン文字列をargvに分割する
///
/// シェルと同様にシングルクォート、ダブルクォート、バックスラッシュエスケープを扱います。
pub fn split_command_line(command_line: &str) -> Result<Vec<String>> {
    let mut argv = Vec::new();
    let mut current: Option<String> = None;
    let mut chars = command_line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if let Some(word) = current.take() {
                    argv.push(word);
                }
            }
            '\'' => {
                let word = current.get_or_insert_with(String::new);
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => return Err(anyhow::anyhow!("Unterminated single quote in command line")),
                    }
                }
            }
            '"' => {
                let word = current.get_or_insert_with(String::new);
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => word.push(c),
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => return Err(anyhow::anyhow!("Unterminated double quote in command line")),
                        },
                        Some(c) => word.push(c),
                        None => return Err(anyhow::anyhow!("Unterminated double quote in command line")),
                    }
                }
            }
            '\\' => {
                let escaped = chars
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("Trailing backslash in command line"))?;
                current.get_or_insert_with(String::new).push(escaped);
            }
            c => current.get_or_insert_with(String::new).push(c),
        }
    }

    if let Some(word) = current {
        argv.push(word);
    }
    Ok(argv)
}

/// 実行するプログラムのパスを解決する
///
/// `/` を含む名前はそのまま、それ以外はPATHから探します。
pub fn resolve_program(program: &str) -> Result<PathBuf> {
    if program.contains('/') {
        let path = Path::new(program);
        if !path.is_file() {
            return Err(anyhow::anyhow!("{} does not exist", program));
        }
        return Ok(path.to_path_buf());
    }

    which::which(program).map_err(|e| anyhow::anyhow!("{} not found on PATH: {}", program, e))
}
