//! ユーザー向けコンソール出力
//!
//! セッションごとに1つ作成し、レポーターやビルトインから参照で共有します。
//! 冗長度はグローバルなロガー設定ではなく、このオブジェクトが保持します。

use std::cell::RefCell;
use std::fmt::Display;
use std::io::{self, Write};

/// 出力行の接頭辞
pub const PREFIX: &str = "qdb: ";

/// 情報・警告行の冗長度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    #[default]
    Normal,
    /// 情報行と警告行を抑制する（エラー行は常に出力）
    Quiet,
}

impl Verbosity {
    pub fn from_quiet(quiet: bool) -> Self {
        if quiet {
            Verbosity::Quiet
        } else {
            Verbosity::Normal
        }
    }
}

/// コンソール
pub struct Console {
    verbosity: Verbosity,
    out: RefCell<Box<dyn Write>>,
    err: RefCell<Box<dyn Write>>,
}

impl Console {
    /// 標準出力・標準エラーに書き込むコンソールを作成する
    pub fn stdio(verbosity: Verbosity) -> Self {
        Self::with_writers(verbosity, io::stdout(), io::stderr())
    }

    /// 任意の書き込み先を持つコンソールを作成する
    pub fn with_writers(verbosity: Verbosity, out: impl Write + 'static, err: impl Write + 'static) -> Self {
        Self {
            verbosity,
            out: RefCell::new(Box::new(out)),
            err: RefCell::new(Box::new(err)),
        }
    }

    /// 情報行（標準出力）
    pub fn info(&self, message: impl Display) {
        if self.verbosity == Verbosity::Normal {
            Self::write_line(&self.out, message);
        }
    }

    /// 警告行（標準エラー）
    pub fn warning(&self, message: impl Display) {
        if self.verbosity == Verbosity::Normal {
            Self::write_line(&self.err, message);
        }
    }

    /// エラー行（標準エラー、冗長度に関わらず出力）
    pub fn error(&self, message: impl Display) {
        Self::write_line(&self.err, message);
    }

    fn write_line(writer: &RefCell<Box<dyn Write>>, message: impl Display) {
        let mut writer = writer.borrow_mut();
        // コンソールへの書き込み失敗はセッションを止めない
        let _ = writeln!(writer, "{}{}", PREFIX, message);
        let _ = writer.flush();
    }
}
