//! エラー定義とエラーメッセージ定数

use std::fmt;
use thiserror::Error;

/// プロセスに接続されていない場合のエラーメッセージ
pub const ERR_NOT_ATTACHED: &str = "Not attached to a process";

/// プロセス起動失敗のメッセージ接頭辞
pub const ERR_PROCESS_CREATION: &str = "process creation failed";

/// ターゲット指定が不正な場合のメッセージ
pub const ERR_TARGET_REQUIRED: &str = "A cmdline or an -attach argument is required (but not both)";

/// シンボルが見つからない場合のエラーメッセージ
pub const ERR_SYMBOL_NOT_FOUND: &str = "Symbol not found";

/// セッション内で回収してレポートする障害
#[derive(Debug, Error)]
pub enum ReportedError {
    /// クエリのアクション（または条件式）の実行失敗
    #[error("{message}")]
    BreakpointAction { message: String, backtrace: Vec<String> },

    /// 特定のクエリに依らないプロセス制御の失敗
    #[error("{message}")]
    Platform { message: String },

    /// デバッギの起動失敗
    #[error("{message}")]
    ProcessCreation { message: String },
}

/// セッション境界まで到達した障害の分類
///
/// `Reported` はセッションオーケストレータで回収されてレポートされ、
/// `Unclassified` はそのまま呼び出し元へ伝播します。
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Reported(#[from] ReportedError),

    /// 未分類の障害（レポートせずに伝播する）
    #[error(transparent)]
    Unclassified(#[from] anyhow::Error),
}

impl SessionError {
    /// プロセス制御エラーを作成する
    pub fn platform(err: impl fmt::Display) -> Self {
        ReportedError::Platform {
            message: err.to_string(),
        }
        .into()
    }

    /// プロセス起動エラーを作成する
    pub fn process_creation(detail: impl fmt::Display) -> Self {
        ReportedError::ProcessCreation {
            message: format!("{}: {}", ERR_PROCESS_CREATION, detail),
        }
        .into()
    }

    /// アクション実行エラーを作成する
    ///
    /// `origin` が最も古いフレームになり、続いてエラーのコンテキストチェーンを
    /// 外側から順に並べたものがバックトレースになります。
    pub fn breakpoint_action(origin: impl fmt::Display, err: anyhow::Error) -> Self {
        let origin = origin.to_string();
        let message = format!("{} failed: {}", origin, err.root_cause());

        let mut backtrace = vec![origin];
        backtrace.extend(err.chain().map(|cause| cause.to_string()));

        ReportedError::BreakpointAction { message, backtrace }.into()
    }
}
