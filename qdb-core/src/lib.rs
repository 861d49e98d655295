//! qdb のコア機能
//!
//! クエリのコンパイル、セッションの進行と障害の分類、結果のレポートを提供します。
//! ptraceを使う具体的なデバッグエンジン `Qdb` もこのクレートにあります。

pub mod action;
pub mod breakpoint;
pub mod builtins;
pub mod console;
pub mod debugger;
pub mod disasm;
pub mod engine;
pub mod errors;
pub mod expr_eval;
pub mod inferior;
pub mod parse;
pub mod query;
pub mod report;
pub mod session;
pub mod symbols;
pub mod target;

#[cfg(test)]
pub(crate) mod testing;

pub use console::{Console, Verbosity};
pub use debugger::Qdb;
pub use engine::{DebugEngine, HitCounts, HitKey};
pub use errors::{ReportedError, SessionError};
pub use query::{compile, Query, RawQuery};
pub use report::report;
pub use session::{Session, SessionOutcome, SessionRequest, SessionState, TerminationReason};
pub use target::{SymbolScope, TargetDescriptor, UsageError};

/// デバッガの結果型
pub type Result<T> = anyhow::Result<T>;
