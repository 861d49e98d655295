//! qdb ターゲットプロセス制御
//!
//! デバッグ対象プロセスの起動・アタッチ、実行制御、メモリ/レジスタアクセス、
//! INT3ブレークポイントの挿入を行う低レベル層です。

pub mod breakpoint;
pub mod memory;
pub mod process;
pub mod registers;

pub use breakpoint::SoftwareBreakpoint;
pub use memory::{Memory, MemoryMapping};
pub use process::{Process, SpawnError, StopReason};
pub use registers::{Registers, GENERAL_REGISTERS};

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
