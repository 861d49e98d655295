//! セッションオーケストレータ
//!
//! シンボル読み込み、初期化コード、クエリ登録、実行をこの順に進め、
//! 実行中の障害を分類して1つの `SessionOutcome` にまとめます。
//!
//! ```text
//! Idle -> SymbolsPending -> Configured -> Ready -> Running -> Completed
//!                                           |         |
//!                                           +---------+----> Failed
//! ```

use crate::console::Console;
use crate::engine::{DebugEngine, HitCounts};
use crate::errors::{ReportedError, SessionError};
use crate::query::Query;
use crate::target::{SymbolScope, TargetDescriptor};
use crate::Result;
use std::rc::Rc;

/// セッションの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    SymbolsPending,
    Configured,
    Ready,
    Running,
    Completed,
    Failed,
}

/// デバッギの終わり方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// 終了コードを返して終了した
    Returned,
    /// 終了コードなし（シグナル、デタッチ、起動失敗など）
    NoExitCode,
}

/// セッションの結果
#[derive(Debug)]
pub struct SessionOutcome {
    pub exit_code: Option<i32>,
    pub termination_reason: TerminationReason,
    pub error: Option<ReportedError>,
}

impl SessionOutcome {
    pub fn completed(exit_code: Option<i32>) -> Self {
        let termination_reason = match exit_code {
            Some(_) => TerminationReason::Returned,
            None => TerminationReason::NoExitCode,
        };
        Self {
            exit_code,
            termination_reason,
            error: None,
        }
    }

    pub fn failed(error: ReportedError) -> Self {
        Self {
            exit_code: None,
            termination_reason: TerminationReason::NoExitCode,
            error: Some(error),
        }
    }
}

/// 1回のデバッグセッション
pub struct Session<E: DebugEngine> {
    engine: E,
    console: Rc<Console>,
    target: TargetDescriptor,
    state: SessionState,
}

impl<E: DebugEngine> Session<E> {
    pub fn new(engine: E, console: Rc<Console>, target: TargetDescriptor) -> Self {
        Self {
            engine,
            console,
            target,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    fn expect_state(&self, expected: SessionState, operation: &str) -> Result<()> {
        if self.state != expected {
            return Err(anyhow::anyhow!(
                "Cannot {} in state {:?} (expected {:?})",
                operation,
                self.state,
                expected
            ));
        }
        Ok(())
    }

    /// シンボルを読み込む
    ///
    /// 読み込みの完了をここで待ちます。失敗は警告を出して続行します。
    pub fn request_symbols(&mut self, scope: &SymbolScope) -> Result<()> {
        self.expect_state(SessionState::Idle, "request symbols")?;

        if !scope.is_none() {
            self.state = SessionState::SymbolsPending;
            let future = self.engine.load_symbols(&self.target, scope);
            match future.wait() {
                Ok(loaded) => {
                    for warning in &loaded.warnings {
                        self.console.warning(warning);
                    }
                    self.engine.attach_symbols(loaded.tables);
                }
                Err(e) => self.console.warning(format!("Failed to load symbols: {:#}", e)),
            }
        }

        self.state = SessionState::Configured;
        Ok(())
    }

    /// 初期化コードを設定する
    pub fn install_init_code(&mut self, code: Option<&str>) -> Result<()> {
        self.expect_state(SessionState::Configured, "install init code")?;
        if let Some(code) = code {
            self.engine.set_init_code(code)?;
        }
        Ok(())
    }

    /// クエリを登録する
    pub fn install_queries(&mut self, queries: &[Query]) -> Result<()> {
        self.expect_state(SessionState::Configured, "install queries")?;
        self.engine.add_queries(queries)?;
        self.state = SessionState::Ready;
        Ok(())
    }

    /// 起動またはアタッチして、終了まで実行する
    ///
    /// 分類済みの障害は結果に含めて返し、未分類の障害はそのまま伝播します。
    pub fn start(&mut self) -> Result<SessionOutcome> {
        self.expect_state(SessionState::Ready, "start")?;

        let started = match &self.target {
            TargetDescriptor::Launch { command_line } => self.engine.launch(command_line),
            TargetDescriptor::Attach { process_id } => self.engine.attach(*process_id),
        };
        if let Err(e) = started {
            return self.fail(e);
        }

        self.state = SessionState::Running;
        match self.engine.run() {
            Ok(()) => {
                self.state = SessionState::Completed;
                Ok(SessionOutcome::completed(self.engine.exit_code()))
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, error: SessionError) -> Result<SessionOutcome> {
        self.state = SessionState::Failed;
        match error {
            SessionError::Unclassified(e) => Err(e),
            SessionError::Reported(reported) => {
                tracing::debug!("session failed: {}", reported);
                Ok(SessionOutcome::failed(reported))
            }
        }
    }

    /// ヒットカウントのスナップショット
    pub fn counts(&self) -> HitCounts {
        self.engine.counts()
    }
}

/// 1回の実行に必要な入力
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub target: TargetDescriptor,
    pub symbols: SymbolScope,
    pub init_code: Option<String>,
    pub queries: Vec<Query>,
    pub quiet: bool,
}

/// すべての段階を順に実行する
pub fn run<E: DebugEngine>(
    engine: E,
    console: Rc<Console>,
    request: &SessionRequest,
) -> Result<(SessionOutcome, HitCounts)> {
    let mut session = Session::new(engine, console, request.target.clone());
    session.request_symbols(&request.symbols)?;
    session.install_init_code(request.init_code.as_deref())?;
    session.install_queries(&request.queries)?;
    let outcome = session.start()?;
    Ok((outcome, session.counts()))
}
