//! デバッガのメインロジック
//!
//! ptraceを使う `DebugEngine` の実装です。クエリのロケーションにINT3を置き、
//! ヒットのたびに条件式を評価してアクションを実行します。

use crate::action::ActionCode;
use crate::breakpoint::BreakpointManager;
use crate::builtins::{self, Flow};
use crate::console::Console;
use crate::engine::{DebugEngine, HitCounts, HitKey};
use crate::errors::{SessionError, ERR_NOT_ATTACHED};
use crate::expr_eval::{parse_expression, Expr, ExpressionEvaluator};
use crate::inferior::Inferior;
use crate::query::Query;
use crate::symbols::{load_scope, LoadedSymbols, ModuleSet, Symbolized, SymbolsFuture};
use crate::target::{resolve_program, split_command_line, SymbolScope, TargetDescriptor};
use crate::Result;
use anyhow::Context;
use nix::sys::signal::Signal;
use qdb_dwarf::SymbolTable;
use qdb_target::{Memory, Process, Registers, SoftwareBreakpoint, StopReason};
use std::rc::Rc;

/// 登録済みのクエリ
struct CompiledQuery {
    query: Query,
    condition: Expr,
    action: ActionCode,
    key: HitKey,
}

impl CompiledQuery {
    fn compile(query: &Query) -> Result<Self> {
        let condition = parse_expression(&query.condition_expr)
            .with_context(|| format!("Invalid condition '{}'", query.condition_expr))?;
        let action = ActionCode::parse(&query.action_code)?;
        // ロケーションはアドレスの解決時に評価する
        parse_expression(&query.location_expr)
            .with_context(|| format!("Invalid location '{}'", query.location_expr))?;

        Ok(Self {
            query: query.clone(),
            condition,
            action,
            key: HitKey::for_location(&query.location_expr),
        })
    }
}

/// 実行中のデバッギ
struct Attached {
    process: Process,
    memory: Memory,
    registers: Registers,
    /// qdbが起動したプロセスか（アタッチしたものはデタッチして返す）
    launched: bool,
}

impl Attached {
    fn new(process: Process, launched: bool) -> Self {
        let pid = process.pid();
        Self {
            process,
            memory: Memory::new(pid),
            registers: Registers::new(pid),
            launched,
        }
    }
}

/// 停止中のデバッギへのアクセス
struct StopContext<'a> {
    memory: &'a Memory,
    registers: &'a Registers,
    modules: &'a ModuleSet,
    breakpoints: &'a BreakpointManager,
    location: Option<&'a str>,
}

impl Inferior for StopContext<'_> {
    fn register(&self, name: &str) -> Result<u64> {
        self.registers.get(name)
    }

    fn set_register(&mut self, name: &str, value: u64) -> Result<()> {
        self.registers.set(name, value)
    }

    fn read_memory(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let mut bytes = self.memory.read(addr, size)?;
        self.breakpoints.patch_original(addr, &mut bytes);
        Ok(bytes)
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.memory.write(addr, data)
    }

    fn resolve_symbol(&self, name: &str) -> Result<u64> {
        self.modules.resolve(name)
    }

    fn symbolize(&self, addr: u64) -> Option<Symbolized> {
        self.modules.symbolize(addr)
    }

    fn source_line(&self, addr: u64) -> Option<String> {
        self.modules.source_line(addr)
    }

    fn query_location(&self) -> Option<&str> {
        self.location
    }
}

/// 停止後の実行の続け方
enum Next {
    Continue(Option<Signal>),
    Finished,
}

/// ptraceベースのデバッグエンジン
pub struct Qdb {
    console: Rc<Console>,
    modules: ModuleSet,
    symbol_scope: SymbolScope,
    init_code: Option<ActionCode>,
    queries: Vec<CompiledQuery>,
    breakpoints: BreakpointManager,
    attached: Option<Attached>,
    counts: HitCounts,
    exit_code: Option<i32>,
    finished: bool,
}

impl Qdb {
    /// 新しいデバッガを作成する
    pub fn new(console: Rc<Console>) -> Self {
        Self {
            console,
            modules: ModuleSet::new(),
            symbol_scope: SymbolScope::None,
            init_code: None,
            queries: Vec::new(),
            breakpoints: BreakpointManager::new(),
            attached: None,
            counts: HitCounts::new(),
            exit_code: None,
            finished: false,
        }
    }

    /// プロセスにアタッチされているか確認し、参照を取得
    fn require_attached(&mut self) -> Result<&mut Attached> {
        self.attached
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))
    }

    /// 起動直後のプロセスをエントリポイントまで進める
    ///
    /// 動的ローダーが共有ライブラリをマップし終えてからクエリを配置するためです。
    fn run_to_entry(&mut self) -> Result<()> {
        let attached = self
            .attached
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))?;
        let entry = attached.memory.entry_point()?;

        let mut breakpoint = SoftwareBreakpoint::new(entry);
        breakpoint.insert(&attached.memory)?;

        let mut signal = None;
        loop {
            match attached.process.continue_and_wait(signal)? {
                StopReason::Breakpoint if attached.registers.get_pc()? == entry + 1 => break,
                StopReason::Signal(s) => signal = Some(s),
                StopReason::Exited(code) => {
                    self.exit_code = Some(code);
                    self.finished = true;
                    return Ok(());
                }
                StopReason::Killed(_) => {
                    self.finished = true;
                    return Ok(());
                }
                _ => signal = None,
            }
        }

        breakpoint.remove(&attached.memory)?;
        attached.registers.set_pc(entry)?;
        tracing::debug!("stopped at entry point 0x{:x}", entry);
        Ok(())
    }

    /// 初期化コードを実行し、クエリのブレークポイントを配置する
    fn arm(&mut self) -> std::result::Result<(), SessionError> {
        let Some(attached) = self.attached.as_mut() else {
            return Err(anyhow::anyhow!(ERR_NOT_ATTACHED).into());
        };
        if self.symbol_scope == SymbolScope::All {
            // エントリポイントに着いた時点で共有ライブラリはマップ済み
            let warnings = self.modules.add_mapped(&attached.memory).map_err(SessionError::platform)?;
            for warning in warnings {
                self.console.warning(warning);
            }
        }
        self.modules.bind(&attached.memory).map_err(SessionError::platform)?;

        if let Some(init_code) = &self.init_code {
            let mut context = StopContext {
                memory: &attached.memory,
                registers: &attached.registers,
                modules: &self.modules,
                breakpoints: &self.breakpoints,
                location: None,
            };
            let flow = builtins::execute(init_code, &mut context, &self.console)
                .map_err(|e| SessionError::breakpoint_action("init code", e))?;
            if flow != Flow::Continue {
                return self.finish(flow);
            }
        }

        let mappings = attached.memory.get_mappings().map_err(SessionError::platform)?;
        for (index, compiled) in self.queries.iter().enumerate() {
            let origin = query_origin(index, &compiled.query);
            let context = StopContext {
                memory: &attached.memory,
                registers: &attached.registers,
                modules: &self.modules,
                breakpoints: &self.breakpoints,
                location: Some(&compiled.query.location_expr),
            };
            let address = ExpressionEvaluator::new(&context)
                .evaluate_str(&compiled.query.location_expr)
                .map_err(|e| SessionError::breakpoint_action(&origin, e))?;

            if !mappings.iter().any(|m| m.contains(address)) {
                self.console.warning(format!(
                    "{}: address 0x{:x} is not mapped; query will not fire",
                    origin, address
                ));
                continue;
            }

            self.breakpoints
                .add(address, index, &attached.memory)
                .map_err(SessionError::platform)?;
        }
        Ok(())
    }

    /// ブレークポイントでの停止を処理する
    fn handle_trap(&mut self) -> std::result::Result<Next, SessionError> {
        let Some(attached) = self.attached.as_mut() else {
            return Err(anyhow::anyhow!(ERR_NOT_ATTACHED).into());
        };
        let pc = attached.registers.get_pc().map_err(SessionError::platform)?.wrapping_sub(1);
        if !self.breakpoints.contains(pc) {
            // 自前のINT3ではないSIGTRAP
            return Ok(Next::Continue(None));
        }
        attached.registers.set_pc(pc).map_err(SessionError::platform)?;

        let indices = self.breakpoints.queries_at(pc).to_vec();
        for index in indices {
            let compiled = &self.queries[index];
            let origin = query_origin(index, &compiled.query);
            let mut context = StopContext {
                memory: &attached.memory,
                registers: &attached.registers,
                modules: &self.modules,
                breakpoints: &self.breakpoints,
                location: Some(&compiled.query.location_expr),
            };

            let condition = ExpressionEvaluator::new(&context)
                .evaluate(&compiled.condition)
                .with_context(|| format!("condition: {}", compiled.query.condition_expr))
                .map_err(|e| SessionError::breakpoint_action(&origin, e))?;
            if condition == 0 {
                continue;
            }

            self.counts.increment(&compiled.key);
            let flow = builtins::execute(&compiled.action, &mut context, &self.console)
                .map_err(|e| SessionError::breakpoint_action(&origin, e))?;
            if flow != Flow::Continue {
                self.finish(flow)?;
                return Ok(Next::Finished);
            }
        }

        self.step_over(pc)
    }

    /// ブレークポイントを外して1命令進め、元に戻す
    fn step_over(&mut self, pc: u64) -> std::result::Result<Next, SessionError> {
        let Some(attached) = self.attached.as_mut() else {
            return Err(anyhow::anyhow!(ERR_NOT_ATTACHED).into());
        };

        self.breakpoints
            .disable(pc, &attached.memory)
            .map_err(SessionError::platform)?;
        let reason = attached.process.step().map_err(SessionError::platform)?;
        if let Some(next) = self.record_terminal(&reason) {
            return Ok(next);
        }

        let Some(attached) = self.attached.as_mut() else {
            return Err(anyhow::anyhow!(ERR_NOT_ATTACHED).into());
        };
        self.breakpoints
            .enable(pc, &attached.memory)
            .map_err(SessionError::platform)?;

        Ok(match reason {
            StopReason::Signal(signal) => Next::Continue(Some(signal)),
            _ => Next::Continue(None),
        })
    }

    /// 終了を表す停止なら記録する
    fn record_terminal(&mut self, reason: &StopReason) -> Option<Next> {
        match reason {
            StopReason::Exited(code) => {
                tracing::debug!("debuggee exited with {}", code);
                self.exit_code = Some(*code);
                self.finished = true;
                Some(Next::Finished)
            }
            StopReason::Killed(signal) => {
                tracing::debug!("debuggee killed by {}", signal);
                self.finished = true;
                Some(Next::Finished)
            }
            _ => None,
        }
    }

    /// `detach()`/`kill()` でセッションを終える
    fn finish(&mut self, flow: Flow) -> std::result::Result<(), SessionError> {
        let Some(attached) = self.attached.as_mut() else {
            return Err(anyhow::anyhow!(ERR_NOT_ATTACHED).into());
        };

        match flow {
            Flow::Detach => {
                self.breakpoints
                    .remove_all(&attached.memory)
                    .map_err(SessionError::platform)?;
                attached.process.detach().map_err(SessionError::platform)?;
                self.console.info(format!("Detached from process {}", attached.process.pid()));
            }
            Flow::Kill => {
                attached.process.kill().map_err(SessionError::platform)?;
            }
            Flow::Continue => return Ok(()),
        }
        self.finished = true;
        Ok(())
    }
}

fn query_origin(index: usize, query: &Query) -> String {
    format!("query #{} at {}", index + 1, query.location_expr)
}

impl DebugEngine for Qdb {
    fn load_symbols(&mut self, target: &TargetDescriptor, scope: &SymbolScope) -> SymbolsFuture {
        self.symbol_scope = scope.clone();
        if scope.is_none() {
            return SymbolsFuture::ready(Ok(LoadedSymbols::default()));
        }
        let target = target.clone();
        let scope = scope.clone();
        SymbolsFuture::spawn(move || load_scope(&target, &scope))
    }

    fn attach_symbols(&mut self, tables: Vec<SymbolTable>) {
        for table in &tables {
            tracing::debug!("loaded {} symbols from {}", table.all_symbols().count(), table.path().display());
        }
        self.modules.add(tables);
    }

    fn set_init_code(&mut self, code: &str) -> Result<()> {
        let action = ActionCode::parse(code).context("Invalid init code")?;
        self.init_code = Some(action);
        Ok(())
    }

    fn add_queries(&mut self, queries: &[Query]) -> Result<()> {
        let compiled = queries
            .iter()
            .enumerate()
            .map(|(index, query)| {
                CompiledQuery::compile(query).with_context(|| format!("Invalid {}", query_origin(index, query)))
            })
            .collect::<Result<Vec<_>>>()?;
        self.queries.extend(compiled);
        Ok(())
    }

    fn launch(&mut self, command_line: &str) -> std::result::Result<(), SessionError> {
        let argv = split_command_line(command_line).map_err(SessionError::process_creation)?;
        let program = argv
            .first()
            .ok_or_else(|| SessionError::process_creation("empty command line"))?;
        let path = resolve_program(program).map_err(SessionError::process_creation)?;

        let process = Process::spawn(&path, &argv[1..]).map_err(SessionError::process_creation)?;
        tracing::debug!(pid = process.pid(), "launched {}", path.display());
        self.attached = Some(Attached::new(process, true));

        self.run_to_entry().map_err(SessionError::platform)
    }

    fn attach(&mut self, pid: i32) -> std::result::Result<(), SessionError> {
        let process = Process::attach(pid).map_err(SessionError::platform)?;
        self.attached = Some(Attached::new(process, false));
        Ok(())
    }

    fn run(&mut self) -> std::result::Result<(), SessionError> {
        if self.finished {
            return Ok(());
        }
        self.arm()?;

        let mut signal = None;
        while !self.finished {
            let attached = self.require_attached()?;
            let reason = attached
                .process
                .continue_and_wait(signal)
                .map_err(SessionError::platform)?;

            let next = match reason {
                StopReason::Breakpoint | StopReason::Step => self.handle_trap()?,
                StopReason::Signal(s) => Next::Continue(Some(s)),
                StopReason::Other => Next::Continue(None),
                ref terminal => self.record_terminal(terminal).unwrap_or(Next::Finished),
            };

            match next {
                Next::Continue(s) => signal = s,
                Next::Finished => break,
            }
        }
        Ok(())
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn counts(&self) -> HitCounts {
        self.counts.clone()
    }
}

impl Drop for Qdb {
    fn drop(&mut self) {
        let Some(attached) = self.attached.as_mut() else {
            return;
        };
        if !attached.process.is_traced() {
            return;
        }
        // 途中で失敗した場合もデバッギにINT3を残さない
        if attached.launched {
            let _ = attached.process.kill();
        } else {
            let _ = self.breakpoints.remove_all(&attached.memory);
            let _ = attached.process.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::Verbosity;
    use crate::errors::ReportedError;
    use crate::testing::capture_console;

    #[test]
    fn test_add_queries_is_all_or_nothing() {
        let (console, _) = capture_console(Verbosity::Normal);
        let mut qdb = Qdb::new(console);

        let queries = vec![
            Query::unconditional("main", "record()"),
            Query::conditional("main", "rax ==", "record()"),
        ];
        let err = qdb.add_queries(&queries).unwrap_err();
        assert_eq!(err.to_string(), "Invalid query #2 at main");
        assert!(qdb.queries.is_empty());

        qdb.add_queries(&queries[..1]).unwrap();
        assert_eq!(qdb.queries.len(), 1);
        assert_eq!(qdb.queries[0].key, HitKey::Symbol("main".to_string()));
    }

    #[test]
    fn test_init_code_is_validated() {
        let (console, _) = capture_console(Verbosity::Normal);
        let mut qdb = Qdb::new(console);
        assert!(qdb.set_init_code("print(\"ready\")").is_ok());
        assert!(qdb.set_init_code("not a call").is_err());
    }

    #[test]
    fn test_launch_missing_program_is_process_creation() {
        let (console, _) = capture_console(Verbosity::Normal);
        let mut qdb = Qdb::new(console);

        let err = qdb.launch("/nonexistent/qdb-test-program --flag").unwrap_err();
        assert!(matches!(err, SessionError::Reported(ReportedError::ProcessCreation { .. })), "{:?}", err);
        assert!(err.to_string().starts_with("process creation failed"));

        let err = qdb.launch("prog 'unterminated").unwrap_err();
        assert!(matches!(err, SessionError::Reported(ReportedError::ProcessCreation { .. })));
    }

    #[test]
    fn test_run_without_process_is_unclassified() {
        let (console, _) = capture_console(Verbosity::Normal);
        let mut qdb = Qdb::new(console);
        let err = qdb.run().unwrap_err();
        assert!(matches!(err, SessionError::Unclassified(_)));
        assert_eq!(err.to_string(), ERR_NOT_ATTACHED);
    }

    #[test]
    fn test_symbols_none_scope_is_ready() {
        let (console, _) = capture_console(Verbosity::Normal);
        let mut qdb = Qdb::new(console);
        let target = TargetDescriptor::Launch {
            command_line: "/bin/true".to_string(),
        };
        let loaded = qdb.load_symbols(&target, &SymbolScope::None).wait().unwrap();
        assert!(loaded.tables.is_empty());
        assert_eq!(qdb.symbol_scope, SymbolScope::None);
    }
}
