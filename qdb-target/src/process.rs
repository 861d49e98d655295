//! プロセス制御機能

use crate::Result;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use thiserror::Error;

/// execに失敗した子プロセスの終了ステータス
const EXEC_FAILED_STATUS: i32 = 127;

/// 停止イベントの種類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// ブレークポイントヒット（SIGTRAP）
    Breakpoint,
    /// ステップ実行完了（SIGTRAP）
    Step,
    /// シグナルによる停止（デバッギへ再配送すべきもの）
    Signal(Signal),
    /// プロセス終了
    Exited(i32),
    /// シグナルによるプロセス終了
    Killed(Signal),
    /// その他の停止
    Other,
}

impl StopReason {
    /// プロセスがもう存在しないかどうか
    pub fn is_terminal(&self) -> bool {
        matches!(self, StopReason::Exited(_) | StopReason::Killed(_))
    }
}

/// プロセス起動の失敗
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("argument {0:?} contains a NUL byte")]
    InvalidArgument(String),
    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),
    #[error("could not execute {program}")]
    Exec { program: String },
    #[error("unexpected wait status after exec: {0}")]
    UnexpectedStatus(String),
    #[error("waitpid failed: {0}")]
    Wait(#[source] nix::Error),
}

/// デバッグ対象のプロセス
pub struct Process {
    pid: Pid,
    /// まだptraceで制御しているか
    traced: bool,
}

impl Process {
    /// 実行可能ファイルを起動してデバッグ対象プロセスを開始する
    ///
    /// fork後、子プロセスでPTRACE_TRACEMEを設定してからexecvを実行します。
    /// 返されるプロセスはexec直後（最初の命令の前）で停止しています。
    /// execに失敗した子はステータス127で終了し、`SpawnError::Exec`になります。
    pub fn spawn<P: AsRef<Path>>(program: P, args: &[String]) -> std::result::Result<Self, SpawnError> {
        use nix::unistd::{execv, fork, ForkResult};

        let program = program.as_ref();
        let program_name = program.display().to_string();
        let program_c = CString::new(program.as_os_str().as_bytes())
            .map_err(|_| SpawnError::InvalidArgument(program_name.clone()))?;

        // fork後にアロケーションしないよう、argvは先に組み立てる
        let mut argv = vec![program_c.clone()];
        for arg in args {
            argv.push(CString::new(arg.as_str()).map_err(|_| SpawnError::InvalidArgument(arg.clone()))?);
        }

        match unsafe { fork() }.map_err(SpawnError::Fork)? {
            ForkResult::Child => {
                if ptrace::traceme().is_ok() {
                    let _ = execv(&program_c, &argv);
                }
                unsafe { nix::libc::_exit(EXEC_FAILED_STATUS) }
            }
            ForkResult::Parent { child } => match waitpid(child, None).map_err(SpawnError::Wait)? {
                WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                    // qdbが先に終了した場合にデバッギを残さない
                    if let Err(e) = ptrace::setoptions(child, ptrace::Options::PTRACE_O_EXITKILL) {
                        tracing::warn!("PTRACE_O_EXITKILL unavailable: {}", e);
                    }
                    tracing::debug!(pid = child.as_raw(), "spawned {}", program_name);
                    Ok(Self { pid: child, traced: true })
                }
                WaitStatus::Exited(_, EXEC_FAILED_STATUS) => Err(SpawnError::Exec { program: program_name }),
                status => Err(SpawnError::UnexpectedStatus(format!("{:?}", status))),
            },
        }
    }

    /// 既存のプロセスにアタッチする
    ///
    /// PTRACE_ATTACHの後、プロセスが停止するまで待機します。
    pub fn attach(pid: i32) -> Result<Self> {
        let pid = Pid::from_raw(pid);
        ptrace::attach(pid).map_err(|e| anyhow::anyhow!("Failed to attach to process {}: {}", pid, e))?;

        match waitpid(pid, None)? {
            WaitStatus::Stopped(_, _) => {
                tracing::debug!(pid = pid.as_raw(), "attached");
                Ok(Self { pid, traced: true })
            }
            status => Err(anyhow::anyhow!("Unexpected wait status after attach: {:?}", status)),
        }
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// まだptraceで制御しているか
    pub fn is_traced(&self) -> bool {
        self.traced
    }

    /// プロセスを実行継続して停止イベントを待機する
    ///
    /// `signal`が指定された場合はデバッギへ配送してから再開します。
    pub fn continue_and_wait(&mut self, signal: Option<Signal>) -> Result<StopReason> {
        ptrace::cont(self.pid, signal)?;
        let reason = self.wait()?;
        Ok(match reason {
            StopReason::Step => StopReason::Breakpoint,
            other => other,
        })
    }

    /// 1命令だけ実行して停止する
    pub fn step(&mut self) -> Result<StopReason> {
        ptrace::step(self.pid, None)?;
        self.wait()
    }

    /// 次の停止イベントを待機する
    fn wait(&mut self) -> Result<StopReason> {
        let reason = match waitpid(self.pid, None)? {
            // SIGTRAPはステップ完了かブレークポイント。判定は呼び出し元で行う
            WaitStatus::Stopped(_, Signal::SIGTRAP) => StopReason::Step,
            WaitStatus::Stopped(_, signal) => StopReason::Signal(signal),
            WaitStatus::Exited(_, code) => StopReason::Exited(code),
            WaitStatus::Signaled(_, signal, _) => StopReason::Killed(signal),
            _ => StopReason::Other,
        };

        if reason.is_terminal() {
            self.traced = false;
        }
        tracing::trace!(pid = self.pid.as_raw(), ?reason, "stop");
        Ok(reason)
    }

    /// プロセスからデタッチする
    pub fn detach(&mut self) -> Result<()> {
        if self.traced {
            ptrace::detach(self.pid, None)?;
            self.traced = false;
        }
        Ok(())
    }

    /// プロセスを強制終了する
    pub fn kill(&mut self) -> Result<()> {
        if self.traced {
            nix::sys::signal::kill(self.pid, Signal::SIGKILL)?;
            // 終了を回収する
            while !self.wait()?.is_terminal() {}
        }
        Ok(())
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.traced {
            let _ = ptrace::detach(self.pid, None);
        }
    }
}
