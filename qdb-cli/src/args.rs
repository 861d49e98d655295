//! コマンドライン引数の正規化
//!
//! `-attach` や `-at` のような1ダッシュの長いフラグも受け付けるため、
//! clapに渡す前に2ダッシュへ書き換えます。

use clap::{ArgAction, Parser};
use qdb_core::query::compile;
use qdb_core::{SessionRequest, SymbolScope, TargetDescriptor, UsageError};
use std::ffi::OsString;
use thiserror::Error;

/// 1ダッシュでも書ける長いフラグと、それが取る値の数
const LONG_FLAGS: &[(&str, usize)] = &[
    ("attach", 1),
    ("loadsyms", 1),
    ("init", 1),
    ("at", 2),
    ("at-if", 3),
    ("help-builtins", 0),
];

const HELP_BUILTINS: &str = "help-builtins";

/// qdb - Query-oriented process debugger [x86_64]
#[derive(Parser, Debug)]
#[command(name = "qdb")]
#[command(version)]
#[command(about = "Query-oriented process debugger [x86_64]", long_about = None)]
pub struct Cli {
    /// Command line to launch, quoted as a single argument
    pub cmdline: Option<String>,

    /// Process ID to attach to
    #[arg(long = "attach", value_name = "PID")]
    pub attach: Option<i32>,

    /// Suppress informational and warning output
    #[arg(short = 'q')]
    pub quiet: bool,

    /// Modules to load symbols for, whitespace separated, or '*' for all
    #[arg(long = "loadsyms", value_name = "NAMES")]
    pub loadsyms: Option<String>,

    /// Action code run once before any query fires
    #[arg(long = "init", value_name = "CODE", allow_hyphen_values = true)]
    pub init: Option<String>,

    /// Run ACTION every time LOCATION is reached
    #[arg(
        long = "at",
        num_args = 2,
        value_names = ["LOCATION", "ACTION"],
        action = ArgAction::Append,
        allow_hyphen_values = true
    )]
    pub at: Vec<String>,

    /// Run ACTION when LOCATION is reached and CONDITION is non-zero
    #[arg(
        long = "at-if",
        num_args = 3,
        value_names = ["LOCATION", "CONDITION", "ACTION"],
        action = ArgAction::Append,
        allow_hyphen_values = true
    )]
    pub at_if: Vec<String>,

    /// Print the builtins available to action code and exit
    #[arg(long = "help-builtins")]
    pub help_builtins: bool,
}

/// 正規化の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Session(SessionRequest),
    HelpBuiltins,
}

/// 引数の誤り
#[derive(Debug, Error)]
pub enum ArgsError {
    /// clapが検出した書式の誤り（`--help`/`--version` も含む）
    #[error(transparent)]
    Clap(#[from] clap::Error),
    /// ターゲット指定の誤り
    #[error(transparent)]
    Usage(#[from] UsageError),
}

/// 1ダッシュの長いフラグを2ダッシュに書き換える
///
/// フラグの値として渡された文字列と `--` 以降は書き換えません。
/// `--help-builtins` がフラグとして現れたかどうかも返します。
fn rewrite_long_flags(args: Vec<OsString>) -> (Vec<OsString>, bool) {
    let mut rewritten = Vec::with_capacity(args.len());
    let mut help_builtins = false;
    let mut pending_values = 0usize;
    let mut passthrough = false;

    for (index, arg) in args.into_iter().enumerate() {
        if index == 0 || passthrough {
            rewritten.push(arg);
            continue;
        }
        if pending_values > 0 {
            pending_values -= 1;
            rewritten.push(arg);
            continue;
        }

        let Some(text) = arg.to_str() else {
            rewritten.push(arg);
            continue;
        };
        if text == "--" {
            passthrough = true;
            rewritten.push(arg);
            continue;
        }

        let name = text.strip_prefix("--").or_else(|| text.strip_prefix('-'));
        let flag = name.and_then(|name| {
            let (bare, inline_value) = match name.split_once('=') {
                Some((bare, _)) => (bare, true),
                None => (name, false),
            };
            LONG_FLAGS
                .iter()
                .find(|(flag, _)| *flag == bare)
                .map(|(flag, arity)| (*flag, if inline_value { arity.saturating_sub(1) } else { *arity }))
        });

        match (flag, name) {
            (Some((flag, arity)), Some(name)) => {
                help_builtins |= flag == HELP_BUILTINS;
                pending_values = arity;
                rewritten.push(OsString::from(format!("--{}", name)));
            }
            _ => rewritten.push(arg),
        }
    }

    (rewritten, help_builtins)
}

/// 引数を検証してセッション要求に変換する
pub fn normalize<I, T>(args: I) -> Result<Invocation, ArgsError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let (args, help_builtins) = rewrite_long_flags(args.into_iter().map(Into::into).collect());
    if help_builtins {
        return Ok(Invocation::HelpBuiltins);
    }

    let cli = Cli::try_parse_from(args)?;
    let target = TargetDescriptor::from_parts(cli.cmdline, cli.attach)?;

    let unconditional = cli
        .at
        .chunks(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    let conditional = cli
        .at_if
        .chunks(3)
        .map(|triple| (triple[0].clone(), triple[1].clone(), triple[2].clone()))
        .collect();

    Ok(Invocation::Session(SessionRequest {
        target,
        symbols: SymbolScope::parse(cli.loadsyms.as_deref()),
        init_code: cli.init,
        queries: compile(unconditional, conditional),
        quiet: cli.quiet,
    }))
}
