//! qdb CLI - コマンドラインインターフェース
//!
//! 起動時に宣言したクエリを、デバッグ対象の実行中に自動で評価します。

mod args;

use anyhow::Result;
use args::{ArgsError, Cli, Invocation};
use clap::CommandFactory;
use qdb_core::{builtins, session, Console, Qdb, Verbosity};
use std::rc::Rc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// 使い方の誤りの終了ステータス
const USAGE_EXIT_STATUS: i32 = 2;

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let request = match args::normalize(std::env::args_os()) {
        Ok(Invocation::Session(request)) => request,
        Ok(Invocation::HelpBuiltins) => {
            print!("{}", builtins::documentation());
            return Ok(());
        }
        Err(ArgsError::Clap(e)) => e.exit(),
        Err(ArgsError::Usage(e)) => {
            println!("{}", e);
            println!();
            println!("{}", Cli::command().render_help());
            std::process::exit(USAGE_EXIT_STATUS);
        }
    };

    let console = Rc::new(Console::stdio(Verbosity::from_quiet(request.quiet)));
    let engine = Qdb::new(Rc::clone(&console));

    tracing::debug!(?request.target, queries = request.queries.len(), "starting session");
    let (outcome, counts) = session::run(engine, Rc::clone(&console), &request)?;
    qdb_core::report(&console, &outcome, &counts);
    Ok(())
}
