//! セッション結果のレポート

use crate::console::Console;
use crate::engine::HitCounts;
use crate::errors::ReportedError;
use crate::session::SessionOutcome;

/// 結果をコンソールに出力する
///
/// エラー、終了コード、ヒットカウントの順に出力します。
pub fn report(console: &Console, outcome: &SessionOutcome, counts: &HitCounts) {
    if let Some(error) = &outcome.error {
        report_error(console, error);
    }

    match outcome.exit_code {
        Some(code) => console.info(format!("Debuggee returned {}", code)),
        None => console.warning("Debuggee terminated without returning an exit code"),
    }

    if !counts.is_empty() {
        console.info("Counts:");
        for (key, hits) in counts.iter() {
            console.info(format!("{} hit {} time(s)", key, hits));
        }
    }
}

fn report_error(console: &Console, error: &ReportedError) {
    match error {
        ReportedError::BreakpointAction { message, backtrace } => {
            console.error(message);
            for frame in backtrace {
                console.error(format!("  {}", frame));
            }
        }
        ReportedError::Platform { message } | ReportedError::ProcessCreation { message } => console.error(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::Verbosity;
    use crate::engine::HitKey;
    use crate::errors::SessionError;
    use crate::testing::capture_console;

    fn failed(error: SessionError) -> SessionOutcome {
        match error {
            SessionError::Reported(error) => SessionOutcome::failed(error),
            SessionError::Unclassified(e) => panic!("unexpected unclassified error: {}", e),
        }
    }

    fn sample_counts() -> HitCounts {
        [(HitKey::Address(0x401000), 3), (HitKey::Symbol("main".to_string()), 1)]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_exit_code_zero_is_reported() {
        let (console, captured) = capture_console(Verbosity::Normal);
        report(&console, &SessionOutcome::completed(Some(0)), &HitCounts::new());

        assert_eq!(captured.stdout(), "qdb: Debuggee returned 0\n");
        assert_eq!(captured.stderr(), "");
    }

    #[test]
    fn test_missing_exit_code_warns() {
        let (console, captured) = capture_console(Verbosity::Normal);
        report(&console, &SessionOutcome::completed(None), &HitCounts::new());

        assert_eq!(captured.stdout(), "");
        assert_eq!(
            captured.stderr(),
            "qdb: Debuggee terminated without returning an exit code\n"
        );
    }

    #[test]
    fn test_counts_in_snapshot_order() {
        let (console, captured) = capture_console(Verbosity::Normal);
        report(&console, &SessionOutcome::completed(Some(1)), &sample_counts());

        assert_eq!(
            captured.stdout(),
            "qdb: Debuggee returned 1\nqdb: Counts:\nqdb: 0x401000 hit 3 time(s)\nqdb: main hit 1 time(s)\n"
        );
    }

    #[test]
    fn test_breakpoint_action_backtrace() {
        let cause = anyhow::anyhow!("Failed to read 8 bytes at 0x0").context("statement 1: dump(0, 8)");
        let outcome = failed(SessionError::breakpoint_action("query #1 at main", cause));

        let (console, captured) = capture_console(Verbosity::Normal);
        report(&console, &outcome, &HitCounts::new());

        assert_eq!(
            captured.stderr(),
            concat!(
                "qdb: query #1 at main failed: Failed to read 8 bytes at 0x0\n",
                "qdb:   query #1 at main\n",
                "qdb:   statement 1: dump(0, 8)\n",
                "qdb:   Failed to read 8 bytes at 0x0\n",
                "qdb: Debuggee terminated without returning an exit code\n",
            )
        );
    }

    #[test]
    fn test_quiet_keeps_only_errors() {
        let outcome = failed(SessionError::process_creation("could not execute /nonexistent"));

        let (console, captured) = capture_console(Verbosity::Quiet);
        report(&console, &outcome, &sample_counts());

        assert_eq!(captured.stdout(), "");
        assert_eq!(
            captured.stderr(),
            "qdb: process creation failed: could not execute /nonexistent\n"
        );
    }
}
