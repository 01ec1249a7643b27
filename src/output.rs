//! One-shot (non-interactive) output.
//!
//! Live mode redraws one line per package in place while runs are in flight;
//! batch mode stays quiet until the end. Both finish with the same report.

use std::fmt::Write as _;
use std::io::{self, IsTerminal, Write};

use crossterm::cursor::MoveUp;
use crossterm::queue;
use crossterm::terminal::{Clear, ClearType};

use crate::app::SPINNER;
use crate::package::{RunState, RunStatus};
use crate::report::TestStatus;
use crate::scheduler::Scheduler;
use crate::summary::{format_duration, strip_ansi};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStyle {
    /// Spinner lines redrawn in place.
    Live,
    /// A single report at the end.
    Batch,
}

/// True when `CI` is set to anything but an empty string, `0` or `false`.
pub fn is_ci() -> bool {
    std::env::var("CI")
        .map(|value| !matches!(value.as_str(), "" | "0" | "false"))
        .unwrap_or(false)
}

pub fn output_style() -> OutputStyle {
    if io::stdout().is_terminal() && !is_ci() {
        OutputStyle::Live
    } else {
        OutputStyle::Batch
    }
}

/// Process exit code: only failed tests under CI fail the build. Broken
/// runs are reported but judged by their parsed counts, not the exit code.
pub fn exit_code(scheduler: &Scheduler, ci: bool) -> i32 {
    if ci && scheduler.totals().failed > 0 {
        1
    } else {
        0
    }
}

/// In-place progress lines for live mode.
#[derive(Debug, Default)]
pub struct LiveProgress {
    drawn: u16,
    frame: usize,
}

impl LiveProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the previously drawn lines with the current state.
    pub fn redraw(&mut self, scheduler: &Scheduler, out: &mut impl Write) -> io::Result<()> {
        self.frame = self.frame.wrapping_add(1);
        self.erase(out)?;
        let spinner = SPINNER[self.frame % SPINNER.len()];
        let width = name_width(scheduler);
        for (package, state) in scheduler.packages().iter().zip(scheduler.states()) {
            writeln!(out, "{}", package_line(&package.name, state, width, spinner))?;
        }
        self.drawn = scheduler.len() as u16;
        out.flush()
    }

    /// Removes the progress lines so the final report starts clean.
    pub fn erase(&mut self, out: &mut impl Write) -> io::Result<()> {
        if self.drawn > 0 {
            queue!(out, MoveUp(self.drawn), Clear(ClearType::FromCursorDown))?;
            self.drawn = 0;
        }
        Ok(())
    }
}

fn name_width(scheduler: &Scheduler) -> usize {
    scheduler
        .packages()
        .iter()
        .map(|package| package.name.chars().count())
        .max()
        .unwrap_or(0)
}

fn package_line(name: &str, state: &RunState, width: usize, spinner: char) -> String {
    let glyph = match state.status {
        RunStatus::Running => spinner,
        RunStatus::Pending => '·',
        RunStatus::NoTests | RunStatus::UnknownRunner => '–',
        RunStatus::Done if state.is_broken() => '!',
        RunStatus::Done if state.has_failures() => '✗',
        RunStatus::Done => '✓',
    };
    let detail = match state.status {
        RunStatus::NoTests => "no test script".to_string(),
        RunStatus::UnknownRunner => "unknown runner".to_string(),
        _ => {
            let duration = state
                .display_duration()
                .map(format_duration)
                .unwrap_or_else(|| "-".into());
            format!(
                "{:>4} passed {:>4} skipped {:>4} failed  {:>8}",
                state.passed, state.skipped, state.failed, duration
            )
        }
    };
    format!(" {glyph} {name:<width$}  {detail}")
}

/// The end-of-run report.
pub fn final_report(scheduler: &Scheduler, verbose: bool) -> String {
    let mut out = String::new();
    let width = name_width(scheduler);
    for (package, state) in scheduler.packages().iter().zip(scheduler.states()) {
        let _ = writeln!(out, "{}", package_line(&package.name, state, width, '·'));
    }

    let mut failures = String::new();
    for (package, state) in scheduler.packages().iter().zip(scheduler.states()) {
        let Some(report) = &state.test_report else {
            continue;
        };
        for (file, test) in report.tests().filter(|(_, test)| test.status == TestStatus::Failed) {
            let _ = writeln!(failures, "  ✗ {} › {} › {}", package.name, file, test.name);
            if verbose {
                if let Some(message) = &test.failure_message {
                    for line in strip_ansi(message).lines() {
                        let _ = writeln!(failures, "      {line}");
                    }
                }
            }
        }
    }
    if !failures.is_empty() {
        let _ = write!(out, "\nFailed tests:\n{failures}");
    }

    let mut errors = String::new();
    for (package, state) in scheduler.packages().iter().zip(scheduler.states()) {
        if let Some(error) = &state.spawn_error {
            let _ = writeln!(errors, "  ! {}: {}", package.name, error);
        } else if state.is_broken() {
            let code = state
                .exit_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "signal".into());
            let _ = writeln!(errors, "  ! {}: exited {} without failing tests", package.name, code);
            if verbose {
                for line in strip_ansi(&state.raw_output).lines() {
                    let _ = writeln!(errors, "      {line}");
                }
            }
        }
    }
    if !errors.is_empty() {
        let _ = write!(out, "\nBroken runs:\n{errors}");
    }

    if scheduler.states().iter().any(|state| state.coverage_requested) {
        out.push_str("\nCoverage:\n");
        let _ = writeln!(
            out,
            "  {:<width$}  {:>7}  {:>7}  {:>7}",
            "package", "lines", "branch", "funcs"
        );
        for (package, state) in scheduler.packages().iter().zip(scheduler.states()) {
            if !state.coverage_requested {
                continue;
            }
            let summary = state.coverage.as_ref().map(|c| c.summary);
            let cell = |pct: Option<f64>| match pct {
                Some(pct) => format!("{pct:>6.1}%"),
                None => format!("{:>7}", "–"),
            };
            let (lines, branches, functions) = summary
                .map(|s| (s.lines_pct, s.branches_pct, s.functions_pct))
                .unwrap_or((None, None, None));
            let _ = writeln!(
                out,
                "  {:<width$}  {}  {}  {}",
                package.name,
                cell(lines),
                cell(branches),
                cell(functions)
            );
        }
    }

    let totals = scheduler.totals();
    let _ = writeln!(
        out,
        "\n{} passed, {} skipped, {} failed across {} packages",
        totals.passed,
        totals.skipped,
        totals.failed,
        scheduler.len()
    );
    out
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::adapter::AdapterRegistry;
    use crate::package::{Package, RunnerKind};
    use crate::report::parse_report;

    fn scheduler() -> Scheduler {
        let packages = vec![
            Package {
                name: "api".into(),
                path: PathBuf::from("/repo/api"),
                test_command: Some("vitest".into()),
                runner: Some(RunnerKind::Vitest),
            },
            Package {
                name: "docs".into(),
                path: PathBuf::from("/repo/docs"),
                test_command: None,
                runner: None,
            },
        ];
        Scheduler::new(packages, AdapterRegistry::new(), false, PathBuf::from("/tmp/testrack-output-tests"))
    }

    fn finish(scheduler: &mut Scheduler, failed: bool, exit_code: i32) {
        let state = scheduler.state_mut(0).unwrap();
        state.status = RunStatus::Done;
        state.exit_code = Some(exit_code);
        state.duration = Some(Duration::from_millis(250));
        state.raw_output = "\u{1b}[31mSyntaxError\u{1b}[0m: bad".into();
        if failed {
            state.passed = 1;
            state.failed = 1;
            state.test_report = Some(parse_report(
                r#"<testsuite name="src/a.test.ts">
                    <testcase classname="src/a.test.ts" name="ok"/>
                    <testcase classname="src/a.test.ts" name="adds"><failure message="expected 2">expected 2
received 3</failure></testcase>
                </testsuite>"#,
            ));
        }
    }

    #[test]
    fn report_lists_failures_with_verbose_messages() {
        let mut scheduler = scheduler();
        finish(&mut scheduler, true, 1);
        let quiet = final_report(&scheduler, false);
        assert!(quiet.contains("✗ api › src/a.test.ts › adds"));
        assert!(!quiet.contains("received 3"));
        assert!(quiet.contains("no test script"));
        assert!(quiet.contains("1 passed, 0 skipped, 1 failed across 2 packages"));

        let verbose = final_report(&scheduler, true);
        assert!(verbose.contains("      received 3"));
        assert!(!verbose.contains("Broken runs"));
    }

    #[test]
    fn broken_runs_show_raw_output_in_verbose_mode() {
        let mut scheduler = scheduler();
        finish(&mut scheduler, false, 1);
        let report = final_report(&scheduler, true);
        assert!(report.contains("! api: exited 1 without failing tests"));
        assert!(report.contains("      SyntaxError: bad"));
    }

    #[test]
    fn exit_code_is_nonzero_only_under_ci() {
        let mut scheduler = scheduler();
        finish(&mut scheduler, true, 1);
        assert_eq!(exit_code(&scheduler, false), 0);
        assert_eq!(exit_code(&scheduler, true), 1);

        let mut clean = self::scheduler();
        finish(&mut clean, false, 0);
        assert_eq!(exit_code(&clean, true), 0);
    }

    #[test]
    fn broken_runs_without_failed_tests_pass_ci() {
        let mut scheduler = scheduler();
        finish(&mut scheduler, false, 1);
        assert!(scheduler.state(0).unwrap().is_broken());
        assert_eq!(exit_code(&scheduler, true), 0);
    }

    #[test]
    fn live_progress_erases_what_it_drew() {
        let scheduler = scheduler();
        let mut progress = LiveProgress::new();
        let mut buf = Vec::new();
        progress.redraw(&scheduler, &mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf).into_owned();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains(" · api"));

        let mut buf = Vec::new();
        progress.erase(&mut buf).unwrap();
        assert!(!buf.is_empty());
        let mut again = Vec::new();
        progress.erase(&mut again).unwrap();
        assert!(again.is_empty());
    }
}
