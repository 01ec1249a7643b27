//! Data structures for tracking packages and their runs.
//!
//! A `Package` is what discovery found on disk and never changes afterwards.
//! A `RunState` holds everything the latest run produced; the scheduler is its
//! only writer and overwrites its fields in place on every rerun.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::coverage::PackageCoverage;
use crate::report::TestReport;
use crate::summary::DotCounts;

/// Test frameworks with a registered adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunnerKind {
    Vitest,
    Bun,
}

/// One testable unit of the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    /// Name from `package.json`, or the directory name.
    pub name: String,
    /// Absolute package directory.
    pub path: PathBuf,
    /// The `test` script, if the package declares one.
    pub test_command: Option<String>,
    /// Adapter that recognized the test command.
    pub runner: Option<RunnerKind>,
}

impl Package {
    pub fn is_runnable(&self) -> bool {
        self.test_command.is_some() && self.runner.is_some()
    }
}

/// The current lifecycle status of a package run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Not started yet.
    Pending,
    /// A process is live for this package.
    Running,
    /// The last run finished (or failed to spawn).
    Done,
    /// No `test` script.
    NoTests,
    /// A test script no adapter recognizes.
    UnknownRunner,
}

/// Results of the latest run of one package.
#[derive(Debug, Clone)]
pub struct RunState {
    pub status: RunStatus,
    pub passed: u32,
    pub skipped: u32,
    pub failed: u32,
    pub file_count: u32,
    pub test_count: u32,
    /// Runner-reported wall time, or elapsed time when the runner printed none.
    pub duration: Option<Duration>,
    pub exit_code: Option<i32>,
    /// Everything the process wrote, stdout and stderr interleaved.
    pub raw_output: String,
    pub test_report: Option<TestReport>,
    pub coverage: Option<PackageCoverage>,
    pub spawn_error: Option<String>,
    pub started_at: Option<Instant>,
    /// Whether the current (or last) run was spawned with coverage.
    pub coverage_requested: bool,
}

impl RunState {
    pub fn for_package(package: &Package) -> Self {
        let status = if package.test_command.is_none() {
            RunStatus::NoTests
        } else if package.runner.is_none() {
            RunStatus::UnknownRunner
        } else {
            RunStatus::Pending
        };
        Self {
            status,
            passed: 0,
            skipped: 0,
            failed: 0,
            file_count: 0,
            test_count: 0,
            duration: None,
            exit_code: None,
            raw_output: String::new(),
            test_report: None,
            coverage: None,
            spawn_error: None,
            started_at: None,
            coverage_requested: false,
        }
    }

    /// Clears counters for a fresh run.
    pub fn begin(&mut self, coverage: bool) {
        self.status = RunStatus::Running;
        self.passed = 0;
        self.skipped = 0;
        self.failed = 0;
        self.file_count = 0;
        self.test_count = 0;
        self.duration = None;
        self.exit_code = None;
        self.raw_output.clear();
        self.test_report = None;
        self.spawn_error = None;
        self.started_at = Some(Instant::now());
        self.coverage_requested = coverage;
        if !coverage {
            self.coverage = None;
        }
    }

    pub fn add(&mut self, counts: DotCounts) {
        self.passed += counts.passed;
        self.skipped += counts.skipped;
        self.failed += counts.failed;
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// Whether the run crashed or reported failures.
    pub fn is_broken(&self) -> bool {
        self.spawn_error.is_some()
            || (self.status == RunStatus::Done
                && self.exit_code.is_some_and(|code| code != 0)
                && self.failed == 0)
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    /// Elapsed time while running, else the recorded duration.
    pub fn display_duration(&self) -> Option<Duration> {
        match (self.status, self.started_at) {
            (RunStatus::Running, Some(started)) => Some(started.elapsed()),
            _ => self.duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(test_command: Option<&str>, runner: Option<RunnerKind>) -> Package {
        Package {
            name: "pkg".into(),
            path: PathBuf::from("/repo/pkg"),
            test_command: test_command.map(str::to_string),
            runner,
        }
    }

    #[test]
    fn initial_status_reflects_runnability() {
        let none = RunState::for_package(&package(None, None));
        assert_eq!(none.status, RunStatus::NoTests);
        let unknown = RunState::for_package(&package(Some("jest"), None));
        assert_eq!(unknown.status, RunStatus::UnknownRunner);
        let ok = RunState::for_package(&package(Some("vitest"), Some(RunnerKind::Vitest)));
        assert_eq!(ok.status, RunStatus::Pending);
    }

    #[test]
    fn begin_resets_counters_but_keeps_coverage_when_requested() {
        let mut state = RunState::for_package(&package(Some("vitest"), Some(RunnerKind::Vitest)));
        state.add(DotCounts {
            passed: 3,
            skipped: 1,
            failed: 2,
        });
        state.exit_code = Some(1);
        state.raw_output.push_str("old");
        state.coverage = Some(PackageCoverage::default());
        state.begin(true);
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!((state.passed, state.skipped, state.failed), (0, 0, 0));
        assert!(state.exit_code.is_none());
        assert!(state.raw_output.is_empty());
        assert!(state.coverage.is_some());
        state.begin(false);
        assert!(state.coverage.is_none());
    }

    #[test]
    fn nonzero_exit_without_failures_is_broken() {
        let mut state = RunState::for_package(&package(Some("vitest"), Some(RunnerKind::Vitest)));
        state.status = RunStatus::Done;
        state.exit_code = Some(1);
        assert!(state.is_broken());
        state.failed = 1;
        assert!(!state.is_broken());
        assert!(state.has_failures());
    }
}
