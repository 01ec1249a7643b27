//! Run scheduling state machine.
//!
//! The scheduler owns every `RunState` and decides what to launch next. It
//! does no I/O of its own apart from reading report files once a run ends;
//! spawning is left to [`crate::runner::ProcessManager`], which feeds output
//! and exit events back through the event loop. Every entry point that can
//! start work returns the [`Launch`]es the caller has to spawn.
//!
//! At most one process per package is live. A rerun requested while a package
//! is running is queued and started from that run's completion. `run_all`
//! while anything is running is deferred until every package is idle, and a
//! pending run-all suppresses per-package queue draining so nothing is
//! launched twice.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::adapter::{AdapterRegistry, CommandRequest, CommandSpec, RunArtifacts};
use crate::coverage;
use crate::flags::CoverageFlags;
use crate::package::{Package, RunState, RunStatus};
use crate::report::{parse_report, TestStatus};

/// A process the caller must spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub id: usize,
    pub command: CommandSpec,
    pub artifacts: RunArtifacts,
    pub coverage: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunAllOutcome {
    Started,
    Deferred,
}

/// Aggregate counts over every package.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub passed: u32,
    pub skipped: u32,
    pub failed: u32,
    pub running: usize,
    pub broken: usize,
}

pub struct Scheduler {
    packages: Vec<Package>,
    states: Vec<RunState>,
    adapters: AdapterRegistry,
    coverage: CoverageFlags,
    pending_reruns: BTreeSet<usize>,
    pending_run_all: bool,
    artifacts_root: PathBuf,
}

impl Scheduler {
    pub fn new(
        packages: Vec<Package>,
        adapters: AdapterRegistry,
        coverage_enabled: bool,
        artifacts_root: PathBuf,
    ) -> Self {
        let states = packages.iter().map(RunState::for_package).collect();
        let coverage = CoverageFlags::new(packages.len(), coverage_enabled);
        Self {
            packages,
            states,
            adapters,
            coverage,
            pending_reruns: BTreeSet::new(),
            pending_run_all: false,
            artifacts_root,
        }
    }

    pub fn packages(&self) -> &[Package] {
        &self.packages
    }

    pub fn package(&self, id: usize) -> Option<&Package> {
        self.packages.get(id)
    }

    pub fn states(&self) -> &[RunState] {
        &self.states
    }

    pub fn state(&self, id: usize) -> Option<&RunState> {
        self.states.get(id)
    }

    #[cfg(test)]
    pub(crate) fn state_mut(&mut self, id: usize) -> Option<&mut RunState> {
        self.states.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.packages.iter().position(|package| package.name == name)
    }

    pub fn coverage_flags(&self) -> &CoverageFlags {
        &self.coverage
    }

    pub fn any_running(&self) -> bool {
        self.states.iter().any(RunState::is_running)
    }

    pub fn pending_run_all(&self) -> bool {
        self.pending_run_all
    }

    pub fn is_queued(&self, id: usize) -> bool {
        self.pending_reruns.contains(&id)
    }

    pub fn totals(&self) -> Totals {
        self.states.iter().fold(Totals::default(), |mut totals, state| {
            totals.passed += state.passed;
            totals.skipped += state.skipped;
            totals.failed += state.failed;
            if state.is_running() {
                totals.running += 1;
            }
            if state.is_broken() {
                totals.broken += 1;
            }
            totals
        })
    }

    /// Starts `id`, or queues it behind its live run.
    pub fn run_package(&mut self, id: usize) -> Option<Launch> {
        let state = self.states.get(id)?;
        if state.is_running() {
            debug!(package = %self.packages[id].name, "run in flight, queueing rerun");
            self.pending_reruns.insert(id);
            return None;
        }
        self.launch(id)
    }

    /// Runs every runnable package, or defers until nothing is running.
    pub fn run_all(&mut self) -> (Vec<Launch>, RunAllOutcome) {
        if self.any_running() {
            debug!("runs in flight, deferring run-all");
            self.pending_run_all = true;
            return (Vec::new(), RunAllOutcome::Deferred);
        }
        (self.launch_all(), RunAllOutcome::Started)
    }

    /// Flips the coverage flag of one package; turning it on reruns it.
    pub fn toggle_coverage(&mut self, id: usize) -> Option<Launch> {
        if self.coverage.toggle(id) {
            self.run_package(id)
        } else {
            None
        }
    }

    /// Advances the global coverage cycle and reruns the packages it turned on.
    pub fn cycle_coverage(&mut self) -> Vec<Launch> {
        let turned_on = self.coverage.cycle();
        turned_on
            .into_iter()
            .filter_map(|id| self.run_package(id))
            .collect()
    }

    /// Applies a chunk of process output to the live counters.
    pub fn on_output(&mut self, id: usize, chunk: &str) {
        let Some(adapter) = self
            .packages
            .get(id)
            .and_then(|package| package.runner)
            .and_then(|kind| self.adapters.get(kind))
        else {
            return;
        };
        let Some(state) = self.states.get_mut(id) else {
            return;
        };
        state.add(adapter.count_dots(chunk));
        state.raw_output.push_str(chunk);
    }

    /// Finalizes a finished run and returns what to launch next.
    pub fn on_exit(&mut self, id: usize, code: Option<i32>) -> Vec<Launch> {
        if id >= self.states.len() {
            return Vec::new();
        }
        self.finalize(id, code);
        self.complete(id)
    }

    /// Records a spawn failure and resolves the queue as for any completion.
    pub fn on_spawn_failed(&mut self, id: usize, error: String) -> Vec<Launch> {
        let Some(state) = self.states.get_mut(id) else {
            return Vec::new();
        };
        warn!(package = %self.packages[id].name, %error, "failed to spawn test run");
        state.status = RunStatus::Done;
        state.spawn_error = Some(error);
        state.duration = state.started_at.map(|started| started.elapsed());
        self.complete(id)
    }

    fn complete(&mut self, id: usize) -> Vec<Launch> {
        if self.pending_run_all {
            if self.any_running() {
                return Vec::new();
            }
            info!("all runs idle, starting deferred run-all");
            self.pending_run_all = false;
            self.pending_reruns.clear();
            return self.launch_all();
        }
        if self.pending_reruns.remove(&id) {
            debug!(package = %self.packages[id].name, "starting queued rerun");
            return self.launch(id).into_iter().collect();
        }
        Vec::new()
    }

    fn launch_all(&mut self) -> Vec<Launch> {
        (0..self.packages.len())
            .filter_map(|id| self.launch(id))
            .collect()
    }

    /// Builds the command from the flags as they are now and marks the
    /// package running.
    fn launch(&mut self, id: usize) -> Option<Launch> {
        let package = self.packages.get(id)?;
        let test_command = package.test_command.as_deref()?;
        let adapter = self.adapters.get(package.runner?)?;
        let coverage = self.coverage.is_on(id);
        let artifacts = RunArtifacts::new(&self.artifacts_root, &package.name);
        let (program, args) = adapter.build_command(&CommandRequest {
            test_command,
            coverage,
            artifacts: &artifacts,
        });
        let command = CommandSpec {
            program,
            args,
            cwd: package.path.clone(),
        };
        debug!(package = %package.name, command = %command.display(), coverage, "launching");
        self.states[id].begin(coverage);
        Some(Launch {
            id,
            command,
            artifacts,
            coverage,
        })
    }

    fn finalize(&mut self, id: usize, code: Option<i32>) {
        let package = &self.packages[id];
        let Some(adapter) = package.runner.and_then(|kind| self.adapters.get(kind)) else {
            return;
        };
        let artifacts = RunArtifacts::new(&self.artifacts_root, &package.name);
        let state = &mut self.states[id];
        state.status = RunStatus::Done;
        state.exit_code = code;

        let summary = adapter.parse_final(&state.raw_output);
        let report = std::fs::read_to_string(&artifacts.junit)
            .ok()
            .map(|xml| parse_report(&xml))
            .filter(|report| !report.is_empty());

        if !summary.is_empty() {
            state.passed = summary.passed;
            state.skipped = summary.skipped;
            state.failed = summary.failed;
            state.test_count = summary.test_count;
            state.file_count = summary.file_count;
        } else if let Some(report) = &report {
            debug!(package = %package.name, "no final summary, counting from report");
            state.passed = report.count(TestStatus::Passed) as u32;
            state.skipped = report.count(TestStatus::Skipped) as u32;
            state.failed = report.count(TestStatus::Failed) as u32;
            state.test_count = report.test_count() as u32;
            state.file_count = report.suites.len() as u32;
        } else {
            state.test_count = state.passed + state.skipped + state.failed;
        }
        state.duration = summary
            .duration
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .or_else(|| state.started_at.map(|started| started.elapsed()));
        state.test_report = report;

        if state.coverage_requested {
            let thresholds = adapter.thresholds(&package.path);
            state.coverage = coverage::load(&artifacts.lcov(), &package.path, thresholds);
        }
        info!(
            package = %package.name,
            passed = state.passed,
            failed = state.failed,
            skipped = state.skipped,
            exit_code = ?code,
            "run finished"
        );
    }
}
