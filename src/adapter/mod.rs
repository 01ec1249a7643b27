//! Runner adapters: one per supported test framework.
//!
//! An adapter knows how to recognize its framework in a package's `test`
//! script, how to spawn it with machine-readable reporters, how to count the
//! live dot stream and how to read the trailing summary once the run ends.

mod bun;
mod vitest;

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::coverage::Thresholds;
use crate::package::RunnerKind;
use crate::summary::{DotCounts, FinalSummary};

pub use bun::BunAdapter;
pub use vitest::VitestAdapter;

/// Where a run writes its report files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArtifacts {
    pub dir: PathBuf,
    pub junit: PathBuf,
    pub coverage_dir: PathBuf,
}

impl RunArtifacts {
    /// Artifacts for `package` under `base`, one directory per package.
    pub fn new(base: &Path, package: &str) -> Self {
        let dir = base.join(sanitize(package));
        Self {
            junit: dir.join("junit.xml"),
            coverage_dir: dir.join("coverage"),
            dir,
        }
    }

    pub fn lcov(&self) -> PathBuf {
        self.coverage_dir.join("lcov.info")
    }
}

/// Per-process scratch directory holding every package's artifacts.
pub fn artifacts_root() -> PathBuf {
    std::env::temp_dir().join(format!("testrack-{}", std::process::id()))
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

/// Inputs to [`RunnerAdapter::build_command`].
#[derive(Debug, Clone, Copy)]
pub struct CommandRequest<'a> {
    pub test_command: &'a str,
    pub coverage: bool,
    pub artifacts: &'a RunArtifacts,
}

/// A fully resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl CommandSpec {
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }
}

pub trait RunnerAdapter: Send + Sync {
    fn kind(&self) -> RunnerKind;
    fn name(&self) -> &'static str;
    /// Whether this adapter runs the given `test` script.
    fn detect(&self, test_command: &str) -> bool;
    /// Program and arguments, without a working directory.
    fn build_command(&self, request: &CommandRequest<'_>) -> (String, Vec<String>);
    fn count_dots(&self, chunk: &str) -> DotCounts;
    fn parse_final(&self, output: &str) -> FinalSummary;
    fn thresholds(&self, package_root: &Path) -> Option<Thresholds>;
}

/// Ordered adapter list. Detection is first match wins.
pub struct AdapterRegistry {
    adapters: Vec<Box<dyn RunnerAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: vec![Box::new(VitestAdapter::new()), Box::new(BunAdapter::new())],
        }
    }

    pub fn detect(&self, test_command: &str) -> Option<RunnerKind> {
        self.adapters
            .iter()
            .find(|adapter| adapter.detect(test_command))
            .map(|adapter| adapter.kind())
    }

    pub fn get(&self, kind: RunnerKind) -> Option<&dyn RunnerAdapter> {
        self.adapters
            .iter()
            .find(|adapter| adapter.kind() == kind)
            .map(|adapter| adapter.as_ref())
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits a script into words, tolerating unbalanced quotes.
pub(crate) fn split_command(command: &str) -> Vec<String> {
    shell_words::split(command)
        .unwrap_or_else(|_| command.split_whitespace().map(str::to_string).collect())
}

/// User arguments following the runner invocation, up to the first shell
/// operator.
pub(crate) fn trailing_args(words: &[String], skip: &[&str]) -> Vec<String> {
    words
        .iter()
        .take_while(|word| !matches!(word.as_str(), "&&" | "||" | ";" | "|"))
        .filter(|word| !skip.contains(&word.as_str()))
        .cloned()
        .collect()
}

pub(crate) fn capture_u32(re: &Regex, text: &str) -> Option<u32> {
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

pub(crate) fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("adapter pattern is valid")
}
