use std::path::Path;

use regex::Regex;

use super::{compile, split_command, trailing_args, CommandRequest, RunnerAdapter};
use crate::coverage::Thresholds;
use crate::package::RunnerKind;
use crate::summary::{count_markers, seconds_from, strip_ansi, DotCounts, FinalSummary, Marker};

const MARKERS: &[(char, Marker)] = &[
    ('·', Marker::Passed),
    ('.', Marker::Passed),
    ('-', Marker::Skipped),
    ('↓', Marker::Skipped),
    ('×', Marker::Failed),
    ('x', Marker::Failed),
];

/// Words of the user's script that select a vitest mode we override.
const MODE_WORDS: &[&str] = &["run", "watch", "dev", "--run", "--watch"];

const CONFIG_FILES: &[&str] = &[
    "vitest.config.ts",
    "vitest.config.mts",
    "vitest.config.js",
    "vitest.config.mjs",
    "vitest.config.cts",
    "vitest.config.cjs",
    "vite.config.ts",
    "vite.config.mts",
    "vite.config.js",
    "vite.config.mjs",
];

pub struct VitestAdapter {
    detect: Regex,
    files_line: Regex,
    tests_line: Regex,
    tally: Regex,
    duration: Regex,
    thresholds_block: Regex,
    threshold_entry: Regex,
}

impl VitestAdapter {
    pub fn new() -> Self {
        Self {
            detect: compile(r"\bvitest\b"),
            files_line: compile(r"(?m)^\s*Test Files\s+(.*?)\((\d+)\)"),
            tests_line: compile(r"(?m)^\s*Tests\s+(.*?)\((\d+)\)"),
            tally: compile(r"(\d+)\s+(passed|failed|skipped|todo)"),
            duration: compile(r"(?m)^\s*Duration\s+([\d.]+)\s*(ms|s)\b"),
            thresholds_block: compile(r"thresholds\s*:\s*\{([^}]*)\}"),
            threshold_entry: compile(r"\b(lines|branches|functions)\s*:\s*(\d+(?:\.\d+)?)"),
        }
    }
}

impl RunnerAdapter for VitestAdapter {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Vitest
    }

    fn name(&self) -> &'static str {
        "vitest"
    }

    fn detect(&self, test_command: &str) -> bool {
        self.detect.is_match(test_command)
    }

    fn build_command(&self, request: &CommandRequest<'_>) -> (String, Vec<String>) {
        let words = split_command(request.test_command);
        let start = words
            .iter()
            .position(|word| word == "vitest" || word.ends_with("/vitest"))
            .map_or(words.len(), |idx| idx + 1);

        let mut args = vec!["vitest".to_string(), "run".to_string()];
        args.extend(trailing_args(&words[start..], MODE_WORDS));
        args.push("--reporter=dot".into());
        args.push("--reporter=junit".into());
        args.push(format!(
            "--outputFile.junit={}",
            request.artifacts.junit.display()
        ));
        if request.coverage {
            args.push("--coverage.enabled".into());
            args.push("--coverage.reporter=lcov".into());
            args.push(format!(
                "--coverage.reportsDirectory={}",
                request.artifacts.coverage_dir.display()
            ));
        }
        ("npx".to_string(), args)
    }

    fn count_dots(&self, chunk: &str) -> DotCounts {
        count_markers(chunk, MARKERS)
    }

    fn parse_final(&self, output: &str) -> FinalSummary {
        let text = strip_ansi(output);
        let mut summary = FinalSummary::default();

        if let Some(caps) = self.files_line.captures(&text) {
            summary.file_count = caps[2].parse().unwrap_or(0);
        }
        if let Some(caps) = self.tests_line.captures(&text) {
            summary.test_count = caps[2].parse().unwrap_or(0);
            for tally in self.tally.captures_iter(&caps[1]) {
                let n: u32 = tally[1].parse().unwrap_or(0);
                match &tally[2] {
                    "passed" => summary.passed += n,
                    "failed" => summary.failed += n,
                    _ => summary.skipped += n,
                }
            }
        }
        if let Some(caps) = self.duration.captures(&text) {
            summary.duration = caps[1]
                .parse::<f64>()
                .ok()
                .map(|value| seconds_from(value, &caps[2]));
        }
        summary
    }

    fn thresholds(&self, package_root: &Path) -> Option<Thresholds> {
        let source = CONFIG_FILES
            .iter()
            .map(|name| package_root.join(name))
            .find_map(|path| std::fs::read_to_string(path).ok())?;
        let block = self.thresholds_block.captures(&source)?;
        let mut thresholds = Thresholds::default();
        for entry in self.threshold_entry.captures_iter(&block[1]) {
            let value = entry[2].parse::<f64>().ok();
            match &entry[1] {
                "lines" => thresholds.lines = value,
                "branches" => thresholds.branches = value,
                _ => thresholds.functions = value,
            }
        }
        (!thresholds.is_empty()).then_some(thresholds)
    }
}

impl Default for VitestAdapter {
    fn default() -> Self {
        Self::new()
    }
}
