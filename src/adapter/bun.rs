use std::path::Path;

use regex::Regex;

use super::{capture_u32, compile, split_command, trailing_args, CommandRequest, RunnerAdapter};
use crate::coverage::Thresholds;
use crate::package::RunnerKind;
use crate::summary::{count_markers, seconds_from, strip_ansi, DotCounts, FinalSummary, Marker};

// `--dots` only prints passes; skips and failures show up in the summary.
const MARKERS: &[(char, Marker)] = &[('.', Marker::Passed)];

pub struct BunAdapter {
    detect: Regex,
    pass: Regex,
    skip: Regex,
    todo: Regex,
    fail: Regex,
    ran: Regex,
}

impl BunAdapter {
    pub fn new() -> Self {
        Self {
            detect: compile(r"\bbun\s+test\b"),
            pass: compile(r"(?m)^\s*(\d+) pass\b"),
            skip: compile(r"(?m)^\s*(\d+) skip\b"),
            todo: compile(r"(?m)^\s*(\d+) todo\b"),
            fail: compile(r"(?m)^\s*(\d+) fail\b"),
            ran: compile(r"Ran (\d+) tests? across (\d+) files?\.\s*\[([\d.]+)(ms|s)\]"),
        }
    }
}

impl RunnerAdapter for BunAdapter {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Bun
    }

    fn name(&self) -> &'static str {
        "bun"
    }

    fn detect(&self, test_command: &str) -> bool {
        self.detect.is_match(test_command)
    }

    fn build_command(&self, request: &CommandRequest<'_>) -> (String, Vec<String>) {
        let words = split_command(request.test_command);
        let start = words
            .windows(2)
            .position(|pair| pair[0] == "bun" && pair[1] == "test")
            .map_or(words.len(), |idx| idx + 2);

        let mut args = vec!["test".to_string()];
        args.extend(trailing_args(&words[start..], &["--watch"]));
        args.push("--dots".into());
        args.push("--reporter=junit".into());
        args.push(format!(
            "--reporter-outfile={}",
            request.artifacts.junit.display()
        ));
        if request.coverage {
            args.push("--coverage".into());
            args.push("--coverage-reporter=lcov".into());
            args.push(format!(
                "--coverage-dir={}",
                request.artifacts.coverage_dir.display()
            ));
        }
        ("bun".to_string(), args)
    }

    fn count_dots(&self, chunk: &str) -> DotCounts {
        count_markers(chunk, MARKERS)
    }

    fn parse_final(&self, output: &str) -> FinalSummary {
        let text = strip_ansi(output);
        let mut summary = FinalSummary {
            passed: capture_u32(&self.pass, &text).unwrap_or(0),
            skipped: capture_u32(&self.skip, &text).unwrap_or(0)
                + capture_u32(&self.todo, &text).unwrap_or(0),
            failed: capture_u32(&self.fail, &text).unwrap_or(0),
            ..FinalSummary::default()
        };
        match self.ran.captures(&text) {
            Some(caps) => {
                summary.test_count = caps[1].parse().unwrap_or(0);
                summary.file_count = caps[2].parse().unwrap_or(0);
                summary.duration = caps[3]
                    .parse::<f64>()
                    .ok()
                    .map(|value| seconds_from(value, &caps[4]));
            }
            None => summary.test_count = summary.passed + summary.skipped + summary.failed,
        }
        summary
    }

    fn thresholds(&self, package_root: &Path) -> Option<Thresholds> {
        let raw = std::fs::read_to_string(package_root.join("bunfig.toml")).ok()?;
        let value: toml::Value = toml::from_str(&raw).ok()?;
        let threshold = value.get("test")?.get("coverageThreshold")?;
        let thresholds = match threshold {
            toml::Value::Table(table) => {
                let read = |keys: &[&str]| {
                    keys.iter()
                        .find_map(|key| table.get(*key))
                        .and_then(as_percent)
                };
                Thresholds {
                    lines: read(&["line", "lines"]),
                    branches: read(&["branch", "branches"]),
                    functions: read(&["function", "functions"]),
                }
            }
            other => {
                let pct = as_percent(other)?;
                Thresholds {
                    lines: Some(pct),
                    branches: Some(pct),
                    functions: Some(pct),
                }
            }
        };
        (!thresholds.is_empty()).then_some(thresholds)
    }
}

impl Default for BunAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// bunfig ratios are 0-1; values above 1 are taken as percentages already.
fn as_percent(value: &toml::Value) -> Option<f64> {
    let raw = match value {
        toml::Value::Float(f) => *f,
        toml::Value::Integer(i) => *i as f64,
        _ => return None,
    };
    Some(if raw <= 1.0 { raw * 100.0 } else { raw })
}
