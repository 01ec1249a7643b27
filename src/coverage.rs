//! LCOV coverage-report parsing.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

/// Taken/total counts of the branches on one source line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchHits {
    pub total: u32,
    pub taken: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    NotInstrumented,
    Uncovered,
    Partial,
    Covered,
}

/// Minimum percentages configured for a package.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Thresholds {
    pub lines: Option<f64>,
    pub branches: Option<f64>,
    pub functions: Option<f64>,
}

impl Thresholds {
    pub fn is_empty(&self) -> bool {
        self.lines.is_none() && self.branches.is_none() && self.functions.is_none()
    }
}

/// How a percentage compares to its threshold, for colouring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grade {
    Good,
    Warn,
    Bad,
}

/// Grades `pct` against `threshold`; without a threshold, 80% and 50% are the
/// cut-offs.
pub fn grade(pct: f64, threshold: Option<f64>) -> Grade {
    match threshold {
        Some(min) if pct >= min => Grade::Good,
        Some(_) => Grade::Bad,
        None if pct >= 80.0 => Grade::Good,
        None if pct >= 50.0 => Grade::Warn,
        None => Grade::Bad,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileCoverage {
    /// Relative to the package when the file lives inside it.
    pub path: String,
    pub lines_hit: u32,
    pub lines_total: u32,
    pub branches_hit: u32,
    pub branches_total: u32,
    pub functions_hit: u32,
    pub functions_total: u32,
    pub line_hits: BTreeMap<u32, u64>,
    pub branch_hits: BTreeMap<u32, BranchHits>,
}

impl FileCoverage {
    pub fn line_status(&self, line: u32) -> LineStatus {
        match self.line_hits.get(&line) {
            None => LineStatus::NotInstrumented,
            Some(0) => LineStatus::Uncovered,
            Some(_) => match self.branch_hits.get(&line) {
                Some(branches) if branches.taken < branches.total => LineStatus::Partial,
                _ => LineStatus::Covered,
            },
        }
    }

    pub fn first_uncovered_line(&self) -> Option<u32> {
        self.line_hits
            .keys()
            .copied()
            .find(|line| self.line_status(*line) == LineStatus::Uncovered)
    }

    pub fn lines_pct(&self) -> Option<f64> {
        percent(self.lines_hit, self.lines_total)
    }

    pub fn branches_pct(&self) -> Option<f64> {
        percent(self.branches_hit, self.branches_total)
    }

    pub fn functions_pct(&self) -> Option<f64> {
        percent(self.functions_hit, self.functions_total)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CoverageSummary {
    pub lines_pct: Option<f64>,
    pub branches_pct: Option<f64>,
    pub functions_pct: Option<f64>,
    pub thresholds: Option<Thresholds>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageCoverage {
    pub summary: CoverageSummary,
    pub files: Vec<FileCoverage>,
}

impl PackageCoverage {
    pub fn new(files: Vec<FileCoverage>, thresholds: Option<Thresholds>) -> Self {
        Self {
            summary: summarize(&files, thresholds),
            files,
        }
    }
}

/// `hit / total` as a percentage; `None` when nothing was instrumented.
pub fn percent(hit: u32, total: u32) -> Option<f64> {
    (total > 0).then(|| f64::from(hit) * 100.0 / f64::from(total))
}

/// Aggregates per-file totals into package percentages.
pub fn summarize(files: &[FileCoverage], thresholds: Option<Thresholds>) -> CoverageSummary {
    let sum = |f: fn(&FileCoverage) -> u32| files.iter().map(f).sum::<u32>();
    CoverageSummary {
        lines_pct: percent(sum(|f| f.lines_hit), sum(|f| f.lines_total)),
        branches_pct: percent(sum(|f| f.branches_hit), sum(|f| f.branches_total)),
        functions_pct: percent(sum(|f| f.functions_hit), sum(|f| f.functions_total)),
        thresholds,
    }
}

/// Reads and parses `lcov.info`; a missing or unreadable file yields `None`.
pub fn load(lcov: &Path, package_root: &Path, thresholds: Option<Thresholds>) -> Option<PackageCoverage> {
    match std::fs::read_to_string(lcov) {
        Ok(text) => Some(PackageCoverage::new(parse_lcov(&text, package_root), thresholds)),
        Err(err) => {
            debug!(path = %lcov.display(), %err, "no coverage report");
            None
        }
    }
}

#[derive(Default)]
struct Record {
    file: FileCoverage,
    lines: Option<(u32, u32)>,
    branches: Option<(u32, u32)>,
    functions_found: Option<u32>,
    functions_hit: Option<u32>,
}

impl Record {
    fn finish(mut self) -> FileCoverage {
        let (lines_hit, lines_total) = self.lines.unwrap_or_else(|| {
            let total = self.file.line_hits.len() as u32;
            let hit = self.file.line_hits.values().filter(|hits| **hits > 0).count() as u32;
            (hit, total)
        });
        let (branches_hit, branches_total) = self.branches.unwrap_or_else(|| {
            self.file
                .branch_hits
                .values()
                .fold((0, 0), |(hit, total), b| (hit + b.taken, total + b.total))
        });
        self.file.lines_hit = lines_hit;
        self.file.lines_total = lines_total;
        self.file.branches_hit = branches_hit;
        self.file.branches_total = branches_total;
        self.file.functions_total = self.functions_found.unwrap_or(0);
        self.file.functions_hit = self.functions_hit.unwrap_or(0);
        self.file
    }
}

/// Parses LCOV tracefile text. Unknown or malformed lines are skipped.
pub fn parse_lcov(text: &str, package_root: &Path) -> Vec<FileCoverage> {
    let mut files = Vec::new();
    let mut current: Option<Record> = None;

    for raw in text.lines() {
        let line = raw.trim();
        if line == "end_of_record" {
            if let Some(record) = current.take() {
                files.push(record.finish());
            }
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key == "SF" {
            if let Some(record) = current.take() {
                files.push(record.finish());
            }
            current = Some(Record {
                file: FileCoverage {
                    path: relative_path(value, package_root),
                    ..FileCoverage::default()
                },
                ..Record::default()
            });
            continue;
        }
        let Some(record) = current.as_mut() else {
            continue;
        };
        match key {
            "DA" => {
                let mut parts = value.split(',');
                let line_no = parts.next().and_then(|v| v.trim().parse::<u32>().ok());
                let hits = parts.next().and_then(|v| v.trim().parse::<u64>().ok());
                if let (Some(line_no), Some(hits)) = (line_no, hits) {
                    *record.file.line_hits.entry(line_no).or_insert(0) += hits;
                }
            }
            "BRDA" => {
                let parts: Vec<&str> = value.split(',').collect();
                if parts.len() < 4 {
                    continue;
                }
                let Ok(line_no) = parts[0].trim().parse::<u32>() else {
                    continue;
                };
                let taken = parts[3].trim();
                let entry = record.file.branch_hits.entry(line_no).or_default();
                entry.total += 1;
                if taken != "-" && taken.parse::<u64>().is_ok_and(|n| n > 0) {
                    entry.taken += 1;
                }
            }
            "LF" => set_total(&mut record.lines, value, true),
            "LH" => set_total(&mut record.lines, value, false),
            "BRF" => set_total(&mut record.branches, value, true),
            "BRH" => set_total(&mut record.branches, value, false),
            "FNF" => record.functions_found = value.trim().parse().ok(),
            "FNH" => record.functions_hit = value.trim().parse().ok(),
            _ => {}
        }
    }
    if let Some(record) = current.take() {
        files.push(record.finish());
    }
    files
}

fn set_total(slot: &mut Option<(u32, u32)>, value: &str, is_total: bool) {
    let Ok(n) = value.trim().parse::<u32>() else {
        return;
    };
    let (hit, total) = slot.get_or_insert((0, 0));
    if is_total {
        *total = n;
    } else {
        *hit = n;
    }
}

fn relative_path(source: &str, package_root: &Path) -> String {
    let path = Path::new(source);
    match path.strip_prefix(package_root) {
        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
        Err(_) => source.to_string(),
    }
}
