//! Run totals shared by the adapters, the scheduler and the renderers.
//!
//! `DotCounts` are the partial increments produced while a run is streaming;
//! `FinalSummary` is what an adapter reads back out of the complete output once
//! the process has exited.

use std::time::Duration;

use strip_ansi_escapes::strip;

/// Incremental pass/skip/fail counts from a chunk of dot-stream output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DotCounts {
    pub passed: u32,
    pub skipped: u32,
    pub failed: u32,
}

/// Which bucket a streaming marker character counts toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Passed,
    Skipped,
    Failed,
}

/// Counts marker characters in `chunk` after removing terminal color codes.
///
/// `alphabet` maps each marker character to its bucket; characters outside the
/// alphabet are ignored.
pub fn count_markers(chunk: &str, alphabet: &[(char, Marker)]) -> DotCounts {
    let mut counts = DotCounts::default();
    if chunk.is_empty() {
        return counts;
    }
    let plain = strip_ansi(chunk);
    for ch in plain.chars() {
        let Some((_, marker)) = alphabet.iter().find(|(c, _)| *c == ch) else {
            continue;
        };
        match marker {
            Marker::Passed => counts.passed += 1,
            Marker::Skipped => counts.skipped += 1,
            Marker::Failed => counts.failed += 1,
        }
    }
    counts
}

/// Authoritative totals parsed from the trailing summary of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FinalSummary {
    pub file_count: u32,
    pub test_count: u32,
    pub passed: u32,
    pub skipped: u32,
    pub failed: u32,
    /// Wall time reported by the runner, in seconds.
    pub duration: Option<f64>,
}

impl FinalSummary {
    pub fn is_empty(&self) -> bool {
        self.test_count == 0 && self.passed == 0 && self.skipped == 0 && self.failed == 0
    }
}

/// Converts a printed duration value to seconds.
pub fn seconds_from(value: f64, unit: &str) -> f64 {
    match unit {
        "ms" => value / 1000.0,
        "m" | "min" => value * 60.0,
        _ => value,
    }
}

/// Formats a duration the way every screen shows it: whole milliseconds below
/// one second, seconds with two decimals above.
pub fn format_duration(duration: Duration) -> String {
    format_seconds(duration.as_secs_f64())
}

pub fn format_seconds(seconds: f64) -> String {
    if seconds < 1.0 {
        format!("{}ms", (seconds * 1000.0).round() as u64)
    } else {
        format!("{:.2}s", seconds)
    }
}

pub fn strip_ansi(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALPHABET: &[(char, Marker)] = &[
        ('.', Marker::Passed),
        ('-', Marker::Skipped),
        ('x', Marker::Failed),
    ];

    #[test]
    fn empty_chunk_counts_nothing() {
        assert_eq!(count_markers("", ALPHABET), DotCounts::default());
    }

    #[test]
    fn markers_inside_color_codes_are_counted_once() {
        let chunk = "\u{1b}[32m..\u{1b}[39m\u{1b}[31mx\u{1b}[39m-";
        let counts = count_markers(chunk, ALPHABET);
        assert_eq!(
            counts,
            DotCounts {
                passed: 2,
                skipped: 1,
                failed: 1
            }
        );
    }

    #[test]
    fn escape_sequence_digits_are_not_markers() {
        // "[1;31m" contains no marker characters once stripped.
        let counts = count_markers("\u{1b}[1;31m\u{1b}[0m", ALPHABET);
        assert_eq!(counts, DotCounts::default());
    }

    #[test]
    fn durations_switch_units_at_one_second() {
        assert_eq!(format_seconds(0.4567), "457ms");
        assert_eq!(format_seconds(0.999), "999ms");
        assert_eq!(format_seconds(1.0), "1.00s");
        assert_eq!(format_seconds(12.346), "12.35s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }

    #[test]
    fn seconds_from_normalizes_milliseconds() {
        assert!((seconds_from(850.0, "ms") - 0.85).abs() < 1e-9);
        assert!((seconds_from(1.5, "s") - 1.5).abs() < 1e-9);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn counts_sum_to_marker_occurrences(text in "[.x\\-a-z ]{0,64}") {
                let counts = count_markers(&text, ALPHABET);
                let expected = text.chars().filter(|c| matches!(c, '.' | 'x' | '-')).count() as u32;
                prop_assert_eq!(counts.passed + counts.skipped + counts.failed, expected);
            }

            #[test]
            fn formatted_seconds_round_trip(seconds in 1.0f64..10_000.0) {
                let formatted = format_seconds(seconds);
                let parsed: f64 = formatted.trim_end_matches('s').parse().unwrap();
                prop_assert!((parsed - seconds).abs() <= 0.005 + 1e-9);
            }
        }
    }
}
