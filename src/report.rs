//! JUnit XML test-report parsing.
//!
//! Runners emit two shapes of report:
//!
//! * one `<testsuite>` per source file whose test cases carry a path-like
//!   `classname` and a fully qualified `name` (`"outer > inner > works"`);
//! * one `<testsuite>` per `describe` block, nested as deep as the source, with
//!   leaf-only test names and the source file in a `file` attribute.
//!
//! Both are folded into the same [`TestReport`]: one [`Suite`] per resolved
//! source file, tests in document order. The scanner works over byte offsets
//! of the raw text and never fails; malformed input yields whatever could be
//! read before the damage.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

const SUITE_TAG: &str = "testsuite";
const CASE_TAG: &str = "testcase";
const UNKNOWN_FILE: &str = "(unknown file)";
const NAME_SEPARATOR: &str = " > ";

const SOURCE_EXTENSIONS: &[&str] = &[
    ".ts", ".tsx", ".mts", ".cts", ".js", ".jsx", ".mjs", ".cjs", ".vue", ".svelte",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Test {
    pub name: String,
    pub status: TestStatus,
    pub duration: Duration,
    pub failure_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Suite {
    pub file: String,
    pub tests: Vec<Test>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestReport {
    pub suites: Vec<Suite>,
}

impl TestReport {
    pub fn is_empty(&self) -> bool {
        self.suites.iter().all(|suite| suite.tests.is_empty())
    }

    pub fn test_count(&self) -> usize {
        self.suites.iter().map(|suite| suite.tests.len()).sum()
    }

    pub fn count(&self, status: TestStatus) -> usize {
        self.tests().filter(|(_, test)| test.status == status).count()
    }

    /// Iterates every test with the file of the suite it belongs to.
    pub fn tests(&self) -> impl Iterator<Item = (&str, &Test)> {
        self.suites.iter().flat_map(|suite| {
            suite
                .tests
                .iter()
                .map(move |test| (suite.file.as_str(), test))
        })
    }
}

/// Parses a JUnit XML document into a [`TestReport`].
pub fn parse_report(xml: &str) -> TestReport {
    let mut builder = ReportBuilder::default();
    scan(xml, &Scope::default(), &mut builder);
    builder.finish()
}

/// True when a suite or test attribute names a source file rather than a
/// `describe` block.
pub fn looks_like_path(value: &str) -> bool {
    value.contains('/')
        || value.contains('\\')
        || SOURCE_EXTENSIONS.iter().any(|ext| value.ends_with(ext))
}

/// Context carried down through nested suites.
#[derive(Debug, Clone, Default)]
struct Scope {
    describe: Vec<String>,
    file: Option<String>,
}

impl Scope {
    fn enter_suite(&self, attrs: &Attributes) -> Scope {
        let mut child = self.clone();
        let file_attr = attrs.non_empty("file");
        if let Some(file) = file_attr {
            child.file = Some(file.to_string());
        }
        match attrs.non_empty("name") {
            Some(name) if looks_like_path(name) => {
                if file_attr.is_none() {
                    child.file = Some(name.to_string());
                }
            }
            Some(name) => child.describe.push(name.to_string()),
            None => {}
        }
        child
    }
}

#[derive(Debug, Default)]
struct ReportBuilder {
    suites: Vec<Suite>,
    by_file: HashMap<String, usize>,
}

impl ReportBuilder {
    fn push(&mut self, file: String, test: Test) {
        let idx = match self.by_file.get(&file) {
            Some(idx) => *idx,
            None => {
                self.suites.push(Suite {
                    file: file.clone(),
                    tests: Vec::new(),
                });
                let idx = self.suites.len() - 1;
                self.by_file.insert(file, idx);
                idx
            }
        };
        self.suites[idx].tests.push(test);
    }

    fn finish(self) -> TestReport {
        TestReport {
            suites: self.suites,
        }
    }
}

fn scan(content: &str, scope: &Scope, out: &mut ReportBuilder) {
    let mut pos = 0;
    while pos < content.len() {
        let next_suite = find_open_tag(content, pos, SUITE_TAG);
        let next_case = find_open_tag(content, pos, CASE_TAG);
        pos = match (next_suite, next_case) {
            (Some(suite), Some(case)) if suite < case => parse_suite(content, suite, scope, out),
            (Some(suite), None) => parse_suite(content, suite, scope, out),
            (_, Some(case)) => parse_case(content, case, scope, out),
            (None, None) => break,
        };
    }
}

fn parse_suite(content: &str, start: usize, scope: &Scope, out: &mut ReportBuilder) -> usize {
    let Some((open_end, self_closing)) = tag_end(content, start) else {
        return content.len();
    };
    if self_closing {
        return open_end;
    }
    let attrs = Attributes::parse(&content[start..open_end]);
    let (inner_end, after) =
        find_suite_close(content, open_end).unwrap_or((content.len(), content.len()));
    let child = scope.enter_suite(&attrs);
    scan(&content[open_end..inner_end], &child, out);
    after
}

/// Finds the `</testsuite>` matching an already-consumed open tag.
///
/// Returns the offset where the closing tag starts and the offset just past it.
fn find_suite_close(content: &str, from: usize) -> Option<(usize, usize)> {
    let mut depth = 1usize;
    let mut pos = from;
    loop {
        let next_open = find_open_tag(content, pos, SUITE_TAG);
        let next_close = find_close_tag(content, pos, SUITE_TAG);
        match (next_open, next_close) {
            (Some(open), Some(close)) if open < close => {
                let (end, self_closing) = tag_end(content, open)?;
                if !self_closing {
                    depth += 1;
                }
                pos = end;
            }
            (Some(open), None) => {
                let (end, self_closing) = tag_end(content, open)?;
                if !self_closing {
                    depth += 1;
                }
                pos = end;
            }
            (_, Some(close)) => {
                let (end, _) = tag_end(content, close)?;
                depth -= 1;
                if depth == 0 {
                    return Some((close, end));
                }
                pos = end;
            }
            (None, None) => return None,
        }
    }
}

fn parse_case(content: &str, start: usize, scope: &Scope, out: &mut ReportBuilder) -> usize {
    let Some((open_end, self_closing)) = tag_end(content, start) else {
        return content.len();
    };
    let attrs = Attributes::parse(&content[start..open_end]);
    let (body, after) = if self_closing {
        ("", open_end)
    } else {
        match find_close_tag(content, open_end, CASE_TAG) {
            Some(close) => {
                let end = tag_end(content, close).map_or(content.len(), |(end, _)| end);
                (&content[open_end..close], end)
            }
            None => (&content[open_end..], content.len()),
        }
    };

    let failure = parse_failure(body);
    let skipped = find_open_tag(body, 0, "skipped").is_some();
    let status = if failure.is_some() {
        TestStatus::Failed
    } else if skipped {
        TestStatus::Skipped
    } else {
        TestStatus::Passed
    };

    let leaf = attrs.get("name").unwrap_or_default();
    let classname = attrs.non_empty("classname");
    let flat = classname.is_some_and(looks_like_path);
    let file = if flat {
        attrs.non_empty("file").or(classname).map(str::to_string)
    } else {
        attrs
            .non_empty("file")
            .map(str::to_string)
            .or_else(|| scope.file.clone())
            .or_else(|| classname.map(str::to_string))
    }
    .unwrap_or_else(|| UNKNOWN_FILE.to_string());
    let name = if flat || scope.describe.is_empty() {
        leaf.to_string()
    } else {
        let mut parts = scope.describe.clone();
        parts.push(leaf.to_string());
        parts.join(NAME_SEPARATOR)
    };

    let duration = attrs
        .get("time")
        .and_then(|time| time.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or_default();

    out.push(
        file,
        Test {
            name,
            status,
            duration,
            failure_message: failure,
        },
    );
    after
}

/// Extracts the message of a `<failure>` or `<error>` element in a test body.
///
/// The element text (usually message plus stack) wins over the `message`
/// attribute when both are present.
fn parse_failure(body: &str) -> Option<String> {
    let (start, tag) = ["failure", "error"]
        .iter()
        .filter_map(|tag| find_open_tag(body, 0, tag).map(|pos| (pos, *tag)))
        .min_by_key(|(pos, _)| *pos)?;
    let Some((open_end, self_closing)) = tag_end(body, start) else {
        return Some(String::new());
    };
    let attrs = Attributes::parse(&body[start..open_end]);
    let message = attrs.get("message").unwrap_or_default().to_string();
    if self_closing {
        return Some(message);
    }
    let close = find_close_tag(body, open_end, tag).unwrap_or(body.len());
    let text = element_text(&body[open_end..close]);
    if text.trim().is_empty() {
        Some(message)
    } else {
        Some(text.trim_end().to_string())
    }
}

fn element_text(raw: &str) -> String {
    let trimmed = raw.trim_start();
    if let Some(rest) = trimmed.strip_prefix("<![CDATA[") {
        let end = rest.find("]]>").unwrap_or(rest.len());
        return rest[..end].to_string();
    }
    decode_entities(raw)
}

/// Finds `<tag` followed by whitespace, `>` or `/`, so `<testsuite` does not
/// match `<testsuites`.
fn find_open_tag(content: &str, from: usize, tag: &str) -> Option<usize> {
    find_tag(content, from, '<', tag)
}

fn find_close_tag(content: &str, from: usize, tag: &str) -> Option<usize> {
    find_tag(content, from, '/', tag).map(|pos| pos - 1)
}

fn find_tag(content: &str, from: usize, lead: char, tag: &str) -> Option<usize> {
    let needle = if lead == '<' {
        format!("<{}", tag)
    } else {
        format!("</{}", tag)
    };
    let bytes = content.as_bytes();
    let mut pos = from;
    while pos <= content.len() {
        let found = pos + content.get(pos..)?.find(&needle)?;
        let next = found + needle.len();
        match bytes.get(next) {
            Some(b) if b.is_ascii_whitespace() || *b == b'>' || *b == b'/' => {
                return Some(if lead == '<' { found } else { found + 1 });
            }
            None => return None,
            _ => pos = next,
        }
    }
    None
}

/// Returns the offset just past the `>` closing the tag that starts at
/// `start`, and whether the tag is self-closing. Quoted attribute values may
/// contain `>`.
fn tag_end(content: &str, start: usize) -> Option<(usize, bool)> {
    let bytes = content.as_bytes();
    let mut quote: Option<u8> = None;
    let mut idx = start;
    while idx < bytes.len() {
        let b = bytes[idx];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => {
                let self_closing = idx > start && bytes[idx - 1] == b'/';
                return Some((idx + 1, self_closing));
            }
            None => {}
        }
        idx += 1;
    }
    None
}

#[derive(Debug, Default)]
struct Attributes {
    values: HashMap<String, String>,
}

impl Attributes {
    fn parse(tag: &str) -> Self {
        static ATTR: OnceLock<Regex> = OnceLock::new();
        let re = ATTR.get_or_init(|| {
            Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
                .expect("attribute pattern is valid")
        });
        let values = re
            .captures_iter(tag)
            .map(|caps| {
                let value = caps
                    .get(2)
                    .or_else(|| caps.get(3))
                    .map_or("", |m| m.as_str());
                (caps[1].to_string(), decode_entities(value))
            })
            .collect();
        Self { values }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|value| !value.trim().is_empty())
    }
}

/// Decodes XML entities. One layer of double-escaping (`&amp;lt;`) is
/// resolved before the single escapes because some reporters escape twice.
pub fn decode_entities(text: &str) -> String {
    const DOUBLE: &[(&str, &str)] = &[
        ("&amp;lt;", "<"),
        ("&amp;gt;", ">"),
        ("&amp;quot;", "\""),
        ("&amp;apos;", "'"),
        ("&amp;#39;", "'"),
    ];
    const SINGLE: &[(&str, &str)] = &[
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&quot;", "\""),
        ("&apos;", "'"),
    ];
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = text.to_string();
    for (from, to) in DOUBLE.iter().chain(SINGLE) {
        out = out.replace(from, to);
    }
    out = decode_numeric(&out);
    out.replace("&amp;", "&")
}

fn decode_numeric(text: &str) -> String {
    static NUMERIC: OnceLock<Regex> = OnceLock::new();
    let re = NUMERIC
        .get_or_init(|| Regex::new(r"&#(x[0-9A-Fa-f]+|[0-9]+);").expect("numeric pattern is valid"));
    re.replace_all(text, |caps: &regex::Captures| {
        let raw = &caps[1];
        let code = match raw.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => raw.parse::<u32>().ok(),
        };
        code.and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_report_keys_suite_by_classname() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8" ?>
<testsuites name="vitest tests" tests="1" failures="0">
    <testsuite name="test/foo.test.ts" tests="1" failures="0" skipped="0" time="0.004">
        <testcase classname="test/foo.test.ts" name="does X" time="0.002">
        </testcase>
    </testsuite>
</testsuites>"#;
        let report = parse_report(xml);
        assert_eq!(report.suites.len(), 1);
        assert_eq!(report.suites[0].file, "test/foo.test.ts");
        assert_eq!(report.suites[0].tests.len(), 1);
        let test = &report.suites[0].tests[0];
        assert_eq!(test.name, "does X");
        assert_eq!(test.status, TestStatus::Passed);
        assert_eq!(test.duration, Duration::from_millis(2));
    }

    #[test]
    fn unrepresentable_times_become_zero() {
        let report = parse_report(
            r#"<testsuite name="a.test.ts">
  <testcase classname="a.test.ts" name="huge" time="1e30"/>
  <testcase classname="a.test.ts" name="negative" time="-1"/>
  <testcase classname="a.test.ts" name="nan" time="NaN"/>
  <testcase classname="a.test.ts" name="ok" time="0.25"/>
</testsuite>"#,
        );
        let times: Vec<Duration> = report.tests().map(|(_, test)| test.duration).collect();
        assert_eq!(
            times,
            vec![Duration::ZERO, Duration::ZERO, Duration::ZERO, Duration::from_millis(250)]
        );
    }

    #[test]
    fn nested_report_prefixes_describe_path() {
        let xml = r#"<testsuites name="bun test">
  <testsuite name="test/foo.test.ts" file="test/foo.test.ts" tests="2">
    <testsuite name="outer" file="test/foo.test.ts">
      <testsuite name="inner" file="test/foo.test.ts">
        <testcase name="works" classname="inner" file="test/foo.test.ts" time="0.01" />
      </testsuite>
      <testcase name="top" classname="outer" time="0.01" />
    </testsuite>
  </testsuite>
</testsuites>"#;
        let report = parse_report(xml);
        assert_eq!(report.suites.len(), 1);
        assert_eq!(report.suites[0].file, "test/foo.test.ts");
        let names: Vec<_> = report.suites[0].tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["outer > inner > works", "outer > top"]);
    }

    #[test]
    fn nested_suites_fall_back_to_inherited_file() {
        let xml = r#"<testsuite name="src/a.spec.js">
  <testsuite name="group">
    <testcase name="leaf" classname="group"/>
  </testsuite>
</testsuite>"#;
        let report = parse_report(xml);
        assert_eq!(report.suites[0].file, "src/a.spec.js");
        assert_eq!(report.suites[0].tests[0].name, "group > leaf");
    }

    #[test]
    fn self_closing_suites_do_not_unbalance_matching() {
        let xml = r#"<testsuites>
  <testsuite name="a.test.ts">
    <testsuite name="empty" />
    <testsuite name="block">
      <testcase name="one" classname="block" file="a.test.ts"/>
    </testsuite>
    <testcase name="two" classname="a.test.ts"/>
  </testsuite>
  <testsuite name="b.test.ts">
    <testcase name="three" classname="b.test.ts"/>
  </testsuite>
</testsuites>"#;
        let report = parse_report(xml);
        let files: Vec<_> = report.suites.iter().map(|s| s.file.as_str()).collect();
        assert_eq!(files, vec!["a.test.ts", "b.test.ts"]);
        let names: Vec<_> = report.suites[0].tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["block > one", "two"]);
        assert_eq!(report.suites[1].tests[0].name, "three");
    }

    #[test]
    fn failures_and_skips_set_status() {
        let xml = r#"<testsuite name="src/math.test.ts">
  <testcase classname="src/math.test.ts" name="adds" time="0.1">
    <failure message="expected 1 to be 2" type="AssertionError">AssertionError: expected 1 to be 2
 ❯ src/math.test.ts:5:13
</failure>
  </testcase>
  <testcase classname="src/math.test.ts" name="later">
    <skipped/>
  </testcase>
  <testcase classname="src/math.test.ts" name="errors">
    <error message="boom"/>
  </testcase>
</testsuite>"#;
        let report = parse_report(xml);
        let tests = &report.suites[0].tests;
        assert_eq!(tests[0].status, TestStatus::Failed);
        assert_eq!(
            tests[0].failure_message.as_deref(),
            Some("AssertionError: expected 1 to be 2\n ❯ src/math.test.ts:5:13")
        );
        assert_eq!(tests[1].status, TestStatus::Skipped);
        assert_eq!(tests[2].status, TestStatus::Failed);
        assert_eq!(tests[2].failure_message.as_deref(), Some("boom"));
        assert_eq!(report.count(TestStatus::Failed), 2);
    }

    #[test]
    fn cdata_failure_text_is_kept_verbatim() {
        let xml = r#"<testsuite name="x.test.ts"><testcase classname="x.test.ts" name="t"><failure><![CDATA[a &lt; b]]></failure></testcase></testsuite>"#;
        let report = parse_report(xml);
        assert_eq!(
            report.suites[0].tests[0].failure_message.as_deref(),
            Some("a &lt; b")
        );
    }

    #[test]
    fn double_escaped_entities_decode_to_characters() {
        assert_eq!(decode_entities("&amp;lt;div&amp;gt;"), "<div>");
        assert_eq!(decode_entities("&lt;div&gt;"), "<div>");
        assert_eq!(decode_entities("a &amp;amp; b"), "a &amp; b");
        assert_eq!(decode_entities("line&#10;next"), "line\nnext");
        assert_eq!(decode_entities("&quot;q&quot; &amp;quot;"), "\"q\" \"");
    }

    #[test]
    fn attribute_values_are_decoded() {
        let xml = r#"<testsuite name="t.test.ts"><testcase classname="t.test.ts" name="renders &amp;lt;App /&amp;gt;"/></testsuite>"#;
        let report = parse_report(xml);
        assert_eq!(report.suites[0].tests[0].name, "renders <App />");
    }

    #[test]
    fn quoted_angle_brackets_do_not_end_tags() {
        let xml = r#"<testsuite name="q.test.ts"><testcase classname="q.test.ts" name="a > b"/></testsuite>"#;
        let report = parse_report(xml);
        assert_eq!(report.suites[0].tests[0].name, "a > b");
    }

    #[test]
    fn malformed_input_yields_partial_report() {
        assert!(parse_report("").is_empty());
        assert!(parse_report("not xml at all").is_empty());
        let truncated = r#"<testsuite name="t.test.ts"><testcase classname="t.test.ts" name="ok"/><testcase classname="t.te"#;
        let report = parse_report(truncated);
        assert_eq!(report.test_count(), 1);
    }

    #[test]
    fn path_detection_uses_separators_and_extensions() {
        assert!(looks_like_path("src/foo.ts"));
        assert!(looks_like_path("src\\foo"));
        assert!(looks_like_path("foo.test.tsx"));
        assert!(!looks_like_path("outer describe"));
    }
}
