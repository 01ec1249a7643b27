//! Enter-action command templates.
//!
//! `{name}` placeholders are replaced from a fixed vocabulary. A `[...]`
//! section is kept only when every placeholder inside it has a non-empty
//! value; otherwise the whole section, literal text included, is dropped.
//! Sections do not nest. Unknown placeholders are left as written.

use std::sync::OnceLock;

use regex::{Captures, Regex};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateValues {
    /// Path relative to the repository root.
    pub file_path: Option<String>,
    pub abs_file_path: Option<String>,
    /// Path relative to the package directory.
    pub pkg_file_path: Option<String>,
    pub file_name: Option<String>,
    pub line: Option<u32>,
    pub test_name: Option<String>,
    pub package_name: Option<String>,
    pub package_path: Option<String>,
}

impl TemplateValues {
    /// `None` for names outside the vocabulary, `Some("")` for known names
    /// without a value.
    fn lookup(&self, name: &str) -> Option<String> {
        let value = match name {
            "filePath" => self.file_path.clone(),
            "absFilePath" => self.abs_file_path.clone(),
            "pkgFilePath" => self.pkg_file_path.clone(),
            "fileName" => self.file_name.clone(),
            "line" => self.line.map(|line| line.to_string()),
            "testName" => self.test_name.clone(),
            "packageName" => self.package_name.clone(),
            "packagePath" => self.package_path.clone(),
            _ => return None,
        };
        Some(value.unwrap_or_default())
    }
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{([A-Za-z]+)\}").expect("placeholder pattern is valid"))
}

/// Renders `template`, passing every substituted value through `escape`.
pub fn render_with(template: &str, values: &TemplateValues, escape: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('[') {
        out.push_str(&expand(&rest[..open], values, &escape));
        let after = &rest[open + 1..];
        let Some(close) = after.find(']') else {
            // Unclosed section: the bracket is literal text.
            out.push_str(&expand(&rest[open..], values, &escape));
            return out;
        };
        let section = &after[..close];
        if section_resolves(section, values) {
            out.push_str(&expand(section, values, &escape));
        }
        rest = &after[close + 1..];
    }
    out.push_str(&expand(rest, values, &escape));
    out
}

fn section_resolves(section: &str, values: &TemplateValues) -> bool {
    placeholder()
        .captures_iter(section)
        .all(|caps| match values.lookup(&caps[1]) {
            Some(value) => !value.is_empty(),
            None => true,
        })
}

fn expand(text: &str, values: &TemplateValues, escape: &impl Fn(&str) -> String) -> String {
    placeholder()
        .replace_all(text, |caps: &Captures| match values.lookup(&caps[1]) {
            Some(value) if value.is_empty() => String::new(),
            Some(value) => escape(&value),
            None => caps[0].to_string(),
        })
        .into_owned()
}
