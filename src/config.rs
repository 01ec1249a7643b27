//! Configuration management for testrack.
//!
//! The config file is optional. It is looked up in the repository root under
//! a handful of names (TOML or JSON, both camelCase), or given explicitly with
//! `--config`. Validation needs the discovered package list, so it happens in
//! [`Config::compile_watch_rules`] once discovery is done.

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Quiet window for file-watch batches when the config names none.
pub const DEFAULT_DEBOUNCE_MS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Toml,
    Json,
}

/// Names searched in the repository root, first match wins.
const SEARCH: &[(&str, Format)] = &[
    ("testrack.toml", Format::Toml),
    (".testrack.toml", Format::Toml),
    ("testrack.json", Format::Json),
    (".testrackrc.json", Format::Json),
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {path} does not exist")]
    Missing { path: PathBuf },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {details}")]
    Parse { path: PathBuf, details: String },

    #[error("invalid config: {details}")]
    Invalid { details: String },
}

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Command run by Enter on a test or coverage file.
    pub enter_action: Option<EnterAction>,
    /// Extra file-to-package routing for watch mode.
    #[serde(default)]
    pub watch_mappings: Vec<WatchMapping>,
    /// Quiet window for file-watch batches.
    pub watch_debounce_ms: Option<u64>,
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnterAction {
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchMapping {
    /// Globs relative to the repository root.
    pub paths: Vec<String>,
    pub triggers: Triggers,
}

/// Either a list of package names or `"*"` for every package.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Triggers {
    Packages(Vec<String>),
    Keyword(String),
}

/// Packages a matched path reruns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    All,
    Packages(Vec<usize>),
}

/// A validated watch mapping.
#[derive(Debug, Clone)]
pub struct WatchRule {
    pub matcher: GlobSet,
    pub target: WatchTarget,
}

impl Config {
    pub fn debounce_ms(&self) -> u64 {
        self.watch_debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS)
    }

    pub fn enter_command(&self) -> Option<&str> {
        self.enter_action.as_ref().map(|action| action.command.as_str())
    }

    /// Checks every field that does not depend on discovery.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(action) = &self.enter_action {
            if action.command.trim().is_empty() {
                return Err(invalid("enterAction.command must not be empty"));
            }
        }
        if self.watch_debounce_ms == Some(0) {
            return Err(invalid("watchDebounceMs must be greater than zero"));
        }
        Ok(())
    }

    /// Compiles watch mappings against the discovered package names.
    pub fn compile_watch_rules(&self, packages: &[&str]) -> Result<Vec<WatchRule>, ConfigError> {
        self.watch_mappings
            .iter()
            .enumerate()
            .map(|(idx, mapping)| compile_mapping(idx, mapping, packages))
            .collect()
    }
}

fn compile_mapping(idx: usize, mapping: &WatchMapping, packages: &[&str]) -> Result<WatchRule, ConfigError> {
    if mapping.paths.is_empty() {
        return Err(invalid(format!("watchMappings[{idx}].paths must not be empty")));
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in &mapping.paths {
        let glob = GlobBuilder::new(pattern).literal_separator(true).build().map_err(|err| {
            invalid(format!("watchMappings[{idx}].paths: bad glob {pattern:?}: {err}"))
        })?;
        builder.add(glob);
    }
    let matcher = builder
        .build()
        .map_err(|err| invalid(format!("watchMappings[{idx}].paths: {err}")))?;

    let target = match &mapping.triggers {
        Triggers::Keyword(word) if word == "*" => WatchTarget::All,
        Triggers::Keyword(word) => {
            return Err(invalid(format!(
                "watchMappings[{idx}].triggers must be \"*\" or a list of package names, got {word:?}"
            )))
        }
        Triggers::Packages(names) if names.is_empty() => {
            return Err(invalid(format!("watchMappings[{idx}].triggers must not be empty")))
        }
        Triggers::Packages(names) => {
            let mut ids = Vec::with_capacity(names.len());
            for name in names {
                let id = packages.iter().position(|pkg| pkg == name).ok_or_else(|| {
                    invalid(format!("watchMappings[{idx}].triggers: unknown package {name:?}"))
                })?;
                ids.push(id);
            }
            WatchTarget::Packages(ids)
        }
    };
    Ok(WatchRule { matcher, target })
}

fn invalid(details: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        details: details.into(),
    }
}

/// Finds the config file for `root`, preferring an explicit path.
pub fn find_config(explicit: Option<&Path>, root: &Path) -> Result<Option<PathBuf>, ConfigError> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(ConfigError::Missing {
                path: path.to_path_buf(),
            });
        }
        return Ok(Some(path.to_path_buf()));
    }
    Ok(SEARCH
        .iter()
        .map(|(name, _)| root.join(name))
        .find(|path| path.is_file()))
}

/// Loads and validates the config; no file at all yields the defaults.
pub fn load_config(explicit: Option<&Path>, root: &Path) -> Result<Config, ConfigError> {
    let Some(path) = find_config(explicit, root)? else {
        debug!(root = %root.display(), "no config file");
        return Ok(Config::default());
    };
    let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let mut config = parse_config(&raw, format_for(&path), &path)?;
    config.validate()?;
    debug!(path = %path.display(), "loaded config");
    config.source = Some(path);
    Ok(config)
}

fn format_for(path: &Path) -> Format {
    let name = path.file_name().and_then(|name| name.to_str()).unwrap_or_default();
    SEARCH
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, format)| *format)
        .unwrap_or_else(|| match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Format::Json,
            _ => Format::Toml,
        })
}

fn parse_config(raw: &str, format: Format, path: &Path) -> Result<Config, ConfigError> {
    let parsed = match format {
        Format::Toml => toml::from_str(raw).map_err(|err| err.to_string()),
        Format::Json => serde_json::from_str(raw).map_err(|err| err.to_string()),
    };
    parsed.map_err(|details| ConfigError::Parse {
        path: path.to_path_buf(),
        details,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_toml_with_camel_case_keys() {
        let raw = r#"
watchDebounceMs = 350

[enterAction]
command = "code -g {absFilePath}[:{line}]"

[[watchMappings]]
paths = ["shared/**/*.ts"]
triggers = ["ui", "api"]

[[watchMappings]]
paths = ["tsconfig.base.json"]
triggers = "*"
"#;
        let config = parse_config(raw, Format::Toml, Path::new("testrack.toml")).unwrap();
        assert_eq!(config.debounce_ms(), 350);
        assert_eq!(config.enter_command(), Some("code -g {absFilePath}[:{line}]"));
        assert_eq!(config.watch_mappings.len(), 2);
        assert_eq!(
            config.watch_mappings[1].triggers,
            Triggers::Keyword("*".into())
        );
    }

    #[test]
    fn parses_json() {
        let raw = r#"{ "enterAction": { "command": "vim {filePath}" }, "watchMappings": [] }"#;
        let config = parse_config(raw, Format::Json, Path::new("testrack.json")).unwrap();
        assert_eq!(config.enter_command(), Some("vim {filePath}"));
        assert_eq!(config.debounce_ms(), DEFAULT_DEBOUNCE_MS);
    }

    #[test]
    fn compiles_rules_against_packages() {
        let raw = r#"{ "watchMappings": [
            { "paths": ["shared/**"], "triggers": ["api"] },
            { "paths": ["*.json"], "triggers": "*" }
        ] }"#;
        let config = parse_config(raw, Format::Json, Path::new("x.json")).unwrap();
        let rules = config.compile_watch_rules(&["api", "ui"]).unwrap();
        assert_eq!(rules[0].target, WatchTarget::Packages(vec![0]));
        assert!(rules[0].matcher.is_match("shared/util/a.ts"));
        assert_eq!(rules[1].target, WatchTarget::All);
    }

    #[test]
    fn single_star_stays_within_one_directory() {
        let raw = r#"{ "watchMappings": [{ "paths": ["packages/*"], "triggers": "*" }] }"#;
        let config = parse_config(raw, Format::Json, Path::new("x.json")).unwrap();
        let rules = config.compile_watch_rules(&[]).unwrap();
        assert!(rules[0].matcher.is_match("packages/tsconfig.json"));
        assert!(!rules[0].matcher.is_match("packages/ui/src/a.ts"));
    }

    #[test]
    fn unknown_trigger_package_is_rejected() {
        let raw = r#"{ "watchMappings": [{ "paths": ["a/**"], "triggers": ["nope"] }] }"#;
        let config = parse_config(raw, Format::Json, Path::new("x.json")).unwrap();
        let err = config.compile_watch_rules(&["api"]).unwrap_err();
        assert!(err.to_string().contains("unknown package \"nope\""));
    }

    #[test]
    fn bad_keyword_and_empty_paths_are_rejected() {
        let raw = r#"{ "watchMappings": [{ "paths": ["a/**"], "triggers": "all" }] }"#;
        let config = parse_config(raw, Format::Json, Path::new("x.json")).unwrap();
        assert!(config.compile_watch_rules(&[]).is_err());

        let raw = r#"{ "watchMappings": [{ "paths": [], "triggers": "*" }] }"#;
        let config = parse_config(raw, Format::Json, Path::new("x.json")).unwrap();
        assert!(config.compile_watch_rules(&[]).is_err());
    }

    #[test]
    fn empty_enter_command_is_invalid() {
        let raw = "[enterAction]\ncommand = \"  \"\n";
        let config = parse_config(raw, Format::Toml, Path::new("testrack.toml")).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn search_prefers_toml_and_explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(None, dir.path()).unwrap().source.is_none());

        std::fs::write(dir.path().join(".testrackrc.json"), "{}").unwrap();
        std::fs::write(dir.path().join("testrack.toml"), "watchDebounceMs = 90\n").unwrap();
        let config = load_config(None, dir.path()).unwrap();
        assert_eq!(config.debounce_ms(), 90);
        assert_eq!(config.source, Some(dir.path().join("testrack.toml")));

        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            load_config(Some(&missing), dir.path()),
            Err(ConfigError::Missing { .. })
        ));
    }

    #[test]
    fn parse_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("testrack.json"), "{ not json").unwrap();
        let err = load_config(None, dir.path()).unwrap_err();
        assert!(err.to_string().contains("testrack.json"));
    }
}
