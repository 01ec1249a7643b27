//! Package discovery from `package.json` workspaces.
//!
//! Strategies run in order and the first one that finds anything wins:
//! `workspaces` as an array of globs, `workspaces.packages` in the object
//! form, then the root directory on its own.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::adapter::AdapterRegistry;
use crate::package::Package;

const MANIFEST: &str = "package.json";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    pub name: Option<String>,
    #[serde(default)]
    pub workspaces: Option<Value>,
    #[serde(default)]
    pub scripts: HashMap<String, String>,
}

impl Manifest {
    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }
}

pub trait DiscoveryStrategy {
    fn name(&self) -> &'static str;
    fn discover(&self, root: &Path, manifest: &Manifest, adapters: &AdapterRegistry) -> Vec<Package>;
}

/// `"workspaces": ["packages/*"]`
pub struct WorkspaceArray;

/// `"workspaces": { "packages": ["packages/*"] }`
pub struct WorkspaceObject;

/// The root `package.json` is the only package.
pub struct SingleDirectory;

impl DiscoveryStrategy for WorkspaceArray {
    fn name(&self) -> &'static str {
        "workspaces"
    }

    fn discover(&self, root: &Path, manifest: &Manifest, adapters: &AdapterRegistry) -> Vec<Package> {
        match manifest.workspaces.as_ref() {
            Some(Value::Array(items)) => from_globs(root, &strings(items), adapters),
            _ => Vec::new(),
        }
    }
}

impl DiscoveryStrategy for WorkspaceObject {
    fn name(&self) -> &'static str {
        "workspaces.packages"
    }

    fn discover(&self, root: &Path, manifest: &Manifest, adapters: &AdapterRegistry) -> Vec<Package> {
        match manifest.workspaces.as_ref().and_then(|ws| ws.get("packages")) {
            Some(Value::Array(items)) => from_globs(root, &strings(items), adapters),
            _ => Vec::new(),
        }
    }
}

impl DiscoveryStrategy for SingleDirectory {
    fn name(&self) -> &'static str {
        "single directory"
    }

    fn discover(&self, root: &Path, manifest: &Manifest, adapters: &AdapterRegistry) -> Vec<Package> {
        vec![package_from(root, manifest, adapters)]
    }
}

pub fn default_strategies() -> Vec<Box<dyn DiscoveryStrategy>> {
    vec![
        Box::new(WorkspaceArray),
        Box::new(WorkspaceObject),
        Box::new(SingleDirectory),
    ]
}

/// Discovers packages under `root`, sorted by name.
pub fn discover_packages(root: &Path, adapters: &AdapterRegistry) -> Result<Vec<Package>> {
    let manifest = Manifest::read(root)?;
    for strategy in default_strategies() {
        let mut packages = strategy.discover(root, &manifest, adapters);
        if packages.is_empty() {
            continue;
        }
        debug!(strategy = strategy.name(), count = packages.len(), "discovered packages");
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        return Ok(packages);
    }
    Ok(Vec::new())
}

fn strings(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| item.as_str().map(str::to_string))
        .collect()
}

fn from_globs(root: &Path, patterns: &[String], adapters: &AdapterRegistry) -> Vec<Package> {
    let dirs = match expand_workspace_globs(root, patterns) {
        Ok(dirs) => dirs,
        Err(err) => {
            warn!(%err, "invalid workspace glob");
            return Vec::new();
        }
    };
    dirs.into_iter()
        .filter_map(|dir| match Manifest::read(&dir) {
            Ok(manifest) => Some(package_from(&dir, &manifest, adapters)),
            Err(err) => {
                warn!(dir = %dir.display(), %err, "skipping workspace");
                None
            }
        })
        .collect()
}

fn package_from(dir: &Path, manifest: &Manifest, adapters: &AdapterRegistry) -> Package {
    let name = manifest.name.clone().unwrap_or_else(|| {
        dir.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string())
    });
    let test_command = manifest
        .scripts
        .get("test")
        .map(|cmd| cmd.trim().to_string())
        .filter(|cmd| !cmd.is_empty());
    let runner = test_command.as_deref().and_then(|cmd| adapters.detect(cmd));
    Package {
        name,
        path: dir.to_path_buf(),
        test_command,
        runner,
    }
}

/// Directories under `root` matching the workspace globs (`!` negates) that
/// hold a `package.json`. `node_modules` is never entered.
pub fn expand_workspace_globs(root: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let (negated, included): (Vec<&String>, Vec<&String>) =
        patterns.iter().partition(|pattern| pattern.starts_with('!'));
    let include = build_globset(included.iter().map(|p| p.as_str()))?;
    let exclude = build_globset(negated.iter().map(|p| &p[1..]))?;

    let mut found = BTreeSet::new();
    let walker = WalkBuilder::new(root)
        .standard_filters(true)
        .hidden(true)
        .filter_entry(|entry| entry.file_name() != "node_modules")
        .build();
    for entry in walker.flatten() {
        if !entry.file_type().is_some_and(|ft| ft.is_dir()) {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let relative = relative.to_string_lossy().replace('\\', "/");
        if include.is_match(&relative)
            && !exclude.is_match(&relative)
            && entry.path().join(MANIFEST).is_file()
        {
            found.insert(entry.path().to_path_buf());
        }
    }
    Ok(found.into_iter().collect())
}

fn build_globset<'a>(patterns: impl Iterator<Item = &'a str>) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let normalized = pattern.trim_start_matches("./").trim_end_matches('/');
        let glob = GlobBuilder::new(normalized)
            .literal_separator(true)
            .build()
            .with_context(|| format!("bad workspace glob {pattern:?}"))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::RunnerKind;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn array_workspaces_expand_globs_with_negation() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "package.json", r#"{ "workspaces": ["packages/*", "!packages/legacy"] }"#);
        write(root, "packages/ui/package.json", r#"{ "name": "@app/ui", "scripts": { "test": "vitest" } }"#);
        write(root, "packages/api/package.json", r#"{ "scripts": { "test": "bun test" } }"#);
        write(root, "packages/legacy/package.json", r#"{ "name": "legacy" }"#);
        write(root, "packages/ui/node_modules/dep/package.json", r#"{ "name": "dep" }"#);
        write(root, "packages/nested/deep/package.json", r#"{ "name": "deep" }"#);

        let packages = discover_packages(root, &AdapterRegistry::new()).unwrap();
        let names: Vec<_> = packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["@app/ui", "api"]);
        assert_eq!(packages[0].runner, Some(RunnerKind::Vitest));
        assert_eq!(packages[1].runner, Some(RunnerKind::Bun));
        assert_eq!(packages[1].path, root.join("packages/api"));
    }

    #[test]
    fn object_workspaces_are_the_second_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "package.json", r#"{ "workspaces": { "packages": ["apps/**"] } }"#);
        write(root, "apps/web/package.json", r#"{ "name": "web", "scripts": { "test": "jest" } }"#);
        write(root, "apps/tools/cli/package.json", r#"{ "name": "cli" }"#);

        let packages = discover_packages(root, &AdapterRegistry::new()).unwrap();
        let names: Vec<_> = packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["cli", "web"]);
        let web = packages.iter().find(|p| p.name == "web").unwrap();
        assert_eq!(web.test_command.as_deref(), Some("jest"));
        assert!(!web.is_runnable());
    }

    #[test]
    fn single_directory_is_the_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "package.json", r#"{ "name": "solo", "scripts": { "test": "vitest run" } }"#);
        let packages = discover_packages(root, &AdapterRegistry::new()).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].name, "solo");
        assert!(packages[0].is_runnable());
    }

    #[test]
    fn workspaces_matching_nothing_fall_through() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "package.json", r#"{ "name": "root", "workspaces": ["missing/*"] }"#);
        let packages = discover_packages(root, &AdapterRegistry::new()).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].name, "root");
        assert!(packages[0].test_command.is_none());
    }

    #[test]
    fn missing_root_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_packages(dir.path(), &AdapterRegistry::new()).is_err());
    }
}
