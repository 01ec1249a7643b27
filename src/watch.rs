//! File watching for watch mode.
//!
//! One recursive watcher covers the repository root. Relevant paths are
//! collected until the quiet window passes, then routed to packages: explicit
//! `watchMappings` first, else the deepest package directory containing the
//! path. Each batch yields at most one trigger per package.

use std::collections::{BTreeSet, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{WatchRule, WatchTarget};
use crate::events::Event;
use crate::package::Package;

/// Directories whose changes never trigger a run.
const ALWAYS_IGNORED: &[&str] = &[".git", "node_modules"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// The path lives inside the package.
    Direct,
    /// A watch mapping names the package.
    Mapped,
    /// A watch mapping with `"*"` matched.
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTrigger {
    /// `None` for [`TriggerKind::All`].
    pub package: Option<usize>,
    pub path: PathBuf,
    pub kind: TriggerKind,
}

pub struct WatchRouter {
    root: PathBuf,
    rules: Vec<WatchRule>,
    /// Package directories, deepest first.
    packages: Vec<(usize, PathBuf)>,
}

impl WatchRouter {
    pub fn new(root: &Path, rules: Vec<WatchRule>, packages: &[Package]) -> Self {
        let mut dirs: Vec<(usize, PathBuf)> = packages
            .iter()
            .enumerate()
            .filter(|(_, package)| package.is_runnable())
            .map(|(id, package)| (id, package.path.clone()))
            .collect();
        dirs.sort_by_key(|(_, path)| std::cmp::Reverse(path.components().count()));
        Self {
            root: root.to_path_buf(),
            rules,
            packages: dirs,
        }
    }

    /// Routes one debounced batch of changed paths.
    pub fn route<'a>(&self, paths: impl IntoIterator<Item = &'a PathBuf>) -> Vec<WatchTrigger> {
        let mut triggers = Vec::new();
        let mut seen: HashSet<usize> = HashSet::new();
        for path in paths {
            let relative = path
                .strip_prefix(&self.root)
                .map(|rel| rel.to_string_lossy().replace('\\', "/"))
                .unwrap_or_else(|_| path.to_string_lossy().into_owned());

            let matching: Vec<&WatchRule> = self
                .rules
                .iter()
                .filter(|rule| rule.matcher.is_match(&relative))
                .collect();
            if matching.iter().any(|rule| rule.target == WatchTarget::All) {
                // A full rerun supersedes everything else in the batch.
                return vec![WatchTrigger {
                    package: None,
                    path: path.clone(),
                    kind: TriggerKind::All,
                }];
            }
            if !matching.is_empty() {
                for rule in matching {
                    if let WatchTarget::Packages(ids) = &rule.target {
                        for id in ids {
                            if seen.insert(*id) {
                                triggers.push(WatchTrigger {
                                    package: Some(*id),
                                    path: path.clone(),
                                    kind: TriggerKind::Mapped,
                                });
                            }
                        }
                    }
                }
                continue;
            }
            if let Some((id, _)) = self.packages.iter().find(|(_, dir)| path.starts_with(dir)) {
                if seen.insert(*id) {
                    triggers.push(WatchTrigger {
                        package: Some(*id),
                        path: path.clone(),
                        kind: TriggerKind::Direct,
                    });
                }
            }
        }
        triggers
    }
}

/// A running watcher. Dropping it stops the watcher; [`WatchHandle::stop`]
/// also waits for the debounce thread to finish.
pub struct WatchHandle {
    watcher: Option<RecommendedWatcher>,
    thread: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // The thread exits once the watcher's sender is gone.
        self.watcher.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Starts watching `root`. Triggers arrive as [`Event::Watch`].
pub fn spawn_watcher(
    root: &Path,
    router: WatchRouter,
    debounce_ms: u64,
    tx: mpsc::Sender<Event>,
) -> Result<WatchHandle> {
    let matcher = IgnoreMatcher::new(root)?;
    let (raw_tx, raw_rx) = std::sync::mpsc::channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = raw_tx.send(res);
        },
        notify::Config::default(),
    )
    .context("failed to create watcher")?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {}", root.display()))?;

    let debounce = Duration::from_millis(debounce_ms.max(50));
    let thread = std::thread::spawn(move || {
        loop {
            let first = match raw_rx.recv() {
                Ok(res) => res,
                Err(_) => break,
            };
            let mut batch = BTreeSet::new();
            collect_paths(&first, &matcher, &mut batch);
            if batch.is_empty() {
                continue;
            }

            let mut last = Instant::now();
            loop {
                let elapsed = last.elapsed();
                if elapsed >= debounce {
                    break;
                }
                match raw_rx.recv_timeout(debounce - elapsed) {
                    Ok(res) => {
                        if collect_paths(&res, &matcher, &mut batch) {
                            last = Instant::now();
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }

            let triggers = router.route(&batch);
            debug!(paths = batch.len(), triggers = triggers.len(), "watch batch");
            for trigger in triggers {
                if tx.blocking_send(Event::Watch(trigger)).is_err() {
                    return;
                }
            }
        }
    });

    Ok(WatchHandle {
        watcher: Some(watcher),
        thread: Some(thread),
    })
}

/// Adds the relevant paths of `event` to `batch`; true if any were added.
fn collect_paths(
    event: &notify::Result<NotifyEvent>,
    matcher: &IgnoreMatcher,
    batch: &mut BTreeSet<PathBuf>,
) -> bool {
    let event = match event {
        Ok(event) => event,
        Err(err) => {
            warn!(%err, "watch error");
            return false;
        }
    };
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    let mut added = false;
    for path in &event.paths {
        if !matcher.is_ignored(path) && batch.insert(path.clone()) {
            added = true;
        }
    }
    added
}

struct IgnoreMatcher {
    gitignore: Option<Gitignore>,
}

impl IgnoreMatcher {
    fn new(root: &Path) -> Result<Self> {
        Ok(Self {
            gitignore: Some(build_gitignore(root)?),
        })
    }

    fn is_ignored(&self, path: &Path) -> bool {
        let in_ignored_dir = path.components().any(|component| match component {
            Component::Normal(name) => ALWAYS_IGNORED.iter().any(|ignored| name == *ignored),
            _ => false,
        });
        if in_ignored_dir {
            return true;
        }
        if let Some(gitignore) = &self.gitignore {
            let is_dir = path.is_dir();
            if gitignore
                .matched_path_or_any_parents(path, is_dir)
                .is_ignore()
            {
                return true;
            }
        }
        false
    }
}

fn build_gitignore(root: &Path) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    for ancestor in root.ancestors() {
        let path = ancestor.join(".gitignore");
        if path.exists() {
            builder.add(path);
        }
        let exclude = ancestor.join(".git").join("info").join("exclude");
        if exclude.exists() {
            builder.add(exclude);
        }
    }
    Ok(builder.build()?)
}
