//! Application state and key dispatch.
//!
//! `App` is the one state object the event loop hands to every handler. It
//! owns the scheduler and the view, turns classified keys into
//! [`AppAction`]s and keeps the transient status message shown in the footer.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crossterm::event::KeyEvent;
use tracing::{debug, info};

use crate::keys::{classify, Action};
use crate::package::{Package, RunState};
use crate::scheduler::{Launch, RunAllOutcome, Scheduler};
use crate::template::{render_with, TemplateValues};
use crate::view::{
    coverage_rows, popover_content, test_rows, CoverageRow, Screen, TestRow, ViewContext,
    ViewEvent, ViewState,
};
use crate::watch::{TriggerKind, WatchTrigger};

pub const SPINNER: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

/// Actions resulting from user interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppAction {
    /// No action required.
    None,
    /// Spawn these runs.
    Launch(Vec<Launch>),
    /// Start or stop the file watcher.
    ToggleWatch,
    /// Run the rendered enter-action command.
    Execute { program: String, args: Vec<String> },
    /// Exit the application.
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone)]
struct StatusMessage {
    text: String,
    at: Instant,
    ttl: Option<Duration>,
    level: StatusLevel,
}

/// Rows of the selected package, rebuilt whenever the view needs them.
struct Rows {
    tests: Vec<TestRow>,
    coverage: Vec<CoverageRow>,
    test_selectable: Vec<bool>,
    coverage_selectable: Vec<bool>,
    popover_lines: usize,
}

pub struct App {
    pub scheduler: Scheduler,
    pub view: ViewState,
    pub root: PathBuf,
    pub watch_enabled: bool,
    pub should_quit: bool,
    enter_command: Option<String>,
    spinner_frame: usize,
    status_message: Option<StatusMessage>,
}

impl App {
    pub fn new(scheduler: Scheduler, root: PathBuf, enter_command: Option<String>) -> Self {
        Self {
            scheduler,
            view: ViewState::new(),
            root,
            watch_enabled: false,
            should_quit: false,
            enter_command,
            spinner_frame: 0,
            status_message: None,
        }
    }

    pub fn selected_package(&self) -> Option<&Package> {
        self.scheduler.package(self.view.selected_package())
    }

    pub fn selected_state(&self) -> Option<&RunState> {
        self.scheduler.state(self.view.selected_package())
    }

    pub fn spinner(&self) -> char {
        SPINNER[self.spinner_frame % SPINNER.len()]
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> AppAction {
        let Some(input) = classify(&key) else {
            return AppAction::None;
        };
        let rows = self.rows();
        let event = self.view.handle(input, &context(self.scheduler.len(), &rows));
        match event {
            ViewEvent::None => AppAction::None,
            ViewEvent::Execute => self.enter_action(&rows),
            ViewEvent::Action(action) => self.dispatch(action),
        }
    }

    fn dispatch(&mut self, action: Action) -> AppAction {
        let selected = self.view.selected_package();
        match action {
            Action::Rerun => {
                if self.scheduler.is_empty() {
                    return AppAction::None;
                }
                match self.scheduler.run_package(selected) {
                    Some(launch) => AppAction::Launch(vec![launch]),
                    None if self.scheduler.is_queued(selected) => {
                        self.set_status_message("rerun queued behind the current run");
                        AppAction::None
                    }
                    None => {
                        self.set_status_warning("package has no runnable test command");
                        AppAction::None
                    }
                }
            }
            Action::RerunAll => {
                let (launches, outcome) = self.scheduler.run_all();
                if outcome == RunAllOutcome::Deferred {
                    self.set_status_message("rerun all queued until current runs finish");
                }
                AppAction::Launch(launches)
            }
            Action::Coverage => {
                if self.scheduler.is_empty() {
                    return AppAction::None;
                }
                let launch = self.scheduler.toggle_coverage(selected);
                let on = self.scheduler.coverage_flags().is_on(selected);
                self.set_status_message(if on { "coverage on" } else { "coverage off" });
                AppAction::Launch(launch.into_iter().collect())
            }
            Action::CoverageAll => {
                let launches = self.scheduler.cycle_coverage();
                let mode = self.scheduler.coverage_flags().mode();
                self.set_status_message(format!("coverage: {}", mode.label()));
                AppAction::Launch(launches)
            }
            Action::Watch => AppAction::ToggleWatch,
            Action::Quit => {
                self.should_quit = true;
                AppAction::Quit
            }
            // The view consumes Help itself.
            Action::Help => AppAction::None,
        }
    }

    pub fn on_output(&mut self, id: usize, chunk: &str) {
        self.scheduler.on_output(id, chunk);
        if id == self.view.selected_package() && self.view.screen == Screen::Tests {
            self.sync_view();
        }
    }

    pub fn on_exit(&mut self, id: usize, code: Option<i32>) -> Vec<Launch> {
        let launches = self.scheduler.on_exit(id, code);
        self.sync_view();
        launches
    }

    pub fn on_spawn_failed(&mut self, id: usize, error: String) -> Vec<Launch> {
        let launches = self.scheduler.on_spawn_failed(id, error);
        self.sync_view();
        launches
    }

    pub fn on_watch(&mut self, trigger: WatchTrigger) -> Vec<Launch> {
        if !self.watch_enabled {
            return Vec::new();
        }
        info!(path = %trigger.path.display(), kind = ?trigger.kind, "watch trigger");
        match (trigger.kind, trigger.package) {
            (TriggerKind::All, _) | (_, None) => self.scheduler.run_all().0,
            (_, Some(id)) => self.scheduler.run_package(id).into_iter().collect(),
        }
    }

    pub fn set_watch_enabled(&mut self, enabled: bool) {
        self.watch_enabled = enabled;
        self.set_status_message(if enabled { "watch on" } else { "watch off" });
    }

    /// Advances the spinner and the idle timer.
    pub fn tick(&mut self, now: Instant) {
        if self.scheduler.any_running() {
            self.spinner_frame = self.spinner_frame.wrapping_add(1);
        }
        self.view.tick(now);
    }

    /// Re-anchors the view after the selected package's rows changed.
    pub fn sync_view(&mut self) {
        let rows = self.rows();
        self.view.sync(&context(self.scheduler.len(), &rows));
    }

    pub fn test_rows(&self) -> Vec<TestRow> {
        self.selected_state().map(test_rows).unwrap_or_default()
    }

    pub fn coverage_rows(&self) -> Vec<CoverageRow> {
        coverage_rows(self.selected_state().and_then(|state| state.coverage.as_ref()))
    }

    fn rows(&self) -> Rows {
        let tests = self.test_rows();
        let coverage = self.coverage_rows();
        let popover_lines = self
            .selected_test(&tests)
            .map(|(file, test)| popover_content(file, test).body.len())
            .unwrap_or(0);
        Rows {
            test_selectable: tests.iter().map(TestRow::is_selectable).collect(),
            coverage_selectable: coverage.iter().map(CoverageRow::is_selectable).collect(),
            tests,
            coverage,
            popover_lines,
        }
    }

    /// The file and test under the tests cursor.
    pub fn selected_test<'a>(
        &'a self,
        rows: &[TestRow],
    ) -> Option<(&'a str, &'a crate::report::Test)> {
        let TestRow::Test { suite, test } = rows.get(self.view.tests.selected)? else {
            return None;
        };
        let suite = self.selected_state()?.test_report.as_ref()?.suites.get(*suite)?;
        Some((suite.file.as_str(), suite.tests.get(*test)?))
    }

    fn enter_action(&mut self, rows: &Rows) -> AppAction {
        let Some(template) = self.enter_command.clone() else {
            self.set_status_warning("no enterAction configured");
            return AppAction::None;
        };
        let Some(values) = self.template_values(rows) else {
            return AppAction::None;
        };
        let rendered = render_with(&template, &values, |value| shell_words::quote(value).into_owned());
        match shell_words::split(&rendered) {
            Ok(mut words) if !words.is_empty() => {
                let program = words.remove(0);
                debug!(command = %rendered, "enter action");
                self.set_status_message(format!("ran {program}"));
                AppAction::Execute {
                    program,
                    args: words,
                }
            }
            Ok(_) => {
                self.set_status_warning("enterAction rendered an empty command");
                AppAction::None
            }
            Err(err) => {
                self.set_status_warning(format!("bad enterAction command: {err}"));
                AppAction::None
            }
        }
    }

    fn template_values(&self, rows: &Rows) -> Option<TemplateValues> {
        let package = self.selected_package()?;
        let (file, line, test_name) = match self.view.screen {
            Screen::Tests => {
                let (file, test) = self.selected_test(&rows.tests)?;
                (file.to_string(), None, Some(test.name.clone()))
            }
            Screen::Coverage => {
                let CoverageRow::File(idx) = rows.coverage.get(self.view.coverage.selected)? else {
                    return None;
                };
                let file = self.selected_state()?.coverage.as_ref()?.files.get(*idx)?;
                (file.path.clone(), file.first_uncovered_line(), None)
            }
            Screen::Summary => return None,
        };
        Some(file_values(&self.root, package, &file, line, test_name))
    }

    pub fn status_message(&self) -> Option<(&str, StatusLevel)> {
        if let Some(message) = &self.status_message {
            let still_visible = match message.ttl {
                Some(ttl) => message.at.elapsed() < ttl,
                None => true,
            };
            if still_visible {
                return Some((message.text.as_str(), message.level));
            }
        }
        None
    }

    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Info, Some(Duration::from_secs(3)));
    }

    pub fn set_status_warning(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Warning, Some(Duration::from_secs(5)));
    }

    fn set_status_message_with_level(
        &mut self,
        message: impl Into<String>,
        level: StatusLevel,
        ttl: Option<Duration>,
    ) {
        self.status_message = Some(StatusMessage {
            text: message.into(),
            at: Instant::now(),
            ttl,
            level,
        });
    }
}

fn context(package_count: usize, rows: &Rows) -> ViewContext<'_> {
    ViewContext {
        package_count,
        test_selectable: &rows.test_selectable,
        coverage_selectable: &rows.coverage_selectable,
        popover_lines: rows.popover_lines,
    }
}

/// Template values for `file`, which may be absolute or relative to the
/// package directory.
fn file_values(
    root: &Path,
    package: &Package,
    file: &str,
    line: Option<u32>,
    test_name: Option<String>,
) -> TemplateValues {
    let abs = if Path::new(file).is_absolute() {
        PathBuf::from(file)
    } else {
        package.path.join(file)
    };
    let relative_to = |base: &Path| {
        abs.strip_prefix(base)
            .ok()
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
    };
    TemplateValues {
        file_path: relative_to(root),
        pkg_file_path: relative_to(&package.path),
        file_name: abs.file_name().map(|name| name.to_string_lossy().into_owned()),
        abs_file_path: Some(abs.to_string_lossy().into_owned()),
        line,
        test_name,
        package_name: Some(package.name.clone()),
        package_path: Some(package.path.to_string_lossy().into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterRegistry;
    use crate::package::RunnerKind;
    use crossterm::event::{KeyCode, KeyModifiers};

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn make_app(enter: Option<&str>) -> App {
        let packages = vec![
            Package {
                name: "api".into(),
                path: PathBuf::from("/repo/packages/api"),
                test_command: Some("vitest".into()),
                runner: Some(RunnerKind::Vitest),
            },
            Package {
                name: "docs".into(),
                path: PathBuf::from("/repo/docs"),
                test_command: None,
                runner: None,
            },
        ];
        let scheduler = Scheduler::new(
            packages,
            AdapterRegistry::new(),
            false,
            PathBuf::from("/tmp/testrack-app-tests"),
        );
        App::new(scheduler, PathBuf::from("/repo"), enter.map(str::to_string))
    }

    fn finish_with_report(app: &mut App) {
        let state = app.scheduler.state_mut(0).unwrap();
        state.status = crate::package::RunStatus::Done;
        state.test_report = Some(crate::report::parse_report(
            r#"<testsuites><testsuite name="src/math.test.ts">
                <testcase classname="src/math.test.ts" name="adds" time="0.001"/>
                <testcase classname="src/math.test.ts" name="fails" time="0.002"><failure message="boom">boom
at line 3</failure></testcase>
            </testsuite></testsuites>"#,
        ));
    }

    #[test]
    fn rerun_launches_then_queues() {
        let mut app = make_app(None);
        let action = app.handle_key(key(KeyCode::Char('r')));
        assert!(matches!(action, AppAction::Launch(ref l) if l.len() == 1));
        assert_eq!(app.handle_key(key(KeyCode::Char('r'))), AppAction::None);
        assert!(app.scheduler.is_queued(0));
        assert!(app.status_message().is_some());
    }

    #[test]
    fn rerun_on_unrunnable_package_warns() {
        let mut app = make_app(None);
        app.handle_key(key(KeyCode::Down));
        assert_eq!(app.view.selected_package(), 1);
        assert_eq!(app.handle_key(key(KeyCode::Char('r'))), AppAction::None);
        assert_eq!(app.status_message().map(|(_, level)| level), Some(StatusLevel::Warning));
    }

    #[test]
    fn quit_and_watch_actions() {
        let mut app = make_app(None);
        assert_eq!(app.handle_key(key(KeyCode::Char('w'))), AppAction::ToggleWatch);
        assert_eq!(app.handle_key(key(KeyCode::Char('q'))), AppAction::Quit);
        assert!(app.should_quit);
    }

    #[test]
    fn enter_in_popover_renders_quoted_command() {
        let mut app = make_app(Some("code -g {absFilePath}[:{line}] --name {testName}"));
        finish_with_report(&mut app);
        app.handle_key(key(KeyCode::Enter));
        assert_eq!(app.view.screen, Screen::Tests);
        app.sync_view();
        app.handle_key(key(KeyCode::Enter));
        assert!(app.view.popover.visible);
        let action = app.handle_key(key(KeyCode::Enter));
        assert_eq!(
            action,
            AppAction::Execute {
                program: "code".into(),
                args: vec![
                    "-g".into(),
                    "/repo/packages/api/src/math.test.ts".into(),
                    "--name".into(),
                    "adds".into(),
                ],
            }
        );
    }

    #[test]
    fn enter_without_config_sets_status() {
        let mut app = make_app(None);
        finish_with_report(&mut app);
        app.handle_key(key(KeyCode::Enter));
        app.sync_view();
        app.handle_key(key(KeyCode::Enter));
        assert_eq!(app.handle_key(key(KeyCode::Enter)), AppAction::None);
        let (text, level) = app.status_message().unwrap();
        assert!(text.contains("enterAction"));
        assert_eq!(level, StatusLevel::Warning);
    }

    #[test]
    fn watch_triggers_respect_the_toggle() {
        let mut app = make_app(None);
        let trigger = WatchTrigger {
            package: Some(0),
            path: PathBuf::from("/repo/packages/api/src/a.ts"),
            kind: TriggerKind::Direct,
        };
        assert!(app.on_watch(trigger.clone()).is_empty());
        app.set_watch_enabled(true);
        assert_eq!(app.on_watch(trigger).len(), 1);
    }

    #[test]
    fn file_values_are_relative_to_root_and_package() {
        let package = Package {
            name: "api".into(),
            path: PathBuf::from("/repo/packages/api"),
            test_command: None,
            runner: None,
        };
        let values = file_values(Path::new("/repo"), &package, "src/a b.ts", Some(7), None);
        assert_eq!(values.file_path.as_deref(), Some("packages/api/src/a b.ts"));
        assert_eq!(values.pkg_file_path.as_deref(), Some("src/a b.ts"));
        assert_eq!(values.file_name.as_deref(), Some("a b.ts"));
        assert_eq!(values.line, Some(7));
    }
}
