//! Interactive view state: screens, list cursors, the test popover, the help
//! overlay and the idle cursor timer.
//!
//! `ViewState` never reads the scheduler directly. Callers describe the rows
//! of the selected package through a [`ViewContext`] and the renderer reports
//! how many rows it could fit through the `set_*_height` methods.

use std::time::{Duration, Instant};

use crate::coverage::PackageCoverage;
use crate::keys::{Action, KeyInput};
use crate::package::RunState;
use crate::report::{Test, TestStatus};
use crate::summary::{format_duration, strip_ansi};

/// Summary page keys move the selection by this many packages.
pub const SUMMARY_PAGE: usize = 10;
/// Idle time before the cursor glyph dims.
pub const IDLE_DIM_AFTER: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Summary,
    Tests,
    Coverage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListCursor {
    pub selected: usize,
    pub scroll: usize,
    /// Rows the renderer fit on screen last frame.
    pub visible: usize,
}

impl ListCursor {
    fn reset(&mut self) {
        self.selected = 0;
        self.scroll = 0;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Popover {
    pub visible: bool,
    pub scroll: usize,
    /// Body rows the renderer fit inside the box last frame.
    pub body_height: usize,
}

/// One row of the tests list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestRow {
    SuiteHeader(usize),
    Test { suite: usize, test: usize },
    Blank,
    Totals,
    /// A line of raw output, shown when the run produced no report.
    Output(String),
}

impl TestRow {
    pub fn is_selectable(&self) -> bool {
        matches!(self, TestRow::Test { .. })
    }
}

/// One row of the coverage list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageRow {
    File(usize),
    Blank,
    Totals,
}

impl CoverageRow {
    pub fn is_selectable(&self) -> bool {
        matches!(self, CoverageRow::File(_))
    }
}

pub fn test_rows(state: &RunState) -> Vec<TestRow> {
    let Some(report) = &state.test_report else {
        return strip_ansi(&state.raw_output)
            .lines()
            .map(|line| TestRow::Output(line.to_string()))
            .collect();
    };
    let mut rows = Vec::new();
    for (suite_idx, suite) in report.suites.iter().enumerate() {
        rows.push(TestRow::SuiteHeader(suite_idx));
        rows.extend((0..suite.tests.len()).map(|test| TestRow::Test {
            suite: suite_idx,
            test,
        }));
        rows.push(TestRow::Blank);
    }
    rows.push(TestRow::Totals);
    rows
}

pub fn coverage_rows(coverage: Option<&PackageCoverage>) -> Vec<CoverageRow> {
    let Some(coverage) = coverage else {
        return Vec::new();
    };
    let mut rows: Vec<CoverageRow> = (0..coverage.files.len()).map(CoverageRow::File).collect();
    rows.push(CoverageRow::Blank);
    rows.push(CoverageRow::Totals);
    rows
}

/// What the selected package looks like right now.
#[derive(Debug, Clone, Copy, Default)]
pub struct ViewContext<'a> {
    pub package_count: usize,
    pub test_selectable: &'a [bool],
    pub coverage_selectable: &'a [bool],
    /// Body lines of the popover for the selected test.
    pub popover_lines: usize,
}

/// What the caller has to do after a key was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewEvent {
    None,
    Action(Action),
    /// Run the enter action for the selected test or coverage file.
    Execute,
}

#[derive(Debug, Clone)]
pub struct ViewState {
    pub screen: Screen,
    pub summary: ListCursor,
    pub tests: ListCursor,
    pub popover: Popover,
    pub coverage: ListCursor,
    pub help_visible: bool,
    pub cursor_dimmed: bool,
    last_input: Instant,
}

impl Default for ViewState {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewState {
    pub fn new() -> Self {
        Self {
            screen: Screen::Summary,
            summary: ListCursor::default(),
            tests: ListCursor::default(),
            popover: Popover::default(),
            coverage: ListCursor::default(),
            help_visible: false,
            cursor_dimmed: false,
            last_input: Instant::now(),
        }
    }

    /// The selected package. Tests and coverage screens always show this one.
    pub fn selected_package(&self) -> usize {
        self.summary.selected
    }

    pub fn handle(&mut self, input: KeyInput, ctx: &ViewContext<'_>) -> ViewEvent {
        self.touch(Instant::now());

        if self.help_visible {
            if input == KeyInput::Escape {
                self.help_visible = false;
            }
            return ViewEvent::None;
        }
        if let KeyInput::Action(action) = input {
            if action == Action::Help {
                self.help_visible = true;
                return ViewEvent::None;
            }
            return ViewEvent::Action(action);
        }

        match self.screen {
            Screen::Summary => self.handle_summary(input, ctx),
            Screen::Tests if self.popover.visible => self.handle_popover(input, ctx),
            Screen::Tests => self.handle_tests(input, ctx),
            Screen::Coverage => self.handle_coverage(input, ctx),
        }
    }

    fn handle_summary(&mut self, input: KeyInput, ctx: &ViewContext<'_>) -> ViewEvent {
        match input {
            KeyInput::Vertical(delta) => self.select_package(ctx, delta as isize),
            KeyInput::VerticalPage(delta) => {
                self.select_package(ctx, delta as isize * SUMMARY_PAGE as isize)
            }
            KeyInput::Enter | KeyInput::Horizontal(1) => {
                if ctx.package_count > 0 {
                    self.screen = Screen::Tests;
                    self.sync(ctx);
                }
            }
            _ => {}
        }
        ViewEvent::None
    }

    fn handle_tests(&mut self, input: KeyInput, ctx: &ViewContext<'_>) -> ViewEvent {
        match input {
            KeyInput::Vertical(delta) => {
                self.tests.selected =
                    move_selection(ctx.test_selectable, self.tests.selected, delta);
                self.tests.scroll = smart_scroll(
                    self.tests.selected,
                    self.tests.scroll,
                    self.tests.visible,
                    ctx.test_selectable.len(),
                );
            }
            KeyInput::VerticalPage(delta) => self.select_package(ctx, delta as isize),
            KeyInput::Enter => {
                if ctx.test_selectable.get(self.tests.selected) == Some(&true) {
                    self.popover.visible = true;
                    self.popover.scroll = 0;
                }
            }
            KeyInput::Horizontal(1) => {
                self.screen = Screen::Coverage;
                self.sync(ctx);
            }
            KeyInput::Horizontal(_) | KeyInput::Escape => self.screen = Screen::Summary,
            KeyInput::Action(_) => {}
        }
        ViewEvent::None
    }

    fn handle_popover(&mut self, input: KeyInput, ctx: &ViewContext<'_>) -> ViewEvent {
        match input {
            KeyInput::Vertical(delta) => {
                let max = ctx.popover_lines.saturating_sub(self.popover.body_height);
                self.popover.scroll = step(self.popover.scroll, delta as isize, max);
            }
            KeyInput::VerticalPage(delta) => self.select_package(ctx, delta as isize),
            KeyInput::Escape | KeyInput::Horizontal(-1) => self.close_popover(),
            KeyInput::Horizontal(_) => {
                self.close_popover();
                self.screen = Screen::Coverage;
                self.sync(ctx);
            }
            KeyInput::Enter => return ViewEvent::Execute,
            KeyInput::Action(_) => {}
        }
        ViewEvent::None
    }

    fn handle_coverage(&mut self, input: KeyInput, ctx: &ViewContext<'_>) -> ViewEvent {
        match input {
            KeyInput::Vertical(delta) => {
                self.coverage.selected =
                    move_selection(ctx.coverage_selectable, self.coverage.selected, delta);
                self.coverage.scroll = smart_scroll(
                    self.coverage.selected,
                    self.coverage.scroll,
                    self.coverage.visible,
                    ctx.coverage_selectable.len(),
                );
            }
            KeyInput::VerticalPage(delta) => self.select_package(ctx, delta as isize),
            KeyInput::Enter => {
                if ctx.coverage_selectable.get(self.coverage.selected) == Some(&true) {
                    return ViewEvent::Execute;
                }
            }
            KeyInput::Horizontal(-1) | KeyInput::Escape => {
                self.screen = Screen::Tests;
                self.sync(ctx);
            }
            _ => {}
        }
        ViewEvent::None
    }

    fn close_popover(&mut self) {
        self.popover.visible = false;
        self.popover.scroll = 0;
    }

    /// Moves the package selection. Any change resets the detail cursors and
    /// closes the popover.
    fn select_package(&mut self, ctx: &ViewContext<'_>, delta: isize) {
        if ctx.package_count == 0 {
            return;
        }
        let next = step(self.summary.selected, delta, ctx.package_count - 1);
        if next == self.summary.selected {
            return;
        }
        self.summary.selected = next;
        self.summary.scroll = smart_scroll(
            next,
            self.summary.scroll,
            self.summary.visible,
            ctx.package_count,
        );
        self.tests.reset();
        self.coverage.reset();
        self.close_popover();
    }

    /// Re-anchors cursors after the rows changed underneath them: a run
    /// finished, a report arrived, or the package list shrank.
    pub fn sync(&mut self, ctx: &ViewContext<'_>) {
        if ctx.package_count == 0 {
            self.summary = ListCursor {
                visible: self.summary.visible,
                ..ListCursor::default()
            };
        } else {
            self.summary.selected = self.summary.selected.min(ctx.package_count - 1);
            self.summary.scroll = smart_scroll(
                self.summary.selected,
                self.summary.scroll,
                self.summary.visible,
                ctx.package_count,
            );
        }
        anchor(&mut self.tests, ctx.test_selectable);
        anchor(&mut self.coverage, ctx.coverage_selectable);
        if self.popover.visible && ctx.test_selectable.get(self.tests.selected) != Some(&true) {
            self.close_popover();
        }
        let max = ctx.popover_lines.saturating_sub(self.popover.body_height);
        self.popover.scroll = self.popover.scroll.min(max);
        if self.screen != Screen::Tests {
            self.close_popover();
        }
    }

    pub fn set_summary_height(&mut self, height: usize, total: usize) {
        self.summary.visible = height;
        self.summary.scroll = smart_scroll(self.summary.selected, self.summary.scroll, height, total);
    }

    pub fn set_tests_height(&mut self, height: usize, total: usize) {
        self.tests.visible = height;
        self.tests.scroll = smart_scroll(self.tests.selected, self.tests.scroll, height, total);
    }

    pub fn set_coverage_height(&mut self, height: usize, total: usize) {
        self.coverage.visible = height;
        self.coverage.scroll =
            smart_scroll(self.coverage.selected, self.coverage.scroll, height, total);
    }

    pub fn set_popover_body_height(&mut self, height: usize, lines: usize) {
        self.popover.body_height = height;
        self.popover.scroll = self.popover.scroll.min(lines.saturating_sub(height));
    }

    /// Resets the idle timer.
    pub fn touch(&mut self, now: Instant) {
        self.last_input = now;
        self.cursor_dimmed = false;
    }

    /// Dims the cursor once the idle period has passed.
    pub fn tick(&mut self, now: Instant) {
        self.cursor_dimmed = now.saturating_duration_since(self.last_input) >= IDLE_DIM_AFTER;
    }
}

fn anchor(cursor: &mut ListCursor, selectable: &[bool]) {
    if selectable.is_empty() {
        cursor.reset();
        return;
    }
    cursor.selected = cursor.selected.min(selectable.len() - 1);
    if !selectable[cursor.selected] {
        if let Some(idx) = nearest_selectable(selectable, cursor.selected, 1) {
            cursor.selected = idx;
        }
    }
    cursor.scroll = smart_scroll(cursor.selected, cursor.scroll, cursor.visible, selectable.len());
}

fn step(current: usize, delta: isize, max: usize) -> usize {
    current.saturating_add_signed(delta).min(max)
}

/// Moves to the next selectable row in the direction of `delta`, clamping at
/// the ends. From a non-selectable row it jumps to the nearest selectable one.
pub fn move_selection(selectable: &[bool], current: usize, delta: i8) -> usize {
    if selectable.is_empty() {
        return 0;
    }
    let current = current.min(selectable.len() - 1);
    if !selectable[current] {
        return nearest_selectable(selectable, current, delta).unwrap_or(current);
    }
    let mut idx = current;
    loop {
        idx = match delta.signum() {
            1 if idx + 1 < selectable.len() => idx + 1,
            -1 if idx > 0 => idx - 1,
            _ => return current,
        };
        if selectable[idx] {
            return idx;
        }
    }
}

/// Closest selectable index; ties go in the direction of `prefer`.
fn nearest_selectable(selectable: &[bool], from: usize, prefer: i8) -> Option<usize> {
    for distance in 1..selectable.len() {
        let forward = from.checked_add(distance).filter(|idx| *idx < selectable.len());
        let backward = from.checked_sub(distance);
        let order = if prefer < 0 {
            [backward, forward]
        } else {
            [forward, backward]
        };
        if let Some(idx) = order.into_iter().flatten().find(|idx| selectable[*idx]) {
            return Some(idx);
        }
    }
    None
}

/// Adjusts `scroll` minimally so `selected` stays inside the visible window,
/// keeping it within `[0, total - visible]`.
pub fn smart_scroll(selected: usize, scroll: usize, visible: usize, total: usize) -> usize {
    let max = total.saturating_sub(visible);
    let mut scroll = scroll.min(max);
    if visible == 0 {
        return scroll;
    }
    if selected < scroll {
        scroll = selected;
    } else if selected >= scroll + visible {
        scroll = selected + 1 - visible;
    }
    scroll.min(max)
}

/// Heights of the split tests screen while the popover is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopoverLayout {
    pub list_height: usize,
    pub box_height: usize,
    pub body_height: usize,
}

/// Splits `content_height` between the list and a bordered popover holding
/// `header` fixed lines and `body` scrollable ones. The box never takes more
/// than half the content area.
pub fn popover_layout(content_height: usize, header: usize, body: usize) -> PopoverLayout {
    let cap = content_height / 2;
    let available = cap.saturating_sub(header + 2);
    let body_height = body.min(available);
    let box_height = (header + body_height + 2).min(cap);
    PopoverLayout {
        list_height: content_height - box_height,
        box_height,
        body_height,
    }
}

/// Text of the popover for one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopoverContent {
    pub title: String,
    pub file: String,
    pub status: String,
    /// Failed tests get a full-width divider under the header.
    pub divider: bool,
    pub body: Vec<String>,
}

impl PopoverContent {
    pub fn header_lines(&self) -> usize {
        3 + usize::from(self.divider)
    }
}

pub fn popover_content(file: &str, test: &Test) -> PopoverContent {
    let duration = format_duration(test.duration);
    match test.status {
        TestStatus::Passed | TestStatus::Skipped => PopoverContent {
            title: test.name.clone(),
            file: file.to_string(),
            status: if test.status == TestStatus::Passed {
                format!("✓ passed · {duration}")
            } else {
                "○ skipped".to_string()
            },
            divider: false,
            body: Vec::new(),
        },
        TestStatus::Failed => {
            let mut body = vec![format!("duration: {duration}"), String::new()];
            body.extend(
                test.failure_message
                    .as_deref()
                    .unwrap_or("(no failure message)")
                    .lines()
                    .map(strip_ansi),
            );
            PopoverContent {
                title: test.name.clone(),
                file: file.to_string(),
                status: "✗ failed".to_string(),
                divider: true,
                body,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROWS: &[bool] = &[false, true, true, false, false, true, false];

    fn ctx(packages: usize) -> ViewContext<'static> {
        ViewContext {
            package_count: packages,
            test_selectable: ROWS,
            coverage_selectable: &[true, true, false, false],
            popover_lines: 12,
        }
    }

    fn failed_test(message: &str) -> Test {
        Test {
            name: "outer > works".into(),
            status: TestStatus::Failed,
            duration: Duration::from_millis(4),
            failure_message: Some(message.into()),
        }
    }

    #[test]
    fn selection_skips_unselectable_rows_and_clamps() {
        assert_eq!(move_selection(ROWS, 1, 1), 2);
        assert_eq!(move_selection(ROWS, 2, 1), 5);
        assert_eq!(move_selection(ROWS, 5, 1), 5);
        assert_eq!(move_selection(ROWS, 1, -1), 1);
        assert_eq!(move_selection(ROWS, 5, -1), 2);
    }

    #[test]
    fn selection_jumps_off_unselectable_rows() {
        assert_eq!(move_selection(ROWS, 0, 1), 1);
        assert_eq!(move_selection(ROWS, 4, 1), 5);
        assert_eq!(move_selection(ROWS, 3, -1), 2);
        assert_eq!(move_selection(ROWS, 6, 1), 5);
        assert_eq!(move_selection(&[false, false], 1, 1), 1);
        assert_eq!(move_selection(&[], 3, 1), 0);
    }

    #[test]
    fn smart_scroll_moves_minimally() {
        assert_eq!(smart_scroll(0, 0, 5, 20), 0);
        assert_eq!(smart_scroll(5, 0, 5, 20), 1);
        assert_eq!(smart_scroll(3, 4, 5, 20), 3);
        assert_eq!(smart_scroll(19, 0, 5, 20), 15);
        assert_eq!(smart_scroll(2, 10, 5, 6), 1);
        assert_eq!(smart_scroll(0, 3, 10, 4), 0);
    }

    #[test]
    fn summary_navigation_pages_by_ten() {
        let mut view = ViewState::new();
        let ctx = ctx(25);
        view.handle(KeyInput::VerticalPage(1), &ctx);
        assert_eq!(view.selected_package(), 10);
        view.handle(KeyInput::VerticalPage(1), &ctx);
        view.handle(KeyInput::VerticalPage(1), &ctx);
        assert_eq!(view.selected_package(), 24);
        view.handle(KeyInput::Vertical(-1), &ctx);
        assert_eq!(view.selected_package(), 23);
    }

    #[test]
    fn screens_move_forward_and_back() {
        let mut view = ViewState::new();
        let ctx = ctx(2);
        view.handle(KeyInput::Enter, &ctx);
        assert_eq!(view.screen, Screen::Tests);
        assert_eq!(view.tests.selected, 1);
        view.handle(KeyInput::Horizontal(1), &ctx);
        assert_eq!(view.screen, Screen::Coverage);
        view.handle(KeyInput::Horizontal(1), &ctx);
        assert_eq!(view.screen, Screen::Coverage);
        view.handle(KeyInput::Escape, &ctx);
        assert_eq!(view.screen, Screen::Tests);
        view.handle(KeyInput::Horizontal(-1), &ctx);
        assert_eq!(view.screen, Screen::Summary);
    }

    #[test]
    fn popover_consumes_navigation_but_not_actions() {
        let mut view = ViewState::new();
        let ctx = ctx(3);
        view.handle(KeyInput::Enter, &ctx);
        view.handle(KeyInput::Enter, &ctx);
        assert!(view.popover.visible);

        view.popover.body_height = 5;
        view.handle(KeyInput::Vertical(1), &ctx);
        assert_eq!(view.popover.scroll, 1);
        assert_eq!(view.tests.selected, 1);
        for _ in 0..20 {
            view.handle(KeyInput::Vertical(1), &ctx);
        }
        assert_eq!(view.popover.scroll, 7);

        assert_eq!(view.handle(KeyInput::Enter, &ctx), ViewEvent::Execute);
        assert_eq!(
            view.handle(KeyInput::Action(Action::Rerun), &ctx),
            ViewEvent::Action(Action::Rerun)
        );
        assert!(view.popover.visible);

        view.handle(KeyInput::Horizontal(-1), &ctx);
        assert!(!view.popover.visible);
        assert_eq!(view.screen, Screen::Tests);
    }

    #[test]
    fn popover_right_advances_to_coverage() {
        let mut view = ViewState::new();
        let ctx = ctx(1);
        view.handle(KeyInput::Enter, &ctx);
        view.handle(KeyInput::Enter, &ctx);
        view.handle(KeyInput::Horizontal(1), &ctx);
        assert!(!view.popover.visible);
        assert_eq!(view.screen, Screen::Coverage);
    }

    #[test]
    fn page_keys_switch_package_and_close_popover() {
        let mut view = ViewState::new();
        let ctx = ctx(3);
        view.handle(KeyInput::Enter, &ctx);
        view.handle(KeyInput::Vertical(1), &ctx);
        view.handle(KeyInput::Enter, &ctx);
        view.handle(KeyInput::VerticalPage(1), &ctx);
        assert_eq!(view.selected_package(), 1);
        assert!(!view.popover.visible);
        assert_eq!(view.tests.selected, 0);
        assert_eq!(view.screen, Screen::Tests);
    }

    #[test]
    fn help_swallows_everything_but_escape() {
        let mut view = ViewState::new();
        let ctx = ctx(3);
        view.handle(KeyInput::Action(Action::Help), &ctx);
        assert!(view.help_visible);
        assert_eq!(
            view.handle(KeyInput::Action(Action::Quit), &ctx),
            ViewEvent::None
        );
        view.handle(KeyInput::Vertical(1), &ctx);
        assert_eq!(view.selected_package(), 0);
        view.handle(KeyInput::Escape, &ctx);
        assert!(!view.help_visible);
    }

    #[test]
    fn coverage_enter_executes_on_file_rows_only() {
        let mut view = ViewState::new();
        let ctx = ctx(1);
        view.screen = Screen::Coverage;
        assert_eq!(view.handle(KeyInput::Enter, &ctx), ViewEvent::Execute);
        view.coverage.selected = 3;
        assert_eq!(view.handle(KeyInput::Enter, &ctx), ViewEvent::None);
    }

    #[test]
    fn idle_timer_dims_and_key_resets() {
        let mut view = ViewState::new();
        let start = Instant::now();
        view.touch(start);
        view.tick(start + Duration::from_secs(1));
        assert!(!view.cursor_dimmed);
        view.tick(start + IDLE_DIM_AFTER);
        assert!(view.cursor_dimmed);
        view.touch(start + Duration::from_secs(4));
        assert!(!view.cursor_dimmed);
    }

    #[test]
    fn popover_box_is_capped_at_half_the_content() {
        let layout = popover_layout(40, 4, 100);
        assert_eq!(layout.box_height, 20);
        assert_eq!(layout.body_height, 14);
        assert_eq!(layout.list_height, 20);

        let small = popover_layout(40, 3, 0);
        assert_eq!(small.box_height, 5);
        assert_eq!(small.list_height, 35);

        let tiny = popover_layout(6, 4, 10);
        assert_eq!(tiny.body_height, 0);
        assert_eq!(tiny.box_height, 3);
    }

    #[test]
    fn failed_popover_has_divider_and_message_body() {
        let content = popover_content("src/a.test.ts", &failed_test("expected 1\nreceived 2"));
        assert_eq!(content.header_lines(), 4);
        assert_eq!(
            content.body,
            vec!["duration: 4ms", "", "expected 1", "received 2"]
        );

        let mut passed = failed_test("");
        passed.status = TestStatus::Passed;
        let content = popover_content("src/a.test.ts", &passed);
        assert_eq!(content.header_lines(), 3);
        assert!(content.body.is_empty());
        assert_eq!(content.status, "✓ passed · 4ms");
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn selected_row_stays_visible(
                total in 1usize..200,
                visible in 1usize..60,
                selected_seed in 0usize..200,
                scroll in 0usize..400,
            ) {
                let selected = selected_seed % total;
                let adjusted = smart_scroll(selected, scroll, visible, total);
                prop_assert!(adjusted <= total.saturating_sub(visible));
                prop_assert!(selected >= adjusted);
                prop_assert!(selected < adjusted + visible);
            }

            #[test]
            fn movement_lands_on_selectable_rows(
                rows in proptest::collection::vec(any::<bool>(), 1..40),
                start in 0usize..40,
                down in any::<bool>(),
            ) {
                prop_assume!(rows.iter().any(|row| *row));
                let next = move_selection(&rows, start, if down { 1 } else { -1 });
                prop_assert!(next < rows.len());
                prop_assert!(rows[next]);
            }
        }
    }
}
