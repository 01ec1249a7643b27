//! Interactive terminal rendering.
//!
//! The summary screen draws on the primary buffer; the tests and coverage
//! screens switch to the alternate buffer and leaving them restores and
//! clears the primary one. Drawing is a projection of [`App`]: the only thing
//! written back is how many rows fit, through the view's `set_*` methods.

use std::io::{self, Stdout};

use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, Clear, ClearType, EnterAlternateScreen,
    LeaveAlternateScreen, SetTitle,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, BorderType, Borders, Clear as ClearWidget, Paragraph};
use ratatui::{Frame, Terminal};

use crate::app::{App, StatusLevel};
use crate::coverage::{grade, FileCoverage, Grade, PackageCoverage, Thresholds};
use crate::package::{Package, RunState, RunStatus};
use crate::report::TestStatus;
use crate::summary::format_duration;
use crate::view::{popover_content, popover_layout, CoverageRow, PopoverContent, Screen, TestRow};

/// Type alias for the specific terminal backend used.
pub type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

/// Owns the terminal and remembers which buffer is showing.
pub struct TerminalSession {
    terminal: TuiTerminal,
    alternate: bool,
}

impl TerminalSession {
    /// Enables raw mode on the primary buffer.
    pub fn start() -> io::Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, Clear(ClearType::All))?;
        let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
        terminal.clear()?;
        Ok(Self {
            terminal,
            alternate: false,
        })
    }

    /// Restores the terminal to its original state.
    pub fn restore(mut self) -> io::Result<()> {
        disable_raw_mode()?;
        if self.alternate {
            execute!(self.terminal.backend_mut(), LeaveAlternateScreen)?;
        }
        self.terminal.show_cursor()?;
        Ok(())
    }

    fn sync_buffer(&mut self, screen: Screen) -> io::Result<()> {
        let want_alternate = screen != Screen::Summary;
        if want_alternate == self.alternate {
            return Ok(());
        }
        if want_alternate {
            execute!(self.terminal.backend_mut(), EnterAlternateScreen)?;
        } else {
            execute!(
                self.terminal.backend_mut(),
                LeaveAlternateScreen,
                Clear(ClearType::All)
            )?;
        }
        self.alternate = want_alternate;
        self.terminal.clear()
    }

    /// Draws the current application state.
    pub fn draw(&mut self, app: &mut App) -> io::Result<()> {
        self.sync_buffer(app.view.screen)?;
        execute!(self.terminal.backend_mut(), SetTitle(window_title(app)))?;
        self.terminal.draw(|frame| render(frame, app))?;
        Ok(())
    }
}

fn render(frame: &mut Frame, app: &mut App) {
    let area = frame.size();
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Min(1), Constraint::Length(1)])
        .split(area);

    frame.render_widget(Paragraph::new(header_line(app)), vertical[0]);
    match app.view.screen {
        Screen::Summary => render_summary(frame, app, vertical[1]),
        Screen::Tests => render_tests(frame, app, vertical[1]),
        Screen::Coverage => render_coverage(frame, app, vertical[1]),
    }
    frame.render_widget(Paragraph::new(footer_line(app)), vertical[2]);

    if app.view.help_visible {
        let popup_area = centered_rect(60, 70, area);
        let help_block = Paragraph::new(HELP.join("\n"))
            .block(
                Block::default()
                    .title("Help")
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded),
            )
            .style(Style::default().bg(Color::DarkGray).fg(Color::White));
        frame.render_widget(ClearWidget, popup_area);
        frame.render_widget(help_block, popup_area);
    }
}

const HELP: &[&str] = &[
    "Navigation:",
    "  ↑/k ↓/j    Move selection",
    "  PgUp/PgDn  Page (summary) or switch package",
    "  →/l Enter  Open tests / coverage",
    "  ←/h Esc    Back",
    "",
    "Actions:",
    "  Enter      Open test detail, run enter action",
    "  r          Rerun selected package",
    "  R          Rerun all packages",
    "  c          Toggle coverage for package",
    "  C          Cycle coverage for all",
    "  w          Toggle watch mode",
    "",
    "General:",
    "  ?          Show this help (Esc closes)",
    "  q Ctrl-C   Quit",
];

fn header_line(app: &App) -> Line<'static> {
    let totals = app.scheduler.totals();
    let mut spans = vec![Span::styled("testrack", Style::default().add_modifier(Modifier::BOLD))];
    match app.view.screen {
        Screen::Summary => {}
        screen => {
            if let Some(package) = app.selected_package() {
                let label = if screen == Screen::Tests { "tests" } else { "coverage" };
                spans.push(Span::raw(format!(" · {} · {label}", package.name)));
            }
        }
    }
    spans.push(Span::raw("  "));
    spans.extend(count_spans(totals.passed, totals.skipped, totals.failed));
    if totals.running > 0 {
        spans.push(Span::styled(
            format!("  {} {} running", app.spinner(), totals.running),
            Style::default().fg(Color::Cyan),
        ));
    }
    if totals.broken > 0 {
        spans.push(Span::styled(
            format!("  {} broken", totals.broken),
            Style::default().fg(Color::Magenta),
        ));
    }
    if app.watch_enabled {
        spans.push(Span::styled("  [watch]", Style::default().fg(Color::Yellow)));
    }
    if app.scheduler.pending_run_all() {
        spans.push(Span::styled("  [rerun all queued]", Style::default().fg(Color::DarkGray)));
    }
    Line::from(spans)
}

fn footer_line(app: &App) -> Line<'static> {
    if let Some((text, level)) = app.status_message() {
        let style = match level {
            StatusLevel::Info => Style::default().fg(Color::Cyan),
            StatusLevel::Warning => Style::default().fg(Color::Yellow),
        };
        return Line::from(Span::styled(text.to_string(), style));
    }
    let hints = match app.view.screen {
        Screen::Summary => "↑/↓ select · Enter tests · r rerun · R all · c/C coverage · w watch · ? help · q quit",
        Screen::Tests if app.view.popover.visible => "↑/↓ scroll · Enter open · Esc close · → coverage · PgUp/PgDn package",
        Screen::Tests => "↑/↓ select · Enter detail · → coverage · Esc summary · PgUp/PgDn package",
        Screen::Coverage => "↑/↓ select · Enter open file · Esc tests · PgUp/PgDn package",
    };
    Line::from(Span::styled(hints, Style::default().fg(Color::DarkGray)))
}

fn render_summary(frame: &mut Frame, app: &mut App, area: Rect) {
    let height = area.height as usize;
    app.view.set_summary_height(height, app.scheduler.len());
    if app.scheduler.is_empty() {
        frame.render_widget(
            Paragraph::new("No packages found").style(Style::default().fg(Color::DarkGray)),
            area,
        );
        return;
    }

    let name_width = app
        .scheduler
        .packages()
        .iter()
        .map(|package| package.name.chars().count())
        .max()
        .unwrap_or(0)
        .min(40);
    let cursor = app.view.summary;
    let mut lines = Vec::with_capacity(height);
    for id in cursor.scroll..(cursor.scroll + height).min(app.scheduler.len()) {
        let (Some(package), Some(state)) = (app.scheduler.package(id), app.scheduler.state(id))
        else {
            continue;
        };
        let selected = id == cursor.selected;
        let coverage_on = app.scheduler.coverage_flags().is_on(id);
        let queued = app.scheduler.is_queued(id);
        lines.push(summary_row(
            app,
            package,
            state,
            SummaryRowOpts {
                selected,
                coverage_on,
                queued,
                name_width,
            },
        ));
    }
    frame.render_widget(Paragraph::new(Text::from(lines)), area);
}

struct SummaryRowOpts {
    selected: bool,
    coverage_on: bool,
    queued: bool,
    name_width: usize,
}

fn summary_row(app: &App, package: &Package, state: &RunState, opts: SummaryRowOpts) -> Line<'static> {
    let runnable = package.is_runnable();
    let mut spans = vec![cursor_span(opts.selected, app.view.cursor_dimmed)];
    let (glyph, glyph_style) = status_glyph(state, app.spinner());
    spans.push(Span::styled(format!("{glyph} "), glyph_style));
    let name = pad(&truncate(&package.name, opts.name_width), opts.name_width);
    let name_style = if !runnable {
        Style::default().fg(Color::DarkGray)
    } else if opts.selected {
        Style::default().add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    };
    spans.push(Span::styled(name, name_style));
    spans.push(Span::raw("  "));

    match state.status {
        RunStatus::NoTests => {
            spans.push(Span::styled("no test script", Style::default().fg(Color::DarkGray)));
            return Line::from(spans);
        }
        RunStatus::UnknownRunner => {
            spans.push(Span::styled("unknown runner", Style::default().fg(Color::DarkGray)));
            return Line::from(spans);
        }
        _ => {}
    }

    spans.extend(count_spans(state.passed, state.skipped, state.failed));
    let duration = state
        .display_duration()
        .map(format_duration)
        .unwrap_or_else(|| "-".into());
    spans.push(Span::styled(format!("  {duration:>8}"), Style::default().fg(Color::DarkGray)));

    let coverage = state.coverage.as_ref();
    let thresholds = coverage.and_then(|c| c.summary.thresholds);
    spans.push(Span::raw("  "));
    spans.extend(coverage_cells(
        coverage.map(|c| (c.summary.lines_pct, c.summary.branches_pct, c.summary.functions_pct)),
        thresholds,
    ));
    if opts.coverage_on {
        spans.push(Span::styled(" ◆cov", Style::default().fg(Color::Blue)));
    }
    if opts.queued {
        spans.push(Span::styled(" ↻", Style::default().fg(Color::DarkGray)));
    }
    if let Some(error) = &state.spawn_error {
        spans.push(Span::styled(
            format!("  {}", truncate(error, 60)),
            Style::default().fg(Color::Magenta),
        ));
    } else if state.is_broken() {
        let code = state.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into());
        spans.push(Span::styled(
            format!("  exited {code}"),
            Style::default().fg(Color::Magenta),
        ));
    }
    Line::from(spans)
}

fn render_tests(frame: &mut Frame, app: &mut App, area: Rect) {
    let rows = app.test_rows();
    let content = if app.view.popover.visible {
        app.selected_test(&rows)
            .map(|(file, test)| popover_content(file, test))
    } else {
        None
    };

    let (list_area, popover_area) = match &content {
        Some(content) => {
            let layout = popover_layout(area.height as usize, content.header_lines(), content.body.len());
            app.view.set_popover_body_height(layout.body_height, content.body.len());
            let split = Layout::default()
                .direction(Direction::Vertical)
                .constraints([
                    Constraint::Length(layout.list_height as u16),
                    Constraint::Length(layout.box_height as u16),
                ])
                .split(area);
            (split[0], Some(split[1]))
        }
        None => (area, None),
    };

    let list_height = list_area.height as usize;
    let hidden_below = |scroll: usize, height: usize| rows.len().saturating_sub(scroll + height);
    // Reserve a row for the continuation indicator when the popover hides rows.
    let mut visible = list_height;
    if popover_area.is_some() && hidden_below(app.view.tests.scroll, visible) > 0 {
        visible = visible.saturating_sub(1);
    }
    app.view.set_tests_height(visible, rows.len());

    let Some(state) = app.selected_state() else {
        return;
    };
    let cursor = app.view.tests;
    let show_cursor = popover_area.is_none();
    let mut lines: Vec<Line> = Vec::with_capacity(list_height);
    if rows.is_empty() {
        let text = match state.status {
            RunStatus::Running => "Waiting for output…",
            RunStatus::Pending => "Not run yet",
            _ => "No output",
        };
        lines.push(Line::from(Span::styled(text, Style::default().fg(Color::DarkGray))));
    }
    for (idx, row) in rows.iter().enumerate().skip(cursor.scroll).take(visible) {
        let selected = idx == cursor.selected;
        lines.push(test_row_line(app, state, row, selected, show_cursor));
    }
    let hidden = hidden_below(cursor.scroll, visible);
    if popover_area.is_some() && hidden > 0 {
        lines.push(Line::from(Span::styled(
            format!("  ⋯ {hidden} more"),
            Style::default().fg(Color::DarkGray),
        )));
    }
    frame.render_widget(Paragraph::new(Text::from(lines)), list_area);

    if let (Some(content), Some(box_area)) = (content, popover_area) {
        render_popover(frame, app, &content, box_area);
    }
}

fn test_row_line(app: &App, state: &RunState, row: &TestRow, selected: bool, show_cursor: bool) -> Line<'static> {
    let report = state.test_report.as_ref();
    match row {
        TestRow::SuiteHeader(suite) => {
            let file = report
                .and_then(|r| r.suites.get(*suite))
                .map(|s| s.file.clone())
                .unwrap_or_default();
            Line::from(Span::styled(file, Style::default().add_modifier(Modifier::BOLD)))
        }
        TestRow::Test { suite, test } => {
            let Some(test) = report.and_then(|r| r.suites.get(*suite)).and_then(|s| s.tests.get(*test)) else {
                return Line::default();
            };
            let (glyph, style) = match test.status {
                TestStatus::Passed => ("✓", Style::default().fg(Color::Green)),
                TestStatus::Skipped => ("○", Style::default().fg(Color::Yellow)),
                TestStatus::Failed => ("✗", Style::default().fg(Color::Red)),
            };
            let cursor = if show_cursor {
                cursor_span(selected, app.view.cursor_dimmed)
            } else {
                Span::raw("  ")
            };
            let name_style = if selected {
                Style::default().add_modifier(Modifier::REVERSED)
            } else {
                Style::default()
            };
            Line::from(vec![
                cursor,
                Span::styled(format!("{glyph} "), style),
                Span::styled(test.name.clone(), name_style),
                Span::styled(
                    format!("  {}", format_duration(test.duration)),
                    Style::default().fg(Color::DarkGray),
                ),
            ])
        }
        TestRow::Blank => Line::default(),
        TestRow::Totals => {
            let mut spans = vec![Span::raw(format!("{} tests  ", state.test_count))];
            spans.extend(count_spans(state.passed, state.skipped, state.failed));
            if let Some(duration) = state.duration {
                spans.push(Span::styled(
                    format!("  {}", format_duration(duration)),
                    Style::default().fg(Color::DarkGray),
                ));
            }
            Line::from(spans)
        }
        TestRow::Output(text) => Line::from(Span::styled(text.clone(), Style::default().fg(Color::Gray))),
    }
}

fn render_popover(frame: &mut Frame, app: &App, content: &PopoverContent, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(Style::default().fg(Color::DarkGray));
    let inner = block.inner(area);
    let status_style = if content.divider {
        Style::default().fg(Color::Red)
    } else {
        Style::default().fg(Color::Green)
    };
    let mut lines = vec![
        Line::from(Span::styled(content.title.clone(), Style::default().add_modifier(Modifier::BOLD))),
        Line::from(Span::styled(content.file.clone(), Style::default().fg(Color::DarkGray))),
        Line::from(Span::styled(content.status.clone(), status_style)),
    ];
    if content.divider {
        lines.push(Line::from(Span::styled(
            "─".repeat(inner.width as usize),
            Style::default().fg(Color::DarkGray),
        )));
    }
    let body_height = app.view.popover.body_height;
    lines.extend(
        content
            .body
            .iter()
            .skip(app.view.popover.scroll)
            .take(body_height)
            .map(|line| Line::from(line.clone())),
    );
    frame.render_widget(ClearWidget, area);
    frame.render_widget(Paragraph::new(Text::from(lines)).block(block), area);
}

fn render_coverage(frame: &mut Frame, app: &mut App, area: Rect) {
    let rows = app.coverage_rows();
    let split = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Min(0)])
        .split(area);
    app.view.set_coverage_height(split[1].height as usize, rows.len());

    let Some(state) = app.selected_state() else {
        return;
    };
    let Some(coverage) = state.coverage.as_ref() else {
        let text = if state.coverage_requested && state.is_running() {
            "Collecting coverage…"
        } else if app.scheduler.coverage_flags().is_on(app.view.selected_package()) {
            "No coverage data for the last run"
        } else {
            "Coverage is off for this package. Press c to enable it."
        };
        frame.render_widget(
            Paragraph::new(text).style(Style::default().fg(Color::DarkGray)),
            area,
        );
        return;
    };

    let path_width = coverage
        .files
        .iter()
        .map(|file| file.path.chars().count())
        .max()
        .unwrap_or(0)
        .clamp(8, 60);
    frame.render_widget(
        Paragraph::new(Line::from(Span::styled(
            format!("  {}  {:>7}  {:>7}  {:>7}", pad("File", path_width), "Lines", "Branch", "Funcs"),
            Style::default().fg(Color::DarkGray),
        ))),
        split[0],
    );

    let cursor = app.view.coverage;
    let lines: Vec<Line> = rows
        .iter()
        .enumerate()
        .skip(cursor.scroll)
        .take(split[1].height as usize)
        .map(|(idx, row)| coverage_row_line(app, coverage, *row, idx == cursor.selected, path_width))
        .collect();
    frame.render_widget(Paragraph::new(Text::from(lines)), split[1]);
}

fn coverage_row_line(
    app: &App,
    coverage: &PackageCoverage,
    row: CoverageRow,
    selected: bool,
    path_width: usize,
) -> Line<'static> {
    let thresholds = coverage.summary.thresholds;
    match row {
        CoverageRow::File(idx) => {
            let Some(file) = coverage.files.get(idx) else {
                return Line::default();
            };
            let mut spans = vec![cursor_span(selected, app.view.cursor_dimmed)];
            spans.push(Span::raw(pad(&truncate(&file.path, path_width), path_width)));
            spans.push(Span::raw("  "));
            spans.extend(coverage_cells(Some(file_pcts(file)), thresholds));
            Line::from(spans)
        }
        CoverageRow::Blank => Line::default(),
        CoverageRow::Totals => {
            let mut spans = vec![
                Span::raw("  "),
                Span::styled(pad("All files", path_width), Style::default().add_modifier(Modifier::BOLD)),
                Span::raw("  "),
            ];
            let summary = &coverage.summary;
            spans.extend(coverage_cells(
                Some((summary.lines_pct, summary.branches_pct, summary.functions_pct)),
                thresholds,
            ));
            Line::from(spans)
        }
    }
}

fn file_pcts(file: &FileCoverage) -> (Option<f64>, Option<f64>, Option<f64>) {
    (file.lines_pct(), file.branches_pct(), file.functions_pct())
}

/// Three percentage cells coloured against thresholds; dashes when missing.
fn coverage_cells(
    pcts: Option<(Option<f64>, Option<f64>, Option<f64>)>,
    thresholds: Option<Thresholds>,
) -> Vec<Span<'static>> {
    let (lines, branches, functions) = pcts.unwrap_or((None, None, None));
    let t = thresholds.unwrap_or_default();
    vec![
        pct_cell(lines, t.lines),
        Span::raw("  "),
        pct_cell(branches, t.branches),
        Span::raw("  "),
        pct_cell(functions, t.functions),
    ]
}

fn pct_cell(pct: Option<f64>, threshold: Option<f64>) -> Span<'static> {
    match pct {
        Some(pct) => Span::styled(format!("{pct:>6.1}%"), grade_style(grade(pct, threshold))),
        None => Span::styled(format!("{:>7}", "–"), Style::default().fg(Color::DarkGray)),
    }
}

fn grade_style(grade: Grade) -> Style {
    match grade {
        Grade::Good => Style::default().fg(Color::Green),
        Grade::Warn => Style::default().fg(Color::Yellow),
        Grade::Bad => Style::default().fg(Color::Red),
    }
}

fn count_spans(passed: u32, skipped: u32, failed: u32) -> Vec<Span<'static>> {
    let failed_style = if failed > 0 {
        Style::default().fg(Color::Red).add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(Color::DarkGray)
    };
    vec![
        Span::styled(format!("✓ {passed:<4}"), Style::default().fg(Color::Green)),
        Span::styled(format!(" ○ {skipped:<4}"), Style::default().fg(Color::Yellow)),
        Span::styled(format!(" ✗ {failed:<4}"), failed_style),
    ]
}

fn status_glyph(state: &RunState, spinner: char) -> (char, Style) {
    match state.status {
        RunStatus::Running => (spinner, Style::default().fg(Color::Cyan)),
        RunStatus::Pending => ('·', Style::default().fg(Color::DarkGray)),
        RunStatus::NoTests | RunStatus::UnknownRunner => ('–', Style::default().fg(Color::DarkGray)),
        RunStatus::Done if state.is_broken() => ('!', Style::default().fg(Color::Magenta)),
        RunStatus::Done if state.has_failures() => ('✗', Style::default().fg(Color::Red)),
        RunStatus::Done => ('✓', Style::default().fg(Color::Green)),
    }
}

fn cursor_span(selected: bool, dimmed: bool) -> Span<'static> {
    if !selected {
        return Span::raw("  ");
    }
    let style = if dimmed {
        Style::default().fg(Color::DarkGray)
    } else {
        Style::default().fg(Color::Cyan)
    };
    Span::styled("▶ ", style)
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn window_title(app: &App) -> String {
    match app.selected_package() {
        Some(package) if app.view.screen != Screen::Summary => format!("testrack · {}", package.name),
        _ => "testrack".to_string(),
    }
}

fn pad(text: &str, width: usize) -> String {
    let len = text.chars().count();
    if len >= width {
        return text.to_string();
    }
    format!("{text}{}", " ".repeat(width - len))
}

fn truncate(text: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out = text.chars().take(max.saturating_sub(1)).collect::<String>();
    out.push('~');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_marks_cut_text() {
        assert_eq!(truncate("packages", 5), "pack~");
        assert_eq!(truncate("ui", 5), "ui");
        assert_eq!(truncate("ui", 0), "");
    }

    #[test]
    fn missing_percentages_render_as_dashes() {
        let cells = coverage_cells(None, None);
        assert_eq!(cells[0].content.trim(), "–");
        let cell = pct_cell(Some(42.0), Some(40.0));
        assert_eq!(cell.content, "  42.0%");
        assert_eq!(cell.style.fg, Some(Color::Green));
        assert_eq!(pct_cell(Some(42.0), None).style.fg, Some(Color::Red));
    }
}
