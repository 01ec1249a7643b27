//! Raw key events to semantic input.

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Rerun,
    RerunAll,
    Coverage,
    CoverageAll,
    Watch,
    Quit,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyInput {
    /// Up (-1) or down (+1).
    Vertical(i8),
    /// Page up (-1) or page down (+1).
    VerticalPage(i8),
    /// Left (-1) or right (+1).
    Horizontal(i8),
    Enter,
    Escape,
    Action(Action),
}

/// Classifies a key press. Key releases and unbound keys yield `None`.
pub fn classify(key: &KeyEvent) -> Option<KeyInput> {
    if key.kind == KeyEventKind::Release {
        return None;
    }
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        return match key.code {
            KeyCode::Char('c') | KeyCode::Char('C') => Some(KeyInput::Action(Action::Quit)),
            _ => None,
        };
    }
    let input = match key.code {
        KeyCode::Up | KeyCode::Char('k') => KeyInput::Vertical(-1),
        KeyCode::Down | KeyCode::Char('j') => KeyInput::Vertical(1),
        KeyCode::PageUp => KeyInput::VerticalPage(-1),
        KeyCode::PageDown => KeyInput::VerticalPage(1),
        KeyCode::Left | KeyCode::Char('h') => KeyInput::Horizontal(-1),
        KeyCode::Right | KeyCode::Char('l') => KeyInput::Horizontal(1),
        KeyCode::Enter => KeyInput::Enter,
        KeyCode::Esc => KeyInput::Escape,
        KeyCode::Char('r') => KeyInput::Action(Action::Rerun),
        KeyCode::Char('R') => KeyInput::Action(Action::RerunAll),
        KeyCode::Char('c') => KeyInput::Action(Action::Coverage),
        KeyCode::Char('C') => KeyInput::Action(Action::CoverageAll),
        KeyCode::Char('w') => KeyInput::Action(Action::Watch),
        KeyCode::Char('q') => KeyInput::Action(Action::Quit),
        KeyCode::Char('?') => KeyInput::Action(Action::Help),
        _ => return None,
    };
    Some(input)
}
