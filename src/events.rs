//! Event definitions for the application event loop.

use crossterm::event::KeyEvent;

use crate::watch::WatchTrigger;

/// Represents an event in the application's main event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// A decoded chunk of combined stdout/stderr from a run.
    RunOutput { id: usize, chunk: String },
    /// A run exited; `None` means it was killed by a signal.
    RunExited { id: usize, code: Option<i32> },
    /// A run could not be spawned.
    RunFailed { id: usize, error: String },
    /// A debounced file change routed to a package.
    Watch(WatchTrigger),
    /// A keyboard event received from the user.
    Key(KeyEvent),
    /// The terminal window was resized.
    Resize,
    /// SIGINT or SIGTERM was delivered to testrack itself.
    Shutdown,
}
