#![forbid(unsafe_code)]

pub mod app;

use std::io;
use std::io::IsTerminal as _;

use crate::error::ScriptgateError;

pub type Term = ratatui::Terminal<ratatui::backend::CrosstermBackend<io::Stdout>>;

#[must_use]
pub fn is_tty() -> bool {
    std::io::stdout().is_terminal()
}

pub fn init_terminal() -> Result<Term, ScriptgateError> {
    use crossterm::terminal::{EnterAlternateScreen, enable_raw_mode};

    enable_raw_mode()
        .map_err(|e| ScriptgateError::Other(format!("failed to enable raw mode: {e}")))?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, EnterAlternateScreen)
        .map_err(|e| ScriptgateError::Other(format!("failed to enter alt screen: {e}")))?;
    ratatui::Terminal::new(ratatui::backend::CrosstermBackend::new(stdout))
        .map_err(|e| ScriptgateError::Other(format!("failed to create terminal: {e}")))
}

pub fn restore_terminal(mut terminal: Term) -> Result<(), ScriptgateError> {
    use crossterm::terminal::{LeaveAlternateScreen, disable_raw_mode};

    disable_raw_mode()
        .map_err(|e| ScriptgateError::Other(format!("failed to disable raw mode: {e}")))?;
    crossterm::execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .map_err(|e| ScriptgateError::Other(format!("failed to leave alt screen: {e}")))?;
    terminal
        .show_cursor()
        .map_err(|e| ScriptgateError::Other(format!("failed to show cursor: {e}")))
}

/// Restores the terminal on every exit path, including panics.
pub struct TerminalGuard {
    terminal: Option<Term>,
}

impl TerminalGuard {
    #[must_use]
    pub fn new(terminal: Term) -> Self {
        Self {
            terminal: Some(terminal),
        }
    }

    pub fn terminal(&mut self) -> Option<&mut Term> {
        self.terminal.as_mut()
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if let Some(terminal) = self.terminal.take() {
            let _ = restore_terminal(terminal);
        }
    }
}
