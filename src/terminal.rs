use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to enable raw mode: {0}")]
    EnableRawMode(#[source] std::io::Error),
}

/// RAII guard for terminal raw mode.
///
/// Raw mode is needed so every keystroke (including Ctrl+C) reaches the
/// relay instead of being handled locally. Dropping the guard -- normal
/// return, error path, or panic unwind -- restores the terminal, which is
/// why nothing in the client ever exits the process from a signal handler.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self, TerminalError> {
        enable_raw_mode().map_err(TerminalError::EnableRawMode)?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Current terminal size as (rows, cols) -- the PTY convention.
///
/// crossterm reports (cols, rows), so the pair is swapped here. These same
/// numbers feed the `COLUMNS`/`LINES` environment of the shared shell.
pub fn terminal_size() -> anyhow::Result<(u16, u16)> {
    let (cols, rows) = size()?;
    Ok((rows, cols))
}
