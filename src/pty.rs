use portable_pty::{native_pty_system, CommandBuilder, PtyPair, PtySize};
use std::io::{Read, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn shell: {0}")]
    SpawnShell(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to wait for child: {0}")]
    Wait(#[from] std::io::Error),
}

/// The shared shell: `$SHELL` spawned in a local PTY.
pub struct Pty {
    pair: PtyPair,
    child: Box<dyn portable_pty::Child + Send + Sync>,
}

impl Pty {
    /// Spawn `$SHELL` (fallback `/bin/sh`) sized to the hosting terminal.
    ///
    /// The child runs under a minimal explicit environment rather than the
    /// host's full one, with a prompt that marks the session as shared.
    pub fn spawn(rows: u16, cols: u16) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system.openpty(size).map_err(PtyError::OpenPty)?;

        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        let mut cmd = CommandBuilder::new(&shell);
        cmd.env_clear();
        cmd.env("PS1", "[tsh] \\W$ ");
        cmd.env(
            "TERM",
            std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string()),
        );
        if let Ok(home) = std::env::var("HOME") {
            cmd.env("HOME", home);
        }
        if let Ok(user) = std::env::var("USER") {
            cmd.env("USER", user);
        }
        cmd.env("COLUMNS", cols.to_string());
        cmd.env("LINES", rows.to_string());

        let child = pair.slave.spawn_command(cmd).map_err(PtyError::SpawnShell)?;

        Ok(Self { pair, child })
    }

    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.pair
            .master
            .try_clone_reader()
            .map_err(PtyError::CloneReader)
    }

    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.pair.master.take_writer().map_err(PtyError::TakeWriter)
    }

    pub fn wait(&mut self) -> Result<portable_pty::ExitStatus, PtyError> {
        Ok(self.child.wait()?)
    }
}
