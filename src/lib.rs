//! tsh - terminal sharing over the web.
//!
//! One operator (the "pilot") runs a shell locally; a broker daemon relays
//! the raw terminal byte stream to any number of read-only viewers and,
//! optionally, to a single interactive "copilot" who can type back into the
//! pilot's shell.
//!
//! ## Modes
//!
//! **Hosting** (no arguments): creates a session on the broker, spawns a
//! shell in a local PTY, and relays its I/O.
//!
//! **Joining** (session URL argument): attaches to an existing session as a
//! viewer or copilot, depending on what the session admits.
//!
//! **Daemon** (`-d`): runs the broker -- the session registry, role
//! admission, and the relay fan-out.

pub mod api;
pub mod backlog;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod fanout;
pub mod pty;
pub mod session;
pub mod sink;
pub mod terminal;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
