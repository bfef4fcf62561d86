//! Client side of a session: hosting (create + shell + relay) and joining.
//!
//! Both modes run a small fixed set of copy pumps in one `tokio::select!`
//! loop and stop when any pump reaches end-of-stream. Signals are observed
//! through a cancellation token the loop selects on; terminal restoration
//! is the raw-mode guard's drop, so nothing here ever exits the process
//! from a handler.

use std::io::{Read, Write};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::pty::{Pty, PtyError};
use crate::terminal::{RawModeGuard, TerminalError};

/// Where sessions live unless `-s` says otherwise.
pub const DEFAULT_SERVER: &str = "termsha.re:443";

/// One zero byte on this cadence keeps intermediaries from reaping the
/// pilot's idle connection. The byte is ordinary payload on the wire --
/// viewers see it too; that minor noise is the accepted price of liveness.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Capacity of the PTY and stdin bridge channels, matching the 4 KiB read
/// buffers on the blocking side.
const BRIDGE_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid session url: {0}")]
    InvalidUrl(String),

    #[error("broker refused the session: http status {0}")]
    SessionRefused(u16),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("pty error: {0}")]
    Pty(#[from] PtyError),

    #[error("terminal error: {0}")]
    Terminal(#[from] TerminalError),

    #[error("failed to read terminal size: {0}")]
    TerminalSize(#[source] anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A broker address plus the scheme family used to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub tls: bool,
}

impl Endpoint {
    pub fn new(host: String, tls: bool) -> Self {
        Self { host, tls }
    }

    pub fn http_base(&self) -> String {
        format!("{}://{}", if self.tls { "https" } else { "http" }, self.host)
    }

    pub fn ws_base(&self) -> String {
        format!("{}://{}", if self.tls { "wss" } else { "ws" }, self.host)
    }
}

/// Parse a session URL into the endpoint to dial and the session path.
///
/// A bare host gains the scheme's default port, and a scheme-less URL is
/// assumed to live on the scheme family selected by the TLS flag.
pub fn parse_session_url(raw: &str, tls: bool) -> Result<(Endpoint, String), ClientError> {
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("{}://{}", if tls { "https" } else { "http" }, raw)
    };
    let url =
        reqwest::Url::parse(&candidate).map_err(|_| ClientError::InvalidUrl(raw.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| ClientError::InvalidUrl(raw.to_string()))?;
    let port = url.port().unwrap_or(if tls { 443 } else { 80 });
    let endpoint = Endpoint::new(format!("{}:{}", host, port), tls);
    Ok((endpoint, url.path().to_string()))
}

/// Watch for SIGINT/SIGTERM and cancel the relay loop.
///
/// The loop owns cleanup (the raw-mode guard, the PTY); the handler only
/// observes.
fn watch_signals(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        cancel.cancel();
    });
}

/// Bridge blocking stdin reads into a channel.
fn spawn_stdin_reader() -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(BRIDGE_CAPACITY);
    tokio::task::spawn_blocking(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}

/// Create a session on the broker and host it: spawn the shell, print the
/// join banner, and relay until the shell, the connection, or local stdin
/// ends.
pub async fn host_session(
    endpoint: Endpoint,
    allow_copilot: bool,
    private: bool,
) -> Result<(), ClientError> {
    let name = Uuid::new_v4().to_string();

    // Presence of a non-empty value is how the form signals a flag.
    let form = [
        ("copilot", if allow_copilot { "true" } else { "" }),
        ("private", if private { "true" } else { "" }),
    ];
    let http = reqwest::Client::new();
    let resp = http
        .post(format!("{}/{}", endpoint.http_base(), name))
        .form(&form)
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(ClientError::SessionRefused(resp.status().as_u16()));
    }
    let banner = resp.text().await?;
    println!("{}", banner);

    let (ws, _) = connect_async(format!("{}/{}", endpoint.ws_base(), name)).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (rows, cols) = crate::terminal::terminal_size().map_err(ClientError::TerminalSize)?;
    let pty = Pty::spawn(rows, cols)?;
    let pty_reader = pty.take_reader()?;
    let pty_writer = pty.take_writer()?;

    // PTY output -> channel. Blocking reads stay off the async runtime.
    let (pty_out_tx, mut pty_out_rx) = mpsc::channel::<Bytes>(BRIDGE_CAPACITY);
    tokio::task::spawn_blocking(move || {
        let mut reader = pty_reader;
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if pty_out_tx
                        .blocking_send(Bytes::copy_from_slice(&buf[..n]))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // Channel -> PTY input.
    let (pty_in_tx, pty_in_rx) = mpsc::channel::<Bytes>(BRIDGE_CAPACITY);
    tokio::task::spawn_blocking(move || {
        let mut writer = pty_writer;
        let mut rx = pty_in_rx;
        while let Some(data) = rx.blocking_recv() {
            if writer.write_all(&data).is_err() {
                break;
            }
            let _ = writer.flush();
        }
    });

    let mut stdin_rx = spawn_stdin_reader();

    let cancel = CancellationToken::new();
    watch_signals(cancel.clone());

    let _raw = RawModeGuard::new()?;
    let mut stdout = tokio::io::stdout();
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // Shell output -> local display + broker.
            chunk = pty_out_rx.recv() => {
                match chunk {
                    Some(data) => {
                        stdout.write_all(&data).await?;
                        stdout.flush().await?;
                        if ws_tx.send(WsMessage::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    None => break, // shell exited
                }
            }
            // Local keystrokes -> shell.
            key = stdin_rx.recv() => {
                match key {
                    Some(data) => {
                        if pty_in_tx.send(data).await.is_err() {
                            break;
                        }
                    }
                    None => break, // local stdin ended
                }
            }
            // Copilot keystrokes (and the attention ding) -> shell.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Binary(data))) => {
                        if pty_in_tx.send(data).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        if pty_in_tx.send(Bytes::from(text.as_bytes().to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "session connection error");
                        break;
                    }
                }
            }
            _ = keepalive.tick() => {
                if ws_tx.send(WsMessage::Binary(Bytes::from_static(b"\x00"))).await.is_err() {
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    Ok(())
}

/// Attach to an existing session: remote stream to the local display,
/// local keystrokes to the remote (they only land if the broker admits
/// this connection as the copilot).
pub async fn join_session(endpoint: Endpoint, path: &str) -> Result<(), ClientError> {
    let (ws, _) = connect_async(format!("{}{}", endpoint.ws_base(), path)).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let mut stdin_rx = spawn_stdin_reader();

    let cancel = CancellationToken::new();
    watch_signals(cancel.clone());

    let _raw = RawModeGuard::new()?;
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Binary(data))) => {
                        stdout.write_all(&data).await?;
                        stdout.flush().await?;
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        stdout.write_all(text.as_bytes()).await?;
                        stdout.flush().await?;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "session connection error");
                        break;
                    }
                }
            }
            key = stdin_rx.recv() => {
                match key {
                    Some(data) => {
                        if ws_tx.send(WsMessage::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    Ok(())
}
