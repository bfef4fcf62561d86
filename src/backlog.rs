use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;

struct BacklogState {
    live: Option<Box<dyn Write + Send>>,
    buffer: Vec<u8>,
}

/// A sink whose destination may come and go.
///
/// While no live sink is attached, every write lands in an internal buffer.
/// `attach` replays the whole backlog into the new sink before it goes live,
/// so a consumer that disconnects and reconnects sees exactly the stream
/// produced since the source started -- nothing missing, nothing twice.
///
/// Caller-facing writes never fail: the source's output pipe must not be
/// blocked by the state of this channel.
#[derive(Clone)]
pub struct BacklogWriter {
    state: Arc<Mutex<BacklogState>>,
}

impl BacklogWriter {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BacklogState {
                live: None,
                buffer: Vec::new(),
            })),
        }
    }

    /// Install a live sink, first flushing the buffered backlog into it.
    ///
    /// The flush is a single best-effort attempt, in original order. If it
    /// errors or comes up short, the sink stays detached, the buffer keeps
    /// the unflushed remainder, and the attach is rejected -- the caller must
    /// not assume the sink is usable.
    pub fn attach(&self, mut sink: Box<dyn Write + Send>) -> io::Result<()> {
        let mut state = self.state.lock();
        if !state.buffer.is_empty() {
            match sink.write(&state.buffer) {
                Ok(n) if n == state.buffer.len() => state.buffer.clear(),
                Ok(n) => {
                    state.buffer.drain(..n);
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "backlog flush came up short",
                    ));
                }
                Err(e) => return Err(e),
            }
        }
        state.live = Some(sink);
        Ok(())
    }

    /// Drop the live sink; subsequent writes buffer again.
    pub fn detach(&self) {
        self.state.lock().live = None;
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().live.is_some()
    }

    pub fn buffered_len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Deliver `buf` to the live sink, or buffer it.
    ///
    /// On a live-sink failure the sink is dropped and the bytes that did not
    /// make it are appended to the buffer, so the next attach replays them.
    pub fn relay(&self, buf: &[u8]) {
        let mut state = self.state.lock();
        match state.live.as_mut() {
            Some(sink) => match sink.write(buf) {
                Ok(n) if n == buf.len() => {}
                Ok(n) => {
                    tracing::debug!(wrote = n, requested = buf.len(),
                        "live sink short write, reverting to buffering");
                    state.live = None;
                    state.buffer.extend_from_slice(&buf[n..]);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "live sink failed, reverting to buffering");
                    state.live = None;
                    state.buffer.extend_from_slice(buf);
                }
            },
            None => state.buffer.extend_from_slice(buf),
        }
    }
}

impl Default for BacklogWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for BacklogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.relay(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
