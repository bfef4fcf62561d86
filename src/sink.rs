use std::io::{self, Write};

use bytes::Bytes;
use tokio::sync::mpsc;

/// Default channel depth for per-connection output channels.
///
/// Each message is one relay chunk (typically <= 4 KiB), so 256 slots absorb
/// about 1 MiB of burst before a consumer is considered stalled.
pub const CHANNEL_CAPACITY: usize = 256;

/// An `io::Write` over a bounded mpsc sender.
///
/// Fan-out and backlog writes happen synchronously on the task that reads the
/// pilot's stream; each downstream connection drains its own channel at its
/// own pace. `try_send` keeps the relay from ever blocking on a consumer: a
/// full or closed channel reports as a write error, which the fan-out set
/// treats as a dead member and the backlog treats as a detach.
pub struct ChannelWriter {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelWriter {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }

    /// Convenience constructor returning the writer and its receiving half.
    pub fn channel() -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (Self::new(tx), rx)
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.tx.try_send(Bytes::copy_from_slice(buf)) {
            Ok(()) => Ok(buf.len()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "consumer is not keeping up",
            )),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "consumer is gone",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Flushes the inner sink after every write.
///
/// Some destinations buffer internally (a chunked HTTP response body, a
/// `BufWriter`-wrapped file). Whether a sink needs an explicit flush per
/// write is decided here, at construction, by wrapping it -- never by probing
/// the sink's type at runtime. A failed flush counts as a failed write.
pub struct FlushEach<W: Write>(pub W);

impl<W: Write> Write for FlushEach<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.0.write(buf)?;
        self.0.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_writer_delivers_chunks_in_order() {
        let (mut w, mut rx) = ChannelWriter::channel();
        assert_eq!(w.write(b"one").unwrap(), 3);
        assert_eq!(w.write(b"two").unwrap(), 3);

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn channel_writer_errors_when_consumer_dropped() {
        let (mut w, rx) = ChannelWriter::channel();
        drop(rx);

        let err = w.write(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn channel_writer_errors_when_consumer_lags() {
        let (tx, _rx) = mpsc::channel(1);
        let mut w = ChannelWriter::new(tx);

        assert!(w.write(b"fits").is_ok());
        let err = w.write(b"overflow").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    struct CountingFlusher {
        flushes: usize,
    }

    impl Write for CountingFlusher {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    #[test]
    fn flush_each_flushes_per_write() {
        let mut w = FlushEach(CountingFlusher { flushes: 0 });
        w.write(b"a").unwrap();
        w.write(b"b").unwrap();
        assert_eq!(w.0.flushes, 2);
    }

    struct FailingFlusher;

    impl Write for FailingFlusher {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "flush failed"))
        }
    }

    #[test]
    fn flush_each_surfaces_flush_failure_as_write_failure() {
        let mut w = FlushEach(FailingFlusher);
        assert!(w.write(b"a").is_err());
    }
}
