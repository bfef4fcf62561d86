use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

/// Stable identity of one fan-out member, assigned at `add` time.
///
/// Members are keyed by this identity rather than by the sink value, so two
/// sinks that happen to compare equal stay distinguishable.
pub type SinkId = Uuid;

/// A broadcast sink: one write goes to every registered member.
///
/// The member set is guarded by a single mutex held for the whole fan-out
/// pass, so `add` during an in-flight broadcast is safe -- the new member
/// simply may or may not see that chunk. A member whose write errors or
/// comes up short is removed before the next pass; no member's failure is
/// ever visible to the caller or to any other member. The pilot's output
/// pipe must never stall on a slow or dead viewer.
#[derive(Clone)]
pub struct FanoutWriter {
    members: Arc<Mutex<HashMap<SinkId, Box<dyn Write + Send>>>>,
}

impl FanoutWriter {
    pub fn new() -> Self {
        Self {
            members: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a new member sink. There is no explicit detach: membership
    /// shrinks automatically when a member's write fails.
    pub fn add(&self, sink: Box<dyn Write + Send>) -> SinkId {
        let id = Uuid::new_v4();
        self.members.lock().insert(id, sink);
        id
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }

    /// Deliver `buf` to every member, pruning the ones that fail.
    pub fn broadcast(&self, buf: &[u8]) {
        let mut members = self.members.lock();
        let mut dead = Vec::new();
        for (id, sink) in members.iter_mut() {
            match sink.write(buf) {
                Ok(n) if n == buf.len() => {}
                Ok(n) => {
                    tracing::debug!(member = %id, wrote = n, requested = buf.len(),
                        "short write, dropping fan-out member");
                    dead.push(*id);
                }
                Err(e) => {
                    tracing::debug!(member = %id, error = %e, "dropping fan-out member");
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            members.remove(&id);
        }
    }
}

impl Default for FanoutWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for FanoutWriter {
    /// Always reports the full buffer as written, regardless of member
    /// failures.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.broadcast(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Records everything written to it.
    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<u8>>>);

    impl Recorder {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().clone()
        }
    }

    impl Write for Recorder {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Fails every write after the first `ok_writes` successes.
    struct FailAfter {
        ok_writes: usize,
        seen: Recorder,
    }

    impl Write for FailAfter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.ok_writes == 0 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
            }
            self.ok_writes -= 1;
            self.seen.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Accepts only half of each buffer.
    struct ShortWriter;

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len() / 2)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn every_member_receives_every_write_in_order() {
        let fanout = FanoutWriter::new();
        let a = Recorder::default();
        let b = Recorder::default();
        fanout.add(Box::new(a.clone()));
        fanout.add(Box::new(b.clone()));

        fanout.broadcast(b"hello ");
        fanout.broadcast(b"world");

        assert_eq!(a.contents(), b"hello world");
        assert_eq!(b.contents(), b"hello world");
    }

    #[test]
    fn caller_always_sees_full_success() {
        let mut fanout = FanoutWriter::new();
        fanout.add(Box::new(ShortWriter));
        fanout.add(Box::new(FailAfter {
            ok_writes: 0,
            seen: Recorder::default(),
        }));

        let n = fanout.write(b"payload").unwrap();
        assert_eq!(n, 7);
    }

    #[test]
    fn erroring_member_is_pruned_without_affecting_others() {
        let fanout = FanoutWriter::new();
        let survivor = Recorder::default();
        let flaky_seen = Recorder::default();
        fanout.add(Box::new(survivor.clone()));
        fanout.add(Box::new(FailAfter {
            ok_writes: 1,
            seen: flaky_seen.clone(),
        }));
        assert_eq!(fanout.member_count(), 2);

        fanout.broadcast(b"first");
        fanout.broadcast(b"second");
        fanout.broadcast(b"third");

        assert_eq!(fanout.member_count(), 1);
        assert_eq!(survivor.contents(), b"firstsecondthird");
        // The flaky member saw only the writes before its failure.
        assert_eq!(flaky_seen.contents(), b"first");
    }

    #[test]
    fn short_writing_member_is_treated_as_dead() {
        let fanout = FanoutWriter::new();
        fanout.add(Box::new(ShortWriter));
        assert_eq!(fanout.member_count(), 1);

        fanout.broadcast(b"data");
        assert_eq!(fanout.member_count(), 0);
    }

    #[test]
    fn empty_set_broadcast_is_a_no_op() {
        let mut fanout = FanoutWriter::new();
        assert_eq!(fanout.write(b"into the void").unwrap(), 13);
    }

    #[test]
    fn member_added_between_broadcasts_sees_later_chunks_only() {
        let fanout = FanoutWriter::new();
        let early = Recorder::default();
        fanout.add(Box::new(early.clone()));

        fanout.broadcast(b"one");

        let late = Recorder::default();
        fanout.add(Box::new(late.clone()));

        fanout.broadcast(b"two");

        assert_eq!(early.contents(), b"onetwo");
        assert_eq!(late.contents(), b"two");
    }
}
