use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backlog::BacklogWriter;
use crate::fanout::{FanoutWriter, SinkId};

/// Capacity of the pilot's input channel (copilot keystrokes and the
/// attention byte). Keystrokes are tiny; 64 slots is ample.
const PILOT_INPUT_CAPACITY: usize = 64;

/// Validate a session name. Names must be 1-64 chars, alphanumeric/hyphens/
/// underscores/dots -- the name is a URL path segment and the session's only
/// shared secret.
pub fn validate_session_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("session name must not be empty".into());
    }
    if name.len() > 64 {
        return Err(format!("session name too long ({} chars, max 64)", name.len()));
    }
    if !name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.') {
        return Err("session name contains invalid characters".into());
    }
    Ok(())
}

/// Why an inbound connection was not admitted to a role.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmitError {
    #[error("session already has a pilot")]
    PilotTaken,
    #[error("session has no pilot yet")]
    NoPilot,
    #[error("session does not allow a copilot")]
    CopilotDisallowed,
    #[error("a copilot is already connected")]
    CopilotTaken,
    #[error("session is private")]
    PrivateSession,
}

/// The session's handle on its pilot: the channel feeding the pilot's
/// keyboard. Once installed it is never cleared -- session identity is tied
/// to its one pilot, and the pilot's departure ends the session.
struct PilotHandle {
    input: mpsc::Sender<Bytes>,
}

struct CopilotHandle {
    id: Uuid,
}

/// The unit of sharing: one pilot, zero-or-one copilot, any number of
/// viewers, bound to a name.
///
/// Cheap to clone; all mutable state lives behind `Arc`s. Slot transitions
/// are check-then-set under the slot's own lock, so "handle present" is the
/// sole admission predicate and two racing attaches cannot both win.
#[derive(Clone)]
pub struct Session {
    pub name: String,
    pub allow_copilot: bool,
    pub private: bool,
    pilot: Arc<Mutex<Option<PilotHandle>>>,
    copilot: Arc<Mutex<Option<CopilotHandle>>>,
    /// Broadcast destination for everything the pilot produces.
    pub viewers: FanoutWriter,
    /// Reconnect-tolerant feed for the copilot; buffers while no copilot is
    /// attached.
    pub copilot_relay: BacklogWriter,
    /// Fires exactly once, when the pilot's stream ends. Any number of
    /// waiters may observe it; firing it again is a no-op.
    ended: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("allow_copilot", &self.allow_copilot)
            .field("private", &self.private)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(name: String, allow_copilot: bool, private: bool) -> Self {
        Self {
            name,
            allow_copilot,
            private,
            pilot: Arc::new(Mutex::new(None)),
            copilot: Arc::new(Mutex::new(None)),
            viewers: FanoutWriter::new(),
            copilot_relay: BacklogWriter::new(),
            ended: CancellationToken::new(),
        }
    }

    /// Install the calling connection as the session's pilot.
    ///
    /// Returns the receiving half of the pilot's input channel -- keystrokes
    /// from a copilot (and the attention byte) arrive there. Fails if a
    /// pilot is already installed; the slot is never vacated.
    pub fn claim_pilot(&self) -> Result<mpsc::Receiver<Bytes>, AdmitError> {
        let mut slot = self.pilot.lock();
        if slot.is_some() {
            return Err(AdmitError::PilotTaken);
        }
        let (input, rx) = mpsc::channel(PILOT_INPUT_CAPACITY);
        *slot = Some(PilotHandle { input });
        Ok(rx)
    }

    pub fn has_pilot(&self) -> bool {
        self.pilot.lock().is_some()
    }

    /// Sender for the pilot's input channel, if a pilot is installed.
    pub fn pilot_input(&self) -> Option<mpsc::Sender<Bytes>> {
        self.pilot.lock().as_ref().map(|p| p.input.clone())
    }

    /// Install a copilot. Admission requires a pilot, the session flag, and
    /// a vacant copilot slot.
    ///
    /// The pilot slot is write-once, so reading it before taking the copilot
    /// lock cannot race with a pilot departure.
    pub fn claim_copilot(&self) -> Result<Uuid, AdmitError> {
        if !self.has_pilot() {
            return Err(AdmitError::NoPilot);
        }
        if !self.allow_copilot {
            return Err(AdmitError::CopilotDisallowed);
        }
        let mut slot = self.copilot.lock();
        if slot.is_some() {
            return Err(AdmitError::CopilotTaken);
        }
        let id = Uuid::new_v4();
        *slot = Some(CopilotHandle { id });
        Ok(id)
    }

    /// Vacate the copilot slot and revert its relay to buffering, so a
    /// future copilot can attach and replay what it missed.
    pub fn release_copilot(&self) {
        let mut slot = self.copilot.lock();
        if let Some(copilot) = slot.take() {
            tracing::debug!(session = %self.name, copilot = %copilot.id, "copilot slot released");
        }
        self.copilot_relay.detach();
    }

    pub fn has_copilot(&self) -> bool {
        self.copilot.lock().is_some()
    }

    /// Admit a viewer sink into the fan-out set. Requires a pilot and a
    /// non-private session.
    pub fn add_viewer(&self, sink: Box<dyn Write + Send>) -> Result<SinkId, AdmitError> {
        if !self.has_pilot() {
            return Err(AdmitError::NoPilot);
        }
        if self.private {
            return Err(AdmitError::PrivateSession);
        }
        Ok(self.viewers.add(sink))
    }

    /// Duplicate one chunk of pilot output into the viewer fan-out and the
    /// copilot relay. Runs synchronously on the pilot's reader task; neither
    /// sink can fail or block it.
    pub fn broadcast(&self, data: &[u8]) {
        self.viewers.broadcast(data);
        self.copilot_relay.relay(data);
    }

    /// Fire the end-of-session signal. Safe to call any number of times,
    /// from any number of tasks.
    pub fn end(&self) {
        self.ended.cancel();
    }

    pub fn is_ended(&self) -> bool {
        self.ended.is_cancelled()
    }

    /// A token that resolves when the session ends. Clone per waiter.
    pub fn ended(&self) -> CancellationToken {
        self.ended.clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session name already exists: {0}")]
    AlreadyExists(String),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("invalid session name: {0}")]
    InvalidName(String),
}

/// Concurrency-safe name → session map.
///
/// Constructed once at process start and handed into the HTTP layer, so
/// tests can run independent registries side by side. Contention is one
/// call per session lifecycle event, not per byte; a single registry-wide
/// lock is plenty.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, Session>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Atomically insert a fresh session under `name`.
    pub fn create(
        &self,
        name: &str,
        allow_copilot: bool,
        private: bool,
    ) -> Result<Session, RegistryError> {
        validate_session_name(name).map_err(RegistryError::InvalidName)?;
        let mut inner = self.inner.write();
        if inner.contains_key(name) {
            return Err(RegistryError::AlreadyExists(name.to_string()));
        }
        let session = Session::new(name.to_string(), allow_copilot, private);
        inner.insert(name.to_string(), session.clone());
        Ok(session)
    }

    pub fn get(&self, name: &str) -> Result<Session, RegistryError> {
        self.inner
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Remove the entry. Idempotent: removing an absent name is a no-op.
    pub fn remove(&self, name: &str) -> Option<Session> {
        self.inner.write().remove(name)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
