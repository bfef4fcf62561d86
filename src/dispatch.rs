//! Role admission and relay pumps for inbound streaming connections.
//!
//! A connection to `/{name}` is classified in admission order -- pilot, then
//! copilot, then viewer -- against the session's current state, claiming the
//! corresponding slot atomically before the transport upgrade completes.
//! Each admitted connection then runs one pump task until its own transport
//! or the session ends.

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};

use crate::session::{AdmitError, Session, SessionRegistry};
use crate::sink::ChannelWriter;

/// Single control byte sent to the pilot when a copilot attaches. BEL --
/// most terminals render it as an audible or visual ding.
pub const ATTENTION_BYTE: u8 = 0x07;

/// An admitted role, carrying the RAII claim on its session slot.
pub enum Admission {
    Pilot(PilotSeat),
    Copilot(CopilotSeat),
    Viewer,
}

impl Admission {
    pub fn role_name(&self) -> &'static str {
        match self {
            Admission::Pilot(_) => "pilot",
            Admission::Copilot(_) => "copilot",
            Admission::Viewer => "viewer",
        }
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.role_name())
    }
}

/// Claim on the pilot slot.
///
/// Dropping the seat -- pump finished, transport died, or the upgrade
/// callback never ran -- fires the session's end signal and evicts the
/// session from the registry so the name becomes reusable. There is exactly
/// one pilot; its departure is always terminal.
pub struct PilotSeat {
    session: Session,
    registry: SessionRegistry,
    pub(crate) input_rx: tokio::sync::mpsc::Receiver<Bytes>,
}

impl Drop for PilotSeat {
    fn drop(&mut self) {
        self.session.end();
        self.registry.remove(&self.session.name);
        tracing::info!(session = %self.session.name, "session ended");
    }
}

/// Claim on the copilot slot. Dropping it vacates the slot and reverts the
/// copilot relay to buffering.
pub struct CopilotSeat {
    session: Session,
    id: uuid::Uuid,
}

impl Drop for CopilotSeat {
    fn drop(&mut self) {
        self.session.release_copilot();
    }
}

/// Classify an upgradable inbound connection against the session state.
///
/// Evaluated in admission order: an empty pilot slot admits a pilot; an
/// occupied one falls through to copilot admission (flag set, slot vacant),
/// then to viewer admission (session not private). Anything else is a
/// rejection -- the caller refuses the handshake.
pub fn admit_stream(
    registry: &SessionRegistry,
    session: &Session,
) -> Result<Admission, AdmitError> {
    match session.claim_pilot() {
        Ok(input_rx) => {
            return Ok(Admission::Pilot(PilotSeat {
                session: session.clone(),
                registry: registry.clone(),
                input_rx,
            }))
        }
        Err(AdmitError::PilotTaken) => {}
        Err(e) => return Err(e),
    }
    match session.claim_copilot() {
        Ok(id) => {
            return Ok(Admission::Copilot(CopilotSeat {
                session: session.clone(),
                id,
            }))
        }
        // Copilot slot unavailable: fall through to viewer admission.
        Err(AdmitError::CopilotDisallowed) | Err(AdmitError::CopilotTaken) => {}
        Err(e) => return Err(e),
    }
    if session.private {
        return Err(AdmitError::PrivateSession);
    }
    Ok(Admission::Viewer)
}

/// Drive an upgraded socket in its admitted role until it ends.
pub async fn run(socket: WebSocket, session: Session, admission: Admission) {
    match admission {
        Admission::Pilot(seat) => run_pilot(socket, session, seat).await,
        Admission::Copilot(seat) => run_copilot(socket, session, seat).await,
        Admission::Viewer => run_viewer(socket, session).await,
    }
}

/// The pilot pump.
///
/// Inbound bytes are duplicated into the viewer fan-out and the copilot
/// relay on this task; both sinks absorb failures themselves and never
/// block it. The session-side input channel (copilot keystrokes, attention
/// byte) drains to the pilot's socket. A clean end-of-stream and a
/// transport error both end the session -- the seat's drop handles the
/// signal and the registry eviction.
async fn run_pilot(socket: WebSocket, session: Session, mut seat: PilotSeat) {
    tracing::info!(session = %session.name, "pilot connected");
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => session.broadcast(&data),
                    Some(Ok(Message::Text(text))) => session.broadcast(text.as_bytes()),
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(session = %session.name, "pilot stream ended");
                        break;
                    }
                    Some(Ok(_)) => {} // ping/pong answered by the transport
                    Some(Err(e)) => {
                        tracing::warn!(session = %session.name, error = %e, "pilot transport error");
                        break;
                    }
                }
            }
            input = seat.input_rx.recv() => {
                match input {
                    Some(data) => {
                        if ws_tx.send(Message::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    // seat drops here: end signal fires, registry entry is evicted.
}

/// The copilot pump.
///
/// Attaches a channel-backed sink to the copilot relay -- which first
/// replays everything buffered since the previous copilot left -- dings the
/// pilot, then bridges keystrokes to the pilot's input channel until either
/// side ends. The seat's drop vacates the slot and detaches the relay so
/// output buffers again.
async fn run_copilot(socket: WebSocket, session: Session, seat: CopilotSeat) {
    let (writer, mut out_rx) = ChannelWriter::channel();
    if let Err(e) = session.copilot_relay.attach(Box::new(writer)) {
        tracing::warn!(session = %session.name, error = %e, "copilot relay attach failed");
        return;
    }

    let Some(pilot_input) = session.pilot_input() else {
        // Admission guaranteed a pilot; its channel is never torn down.
        return;
    };
    if pilot_input
        .send(Bytes::from_static(&[ATTENTION_BYTE]))
        .await
        .is_err()
    {
        return;
    }
    tracing::info!(session = %session.name, copilot = %seat.id, "copilot connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let ended = session.ended();

    loop {
        tokio::select! {
            out = out_rx.recv() => {
                match out {
                    Some(data) => {
                        if ws_tx.send(Message::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    // Relay detached this sink after a failed write.
                    None => break,
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if pilot_input.send(data).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if pilot_input.send(Bytes::from(text.as_bytes().to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(session = %session.name, error = %e, "copilot transport error");
                        break;
                    }
                }
            }
            _ = ended.cancelled() => {
                let _ = ws_tx.send(Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: Utf8Bytes::from_static("session ended"),
                }))).await;
                break;
            }
        }
    }
    tracing::info!(session = %session.name, copilot = %seat.id, "copilot disconnected");
    // seat drops here: slot vacated, relay buffers again.
}

/// The viewer pump.
///
/// Output-only: the socket is drained solely to notice it closing; its
/// payload is never read. Fan-out pruning is the only detach path -- when
/// this task stops draining its channel, the next broadcast write fails and
/// the member is removed.
async fn run_viewer(socket: WebSocket, session: Session) {
    let (writer, mut out_rx) = ChannelWriter::channel();
    if let Err(e) = session.add_viewer(Box::new(writer)) {
        tracing::debug!(session = %session.name, error = %e, "viewer admission lost");
        return;
    }
    tracing::info!(session = %session.name, "viewer connected [websocket]");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let ended = session.ended();

    loop {
        tokio::select! {
            out = out_rx.recv() => {
                match out {
                    Some(data) => {
                        if ws_tx.send(Message::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {} // viewers are never read from
                }
            }
            _ = ended.cancelled() => {
                let _ = ws_tx.send(Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: Utf8Bytes::from_static("session ended"),
                }))).await;
                break;
            }
        }
    }
    tracing::debug!(session = %session.name, "viewer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with_pilot(registry: &SessionRegistry, name: &str, copilot: bool, private: bool) -> Session {
        let session = registry.create(name, copilot, private).unwrap();
        match admit_stream(registry, &session).unwrap() {
            Admission::Pilot(seat) => {
                // Keep the seat alive for the test's duration by leaking the
                // claim; dropping it would end the session.
                std::mem::forget(seat);
            }
            _ => panic!("first admission must be the pilot"),
        }
        session
    }

    #[test]
    fn first_stream_is_the_pilot() {
        let registry = SessionRegistry::new();
        let session = registry.create("s", true, false).unwrap();
        let admission = admit_stream(&registry, &session).unwrap();
        assert_eq!(admission.role_name(), "pilot");
        std::mem::forget(admission);
        assert!(session.has_pilot());
    }

    #[test]
    fn second_stream_becomes_copilot_when_allowed() {
        let registry = SessionRegistry::new();
        let session = session_with_pilot(&registry, "s", true, false);

        let admission = admit_stream(&registry, &session).unwrap();
        assert_eq!(admission.role_name(), "copilot");
    }

    #[test]
    fn second_stream_becomes_viewer_when_copilot_disallowed() {
        let registry = SessionRegistry::new();
        let session = session_with_pilot(&registry, "s", false, false);

        let admission = admit_stream(&registry, &session).unwrap();
        assert_eq!(admission.role_name(), "viewer");
    }

    #[test]
    fn stream_after_copilot_falls_through_to_viewer() {
        let registry = SessionRegistry::new();
        let session = session_with_pilot(&registry, "s", true, false);

        let copilot = admit_stream(&registry, &session).unwrap();
        assert_eq!(copilot.role_name(), "copilot");
        let next = admit_stream(&registry, &session).unwrap();
        assert_eq!(next.role_name(), "viewer");
    }

    #[test]
    fn private_session_rejects_everything_but_the_copilot() {
        let registry = SessionRegistry::new();
        let session = session_with_pilot(&registry, "s", true, true);

        let copilot = admit_stream(&registry, &session).unwrap();
        assert_eq!(copilot.role_name(), "copilot");

        // Copilot slot now taken; a private session has no viewer fallback.
        assert_eq!(
            admit_stream(&registry, &session).unwrap_err(),
            AdmitError::PrivateSession
        );
    }

    #[test]
    fn private_no_copilot_session_admits_only_the_pilot() {
        let registry = SessionRegistry::new();
        let session = session_with_pilot(&registry, "x", false, true);

        assert_eq!(
            admit_stream(&registry, &session).unwrap_err(),
            AdmitError::PrivateSession
        );
    }

    #[test]
    fn dropping_the_pilot_seat_ends_and_evicts() {
        let registry = SessionRegistry::new();
        let session = registry.create("gone", false, false).unwrap();
        let admission = admit_stream(&registry, &session).unwrap();

        drop(admission);

        assert!(session.is_ended());
        assert!(registry.get("gone").is_err());
        // The name is reusable immediately.
        registry.create("gone", false, false).unwrap();
    }

    #[test]
    fn dropping_the_copilot_seat_releases_the_slot() {
        let registry = SessionRegistry::new();
        let session = session_with_pilot(&registry, "s", true, false);

        let copilot = admit_stream(&registry, &session).unwrap();
        assert!(session.has_copilot());
        drop(copilot);
        assert!(!session.has_copilot());
        assert!(!session.copilot_relay.is_attached());

        // And the next stream can claim the seat again.
        let again = admit_stream(&registry, &session).unwrap();
        assert_eq!(again.role_name(), "copilot");
    }
}
