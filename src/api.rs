//! HTTP/WebSocket surface of the broker daemon.
//!
//! One route family does all the sharing work: `POST /{name}` creates a
//! session, and `GET /{name}` attaches to it -- as a websocket stream
//! admitted per the role state machine, as an HTTP long-poll viewer for
//! streaming CLI clients, or as a static page for browsers.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{FromRequestParts, Path, State, WebSocketUpgrade},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;

use crate::config::DaemonConfig;
use crate::dispatch;
use crate::session::{AdmitError, RegistryError, Session, SessionRegistry};
use crate::sink::{ChannelWriter, FlushEach, CHANNEL_CAPACITY};

const BANNER: &str = "\
tsh session ready.

  Session URL: {url}

Anyone with the URL can attach; the first interactive joiner becomes the
copilot if the session allows one.
";

/// Placeholder page for plain browser hits. Browser rendering of the live
/// stream is not something the daemon does; point people at a terminal.
const VIEWER_PAGE: &str = "<!doctype html>
<html>
<head><title>tsh</title></head>
<body>
<p>This URL is a live tsh session. Watch it from a terminal:</p>
<pre>curl -Ns <span id=\"u\"></span></pre>
<script>document.getElementById(\"u\").textContent = window.location.href;</script>
</body>
</html>
";

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionRegistry,
    pub config: Arc<DaemonConfig>,
}

/// Structured error type for the HTTP handlers.
///
/// Each variant maps to a status code, a machine-readable code string, and a
/// human-readable message, and renders as a JSON body via [`IntoResponse`].
#[derive(Debug)]
pub enum ApiError {
    /// 409 - Session name already exists.
    SessionExists(String),
    /// 404 - Unknown session name.
    SessionNotFound(String),
    /// 400 - Name failed validation.
    InvalidName(String),
    /// 403 - Role admission failed.
    RoleRejected(AdmitError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::SessionExists(_) => StatusCode::CONFLICT,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidName(_) => StatusCode::BAD_REQUEST,
            ApiError::RoleRejected(_) => StatusCode::FORBIDDEN,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::SessionExists(_) => "session_exists",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::InvalidName(_) => "invalid_name",
            ApiError::RoleRejected(_) => "role_rejected",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::SessionExists(name) => format!("Session already exists: {}.", name),
            ApiError::SessionNotFound(name) => format!("Session not found: {}.", name),
            ApiError::InvalidName(detail) => format!("Invalid session name: {}.", detail),
            ApiError::RoleRejected(reason) => format!("Not admitted: {}.", reason),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::AlreadyExists(name) => ApiError::SessionExists(name),
            RegistryError::NotFound(name) => ApiError::SessionNotFound(name),
            RegistryError::InvalidName(detail) => ApiError::InvalidName(detail),
        }
    }
}

impl From<AdmitError> for ApiError {
    fn from(e: AdmitError) -> Self {
        ApiError::RoleRejected(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

/// Optional websocket upgrade: a request that is not an upgrade simply
/// probes as `None` instead of being rejected, so one route can serve both
/// upgrading and plain GET clients.
pub struct WsProbe(pub Option<WebSocketUpgrade>);

impl<S> FromRequestParts<S> for WsProbe
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            <WebSocketUpgrade as FromRequestParts<S>>::from_request_parts(parts, state)
                .await
                .ok(),
        ))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/favicon.ico", get(favicon))
        .route("/version", get(version))
        .route("/download/{os}", get(download))
        .route("/{name}", post(create_session).get(session_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the broker on `port` and serve until Ctrl+C.
pub async fn serve(port: u16, state: AppState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "broker listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received Ctrl+C, shutting down");
        })
        .await
}

async fn home(State(state): State<AppState>) -> Redirect {
    Redirect::temporary(&state.config.homepage)
}

async fn favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn version() -> &'static str {
    crate::VERSION
}

async fn download(Path(os): Path<String>, State(state): State<AppState>) -> Redirect {
    Redirect::temporary(&state.config.download_url(&os))
}

#[derive(Debug, Default, Deserialize)]
struct CreateForm {
    /// Presence of a non-empty value means "allow a copilot".
    #[serde(default)]
    copilot: String,
    /// Presence of a non-empty value means "no viewers".
    #[serde(default)]
    private: String,
}

async fn create_session(
    Path(name): Path<String>,
    State(state): State<AppState>,
    Form(form): Form<CreateForm>,
) -> Result<String, ApiError> {
    let allow_copilot = !form.copilot.is_empty();
    let private = !form.private.is_empty();
    state.sessions.create(&name, allow_copilot, private)?;
    tracing::info!(session = %name, copilot = allow_copilot, private, "session created");
    Ok(BANNER.replace("{url}", &state.config.public_url(&name)))
}

async fn session_stream(
    Path(name): Path<String>,
    State(state): State<AppState>,
    probe: WsProbe,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let session = state.sessions.get(&name)?;

    if let WsProbe(Some(ws)) = probe {
        // Claim the role before completing the handshake: a rejection
        // refuses the upgrade with a 4xx instead of closing post-upgrade.
        let admission = dispatch::admit_stream(&state.sessions, &session)?;
        tracing::debug!(session = %name, role = admission.role_name(), "admitting stream");
        return Ok(ws.on_upgrade(move |socket| dispatch::run(socket, session, admission)));
    }

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if user_agent.starts_with("curl/") {
        return http_viewer(session);
    }

    Ok(Html(VIEWER_PAGE).into_response())
}

/// Long-poll viewer for streaming CLI clients: a chunked body fed from a
/// fan-out membership, one chunk per broadcast write, until the session
/// ends or the client goes away (fan-out pruning handles the latter).
fn http_viewer(session: Session) -> Result<Response, ApiError> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    // The chunked body is the kind of destination that may sit behind
    // intermediate buffering, so this sink is flush-tagged at construction.
    session.add_viewer(Box::new(FlushEach(ChannelWriter::new(tx))))?;
    tracing::info!(session = %session.name, "viewer connected [http]");

    let ended = session.ended();
    let stream = ReceiverStream::new(rx)
        .map(Ok::<Bytes, Infallible>)
        .take_until(ended.cancelled_owned());

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(stream),
    )
        .into_response())
}
