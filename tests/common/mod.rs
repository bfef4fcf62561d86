#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use tsh::api::{router, AppState};
use tsh::config::DaemonConfig;
use tsh::session::SessionRegistry;

/// A fresh broker state with a loopback public address, so banner URLs in
/// assertions are deterministic.
pub fn test_state() -> AppState {
    AppState {
        sessions: SessionRegistry::new(),
        config: Arc::new(DaemonConfig {
            public_host: "127.0.0.1:8080".into(),
            tls: false,
            ..Default::default()
        }),
    }
}

/// Bind the broker on an ephemeral loopback port and serve it for the
/// test's lifetime. Returns the bound address and the shared state, so
/// tests can both dial the server and inspect the registry.
pub async fn spawn_server() -> (SocketAddr, AppState) {
    let state = test_state();
    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, state)
}

/// Create a session over HTTP the way the hosting client does.
pub async fn create_session(addr: &SocketAddr, name: &str, copilot: bool, private: bool) {
    let resp = reqwest::Client::new()
        .post(format!("http://{}/{}", addr, name))
        .form(&[
            ("copilot", if copilot { "true" } else { "" }),
            ("private", if private { "true" } else { "" }),
        ])
        .send()
        .await
        .expect("create session request");
    assert!(
        resp.status().is_success(),
        "session create failed: {}",
        resp.status()
    );
}
