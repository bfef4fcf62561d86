//! tsh - terminal sharing over the web.
//!
//! Hosting (default), joining (session URL argument), or the broker daemon
//! (`-d`). The daemon is the interesting part: a session registry that
//! relays one pilot's terminal bytes to viewers and an optional copilot.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser as ClapParser;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tsh::{api, client, config::DaemonConfig, session::SessionRegistry};

/// tsh - terminal sharing over the web.
///
/// Starts a shared session, or connects to one if a session URL is given.
#[derive(ClapParser, Debug)]
#[command(name = "tsh", about, long_about = None, disable_version_flag = true)]
struct Cli {
    /// Run the broker daemon
    #[arg(short = 'd', long = "daemon")]
    daemon: bool,

    /// Allow a copilot to join and share control
    #[arg(short = 'c', long = "copilot")]
    copilot: bool,

    /// Only allow a copilot and no viewers
    #[arg(short = 'p', long = "private")]
    private: bool,

    /// Use a different broker (host:port)
    #[arg(short = 's', long = "server")]
    server: Option<String>,

    /// Do not use TLS endpoints
    #[arg(short = 'n', long = "no-tls")]
    no_tls: bool,

    /// Print version and exit
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// Port the daemon listens on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Optional daemon config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Session URL to join; omit to create and host a session
    session_url: Option<String>,
}

#[derive(Error, Debug)]
enum TshError {
    #[error("client error: {0}")]
    Client(#[from] client::ClientError),

    #[error("config error: {0}")]
    Config(#[from] tsh::config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tsh=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), TshError> {
    let cli = Cli::parse();

    if cli.version {
        println!("{}", tsh::VERSION);
        return Ok(());
    }

    init_tracing();

    if cli.daemon {
        return run_daemon(&cli).await;
    }

    let tls = !cli.no_tls;
    match &cli.session_url {
        Some(url) => {
            let (endpoint, path) = client::parse_session_url(url, tls)?;
            client::join_session(endpoint, &path).await?;
        }
        None => {
            let host = cli
                .server
                .clone()
                .unwrap_or_else(|| client::DEFAULT_SERVER.to_string());
            client::host_session(client::Endpoint::new(host, tls), cli.copilot, cli.private)
                .await?;
        }
    }
    Ok(())
}

async fn run_daemon(cli: &Cli) -> Result<(), TshError> {
    let mut config = match &cli.config {
        Some(path) => match DaemonConfig::load(path)? {
            Some(config) => config,
            None => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                DaemonConfig::default()
            }
        },
        None => DaemonConfig::default(),
    };
    // The address flags shape the URLs the daemon hands out, same as they
    // shape the address clients dial.
    if let Some(server) = &cli.server {
        config.public_host = server.clone();
    }
    if cli.no_tls {
        config.tls = false;
    }

    let state = api::AppState {
        sessions: SessionRegistry::new(),
        config: Arc::new(config),
    };
    tracing::info!(version = tsh::VERSION, "tsh broker starting");
    api::serve(cli.port, state).await?;
    Ok(())
}
