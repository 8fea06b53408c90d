use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use helix_channel::config::{DEFAULT_CONFIG_FILE, OutboundPolicyName};
use helix_channel::{
    ChannelConfig, ChannelEvent, Endpoint, FileConfig, HelixSession, NetworkTransport,
    SendOutcome, TracingSink, TransportStrategy, load_config,
};

mod auth;
mod view;

use crate::auth::LoginTokenProvider;

#[derive(Parser)]
#[command(name = "helix")]
#[command(about = "Chat with Helix and follow the workspace task list from a terminal")]
struct Cli {
    /// Config file (missing file is fine; HELIX_* env vars still apply)
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Server base URL
    #[arg(long)]
    endpoint: Option<String>,

    /// Transport strategies to try, in order (repeatable)
    #[arg(long = "transport", value_enum)]
    transports: Vec<TransportArg>,

    /// Static bearer token for the connect handshake
    #[arg(long, conflicts_with_all = ["email", "password"])]
    token: Option<String>,

    /// Log in with these credentials before connecting
    #[arg(long, requires = "password")]
    email: Option<String>,

    #[arg(long, requires = "email")]
    password: Option<String>,

    /// Hold messages typed while disconnected and send them on reconnect
    #[arg(long)]
    buffer_outbound: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum TransportArg {
    Websocket,
    Polling,
}

impl From<TransportArg> for TransportStrategy {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Websocket => TransportStrategy::WebSocket,
            TransportArg::Polling => TransportStrategy::Polling,
        }
    }
}

impl Cli {
    /// Flags win over helix.toml and env vars.
    fn apply(&self, fc: &mut FileConfig) {
        if let Some(endpoint) = &self.endpoint {
            fc.endpoint = endpoint.clone();
        }
        if !self.transports.is_empty() {
            fc.transports = self.transports.iter().copied().map(Into::into).collect();
        }
        if let Some(token) = &self.token {
            fc.auth.token = Some(token.clone());
        }
        if self.buffer_outbound {
            fc.outbound.policy = OutboundPolicyName::Buffer;
        }
    }

    fn login(&self, endpoint: &Endpoint) -> Option<LoginTokenProvider> {
        match (&self.email, &self.password) {
            (Some(email), Some(password)) => Some(LoginTokenProvider::new(
                endpoint.clone(),
                email.clone(),
                password.clone(),
            )),
            _ => None,
        }
    }
}

fn init_tracing(debug: bool) {
    let default_directive = if debug {
        "helix=debug,helix_channel=debug,warn"
    } else {
        "helix=info,helix_channel=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn build_config(cli: &Cli) -> Result<ChannelConfig> {
    let mut fc: FileConfig = load_config(Some(cli.config.as_path()))
        .extract()
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    cli.apply(&mut fc);

    let mut config = ChannelConfig::from_file(&fc).context("invalid configuration")?;
    if let Some(provider) = cli.login(&config.endpoint) {
        config.connect.auth = Some(Arc::new(provider));
    }
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = build_config(&cli)?;
    info!(endpoint = %config.endpoint, transports = ?config.connect.transports, "starting helix");

    let session = HelixSession::new(
        config,
        Arc::new(NetworkTransport::new()),
        Arc::new(TracingSink),
    );
    let _bindings = session.bind_stores();
    session.connect();

    let result = run(&session).await;
    session.shutdown().await;
    result
}

/// Render store changes and forward stdin lines until EOF or Ctrl-C.
async fn run(session: &HelixSession) -> Result<()> {
    let mut conversation = session.conversation().subscribe();
    let mut workspace = session.workspace().subscribe();
    let mut events = session.events();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printed = 0usize;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    debug!("stdin closed");
                    return Ok(());
                };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if session.send(text).await == SendOutcome::Dropped {
                    warn!("not connected; message was not sent");
                }
            }
            Ok(()) = conversation.changed() => {
                let turns = conversation.borrow_and_update().clone();
                for turn in turns.iter().skip(printed) {
                    println!("{}", view::turn_line(turn));
                }
                printed = turns.len();
            }
            Ok(()) = workspace.changed() => {
                let snapshot = workspace.borrow_and_update().clone();
                for line in view::workspace_lines(&snapshot) {
                    println!("{}", line);
                }
            }
            event = events.recv() => match event {
                Ok(ChannelEvent::StateChanged(state)) => println!("{}", view::state_line(state)),
                Ok(ChannelEvent::Ready { session_id, strategy }) => {
                    info!(session_id = %session_id, strategy = %strategy, "channel ready");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "state notifications lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}
