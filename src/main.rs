use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use voicebug_relay::dispatch::{Dispatcher, DEFAULT_REPORTER};
use voicebug_relay::events::{Broadcaster, HEARTBEAT_INTERVAL};
use voicebug_relay::host::GithubHost;
use voicebug_relay::server::{self, AppState};

/// Relay voice-agent tool calls to GitHub and stream progress to the browser
#[derive(Parser)]
#[command(name = "voicebug-relay", version, about)]
struct Cli {
    /// GitHub personal access token.
    /// Can also be set via GITHUB_TOKEN environment variable.
    #[arg(long)]
    token: Option<String>,

    /// Read GitHub token from an environment variable.
    /// Default: GITHUB_TOKEN
    #[arg(long = "token-env")]
    token_env: Option<String>,

    /// Owner (user or org) of the repository the agent works on
    #[arg(long, env = "GITHUB_OWNER")]
    owner: String,

    /// Name of the repository the agent works on
    #[arg(long, env = "GITHUB_REPO")]
    repo: String,

    /// Address to listen on
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3000")]
    bind: SocketAddr,

    /// Seconds between SSE heartbeat comments (default: 30)
    #[arg(long)]
    heartbeat_secs: Option<u64>,

    /// Name credited in the footer of created issues
    #[arg(long, default_value = DEFAULT_REPORTER)]
    reporter: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Resolve token: --token > --token-env > GITHUB_TOKEN
    let token = if let Some(t) = cli.token {
        Some(t)
    } else {
        let env_name = cli.token_env.as_deref().unwrap_or("GITHUB_TOKEN");
        match std::env::var(env_name) {
            Ok(t) if !t.is_empty() => {
                tracing::info!(env = env_name, "Read GitHub token from environment variable");
                Some(t)
            }
            _ => None,
        }
    };

    let github = if let Some(t) = token {
        octocrab::OctocrabBuilder::new()
            .personal_token(t)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create GitHub client: {}", e))?
    } else {
        tracing::warn!("No GitHub token provided; issue creation will fail and rate limits are very restrictive");
        octocrab::Octocrab::default()
    };

    let host = GithubHost::new(github, cli.owner, cli.repo)?;
    let events = Arc::new(Broadcaster::new());
    let period = cli
        .heartbeat_secs
        .map(|s| Duration::from_secs(s.max(1)))
        .unwrap_or(HEARTBEAT_INTERVAL);
    let heartbeat = events.spawn_heartbeat(period);
    let dispatcher = Dispatcher::new(Arc::new(host.clone()), Arc::clone(&events), cli.reporter);

    let router = server::build_router(AppState::new(dispatcher));
    let drain = Arc::clone(&events);
    let listener = tokio::net::TcpListener::bind(cli.bind).await?;

    tracing::info!(
        addr = %listener.local_addr()?,
        repo = %host.full_name(),
        heartbeat_secs = period.as_secs(),
        "Starting voicebug-relay"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl+c; graceful shutdown disabled");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
            drain.close();
        })
        .await?;

    heartbeat.abort();
    Ok(())
}
