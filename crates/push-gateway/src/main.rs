//! Push gateway binary.
//!
//! `serve` runs the WebSocket gateway; `mint-token` prints a credential for a
//! user id, signed with the configured secret.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use diting_push::auth::issue_token;
use diting_push::config::PushConfig;
use diting_push::lifecycle::shutdown_all;
use diting_push::metrics::init_metrics;
use diting_push::registry::SessionRegistry;
use diting_push::state::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "diting-push")]
#[command(about = "Real-time presence and push delivery gateway")]
#[command(version)]
struct Args {
    /// TOML config file; `DITING_*` environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway (default)
    Serve {
        /// Emit logs as JSON lines
        #[arg(long)]
        log_json: bool,
    },
    /// Print a signed token for a user id
    MintToken {
        #[arg(long)]
        uid: i64,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "warn,diting_push=info,tower_http=info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = PushConfig::load(args.config.as_deref()).context("loading configuration")?;

    match args.command.unwrap_or(Command::Serve { log_json: false }) {
        Command::Serve { log_json } => serve(config, log_json).await,
        Command::MintToken { uid } => {
            let token = issue_token(config.auth.jwt_secret.as_bytes(), uid, config.token_ttl())
                .context("signing token")?;
            println!("{token}");
            Ok(())
        }
    }
}

async fn serve(config: PushConfig, log_json: bool) -> Result<()> {
    init_tracing(log_json);
    init_metrics();

    let state = AppState::from_config(&config);
    let registry = state.registry.clone();
    let app = diting_push::app(state);

    let addr = config.server.bind;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(
        %addr,
        heartbeat_interval_secs = config.heartbeat.interval_secs,
        heartbeat_timeout_secs = config.heartbeat.timeout_secs,
        "Push gateway listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await
        .context("push gateway server")?;
    Ok(())
}

/// Resolves on Ctrl-C after every live session has been torn down.
async fn shutdown_signal(registry: std::sync::Arc<SessionRegistry>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
    shutdown_all(&registry).await;
}
