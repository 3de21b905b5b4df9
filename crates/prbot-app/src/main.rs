//! prbot - answers `/prbot` commands on GitHub pull requests
//!
//! Runs either as a webhook server (`prbot serve`) or as a one-shot handler
//! for an event payload on disk (`prbot run`), as in a CI job.

mod command;
mod event;
mod webhook;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prbot_adapters::Settings;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "prbot",
    about = "Pull request assistant: ask, explain and review from PR comments",
    version
)]
struct Args {
    /// TOML config file (defaults to $PRBOT_CONFIG when set)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Listen for GitHub webhooks
    Serve {
        /// Address to bind, overriding the config
        #[arg(long)]
        bind: Option<String>,
    },
    /// Handle a single event payload and exit
    Run {
        #[arg(long, env = "GITHUB_EVENT_NAME")]
        event_name: String,
        #[arg(long, env = "GITHUB_EVENT_PATH")]
        event_path: PathBuf,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let config_path = args.config.or_else(Settings::env_config_path);
    let settings = Settings::load(config_path.as_deref())?;
    tracing::debug!(?settings, "loaded settings");

    match args.command {
        Mode::Serve { bind } => serve(settings, bind).await,
        Mode::Run {
            event_name,
            event_path,
        } => run_once(&settings, &event_name, &event_path).await,
    }
}

async fn serve(settings: Settings, bind: Option<String>) -> Result<()> {
    let webhook_secret = settings
        .github
        .webhook_secret
        .clone()
        .filter(|s| !s.is_empty())
        .context("No webhook secret configured. Set PRBOT_WEBHOOK_SECRET.")?;
    // fail at startup rather than on the first delivery
    settings.github_token()?;
    settings.llm_api_key()?;
    let bind = bind.unwrap_or_else(|| settings.server.bind.clone());

    let app = webhook::router(Arc::new(webhook::AppState {
        settings,
        webhook_secret,
    }));
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    tracing::info!(%bind, "listening for webhooks");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("Webhook server failed")
}

async fn run_once(settings: &Settings, event_name: &str, event_path: &Path) -> Result<()> {
    let payload = std::fs::read(event_path)
        .with_context(|| format!("Failed to read event payload {}", event_path.display()))?;
    let delivery = uuid::Uuid::new_v4();
    let span = tracing::info_span!("run", id = %delivery, event = %event_name);
    let outcome = event::handle_event(settings, event_name, &payload)
        .instrument(span.clone())
        .await?;

    let _guard = span.enter();
    match outcome {
        Some(outcome) if outcome.success => {
            tracing::info!(comment_id = outcome.result_comment_id, "answered");
        }
        Some(outcome) => {
            tracing::warn!(
                comment_id = outcome.result_comment_id,
                category = outcome.error_category.map(|c| c.as_str()),
                "published a failure reply"
            );
        }
        None => tracing::info!("event needs no action"),
    }
    Ok(())
}
