//! Teams CLI - Lightweight Microsoft Teams client
//!
//! A terminal-based Teams client for Linux that keeps its own session alive.

mod api;
mod auth;
mod config;
mod models;
mod tui;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::TeamsClientFactory;
use crate::auth::fallback::locate::HostProbe;
use crate::auth::fallback::FallbackAuthRunner;
use crate::auth::{
    RefreshObserver, RefreshStatus, SessionRefreshCoordinator, TokenInfo, PRIMARY_TOKEN_NAME,
};
use crate::config::Config;

#[derive(Parser)]
#[command(name = "teams-cli")]
#[command(about = "Lightweight CLI client for Microsoft Teams", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Obtain fresh tokens (device code, then the teams-token helper)
    Refresh,

    /// Show token status and how a refresh would run
    Status,

    /// List teams and recent chats
    Chats {
        /// Maximum number of chats to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Launch the terminal user interface
    Tui,
}

/// Prints refresh progress for the plain CLI commands.
struct ConsoleObserver;

impl RefreshObserver for ConsoleObserver {
    fn verification_message(&self, message: &str) {
        eprintln!("\n{}\n", message);
    }

    fn refresh_started(&self, display_note: &str) {
        eprintln!("Refreshing auth... ({})", display_note);
    }

    fn refresh_finished(&self, status: &RefreshStatus) {
        match status {
            RefreshStatus::Succeeded => eprintln!("Auth refresh succeeded."),
            RefreshStatus::Failed(e) => eprintln!("Unable to refresh auth: {}", e),
        }
    }
}

fn build_coordinator(
    config: &Config,
    observer: Arc<dyn RefreshObserver>,
) -> Result<tui::Coordinator> {
    let auth = config.to_auth_config();
    let store = config.token_store()?;
    let fallback = FallbackAuthRunner::new(&auth, HostProbe::discover());
    let factory = TeamsClientFactory::new(store.clone());

    SessionRefreshCoordinator::new(auth, store, fallback, factory, observer)
        .context("Failed to set up authentication")
}

fn init_logging(verbose: bool, tui_log: Option<&tui::ActivityLog>) {
    let filter = if verbose { "debug" } else { "info" };
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    match tui_log {
        Some(log) => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(log.clone()),
            )
            .init(),
        None => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

/// Cancel an in-flight device code flow on Ctrl-C.
fn cancel_on_ctrl_c(coordinator: &tui::Coordinator) {
    let cancel = coordinator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling auth refresh");
            cancel.cancel();
        }
    });
}

async fn refresh(config: &Config) -> Result<()> {
    let coordinator = build_coordinator(config, Arc::new(ConsoleObserver))?;
    cancel_on_ctrl_c(&coordinator);

    coordinator.refresh().await.context("Auth refresh failed")?;
    println!("Tokens written to {}", coordinator.store().dir().display());
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let auth = config.to_auth_config();
    let store = config.token_store()?;
    let probe = HostProbe::discover();

    println!("Tenant:        {}", auth.tenant);
    println!("Token dir:     {}", store.dir().display());
    println!(
        "Device code:   {}",
        if auth.disable_device_code { "disabled" } else { "enabled" }
    );
    for root in probe.search_roots() {
        println!("Helper search: {}", root.display());
    }
    let fallback = FallbackAuthRunner::new(&auth, probe);
    println!("Login helper:  {}", fallback.display_note());
    println!();

    let names = std::iter::once(PRIMARY_TOKEN_NAME.to_string())
        .chain(auth.resources.iter().map(|r| r.label.clone()));
    for name in names {
        let state = match store
            .read(&name)
            .with_context(|| format!("Failed to read {} token", name))?
        {
            None => "missing".to_string(),
            Some(token) => match TokenInfo::inspect(&token) {
                Some(info) if info.is_expired() => "expired".to_string(),
                Some(info) => match info.minutes_left() {
                    Some(minutes) => format!("valid ({} min left)", minutes),
                    None => "valid".to_string(),
                },
                None => "present".to_string(),
            },
        };
        println!("  {:<12} {}", name, state);
    }
    Ok(())
}

async fn chats(config: &Config, limit: usize) -> Result<()> {
    let coordinator = build_coordinator(config, Arc::new(ConsoleObserver))?;
    cancel_on_ctrl_c(&coordinator);

    let conversations = coordinator
        .call_with_refresh(|client| async move { client.conversations().await })
        .await
        .context("Failed to load conversations")?;

    println!("\nTeams:");
    println!("{:-<60}", "");
    if conversations.teams.is_empty() {
        println!("  (no teams found)");
    }
    for team in &conversations.teams {
        println!("{} ({} channels)", team.display_name, team.channels.len());
        for channel in &team.channels {
            println!("  {:<30} {}", channel.display_name, channel.id);
        }
    }

    println!("\nChats:");
    println!("{:-<60}", "");
    if conversations.chats.is_empty() {
        println!("  (no chats found)");
    }
    for chat in conversations.chats.iter().take(limit) {
        println!("  {:<40} {}", chat.display_title(), chat.id);
    }
    Ok(())
}

async fn run_tui(config: &Config, log: tui::ActivityLog) -> Result<()> {
    let (resp_tx, resp_rx) = tokio::sync::mpsc::unbounded_channel();
    let observer = Arc::new(tui::ChannelObserver::new(resp_tx.clone()));
    let coordinator = Arc::new(build_coordinator(config, observer)?);

    // Reuse an existing session when the stored tokens still work
    if let Err(e) = coordinator.init_client() {
        tracing::info!("No usable session yet: {}", e);
    }

    tui::run(coordinator, (resp_tx, resp_rx), log).await
}

/// Activity pane buffer, teed to the log file in the config directory.
fn tui_activity_log() -> Result<tui::ActivityLog> {
    let path = Config::log_path()?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).context("Failed to create config directory")?;
    }
    tui::ActivityLog::new()
        .with_file(&path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The TUI owns the terminal, so its logs go to the activity pane
    let tui_log = match cli.command {
        Commands::Tui => Some(tui_activity_log()?),
        _ => None,
    };
    init_logging(cli.verbose, tui_log.as_ref());

    let config = Config::load()?;

    match cli.command {
        Commands::Refresh => {
            tracing::info!("Refreshing credentials...");
            refresh(&config).await?;
        }
        Commands::Status => {
            status(&config)?;
        }
        Commands::Chats { limit } => {
            tracing::info!("Fetching chats...");
            chats(&config, limit).await?;
        }
        Commands::Tui => {
            let log = tui_log.unwrap_or_default();
            run_tui(&config, log).await?;
        }
    }

    Ok(())
}
