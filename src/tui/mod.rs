//! TUI module for Teams CLI
//!
//! Terminal user interface using Ratatui. The draw loop runs on a blocking
//! thread; auth refreshes and API calls run as tokio tasks so the screen
//! keeps redrawing while a login is pending.

mod app;
mod backend;
mod log_capture;
mod ui;

use std::sync::Arc;

use anyhow::{Context, Result};

pub use backend::{BackendResponse, ChannelObserver, Coordinator};
pub use log_capture::ActivityLog;

/// Run the TUI until the user quits.
///
/// `responses` must be the receiving half of the channel the coordinator's
/// [`ChannelObserver`] sends on.
pub async fn run(
    coordinator: Arc<Coordinator>,
    responses: (
        tokio::sync::mpsc::UnboundedSender<BackendResponse>,
        tokio::sync::mpsc::UnboundedReceiver<BackendResponse>,
    ),
    log: ActivityLog,
) -> Result<()> {
    let (resp_tx, resp_rx) = responses;
    let runtime = tokio::runtime::Handle::current();
    let cancel = coordinator.cancellation_token();
    let backend = backend::Backend::start(&runtime, coordinator, resp_tx, resp_rx);

    let result = tokio::task::spawn_blocking(move || app::run(backend, log))
        .await
        .context("TUI thread panicked")?;

    // Abort any device code flow still polling
    cancel.cancel();
    result
}
