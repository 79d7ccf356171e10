//! Async backend: bridges the sync TUI event loop with the refresh
//! coordinator and the Teams API.
//!
//! Uses an mpsc channel pair. The TUI sends `BackendCommand` values, and a
//! background tokio task executes them and sends `BackendResponse` values back.
//! Refresh progress reaches the TUI through the same response channel.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::api::TeamsClientFactory;
use crate::auth::{RefreshObserver, RefreshStatus, SessionRefreshCoordinator};
use crate::models::ConversationResponse;

pub type Coordinator = SessionRefreshCoordinator<TeamsClientFactory>;

/// Commands sent from the TUI event loop to the async backend.
#[derive(Debug)]
pub enum BackendCommand {
    LoadConversations,
    RefreshAuth,
}

/// Responses from the async backend to the TUI.
#[derive(Debug)]
pub enum BackendResponse {
    Conversations(Result<ConversationResponse, String>),
    RefreshStarted { note: String },
    Verification(String),
    RefreshFinished(RefreshStatus),
    /// Leave the alternate screen, then acknowledge.
    Suspend(oneshot::Sender<()>),
    Resume,
}

/// Forwards coordinator notifications to the TUI.
pub struct ChannelObserver {
    resp_tx: mpsc::UnboundedSender<BackendResponse>,
}

impl ChannelObserver {
    pub fn new(resp_tx: mpsc::UnboundedSender<BackendResponse>) -> Self {
        Self { resp_tx }
    }

    fn send(&self, resp: BackendResponse) -> bool {
        self.resp_tx.send(resp).is_ok()
    }
}

impl RefreshObserver for ChannelObserver {
    fn verification_message(&self, message: &str) {
        self.send(BackendResponse::Verification(message.to_string()));
    }

    fn refresh_started(&self, display_note: &str) {
        self.send(BackendResponse::RefreshStarted {
            note: display_note.to_string(),
        });
    }

    fn refresh_finished(&self, status: &RefreshStatus) {
        self.send(BackendResponse::RefreshFinished(status.clone()));
    }

    fn suspend_terminal(&self) -> Option<oneshot::Receiver<()>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        // No UI listening means nobody holds the terminal
        self.send(BackendResponse::Suspend(ack_tx)).then_some(ack_rx)
    }

    fn resume_terminal(&self) {
        self.send(BackendResponse::Resume);
    }
}

/// Handle for interacting with the backend from the TUI side.
pub struct Backend {
    cmd_tx: mpsc::UnboundedSender<BackendCommand>,
    resp_rx: mpsc::UnboundedReceiver<BackendResponse>,
}

impl Backend {
    /// Start the backend on `runtime`. `resp_tx` must be the sender whose
    /// receiver is `resp_rx`, shared with the coordinator's observer.
    pub fn start(
        runtime: &tokio::runtime::Handle,
        coordinator: Arc<Coordinator>,
        resp_tx: mpsc::UnboundedSender<BackendResponse>,
        resp_rx: mpsc::UnboundedReceiver<BackendResponse>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        runtime.spawn(backend_loop(coordinator, cmd_rx, resp_tx));
        Self { cmd_tx, resp_rx }
    }

    /// Send a command to the backend (non-blocking).
    pub fn send(&self, cmd: BackendCommand) {
        if self.cmd_tx.send(cmd).is_err() {
            tracing::error!("Backend channel closed -- command dropped");
        }
    }

    /// Next pending response, without blocking.
    pub fn try_recv(&mut self) -> Option<BackendResponse> {
        self.resp_rx.try_recv().ok()
    }

    /// Block the calling (non-runtime) thread until a response arrives.
    pub fn blocking_recv(&mut self) -> Option<BackendResponse> {
        self.resp_rx.blocking_recv()
    }
}

/// Background loop that processes commands.
///
/// Each command runs as its own task so a long refresh never stalls a load.
async fn backend_loop(
    coordinator: Arc<Coordinator>,
    mut cmd_rx: mpsc::UnboundedReceiver<BackendCommand>,
    resp_tx: mpsc::UnboundedSender<BackendResponse>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        let coordinator = Arc::clone(&coordinator);
        let resp_tx = resp_tx.clone();

        tokio::spawn(async move {
            match cmd {
                BackendCommand::LoadConversations => {
                    let result = coordinator
                        .call_with_refresh(|client| async move { client.conversations().await })
                        .await
                        .map_err(|e| e.to_string());
                    let _ = resp_tx.send(BackendResponse::Conversations(result));
                }
                BackendCommand::RefreshAuth => {
                    // Outcome reaches the UI through the observer
                    let _ = coordinator.refresh().await;
                }
            }
        });
    }
}
