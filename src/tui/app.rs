//! TUI Application state and main event loop

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{enable_raw_mode, EnterAlternateScreen};
use ratatui::{DefaultTerminal, Terminal};
use std::io::{self, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tokio::sync::oneshot;

use super::backend::{Backend, BackendCommand, BackendResponse};
use super::log_capture::ActivityLog;
use super::ui;
use crate::auth::RefreshStatus;
use crate::models::ConversationResponse;

/// Target frame rate for UI updates (~30 fps)
const FRAME_DURATION_MS: u64 = 33;

/// Activity lines kept for display.
const MAX_ACTIVITY_LINES: usize = 100;

/// Which page is showing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Page {
    Loading,
    Main,
    /// Auth or load failure; `r` retries
    Error,
}

/// Application state
pub struct App {
    /// Whether the app should exit
    pub should_exit: bool,
    pub page: Page,
    /// Message shown on the loading/error pages and in the status bar
    pub status_message: Option<String>,
    pub status_is_error: bool,
    /// Device code instructions while a login is pending
    pub verification: Option<String>,
    pub refreshing: bool,
    pub conversations: ConversationResponse,
    /// Recent log lines
    pub activity: Vec<String>,
    /// Terminal handed to an interactive login helper
    pub suspended: bool,
    /// Sent once the terminal has been released
    pending_ack: Option<oneshot::Sender<()>>,
}

impl Default for App {
    fn default() -> Self {
        Self {
            should_exit: false,
            page: Page::Loading,
            status_message: Some("Loading conversations...".to_string()),
            status_is_error: false,
            verification: None,
            refreshing: false,
            conversations: ConversationResponse::default(),
            activity: Vec::new(),
            suspended: false,
            pending_ack: None,
        }
    }
}

/// What the event loop must do to the terminal after an update.
#[derive(Debug, PartialEq, Eq)]
pub enum TerminalAction {
    None,
    Release,
    Restore,
}

impl App {
    /// Apply a backend response to the state.
    pub fn update(&mut self, resp: BackendResponse) -> TerminalAction {
        match resp {
            BackendResponse::Conversations(Ok(conversations)) => {
                self.conversations = conversations;
                self.page = Page::Main;
                if !self.refreshing {
                    self.status_message = None;
                    self.status_is_error = false;
                }
            }
            BackendResponse::Conversations(Err(e)) => {
                self.page = Page::Error;
                self.set_status(format!("Unable to load conversations: {}", e), true);
            }
            BackendResponse::RefreshStarted { note } => {
                self.refreshing = true;
                self.set_status(format!("Refreshing auth... ({})", note), false);
            }
            BackendResponse::Verification(message) => {
                self.verification = Some(message);
            }
            BackendResponse::RefreshFinished(status) => {
                self.refreshing = false;
                self.verification = None;
                match status {
                    RefreshStatus::Succeeded => {
                        self.set_status("Auth refresh succeeded. Returning to main view.", false);
                    }
                    RefreshStatus::Failed(e) => {
                        self.page = Page::Error;
                        self.set_status(format!("Unable to refresh auth: {}", e), true);
                    }
                }
            }
            BackendResponse::Suspend(ack) => {
                self.suspended = true;
                // Ack is sent by the loop once the screen is released
                return self.release_with(ack);
            }
            BackendResponse::Resume => {
                self.suspended = false;
                return TerminalAction::Restore;
            }
        }
        TerminalAction::None
    }

    fn release_with(&mut self, ack: oneshot::Sender<()>) -> TerminalAction {
        self.pending_ack = Some(ack);
        TerminalAction::Release
    }

    fn set_status(&mut self, msg: impl Into<String>, is_error: bool) {
        self.status_message = Some(msg.into());
        self.status_is_error = is_error;
    }

    /// Handle a key press. Returns a command for the backend, if any.
    pub fn handle_key(&mut self, code: KeyCode) -> Option<BackendCommand> {
        match code {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.should_exit = true;
                None
            }
            KeyCode::Char('r') if !self.refreshing => {
                self.refreshing = true;
                self.set_status("Refreshing auth...", false);
                Some(BackendCommand::RefreshAuth)
            }
            KeyCode::Char('l') if self.page == Page::Error => {
                self.page = Page::Loading;
                self.set_status("Loading conversations...", false);
                Some(BackendCommand::LoadConversations)
            }
            _ => None,
        }
    }

    /// Append newly captured log lines.
    pub fn push_activity(&mut self, lines: Vec<String>) {
        self.activity.extend(lines);
        if self.activity.len() > MAX_ACTIVITY_LINES {
            let excess = self.activity.len() - MAX_ACTIVITY_LINES;
            self.activity.drain(..excess);
        }
    }

    /// Render the UI
    pub fn render(&self, frame: &mut ratatui::Frame) {
        ui::render(frame, self);
    }
}

/// Run the TUI on the current (blocking) thread with panic-safe terminal restore.
pub fn run(backend: Backend, log: ActivityLog) -> Result<()> {
    let mut terminal = ratatui::init();
    let result = catch_unwind(AssertUnwindSafe(|| run_app(&mut terminal, backend, log)));
    ratatui::restore();

    match result {
        Ok(r) => r,
        Err(e) => std::panic::resume_unwind(e),
    }
}

fn run_app(terminal: &mut DefaultTerminal, mut backend: Backend, log: ActivityLog) -> Result<()> {
    let mut app = App::default();
    backend.send(BackendCommand::LoadConversations);

    while !app.should_exit {
        if app.suspended {
            // The helper owns the terminal; wait for it to hand it back
            let Some(resp) = backend.blocking_recv() else {
                break;
            };
            apply(&mut app, resp, terminal, &backend)?;
            continue;
        }

        app.push_activity(log.drain());
        terminal.draw(|frame| app.render(frame))?;

        if event::poll(Duration::from_millis(FRAME_DURATION_MS))? {
            match event::read()? {
                Event::Key(key_event) if key_event.kind == KeyEventKind::Press => {
                    if let Some(cmd) = app.handle_key(key_event.code) {
                        backend.send(cmd);
                    }
                }
                Event::Resize(_, _) => {
                    // Terminal resized - will be handled on next draw
                }
                _ => {}
            }
        }

        while let Some(resp) = backend.try_recv() {
            apply(&mut app, resp, terminal, &backend)?;
            if app.suspended {
                break;
            }
        }
    }

    Ok(())
}

fn apply(
    app: &mut App,
    resp: BackendResponse,
    terminal: &mut DefaultTerminal,
    backend: &Backend,
) -> Result<()> {
    let reload = matches!(resp, BackendResponse::RefreshFinished(RefreshStatus::Succeeded));

    match app.update(resp) {
        TerminalAction::Release => {
            ratatui::restore();
            if let Some(ack) = app.pending_ack.take() {
                let _ = ack.send(());
            }
        }
        TerminalAction::Restore => {
            enable_raw_mode()?;
            reenter(terminal, &mut io::stdout())?;
        }
        TerminalAction::None => {}
    }

    if reload {
        backend.send(BackendCommand::LoadConversations);
    }
    Ok(())
}

/// Take the screen back from an interactive helper. The panic hook
/// installed by `ratatui::init` stays in place.
fn reenter<B, W>(terminal: &mut Terminal<B>, out: &mut W) -> io::Result<()>
where
    B: ratatui::backend::Backend,
    W: Write,
{
    execute!(out, EnterAlternateScreen)?;
    terminal.clear()
}
