//! UI rendering for the TUI

use ratatui::{
    buffer::Buffer,
    layout::{Alignment, Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Widget, Wrap},
    Frame,
};

use super::app::{App, Page};

/// Height of the activity pane, borders included
const ACTIVITY_HEIGHT: u16 = 6;

/// Main render function
pub fn render(frame: &mut Frame, app: &App) {
    let area = frame.area();

    // Layout: header (1 line) + page + activity pane + status bar (1 line)
    let [header_area, main_area, activity_area, status_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Fill(1),
        Constraint::Length(ACTIVITY_HEIGHT),
        Constraint::Length(1),
    ])
    .areas(area);

    let buf = frame.buffer_mut();
    render_header(header_area, buf, app);
    match app.page {
        Page::Loading => render_notice(main_area, buf, app, Color::Cyan),
        Page::Error => render_notice(main_area, buf, app, Color::Red),
        Page::Main => render_conversations(main_area, buf, app),
    }
    render_activity(activity_area, buf, app);
    render_status(status_area, buf, app);
}

/// Render the header bar
fn render_header(area: Rect, buf: &mut Buffer, app: &App) {
    let title = Span::styled(
        " Teams CLI",
        Style::default()
            .fg(Color::White)
            .add_modifier(Modifier::BOLD),
    );

    let (symbol, color, label) = if app.refreshing {
        ("~", Color::Yellow, "refreshing auth")
    } else if app.page == Page::Error {
        ("o", Color::Red, "signed out")
    } else {
        ("*", Color::Green, "signed in")
    };
    let right = format!(" {} {} ", symbol, label);

    let left_width = " Teams CLI".len();
    let padding_width = area.width.saturating_sub((left_width + right.len()) as u16) as usize;

    let header_line = Line::from(vec![
        title,
        Span::raw(" ".repeat(padding_width)),
        Span::styled(right, Style::default().fg(color)),
    ]);

    Paragraph::new(header_line)
        .style(Style::default().bg(Color::DarkGray))
        .render(area, buf);
}

/// Loading and error pages: status text plus any pending device code instructions.
fn render_notice(area: Rect, buf: &mut Buffer, app: &App, color: Color) {
    let mut lines = vec![Line::raw("")];
    if let Some(msg) = &app.status_message {
        lines.push(Line::from(Span::styled(msg.clone(), Style::default().fg(color))));
    }
    if let Some(verification) = &app.verification {
        lines.push(Line::raw(""));
        lines.push(Line::from(Span::styled(
            verification.clone(),
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        )));
    }
    if app.page == Page::Error {
        lines.push(Line::raw(""));
        lines.push(Line::from(Span::styled(
            "r: refresh auth   l: reload   q: quit",
            Style::default().fg(Color::Gray),
        )));
    }

    Paragraph::new(lines)
        .alignment(Alignment::Center)
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL))
        .render(area, buf);
}

fn render_conversations(area: Rect, buf: &mut Buffer, app: &App) {
    let [teams_area, chats_area] =
        Layout::horizontal([Constraint::Percentage(50), Constraint::Percentage(50)]).areas(area);

    let mut team_lines = Vec::new();
    for team in &app.conversations.teams {
        team_lines.push(Line::from(Span::styled(
            team.display_name.clone(),
            Style::default().add_modifier(Modifier::BOLD),
        )));
        for channel in &team.channels {
            team_lines.push(Line::raw(format!("  # {}", channel.display_name)));
        }
    }
    if team_lines.is_empty() {
        team_lines.push(Line::raw("(no teams found)"));
    }

    let mut chat_lines: Vec<Line> = app
        .conversations
        .chats
        .iter()
        .map(|chat| Line::raw(chat.display_title().to_string()))
        .collect();
    if chat_lines.is_empty() {
        chat_lines.push(Line::raw("(no chats found)"));
    }

    Paragraph::new(team_lines)
        .block(Block::default().borders(Borders::ALL).title(" Teams "))
        .render(teams_area, buf);
    Paragraph::new(chat_lines)
        .block(Block::default().borders(Borders::ALL).title(" Chats "))
        .render(chats_area, buf);
}

/// Most recent log lines, newest at the bottom.
fn render_activity(area: Rect, buf: &mut Buffer, app: &App) {
    let visible = area.height.saturating_sub(2) as usize;
    let start = app.activity.len().saturating_sub(visible);
    let lines: Vec<Line> = app.activity[start..]
        .iter()
        .map(|l| Line::from(Span::styled(l.clone(), Style::default().fg(Color::Gray))))
        .collect();

    Paragraph::new(lines)
        .block(Block::default().borders(Borders::TOP).title(" Activity "))
        .render(area, buf);
}

/// Render the status bar
fn render_status(area: Rect, buf: &mut Buffer, app: &App) {
    // If there's a status message, show it prominently.
    if let Some(ref msg) = app.status_message {
        let style = if app.status_is_error {
            Style::default().fg(Color::Red).bg(Color::DarkGray)
        } else {
            Style::default().fg(Color::Green).bg(Color::DarkGray)
        };
        let line = Line::from(Span::styled(format!(" {} ", msg), style));
        Paragraph::new(line)
            .style(Style::default().bg(Color::DarkGray))
            .render(area, buf);
        return;
    }

    let sep_style = Style::default().fg(Color::DarkGray);
    let counts = Span::styled(
        format!(
            " {} teams, {} chats ",
            app.conversations.teams.len(),
            app.conversations.chats.len()
        ),
        Style::default().fg(Color::Yellow),
    );

    let status_line = Line::from(vec![
        counts,
        Span::styled(" | ", sep_style),
        Span::styled("r: refresh auth", Style::default().fg(Color::Gray)),
        Span::styled(" | ", sep_style),
        Span::styled("q: quit", Style::default().fg(Color::Gray)),
    ]);

    Paragraph::new(status_line)
        .style(Style::default().bg(Color::DarkGray))
        .render(area, buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RefreshStatus;
    use crate::tui::backend::BackendResponse;
    use ratatui::{backend::TestBackend, Terminal};

    fn rendered(app: &App) -> String {
        let mut terminal = Terminal::new(TestBackend::new(80, 20)).unwrap();
        terminal.draw(|frame| render(frame, app)).unwrap();
        let buffer = terminal.backend().buffer().clone();
        buffer
            .content()
            .chunks(buffer.area.width as usize)
            .map(|row| row.iter().map(|c| c.symbol()).collect::<String>())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_error_page_shows_retry_hint() {
        let mut app = App::default();
        app.update(BackendResponse::RefreshFinished(RefreshStatus::Failed(
            "helper lookup failed".to_string(),
        )));

        let screen = rendered(&app);
        assert!(screen.contains("Unable to refresh auth: helper lookup failed"));
        assert!(screen.contains("r: refresh auth"));
    }

    #[test]
    fn test_verification_message_is_visible() {
        let mut app = App::default();
        app.update(BackendResponse::Verification(
            "Go to https://microsoft.com/devicelogin and enter code XYZ-123".to_string(),
        ));

        assert!(rendered(&app).contains("enter code XYZ-123"));
    }
}
