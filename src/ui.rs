use crate::{
    client::AppSnapshot,
    program::InstructionKind,
    submission::SubmissionState,
};
use color_eyre::eyre::{
    Result,
    eyre,
};
use crossterm::{
    event::{
        self,
        Event,
        KeyCode,
        KeyEventKind,
        KeyModifiers,
    },
    terminal::{
        disable_raw_mode,
        enable_raw_mode,
    },
};
use ratatui::{
    prelude::*,
    widgets::*,
};
use std::io::stdout;
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserEvent {
    Quit,
    Initialize,
    MoveLeft,
    MoveRight,
    Refresh,
    Redraw,
}

pub type InputEventReceiver = mpsc::UnboundedReceiver<std::io::Result<Event>>;

#[derive(Default)]
pub struct UiState {
    terminal: Option<Terminal<CrosstermBackend<std::io::Stdout>>>,
}

pub fn terminal_enter(state: &mut UiState) -> Result<()> {
    enable_raw_mode()?;
    crossterm::execute!(std::io::stdout(), crossterm::terminal::EnterAlternateScreen)?;
    // single persistent Terminal so buffers survive across draws
    let backend = CrosstermBackend::new(stdout());
    let terminal = Terminal::new(backend)?;
    state.terminal = Some(terminal);
    Ok(())
}

pub fn terminal_exit() -> Result<()> {
    disable_raw_mode()?;
    crossterm::execute!(std::io::stdout(), crossterm::terminal::LeaveAlternateScreen)?;
    Ok(())
}

/// Reads terminal events on a dedicated thread; `event::read` blocks.
pub fn input_event_stream() -> InputEventReceiver {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        loop {
            let event = event::read();
            let failed = event.is_err();
            if tx.send(event).is_err() || failed {
                break;
            }
        }
    });
    rx
}

pub async fn next_raw_event(input: &mut InputEventReceiver) -> Result<Event> {
    match input.recv().await {
        Some(event) => Ok(event?),
        None => Err(eyre!("terminal input closed")),
    }
}

pub fn interpret_event(event: Event) -> Option<UserEvent> {
    let key = match event {
        Event::Key(key) if key.kind == KeyEventKind::Press => key,
        Event::Resize(..) => return Some(UserEvent::Redraw),
        _ => return None,
    };
    let ev = match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            UserEvent::Quit
        }
        KeyCode::Char('q') | KeyCode::Esc => UserEvent::Quit,
        KeyCode::Char('i') => UserEvent::Initialize,
        KeyCode::Left | KeyCode::Char('h') => UserEvent::MoveLeft,
        KeyCode::Right | KeyCode::Char('l') => UserEvent::MoveRight,
        KeyCode::Char('g') => UserEvent::Refresh,
        _ => return None,
    };
    Some(ev)
}

pub fn draw(state: &mut UiState, snap: &AppSnapshot) -> Result<()> {
    if let Some(term) = state.terminal.as_mut() {
        term.draw(|f| ui(f, snap))?;
    }
    Ok(())
}

fn ui(f: &mut Frame, snap: &AppSnapshot) {
    f.render_widget(Clear, f.area());
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(5), // network + accounts
            Constraint::Length(7), // adventure
            Constraint::Length(3), // actions
            Constraint::Min(4),    // status/errors
            Constraint::Length(3), // help
        ])
        .split(f.area());

    draw_header(f, chunks[0], snap);
    draw_adventure(f, chunks[1], snap);
    draw_actions(f, chunks[2], snap);
    draw_status(f, chunks[3], snap);
    let help = Paragraph::new("i initialize | ←/h left | →/l right | g get data | q/Esc quit")
        .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(help, chunks[4]);
}

fn draw_header(f: &mut Frame, area: Rect, snap: &AppSnapshot) {
    let wallet = snap
        .wallet
        .as_ref()
        .map(|w| w.to_string())
        .unwrap_or_else(|| String::from("not connected (relay)"));
    let lines = vec![
        Line::from(format!("Network: {}", snap.network)),
        Line::from(format!("Game account: {}", snap.game_account)),
        Line::from(format!("Wallet: {wallet}")),
    ];
    let widget = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Tiny Adventure"));
    f.render_widget(widget, area);
}

fn draw_adventure(f: &mut Frame, area: Rect, snap: &AppSnapshot) {
    let heading = if snap.display.message.is_empty() {
        Line::from("")
    } else {
        Line::from(snap.display.message.clone()).style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        )
    };
    let position = match snap.view.account {
        Some(account) => format!(
            "position {} (slot {}, v{})",
            account.player_position, snap.view.slot, snap.view.version
        ),
        None => String::from("no game data"),
    };
    let lines = vec![
        heading,
        Line::from(""),
        Line::from(snap.display.track.clone()).style(
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Line::from(""),
        Line::from(position).style(Style::default().fg(Color::DarkGray)),
    ];
    let widget = Paragraph::new(lines)
        .alignment(Alignment::Center)
        .block(Block::default().borders(Borders::ALL).title("Adventure"));
    f.render_widget(widget, area);
}

fn draw_actions(f: &mut Frame, area: Rect, snap: &AppSnapshot) {
    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Ratio(1, 3); 3])
        .split(area);
    for (kind, col) in InstructionKind::ALL.iter().zip(cols.iter()) {
        let loading = snap.in_flight == Some(*kind);
        let label = if loading {
            format!("{kind} {}", stage_label(snap.submission))
        } else {
            kind.to_string()
        };
        let style = if loading {
            Style::default().fg(Color::Black).bg(Color::Yellow)
        } else if snap.in_flight.is_some() {
            Style::default().fg(Color::DarkGray)
        } else {
            Style::default()
        };
        let widget = Paragraph::new(label)
            .alignment(Alignment::Center)
            .style(style)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(widget, *col);
    }
}

fn stage_label(state: SubmissionState) -> &'static str {
    match state {
        SubmissionState::Building => "(building...)",
        SubmissionState::Signing => "(signing...)",
        SubmissionState::Submitted => "(confirming...)",
        _ => "(...)",
    }
}

fn draw_status(f: &mut Frame, area: Rect, snap: &AppSnapshot) {
    let status_widget = if snap.errors.is_empty() {
        let text = if snap.status.trim().is_empty() {
            "Ready"
        } else {
            snap.status.as_str()
        };
        Paragraph::new(text)
            .wrap(Wrap { trim: false })
            .block(Block::default().borders(Borders::ALL).title("Status"))
            .style(Style::default().fg(Color::Green))
    } else {
        let mut lines = vec![Line::from(snap.status.clone())];
        for e in &snap.errors {
            lines.push(Line::from(e.clone()).style(Style::default().fg(Color::Red)));
        }
        Paragraph::new(lines)
            .wrap(Wrap { trim: false })
            .block(Block::default().borders(Borders::ALL).title("Errors"))
    };
    f.render_widget(status_widget, area);
}
