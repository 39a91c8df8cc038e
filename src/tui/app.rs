#![forbid(unsafe_code)]

use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState, Wrap};

use crate::engine::TaskSnapshot;
use crate::engine::events::EngineUpdate;
use crate::engine::runtime::EngineHandle;
use crate::task::state::Phase;
use crate::tui::{self, TerminalGuard};

const INPUT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    None,
    Start(usize),
    Quit,
}

#[derive(Debug)]
struct AppState {
    tasks: Vec<TaskSnapshot>,
    table_state: TableState,
    unlock_all: bool,
    result: String,
    trouble: String,
}

impl AppState {
    fn new(tasks: Vec<TaskSnapshot>, unlock_all: bool) -> Self {
        let mut table_state = TableState::default();
        table_state.select((!tasks.is_empty()).then_some(0));
        Self {
            tasks,
            table_state,
            unlock_all,
            result: String::new(),
            trouble: String::new(),
        }
    }

    fn selected(&self) -> usize {
        self.table_state.selected().unwrap_or(0)
    }

    fn move_selection(&mut self, delta: i64) {
        if self.tasks.is_empty() {
            return;
        }
        let last = i64::try_from(self.tasks.len() - 1).unwrap_or(i64::MAX);
        let cur = i64::try_from(self.selected()).unwrap_or(0);
        let next = (cur + delta).clamp(0, last);
        self.table_state
            .select(Some(usize::try_from(next).unwrap_or(0)));
    }

    fn running_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.phase == Phase::Running)
            .count()
    }

    fn apply(&mut self, update: EngineUpdate) {
        match update {
            EngineUpdate::Changed(snap) => {
                match snap.phase {
                    Phase::Running => {
                        self.result.clone_from(&snap.last_message);
                        self.trouble.clear();
                    }
                    Phase::Completed => self.result = format!("✅ {}", snap.last_message),
                    Phase::Failed => {
                        self.result = format!("❌ {}", snap.last_message);
                        self.trouble = snap.hint.clone().unwrap_or_default();
                    }
                    Phase::Locked | Phase::Ready => {}
                }
                if let Some(slot) = self.tasks.get_mut(snap.index) {
                    *slot = snap;
                }
            }
            EngineUpdate::Tick {
                index,
                frame,
                symbol,
            } => {
                if let Some(t) = self.tasks.get_mut(index)
                    && t.phase == Phase::Running
                {
                    t.animation_tick = frame;
                    t.spinner = Some(symbol);
                    t.status = format!("Running {symbol}");
                }
            }
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> Action {
        if key.kind != KeyEventKind::Press {
            return Action::None;
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => Action::Quit,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Action::Quit,
            KeyCode::Up | KeyCode::Char('k') => {
                self.move_selection(-1);
                Action::None
            }
            KeyCode::Down | KeyCode::Char('j') => {
                self.move_selection(1);
                Action::None
            }
            KeyCode::Home | KeyCode::Char('g') => {
                self.table_state.select(Some(0));
                Action::None
            }
            KeyCode::End | KeyCode::Char('G') => {
                self.move_selection(i64::MAX / 2);
                Action::None
            }
            KeyCode::Enter | KeyCode::Char('r' | ' ') => {
                let i = self.selected();
                match self.tasks.get(i) {
                    Some(t) if t.phase.is_startable() => Action::Start(i),
                    _ => Action::None,
                }
            }
            _ => Action::None,
        }
    }
}

/// Interactive presenter. Returns the engine's final state after every
/// running task has finished.
pub async fn run(mut handle: EngineHandle, unlock_all: bool) -> anyhow::Result<Vec<TaskSnapshot>> {
    let mut app = AppState::new(handle.snapshot(), unlock_all);
    {
        let mut guard = TerminalGuard::new(tui::init_terminal()?);
        loop {
            for update in handle.pending_updates() {
                app.apply(update);
            }

            let Some(terminal) = guard.terminal() else {
                anyhow::bail!("terminal unavailable");
            };
            terminal.draw(|f| draw(f, &mut app))?;

            if event::poll(INPUT_POLL)?
                && let Event::Key(key) = event::read()?
            {
                match app.handle_key(key) {
                    Action::Start(i) => handle.request_start(i),
                    Action::Quit => break,
                    Action::None => {}
                }
            }
        }
    }

    let running = app.running_count();
    if running > 0 {
        eprintln!("waiting for {running} running task(s) to finish...");
    }
    handle.shutdown().await
}

fn draw(f: &mut Frame<'_>, app: &mut AppState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(5),
            Constraint::Length(4),
            Constraint::Length(5),
            Constraint::Length(1),
        ])
        .split(f.area());

    draw_header(f, chunks[0], app);
    draw_tasks(f, chunks[1], app);

    let result = Paragraph::new(app.result.as_str())
        .block(Block::default().borders(Borders::ALL).title("Result"))
        .wrap(Wrap { trim: false });
    f.render_widget(result, chunks[2]);

    let trouble = Paragraph::new(app.trouble.as_str())
        .style(Style::default().fg(Color::Red))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Troubleshooting"),
        )
        .wrap(Wrap { trim: true });
    f.render_widget(trouble, chunks[3]);

    let footer = Paragraph::new(Line::from(vec![
        Span::styled("↑/↓", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw(" select  "),
        Span::styled("enter", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw(" run  "),
        Span::styled("q", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw(" quit"),
    ]))
    .style(Style::default().fg(Color::DarkGray));
    f.render_widget(footer, chunks[4]);
}

fn draw_header(f: &mut Frame<'_>, area: Rect, app: &AppState) {
    let done = app
        .tasks
        .iter()
        .filter(|t| t.phase == Phase::Completed)
        .count();
    let mode = if app.unlock_all {
        "unlock-all"
    } else {
        "sequential"
    };
    let line = Line::from(vec![
        Span::styled(
            "scriptgate",
            Style::default().add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!("  {done}/{} completed  mode: {mode}", app.tasks.len())),
    ]);
    f.render_widget(Paragraph::new(line), area);
}

fn draw_tasks(f: &mut Frame<'_>, area: Rect, app: &mut AppState) {
    let header = Row::new(["Task", "Status", "Description"])
        .style(Style::default().add_modifier(Modifier::BOLD));
    let rows = app.tasks.iter().map(|t| {
        Row::new(vec![
            Cell::from(t.name.clone()),
            Cell::from(t.status.clone()).style(phase_style(t.phase)),
            Cell::from(t.description.clone()),
        ])
    });
    let table = Table::new(
        rows,
        [
            Constraint::Length(16),
            Constraint::Length(14),
            Constraint::Min(10),
        ],
    )
    .header(header)
    .block(Block::default().borders(Borders::ALL).title("Tasks"))
    .row_highlight_style(Style::default().add_modifier(Modifier::REVERSED));
    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn phase_style(phase: Phase) -> Style {
    match phase {
        Phase::Locked => Style::default().fg(Color::DarkGray),
        Phase::Ready | Phase::Completed => Style::default().fg(Color::Green),
        Phase::Running => Style::default().fg(Color::Blue),
        Phase::Failed => Style::default().fg(Color::Red),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::PrivilegeMode;

    fn snap(index: usize, phase: Phase) -> TaskSnapshot {
        TaskSnapshot {
            index,
            name: format!("t{index}"),
            description: String::new(),
            privilege: PrivilegeMode::Normal,
            phase,
            status: phase.label().to_owned(),
            animation_tick: 0,
            spinner: None,
            last_message: String::new(),
            attempts: 0,
            last_exit_code: None,
            last_stderr: String::new(),
            finished_at: None,
            hint: None,
        }
    }

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn enter_only_requests_startable_tasks() {
        let mut app = AppState::new(vec![snap(0, Phase::Ready), snap(1, Phase::Locked)], false);
        assert_eq!(app.handle_key(press(KeyCode::Enter)), Action::Start(0));
        app.handle_key(press(KeyCode::Down));
        assert_eq!(app.selected(), 1);
        assert_eq!(app.handle_key(press(KeyCode::Enter)), Action::None);
        app.handle_key(press(KeyCode::Down));
        assert_eq!(app.selected(), 1);
        assert_eq!(app.handle_key(press(KeyCode::Char('q'))), Action::Quit);
    }

    #[test]
    fn failure_shows_message_and_hint() {
        let mut app = AppState::new(vec![snap(0, Phase::Running)], false);
        let mut failed = snap(0, Phase::Failed);
        failed.last_message = "Error in t0:\nperm denied".to_owned();
        failed.hint = Some("Check sudo.".to_owned());
        app.apply(EngineUpdate::Changed(failed));
        assert_eq!(app.tasks[0].phase, Phase::Failed);
        assert!(app.result.contains("perm denied"));
        assert_eq!(app.trouble, "Check sudo.");
        assert_eq!(app.handle_key(press(KeyCode::Char('r'))), Action::Start(0));
    }

    #[test]
    fn ticks_update_only_running_rows() {
        let mut app = AppState::new(vec![snap(0, Phase::Running), snap(1, Phase::Ready)], true);
        app.apply(EngineUpdate::Tick {
            index: 0,
            frame: 1,
            symbol: '/',
        });
        app.apply(EngineUpdate::Tick {
            index: 1,
            frame: 1,
            symbol: '/',
        });
        assert_eq!(app.tasks[0].status, "Running /");
        assert_eq!(app.tasks[1].status, "Ready");
        assert_eq!(app.running_count(), 1);
    }
}
