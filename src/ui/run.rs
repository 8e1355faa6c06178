use crate::config::AppConfig;
use crate::error::AppError;
use crate::models::WindowView;
use crate::service::QuotaService;
use crate::tracker::QuotaTracker;
use crate::ui::app::{AppState, Screen};
use chrono::Utc;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::Line;
use ratatui::widgets::{Block, Borders, Clear, Gauge, Paragraph};
use ratatui::Terminal;
use std::io;
use std::time::{Duration as StdDuration, Instant};

const COLOR_OK: Color = Color::Green;
const COLOR_WARN: Color = Color::Yellow;
const COLOR_OVER: Color = Color::Red;
const COLOR_MUTED: Color = Color::DarkGray;
const COLOR_HEADER: Color = Color::White;

pub async fn run_tui(cfg: &AppConfig) -> Result<(), AppError> {
    let tracker = QuotaTracker::from_config(cfg)?;
    let service = QuotaService::new()?;

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    stdout.execute(EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let loop_result = run_loop(&mut terminal, cfg, &tracker, &service).await;

    disable_raw_mode()?;
    terminal.backend_mut().execute(LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    loop_result
}

async fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    cfg: &AppConfig,
    tracker: &QuotaTracker,
    service: &QuotaService,
) -> Result<(), AppError> {
    let mut state = AppState {
        backend: tracker.describe_backend(),
        ..AppState::default()
    };
    let order: Vec<String> = tracker.periods().iter().map(|p| p.key.clone()).collect();
    let mut last_tick = Instant::now();
    let tick_rate = StdDuration::from_secs(cfg.refresh_seconds.max(5));

    refresh_dashboard(&mut state, tracker);

    while state.running {
        terminal.draw(|f| render(f, &state, &order))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| StdDuration::from_millis(0));

        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                handle_key(key.code, key.modifiers, &mut state, cfg, tracker, service).await;
            }
        }

        if last_tick.elapsed() >= tick_rate {
            refresh_dashboard(&mut state, tracker);
            last_tick = Instant::now();
        }
    }

    Ok(())
}

async fn handle_key(
    code: KeyCode,
    modifiers: KeyModifiers,
    state: &mut AppState,
    cfg: &AppConfig,
    tracker: &QuotaTracker,
    service: &QuotaService,
) {
    if modifiers.contains(KeyModifiers::CONTROL) && code == KeyCode::Char('c') {
        state.running = false;
        return;
    }

    if state.screen == Screen::ErrorDialog {
        if matches!(code, KeyCode::Enter | KeyCode::Esc) {
            state.screen = Screen::Dashboard;
        }
        return;
    }

    match code {
        KeyCode::Char('q') | KeyCode::Esc => state.running = false,
        KeyCode::Char('r') => refresh_dashboard(state, tracker),
        KeyCode::Char('p') => {
            state.status = "polling API...".into();
            match service.poll(cfg, tracker).await {
                Ok(view) => {
                    state.view = Some(view);
                    state.last_refresh = Utc::now().format("%H:%M:%S").to_string();
                    state.status = "polled".into();
                }
                Err(err) => {
                    state.status = "poll failed".into();
                    state.show_error(err.to_string());
                }
            }
        }
        KeyCode::Char('z') => {
            state.compact_mode = !state.compact_mode;
            state.status = if state.compact_mode {
                "compact mode enabled".into()
            } else {
                "compact mode disabled".into()
            };
        }
        _ => {}
    }
}

fn refresh_dashboard(state: &mut AppState, tracker: &QuotaTracker) {
    match tracker.read() {
        Ok(view) => {
            state.view = Some(view);
            state.last_refresh = Utc::now().format("%H:%M:%S").to_string();
            state.status = "ok".into();
        }
        Err(err) => {
            state.status = format!("refresh failed: {err}");
        }
    }
}

fn gauge_color(percent: i64) -> Color {
    match percent {
        p if p >= 100 => COLOR_OVER,
        p if p >= 80 => COLOR_WARN,
        _ => COLOR_OK,
    }
}

fn gauge_ratio(percent: i64) -> f64 {
    (percent as f64 / 100.0).clamp(0.0, 1.0)
}

fn gauge_label(window: &WindowView, compact: bool) -> String {
    if compact {
        return format!("{}%", window.percent);
    }
    format!(
        "{}%  ·  {:.0}/{:.0}  ·  resets in {}",
        window.percent, window.used, window.limit, window.resets_in
    )
}

fn render(f: &mut ratatui::Frame, state: &AppState, order: &[String]) {
    let size = f.area();
    let compact = state.compact_mode || size.width < 80;
    let windows = state.ordered_windows(order);

    let mut constraints = vec![Constraint::Length(3)];
    constraints.extend(windows.iter().map(|_| Constraint::Length(3)));
    constraints.push(Constraint::Min(0));
    constraints.push(Constraint::Length(2));

    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(size);

    let (source, updated) = state
        .view
        .as_ref()
        .map(|v| {
            (
                v.source.as_label(),
                v.last_updated.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            )
        })
        .unwrap_or(("none", "never".into()));
    let header = Paragraph::new(format!(
        " quota-meter  ·  {}  ·  source {}  ·  updated {}  ·  refreshed {} ",
        state.status, source, updated, state.last_refresh
    ))
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" {} ", state.backend)),
    )
    .style(Style::default().fg(COLOR_HEADER));
    f.render_widget(header, root[0]);

    for (idx, (key, window)) in windows.iter().enumerate() {
        let gauge = Gauge::default()
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(format!(" {key} ")),
            )
            .gauge_style(
                Style::default()
                    .fg(gauge_color(window.percent))
                    .add_modifier(Modifier::BOLD),
            )
            .ratio(gauge_ratio(window.percent))
            .label(gauge_label(window, compact));
        f.render_widget(gauge, root[idx + 1]);
    }

    let footer = Paragraph::new("r refresh | p poll API | z compact | q quit")
        .block(Block::default().borders(Borders::ALL))
        .style(Style::default().fg(COLOR_MUTED));
    f.render_widget(footer, root[root.len() - 1]);

    if state.screen == Screen::ErrorDialog {
        render_error(f, state);
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn render_error(f: &mut ratatui::Frame, state: &AppState) {
    let area = centered_rect(60, 30, f.area());
    f.render_widget(Clear, area);
    let content = Paragraph::new(vec![
        Line::from(state.error_message.clone()),
        Line::from(""),
        Line::from("Press Enter or Esc"),
    ])
    .block(Block::default().borders(Borders::ALL).title(" Error "))
    .style(Style::default().fg(Color::Red));
    f.render_widget(content, area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn window(percent: i64) -> WindowView {
        WindowView {
            used: percent as f64,
            limit: 100.0,
            resets_at: Utc::now() + Duration::hours(1),
            percent,
            remaining: 100.0 - percent as f64,
            time_until_reset: "0h 59m".into(),
            resets_in: "0h 59m".into(),
        }
    }

    #[test]
    fn gauge_color_escalates_with_usage() {
        assert_eq!(gauge_color(10), COLOR_OK);
        assert_eq!(gauge_color(80), COLOR_WARN);
        assert_eq!(gauge_color(135), COLOR_OVER);
    }

    #[test]
    fn gauge_ratio_is_clamped_for_overage() {
        assert_eq!(gauge_ratio(150), 1.0);
        assert_eq!(gauge_ratio(-5), 0.0);
        assert!((gauge_ratio(42) - 0.42).abs() < 1e-9);
    }

    #[test]
    fn gauge_label_shows_reset_unless_compact() {
        assert_eq!(
            gauge_label(&window(42), false),
            "42%  ·  42/100  ·  resets in 0h 59m"
        );
        assert_eq!(gauge_label(&window(42), true), "42%");
    }

    #[tokio::test]
    async fn quit_and_compact_keys_update_state() {
        let cfg = AppConfig::default();
        let tracker = QuotaTracker::with_defaults(Box::new(crate::storage::MemoryBackend::new()));
        let service = QuotaService::new().expect("service");
        let mut state = AppState::default();

        handle_key(
            KeyCode::Char('z'),
            KeyModifiers::NONE,
            &mut state,
            &cfg,
            &tracker,
            &service,
        )
        .await;
        assert!(state.compact_mode);

        handle_key(
            KeyCode::Char('r'),
            KeyModifiers::NONE,
            &mut state,
            &cfg,
            &tracker,
            &service,
        )
        .await;
        assert!(state.view.is_some());
        assert_eq!(state.status, "ok");

        handle_key(
            KeyCode::Char('q'),
            KeyModifiers::NONE,
            &mut state,
            &cfg,
            &tracker,
            &service,
        )
        .await;
        assert!(!state.running);
    }
}
