/// dashboard.rs – ratatui live terminal dashboard for `stratdesk watch`.
///
/// Layout (6 panels):
///  ┌─ Header ──────────────────────────────────────────────────────────┐
///  │ StratDesk │ user │ market feed status │ strategy feed status      │
///  ├─ Quotes ──────────────────────┬─ Strategies ──────────────────────┤
///  │ last quote per symbol         │ status + P&L per subscription     │
///  ├─ Candles ─────────────────────┼─ Activity ────────────────────────┤
///  │ current bar per symbol        │ recent order/position updates     │
///  │                               ├─ Logs ────────────────────────────┤
///  │                               │ timestamped log lines             │
///  └───────────────────────────────┴───────────────────────────────────┘
use chrono::Utc;
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, List, ListItem, Paragraph, Row, Table},
    Frame, Terminal,
};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Stdout};

use crate::market_feed::MarketFeedState;
use crate::models::{CurrentCandle, PnlUpdate, Quote, StrategyEvent, StrategyStatusUpdate, SubscriptionStatus};
use crate::socket::ConnectionStatus;
use crate::strategy_feed::StrategyFeedState;

pub type CrossTerm = Terminal<CrosstermBackend<Stdout>>;

const MAX_LOG_LINES: usize = 200;

/// Everything one frame needs, copied out of the feeds once per tick.
#[derive(Debug, Clone)]
pub struct DashboardState {
    pub user: String,
    pub market_status: ConnectionStatus,
    pub strategy_status: ConnectionStatus,
    pub symbols: Vec<String>,
    pub acknowledged: Vec<String>,
    pub quotes: HashMap<String, Quote>,
    pub candles: HashMap<String, CurrentCandle>,
    pub statuses: HashMap<String, StrategyStatusUpdate>,
    pub pnl: HashMap<String, PnlUpdate>,
    pub events: Vec<StrategyEvent>,
    pub market_error: Option<String>,
    pub strategy_error: Option<String>,
    pub logs: VecDeque<String>,
}

impl DashboardState {
    pub fn new(user: String, symbols: Vec<String>) -> Self {
        Self {
            user,
            market_status: ConnectionStatus::Idle,
            strategy_status: ConnectionStatus::Idle,
            symbols,
            acknowledged: Vec::new(),
            quotes: HashMap::new(),
            candles: HashMap::new(),
            statuses: HashMap::new(),
            pnl: HashMap::new(),
            events: Vec::new(),
            market_error: None,
            strategy_error: None,
            logs: VecDeque::new(),
        }
    }

    pub fn add_log(&mut self, msg: String) {
        let line = format!("{} {}", Utc::now().format("%H:%M:%S"), msg);
        self.logs.push_front(line);
        while self.logs.len() > MAX_LOG_LINES {
            self.logs.pop_back();
        }
    }

    pub fn sync_market(&mut self, status: ConnectionStatus, feed: &MarketFeedState) {
        self.market_status = status;
        self.acknowledged = feed.subscribed.clone();
        self.quotes = feed.quotes.clone();
        self.candles = feed.candles.clone();
        self.market_error = feed.error.clone();
    }

    pub fn sync_strategies(&mut self, status: ConnectionStatus, feed: &StrategyFeedState) {
        self.strategy_status = status;
        self.statuses = feed.statuses.clone();
        self.pnl = feed.pnl.clone();
        self.events = feed.events.iter().cloned().collect();
        self.strategy_error = feed.error.clone();
    }
}

// ---------------------------------------------------------------------------
// Setup / teardown
// ---------------------------------------------------------------------------

pub fn setup_terminal() -> anyhow::Result<CrossTerm> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Ok(Terminal::new(backend)?)
}

pub fn teardown_terminal(terminal: &mut CrossTerm) -> anyhow::Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

/// Returns `true` when the user requests quit (q or Ctrl-C).
pub fn handle_event(event: &Event) -> bool {
    matches!(
        event,
        Event::Key(k)
            if k.code == KeyCode::Char('q')
            || k.code == KeyCode::Char('Q')
            || (k.code == KeyCode::Char('c') && k.modifiers.contains(KeyModifiers::CONTROL))
    )
}

// ---------------------------------------------------------------------------
// Render
// ---------------------------------------------------------------------------

pub fn render(frame: &mut Frame, state: &DashboardState) {
    let area = frame.size();

    let outer = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)])
        .split(area);

    render_header(frame, outer[0], state);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(outer[1]);

    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(body[0]);

    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage(35),
            Constraint::Percentage(35),
            Constraint::Percentage(30),
        ])
        .split(body[1]);

    render_quotes(frame, left[0], state);
    render_candles(frame, left[1], state);
    render_strategies(frame, right[0], state);
    render_activity(frame, right[1], state);
    render_logs(frame, right[2], state);
}

fn status_span(label: &str, status: &ConnectionStatus) -> Span<'static> {
    let color = match status {
        ConnectionStatus::Connected => Color::Green,
        ConnectionStatus::Connecting | ConnectionStatus::ReconnectScheduled { .. } => Color::Yellow,
        ConnectionStatus::Failed(_) => Color::Red,
        ConnectionStatus::Idle | ConnectionStatus::Closed => Color::DarkGray,
    };
    let dot = if status.is_connected() { "●" } else { "○" };
    Span::styled(
        format!("{label}{dot} {}", status.label()),
        Style::default().fg(color),
    )
}

fn pnl_color(v: f64) -> Color {
    if v >= 0.0 {
        Color::Green
    } else {
        Color::Red
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|p| format!("{p:.2}")).unwrap_or_else(|| "—".into())
}

fn header_row(titles: &[&'static str]) -> Row<'static> {
    let cells = titles
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().add_modifier(Modifier::BOLD)));
    Row::new(cells)
        .style(Style::default().bg(Color::DarkGray))
        .height(1)
}

fn render_header(frame: &mut Frame, area: Rect, state: &DashboardState) {
    let total_pnl: f64 = state.pnl.values().map(PnlUpdate::total).sum();
    let line = Line::from(vec![
        Span::styled(
            "  StratDesk  │ ",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!("{}  │ ", state.user)),
        Span::styled(
            format!("P&L: {total_pnl:+.2}  │ "),
            Style::default()
                .fg(pnl_color(total_pnl))
                .add_modifier(Modifier::BOLD),
        ),
        status_span("MKT", &state.market_status),
        Span::raw("  "),
        status_span("STRAT", &state.strategy_status),
        Span::styled("  [q] quit", Style::default().fg(Color::DarkGray)),
    ]);

    let header =
        Paragraph::new(line).block(Block::default().borders(Borders::ALL).title(" StratDesk "));
    frame.render_widget(header, area);
}

fn render_quotes(frame: &mut Frame, area: Rect, state: &DashboardState) {
    let rows: Vec<Row> = state
        .symbols
        .iter()
        .map(|symbol| {
            let acked = state.acknowledged.contains(symbol);
            let sym = Cell::from(symbol.clone()).style(Style::default().fg(if acked {
                Color::White
            } else {
                Color::DarkGray
            }));
            match state.quotes.get(symbol) {
                Some(q) => {
                    let change = q.change_percent.unwrap_or(0.0);
                    Row::new(vec![
                        sym,
                        Cell::from(format!("{:.2}", q.last_price))
                            .style(Style::default().add_modifier(Modifier::BOLD)),
                        Cell::from(format!("{change:+.2}%"))
                            .style(Style::default().fg(pnl_color(change))),
                        Cell::from(fmt_opt(q.bid)).style(Style::default().fg(Color::Green)),
                        Cell::from(fmt_opt(q.ask)).style(Style::default().fg(Color::Red)),
                        Cell::from(q.volume.map(|v| format!("{v:.0}")).unwrap_or_default()),
                    ])
                }
                None => Row::new(vec![
                    sym,
                    Cell::from("—"),
                    Cell::from("—"),
                    Cell::from("—"),
                    Cell::from("—"),
                    Cell::from(""),
                ]),
            }
        })
        .collect();

    let mut title = format!(
        " Quotes ({}/{} acked) ",
        state.acknowledged.len(),
        state.symbols.len()
    );
    if let Some(err) = &state.market_error {
        title = format!("{title}! {err} ");
    }

    let table = Table::new(
        rows,
        [
            Constraint::Length(14),
            Constraint::Length(10),
            Constraint::Length(8),
            Constraint::Length(9),
            Constraint::Length(9),
            Constraint::Min(8),
        ],
    )
    .header(header_row(&["Symbol", "LTP", "Chg", "Bid", "Ask", "Volume"]))
    .block(Block::default().borders(Borders::ALL).title(title));

    frame.render_widget(table, area);
}

fn render_candles(frame: &mut Frame, area: Rect, state: &DashboardState) {
    let rows: Vec<Row> = state
        .symbols
        .iter()
        .filter_map(|symbol| state.candles.get(symbol).map(|c| (symbol, c)))
        .map(|(symbol, current)| {
            let c = &current.candle;
            let color = if c.is_bullish() { Color::Green } else { Color::Red };
            Row::new(vec![
                Cell::from(symbol.clone()),
                Cell::from(format!("{:.2}", c.open)),
                Cell::from(format!("{:.2}", c.high)),
                Cell::from(format!("{:.2}", c.low)),
                Cell::from(format!("{:.2}", c.close)).style(Style::default().fg(color)),
                Cell::from(if current.is_partial { "live" } else { "closed" }),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(14),
            Constraint::Length(9),
            Constraint::Length(9),
            Constraint::Length(9),
            Constraint::Length(9),
            Constraint::Min(6),
        ],
    )
    .header(header_row(&["Symbol", "Open", "High", "Low", "Close", "Bar"]))
    .block(Block::default().borders(Borders::ALL).title(" Current Candles "));

    frame.render_widget(table, area);
}

fn render_strategies(frame: &mut Frame, area: Rect, state: &DashboardState) {
    let mut ids: Vec<&String> = state.statuses.keys().chain(state.pnl.keys()).collect();
    ids.sort();
    ids.dedup();

    let rows: Vec<Row> = ids
        .into_iter()
        .map(|id| {
            let status = state
                .statuses
                .get(id)
                .map(|s| s.status)
                .unwrap_or_default();
            let status_color = match status {
                SubscriptionStatus::Active => Color::Green,
                SubscriptionStatus::Paused => Color::Yellow,
                SubscriptionStatus::Stopped => Color::Red,
                _ => Color::Gray,
            };
            let pnl = state.pnl.get(id);
            let total = pnl.map(PnlUpdate::total).unwrap_or(0.0);
            Row::new(vec![
                Cell::from(id.clone()),
                Cell::from(status.as_str()).style(Style::default().fg(status_color)),
                Cell::from(format!("{:+.2}", pnl.map(|p| p.realized_pnl).unwrap_or(0.0))),
                Cell::from(format!("{:+.2}", pnl.map(|p| p.unrealized_pnl).unwrap_or(0.0))),
                Cell::from(format!("{total:+.2}")).style(
                    Style::default()
                        .fg(pnl_color(total))
                        .add_modifier(Modifier::BOLD),
                ),
            ])
        })
        .collect();

    let mut title = " Strategies ".to_string();
    if let Some(err) = &state.strategy_error {
        title = format!("{title}! {err} ");
    }

    let table = Table::new(
        rows,
        [
            Constraint::Length(12),
            Constraint::Length(9),
            Constraint::Length(10),
            Constraint::Length(10),
            Constraint::Min(10),
        ],
    )
    .header(header_row(&["Sub", "Status", "Realized", "Unreal.", "Total"]))
    .block(Block::default().borders(Borders::ALL).title(title));

    frame.render_widget(table, area);
}

fn render_activity(frame: &mut Frame, area: Rect, state: &DashboardState) {
    let items: Vec<ListItem> = state
        .events
        .iter()
        .take(area.height as usize)
        .map(|ev| {
            let color = match ev {
                StrategyEvent::Order(o) if o.dry_run => Color::Yellow,
                StrategyEvent::Order(o) if o.side.eq_ignore_ascii_case("buy") => Color::Green,
                StrategyEvent::Order(_) => Color::Red,
                StrategyEvent::Position(_) => Color::Cyan,
            };
            ListItem::new(Line::from(Span::styled(
                format!("[{}] {}", ev.subscription_id(), ev.summary()),
                Style::default().fg(color),
            )))
        })
        .collect();

    let list = List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" Activity ({}) ", state.events.len())),
    );
    frame.render_widget(list, area);
}

fn render_logs(frame: &mut Frame, area: Rect, state: &DashboardState) {
    let items: Vec<ListItem> = state
        .logs
        .iter()
        .take(area.height as usize)
        .map(|line| {
            let color = if line.contains("ERROR") || line.contains("failed") {
                Color::Red
            } else if line.contains("reconnect") || line.contains("DRY") {
                Color::Yellow
            } else if line.contains("connected") {
                Color::Green
            } else {
                Color::Gray
            };
            ListItem::new(Line::from(Span::styled(
                line.clone(),
                Style::default().fg(color),
            )))
        })
        .collect();

    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(" Logs "))
        .style(Style::default().fg(Color::White));

    frame.render_widget(list, area);
}
