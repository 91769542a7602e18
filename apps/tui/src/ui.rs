//! UI rendering module.
//!
//! Contains all the widget rendering logic (View).

use ratatui::{
    Frame,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span, Text},
    widgets::{Block, Borders, Gauge, List, ListItem, Padding, Paragraph, Sparkline, Tabs, Wrap},
};

use crate::app::{App, ConnectionStatus, Focus, LogEntry, LogLevel, Tab};
use flowmaster_core::UpdatePhase;

/// Main draw function.
pub fn draw(frame: &mut Frame, app: &App) {
    let area = frame.area();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header/tabs
            Constraint::Min(10),   // Main content
            Constraint::Length(3), // Footer/status bar
        ])
        .split(area);

    draw_header(frame, chunks[0], app);

    match app.current_tab {
        Tab::Main => draw_main_view(frame, chunks[1], app),
        Tab::Logs => draw_logs_view(frame, chunks[1], app),
        Tab::Help => draw_help_view(frame, chunks[1]),
    }

    draw_footer(frame, chunks[2], app);
}

fn draw_header(frame: &mut Frame, area: Rect, app: &App) {
    let titles = vec!["Monitor", "Logs (F2)", "Help (F1)"];
    let selected = match app.current_tab {
        Tab::Main => 0,
        Tab::Logs => 1,
        Tab::Help => 2,
    };

    let tabs = Tabs::new(titles)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan))
                .title(" Flowmaster ")
                .title_style(
                    Style::default()
                        .fg(Color::Cyan)
                        .add_modifier(Modifier::BOLD),
                ),
        )
        .select(selected)
        .style(Style::default().fg(Color::White))
        .highlight_style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        )
        .divider(symbols::DOT);

    frame.render_widget(tabs, area);
}

fn draw_footer(frame: &mut Frame, area: Rect, app: &App) {
    let status = match &app.connection {
        ConnectionStatus::Connecting => {
            Span::styled(" ○ Connecting ", Style::default().fg(Color::Yellow))
        }
        ConnectionStatus::Connected { port, pwm_top } => Span::styled(
            format!(" ● {} (top {}) ", port, pwm_top),
            Style::default().fg(Color::Green),
        ),
        ConnectionStatus::Failed(_) => {
            Span::styled(" ○ Disconnected ", Style::default().fg(Color::Red))
        }
    };

    let phase = Span::styled(format!(" {} ", app.phase), Style::default().fg(Color::Cyan));

    let help = Span::styled(
        " Ctrl+Q: Quit | Tab: Focus | Enter: Flash | Esc: Cancel ",
        Style::default().fg(Color::DarkGray),
    );

    let footer = Paragraph::new(Line::from(vec![status, phase, help])).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray)),
    );

    frame.render_widget(footer, area);
}

fn draw_main_view(frame: &mut Frame, area: Rect, app: &App) {
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(area);

    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(10), Constraint::Min(5)])
        .split(columns[0]);

    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(6), // Controls
            Constraint::Length(7), // Flash
            Constraint::Min(5),    // Recent logs
        ])
        .split(columns[1]);

    draw_telemetry(frame, left[0], app);
    draw_history(frame, left[1], app);
    draw_controls(frame, right[0], app);
    draw_flash_panel(frame, right[1], app);
    draw_recent_logs(frame, right[2], app);
}

fn field(label: &'static str, value: String) -> Line<'static> {
    Line::from(vec![
        Span::styled(label, Style::default().fg(Color::Cyan)),
        Span::styled(value, Style::default().fg(Color::White)),
    ])
}

fn draw_telemetry(frame: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray))
        .title(" Telemetry ")
        .padding(Padding::horizontal(1));

    let content = match &app.status {
        Some(s) => vec![
            field("Coolant:   ", format!("{:.2} C", s.coolant_temp)),
            field("Ambient:   ", format!("{:.2} C", s.ambient_temp)),
            field("Fan duty:  ", format!("{:.1}%", s.fan_duty_cycle * 100.0)),
            field("Pump duty: ", format!("{:.1}%", s.pump_duty_cycle * 100.0)),
            field("Fan:       ", format!("{} RPM", s.fan_rpm)),
            field("Pump:      ", format!("{} RPM", s.pump_rpm)),
            field(
                "Flow:      ",
                s.flow_rate
                    .map(|f| format!("{:.1} LPH", f))
                    .unwrap_or_else(|| "n/a".to_string()),
            ),
        ],
        None => vec![Line::from(Span::styled(
            "Waiting for status...",
            Style::default().fg(Color::DarkGray),
        ))],
    };

    frame.render_widget(Paragraph::new(content).block(block), area);
}

fn draw_history(frame: &mut Frame, area: Rect, app: &App) {
    let data: Vec<u64> = app.coolant_history.iter().copied().collect();
    let sparkline = Sparkline::default()
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::DarkGray))
                .title(" Coolant history "),
        )
        .data(&data)
        .style(Style::default().fg(Color::Cyan));

    frame.render_widget(sparkline, area);
}

fn draw_controls(frame: &mut Frame, area: Rect, app: &App) {
    let is_focused = app.focus == Focus::Controls;
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(if is_focused {
            Color::Yellow
        } else {
            Color::DarkGray
        }))
        .title(" Controls (f/F fan, p/P pump, a auto, r refresh) ")
        .padding(Padding::horizontal(1));

    let mode = if app.automatic { "automatic" } else { "manual" };
    let content = vec![
        field("Fan target:  ", format!("{:.0}%", app.fan_target * 100.0)),
        field("Pump target: ", format!("{:.0}%", app.pump_target * 100.0)),
        field("Control:     ", mode.to_string()),
    ];

    frame.render_widget(Paragraph::new(content).block(block), area);
}

fn draw_flash_panel(frame: &mut Frame, area: Rect, app: &App) {
    let is_focused = app.focus == Focus::Flash;
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(if is_focused {
            Color::Yellow
        } else {
            Color::DarkGray
        }))
        .title(" Firmware update ")
        .padding(Padding::horizontal(1));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(2), Constraint::Length(3)])
        .split(inner);

    let width = rows[0].width.saturating_sub(8) as usize;
    let path = &app.flash_path;
    let display_path = if path.len() > width && width > 3 {
        format!("...{}", &path[path.len() - (width - 3)..])
    } else {
        path.clone()
    };
    let cursor = if is_focused && !app.is_flashing {
        "▏"
    } else {
        ""
    };
    let input = Paragraph::new(Line::from(vec![
        Span::styled("Image: ", Style::default().fg(Color::Cyan)),
        Span::styled(display_path, Style::default().fg(Color::White)),
        Span::styled(cursor, Style::default().fg(Color::Yellow)),
    ]))
    .block(
        Block::default()
            .borders(Borders::BOTTOM)
            .border_style(Style::default().fg(Color::DarkGray)),
    );
    frame.render_widget(input, rows[0]);

    let color = match app.phase {
        UpdatePhase::Error => Color::Red,
        _ if app.progress == 100 => Color::Green,
        _ => Color::Cyan,
    };
    let label = if app.is_flashing {
        format!("{}: {}%", app.phase, app.progress)
    } else {
        format!("{}%", app.progress)
    };
    let gauge = Gauge::default()
        .gauge_style(Style::default().fg(color).bg(Color::Black))
        .percent(u16::from(app.progress.min(100)))
        .label(label);
    frame.render_widget(gauge, rows[1]);
}

fn draw_recent_logs(frame: &mut Frame, area: Rect, app: &App) {
    let items: Vec<ListItem> = app
        .logs
        .iter()
        .rev()
        .take(area.height.saturating_sub(2) as usize)
        .map(|entry| log_to_list_item(entry, area.width))
        .collect();

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::DarkGray))
                .title(" Recent Logs "),
        )
        .style(Style::default().fg(Color::White));

    frame.render_widget(list, area);
}

fn draw_logs_view(frame: &mut Frame, area: Rect, app: &App) {
    let items: Vec<ListItem> = app
        .logs
        .iter()
        .skip(app.log_scroll)
        .take(area.height.saturating_sub(2) as usize)
        .map(|entry| log_to_list_item(entry, area.width))
        .collect();

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan))
                .title(format!(
                    " Logs ({}/{}) ",
                    app.log_scroll + 1,
                    app.logs.len().max(1)
                )),
        )
        .style(Style::default().fg(Color::White));

    frame.render_widget(list, area);
}

fn draw_help_view(frame: &mut Frame, area: Rect) {
    let help_text = vec![
        "",
        "  Flowmaster TUI - cooling controller monitor",
        "",
        "  KEYBOARD SHORTCUTS:",
        "",
        "  Ctrl+Q, Ctrl+C         Quit application",
        "  Esc                    Cancel update / quit",
        "  F1                     Show this help",
        "  F2                     View full logs",
        "  Tab                    Switch between controls and update",
        "",
        "  CONTROLS PANEL:",
        "",
        "  f / F                  Fan duty -5% / +5%",
        "  p / P                  Pump duty -5% / +5%",
        "  a                      Toggle automatic control",
        "  r                      Refresh status now",
        "",
        "  UPDATE PANEL:",
        "",
        "  Type the path of an Intel-HEX image, then press Enter.",
        "  The image is validated before the controller is touched.",
        "",
        "  Press any key to return...",
    ];

    let text: Vec<Line> = help_text.iter().map(|s| Line::from(*s)).collect();

    let help = Paragraph::new(Text::from(text))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan))
                .title(" Help "),
        )
        .style(Style::default().fg(Color::White))
        .alignment(Alignment::Left)
        .wrap(Wrap { trim: false });

    frame.render_widget(help, area);
}

fn log_to_list_item(entry: &LogEntry, width: u16) -> ListItem<'static> {
    let (icon, color) = match entry.level {
        LogLevel::Error => ("✗", Color::Red),
        LogLevel::Warn => ("⚠", Color::Yellow),
        LogLevel::Info => ("●", Color::Green),
        LogLevel::Debug => ("○", Color::Blue),
    };

    let prefix = vec![
        Span::styled(
            format!("{} ", entry.timestamp),
            Style::default().fg(Color::DarkGray),
        ),
        Span::styled(format!("{} ", icon), Style::default().fg(color)),
    ];
    let indent = entry.timestamp.len() + 3;
    let msg_width = (width as usize).saturating_sub(indent + 4).max(1);

    let chars: Vec<char> = entry.message.chars().collect();
    let mut chunks = chars.chunks(msg_width);
    let first: String = chunks.next().map(|c| c.iter().collect()).unwrap_or_default();

    let mut first_line = prefix;
    first_line.push(Span::styled(first, Style::default().fg(Color::White)));
    let mut lines = vec![Line::from(first_line)];
    for chunk in chunks {
        lines.push(Line::from(vec![
            Span::raw(" ".repeat(indent)),
            Span::styled(chunk.iter().collect::<String>(), Style::default().fg(Color::White)),
        ]));
    }
    ListItem::new(Text::from(lines))
}
