use crate::{App, HubStatus};
use lab_core::{
    chart::{CHART_HEIGHT, CHART_WIDTH},
    project_chart, project_rail, AgentSnapshot, BlockSignal, ChartGeometry, ChartKind, RunStatus,
};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, List, ListItem, Paragraph, Wrap},
    Frame,
};
use std::time::Instant;

pub fn thought_key(run_id: &str, slot: u32) -> String {
    format!("{run_id}:{slot}")
}

pub fn render(frame: &mut Frame, app: &App, now: Instant) {
    let size = frame.size();
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)])
        .split(size);
    frame.render_widget(header(app), rows[0]);

    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Length(28),
            Constraint::Min(30),
            Constraint::Length(38),
        ])
        .split(rows[1]);

    frame.render_widget(agent_list(app), columns[0]);
    render_center(frame, app, now, columns[1]);
    frame.render_widget(rail_list(app, now), columns[2]);
}

fn header(app: &App) -> Paragraph<'static> {
    let agents = app.store.len();
    let running = app
        .store
        .agents()
        .filter(|a| a.status == RunStatus::Running)
        .count();
    let line = Line::from(vec![
        Span::styled("lab-deck ", Style::default().add_modifier(Modifier::BOLD)),
        Span::styled(
            format!("hub: {} ", app.hub_status.label()),
            Style::default().fg(hub_color(app.hub_status)),
        ),
        Span::raw(format!("agents: {running}/{agents} running ")),
        Span::styled(
            "(q quit, j/k agents, h/l rail)",
            Style::default().fg(Color::DarkGray),
        ),
    ]);
    Paragraph::new(line).block(Block::default().borders(Borders::ALL))
}

fn hub_color(status: HubStatus) -> Color {
    match status {
        HubStatus::Connected => Color::Green,
        HubStatus::Connecting => Color::Yellow,
        HubStatus::Reconnecting => Color::Red,
    }
}

fn status_style(status: RunStatus) -> Style {
    let color = match status {
        RunStatus::Pending => Color::Yellow,
        RunStatus::Running => Color::Green,
        RunStatus::Completed => Color::Blue,
        RunStatus::Failed => Color::Red,
    };
    Style::default().fg(color)
}

fn agent_list(app: &App) -> List<'static> {
    let items: Vec<ListItem> = app
        .store
        .agents()
        .enumerate()
        .map(|(index, agent)| {
            let gpu = agent
                .gpu()
                .map(|gpu| format!(" [{gpu}]"))
                .unwrap_or_default();
            let marker = if agent.behind { " ⚠" } else { "" };
            let line = Line::from(vec![
                Span::styled(
                    format!("{:9}", agent.status.as_str()),
                    status_style(agent.status),
                ),
                Span::raw(format!("{}{gpu}{marker}", agent.id)),
            ]);
            let mut item = ListItem::new(line);
            if index == app.selected_agent {
                item = item.style(Style::default().add_modifier(Modifier::REVERSED));
            }
            item
        })
        .collect();
    List::new(items).block(Block::default().borders(Borders::ALL).title("agents"))
}

fn render_center(frame: &mut Frame, app: &App, now: Instant, area: Rect) {
    let selected = app.store.agents().nth(app.selected_agent);
    let chart = selected_chart(app);
    let parts = if chart.is_some() {
        Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(8), Constraint::Length(12)])
            .split(area)
    } else {
        Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(0)])
            .split(area)
    };
    frame.render_widget(thought_panel(app, selected, now), parts[0]);
    if let Some((title, geometry)) = chart {
        frame.render_widget(chart_panel(&title, &geometry, parts[1]), parts[1]);
    }
}

fn thought_panel(
    app: &App,
    selected: Option<&AgentSnapshot>,
    now: Instant,
) -> Paragraph<'static> {
    let Some(agent) = selected else {
        return Paragraph::new("no runs yet")
            .block(Block::default().borders(Borders::ALL).title("thoughts"));
    };
    let mut lines: Vec<Line> = Vec::new();
    if agent.behind {
        lines.push(Line::from(Span::styled(
            "⚠ missed events; timeline may be incomplete",
            Style::default().fg(Color::Yellow),
        )));
    }
    if let Some(reason) = &agent.status_reason {
        lines.push(Line::from(Span::styled(
            format!("{}: {reason}", agent.status.as_str()),
            status_style(agent.status),
        )));
    }
    for thought in &agent.thoughts {
        let key = thought_key(&agent.id, thought.slot);
        let style = match app.presenter.signal(&key, now) {
            BlockSignal::JustAppeared => Style::default().add_modifier(Modifier::BOLD),
            BlockSignal::Idle => Style::default(),
        };
        lines.push(Line::from(vec![
            Span::styled(
                thought.timestamp.format("%H:%M:%S ").to_string(),
                Style::default().fg(Color::DarkGray),
            ),
            Span::styled(thought.text.clone(), style),
        ]));
    }
    Paragraph::new(Text::from(lines))
        .wrap(Wrap { trim: false })
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!("thoughts — {}", agent.id)),
        )
}

fn rail_list(app: &App, now: Instant) -> List<'static> {
    let rail = project_rail(&app.store);
    let items: Vec<ListItem> = rail
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let style = match app.presenter.signal(&entry.insight.id, now) {
                BlockSignal::JustAppeared => Style::default().add_modifier(Modifier::BOLD),
                BlockSignal::Idle => Style::default(),
            };
            let chart_mark = if entry.insight.chart.is_some() { "▮ " } else { "" };
            let mut item = ListItem::new(Text::from(vec![
                Line::from(Span::styled(
                    format!("{chart_mark}{}", entry.insight.summary),
                    style,
                )),
                Line::from(Span::styled(
                    format!(
                        "  {} · {}",
                        entry.agent_id,
                        entry.insight.timestamp.format("%H:%M:%S")
                    ),
                    Style::default().fg(Color::DarkGray),
                )),
            ]));
            if index == app.selected_rail {
                item = item.style(Style::default().add_modifier(Modifier::REVERSED));
            }
            item
        })
        .collect();
    List::new(items).block(Block::default().borders(Borders::ALL).title("insights"))
}

fn selected_chart(app: &App) -> Option<(String, ChartGeometry)> {
    let rail = project_rail(&app.store);
    let entry = rail.get(app.selected_rail)?;
    let spec = entry.insight.chart.as_ref()?;
    let geometry = project_chart(spec)?;
    let title = geometry
        .title
        .clone()
        .unwrap_or_else(|| entry.insight.summary.clone());
    Some((title, geometry))
}

fn chart_panel(title: &str, geometry: &ChartGeometry, area: Rect) -> Paragraph<'static> {
    let inner_width = area.width.saturating_sub(2) as usize;
    let inner_height = area.height.saturating_sub(4) as usize;
    let mut lines: Vec<Line> = chart_rows(geometry, inner_width, inner_height)
        .into_iter()
        .map(|row| Line::from(Span::styled(row, Style::default().fg(Color::Cyan))))
        .collect();
    lines.push(Line::from(Span::styled(
        tick_line(geometry),
        Style::default().fg(Color::DarkGray),
    )));
    Paragraph::new(Text::from(lines)).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!("chart — {title}")),
    )
}

/// Rasterizes projected geometry into fixed-width text rows, top row
/// first. Pure so the mapping is testable without a terminal.
pub fn chart_rows(geometry: &ChartGeometry, width: usize, height: usize) -> Vec<String> {
    if width == 0 || height == 0 || geometry.points.is_empty() {
        return Vec::new();
    }
    let mut grid = vec![vec![' '; width]; height];
    let n = geometry.points.len();
    for col in 0..width {
        let x = if width > 1 {
            col as f64 / (width - 1) as f64 * CHART_WIDTH
        } else {
            0.0
        };
        let index = if n > 1 {
            (x / CHART_WIDTH * (n - 1) as f64).round() as usize
        } else {
            0
        };
        let level = (geometry.points[index].1 / CHART_HEIGHT * (height - 1) as f64).round() as usize;
        match geometry.kind {
            ChartKind::Bar => {
                for row in 0..=level {
                    grid[height - 1 - row][col] = '█';
                }
            }
            ChartKind::Line => {
                grid[height - 1 - level][col] = '•';
            }
        }
    }
    grid.into_iter().map(|row| row.into_iter().collect()).collect()
}

pub fn tick_line(geometry: &ChartGeometry) -> String {
    geometry
        .ticks
        .iter()
        .map(|tick| tick.label.as_str())
        .collect::<Vec<_>>()
        .join(" · ")
}
