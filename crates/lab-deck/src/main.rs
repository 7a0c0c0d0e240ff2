mod ui;

use clap::Parser;
use crossterm::{
    event::{Event as TermEvent, EventStream, KeyCode, KeyEvent, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures_util::StreamExt;
use lab_core::{Event, EventKind, StateStore, TextPresenter};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::{error::Error, io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const REDRAW_INTERVAL: Duration = Duration::from_millis(120);
const STREAM_QUEUE: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "lab-deck")]
struct Args {
    /// Hub websocket endpoint.
    #[arg(long, default_value = "")]
    hub_url: String,
    /// Watch a single run instead of all of them.
    #[arg(long)]
    run: Option<String>,
    /// Viewer label sent to the hub for log correlation.
    #[arg(long, default_value = "")]
    viewer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubStatus {
    Connecting,
    Connected,
    Reconnecting,
}

impl HubStatus {
    pub fn label(&self) -> &'static str {
        match self {
            HubStatus::Connecting => "connecting",
            HubStatus::Connected => "online",
            HubStatus::Reconnecting => "reconnecting",
        }
    }
}

#[derive(Debug)]
enum DeckEvent {
    Stream(Event),
    Hub(HubStatus),
}

pub struct App {
    pub store: StateStore,
    pub presenter: TextPresenter,
    pub hub_status: HubStatus,
    pub selected_agent: usize,
    pub selected_rail: usize,
}

impl App {
    fn new() -> Self {
        Self {
            store: StateStore::new(),
            presenter: TextPresenter::default(),
            hub_status: HubStatus::Connecting,
            selected_agent: 0,
            selected_rail: 0,
        }
    }

    fn apply_stream(&mut self, event: Event, now: Instant) {
        let changed = self.store.apply(&event);
        if !changed {
            return;
        }
        match &event.kind {
            EventKind::Thought { slot, text } => {
                let key = ui::thought_key(&event.run_id, *slot);
                self.presenter.observe(&key, text, now);
            }
            EventKind::Insight { id, summary, .. } => {
                self.presenter.observe(id, summary, now);
            }
            _ => {}
        }
    }

    fn agent_count(&self) -> usize {
        self.store.len()
    }

    fn clamp_selection(&mut self) {
        let agents = self.agent_count();
        if agents > 0 && self.selected_agent >= agents {
            self.selected_agent = agents - 1;
        }
        let rail = lab_core::project_rail(&self.store).len();
        if rail > 0 && self.selected_rail >= rail {
            self.selected_rail = rail - 1;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging();

    let hub_url = resolve_hub_url(&args)?;
    let (stream_tx, mut stream_rx) = mpsc::channel(STREAM_QUEUE);
    tokio::spawn(async move {
        hub_loop(hub_url, stream_tx).await;
    });

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    let mut term_events = EventStream::new();
    let mut redraw = tokio::time::interval(REDRAW_INTERVAL);

    let mut app = App::new();
    loop {
        app.clamp_selection();
        let now = Instant::now();
        app.presenter.tick(now);
        terminal.draw(|frame| ui::render(frame, &app, now))?;

        tokio::select! {
            _ = redraw.tick() => {}
            received = stream_rx.recv() => {
                match received {
                    Some(DeckEvent::Stream(event)) => app.apply_stream(event, Instant::now()),
                    Some(DeckEvent::Hub(status)) => app.hub_status = status,
                    None => break,
                }
                // Drain whatever else is queued before redrawing.
                while let Ok(next) = stream_rx.try_recv() {
                    match next {
                        DeckEvent::Stream(event) => app.apply_stream(event, Instant::now()),
                        DeckEvent::Hub(status) => app.hub_status = status,
                    }
                }
            }
            maybe_event = term_events.next() => {
                if let Some(Ok(event)) = maybe_event {
                    if handle_input(event, &mut app) {
                        break;
                    }
                }
            }
        }
    }

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

fn handle_input(event: TermEvent, app: &mut App) -> bool {
    let TermEvent::Key(KeyEvent {
        code,
        kind: KeyEventKind::Press,
        ..
    }) = event
    else {
        return false;
    };
    match code {
        KeyCode::Char('q') | KeyCode::Esc => return true,
        KeyCode::Up | KeyCode::Char('k') => {
            app.selected_agent = app.selected_agent.saturating_sub(1);
        }
        KeyCode::Down | KeyCode::Char('j') => {
            if app.selected_agent + 1 < app.agent_count() {
                app.selected_agent += 1;
            }
        }
        KeyCode::Left | KeyCode::Char('h') => {
            app.selected_rail = app.selected_rail.saturating_sub(1);
        }
        KeyCode::Right | KeyCode::Char('l') => {
            app.selected_rail += 1; // clamped against the rail next frame
        }
        _ => {}
    }
    false
}

/// Connects, streams, reconnects with backoff. Every (re)connect
/// restarts from the hub's backlog; the store absorbs the overlap.
async fn hub_loop(hub_url: url::Url, tx: mpsc::Sender<DeckEvent>) {
    let mut backoff = Duration::from_secs(1);
    loop {
        let _ = tx.send(DeckEvent::Hub(HubStatus::Connecting)).await;
        let (mut ws, _) = match connect_async(hub_url.clone()).await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "hub_connect_error", error = %err);
                if tx.send(DeckEvent::Hub(HubStatus::Reconnecting)).await.is_err() {
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff);
                continue;
            }
        };
        backoff = Duration::from_secs(1);
        if tx.send(DeckEvent::Hub(HubStatus::Connected)).await.is_err() {
            return;
        }

        while let Some(msg) = ws.next().await {
            use tokio_tungstenite::tungstenite::Message;
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<Event>(&text) {
                    Ok(event) => {
                        if tx.send(DeckEvent::Stream(event)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => warn!(event = "frame_invalid", error = %err),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = ws.close(None).await;
        if tx.send(DeckEvent::Hub(HubStatus::Reconnecting)).await.is_err() {
            return;
        }
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff);
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(Duration::from_secs(30))
}

fn resolve_hub_url(args: &Args) -> Result<url::Url, Box<dyn Error>> {
    let base = if !args.hub_url.trim().is_empty() {
        args.hub_url.clone()
    } else if let Ok(value) = std::env::var("LAB_HUB_ADDR") {
        format!("ws://{value}/ws")
    } else {
        "ws://127.0.0.1:8787/ws".to_string()
    };
    let mut url = url::Url::parse(&base)?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(run) = &args.run {
            query.append_pair("run", run);
        }
        if !args.viewer.trim().is_empty() {
            query.append_pair("viewer", &args.viewer);
        }
    }
    Ok(url)
}

fn init_logging() {
    // The terminal belongs to the TUI; logs only go somewhere when the
    // caller redirects stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}
