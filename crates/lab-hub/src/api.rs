use crate::hub::{Hub, SubscribeError};
use crate::supervisor::{RunConfig, RunInfo, RunRegistry, StartError};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use chrono::Utc;
use lab_core::{Event, EventKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

static CONN_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub registry: Arc<RunRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/runs", get(list_runs).post(start_run))
        .route("/runs/:id", delete(stop_run))
        .route("/runs/:id/backlog", get(run_backlog))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct WsParams {
    /// Restrict the stream to one run; omitted means all runs.
    #[serde(default)]
    run: Option<String>,
    /// Caller-supplied label, for log correlation only.
    #[serde(default)]
    viewer: Option<String>,
}

#[derive(Debug, Serialize)]
struct StartedRun {
    run_id: String,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    // Subscribe before upgrading so queue exhaustion is reported as a
    // proper HTTP error instead of a silent close.
    let subscription = match state.hub.subscribe(params.run.as_deref()).await {
        Ok(value) => value,
        Err(err @ SubscribeError::Exhausted(_)) => {
            warn!(event = "subscribe_rejected", error = %err);
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };
    let conn_id = format!("conn-{}", CONN_COUNTER.fetch_add(1, Ordering::SeqCst) + 1);
    info!(
        event = "viewer_connected",
        conn_id = %conn_id,
        viewer = %params.viewer.as_deref().unwrap_or("-"),
        run = %params.run.as_deref().unwrap_or("*")
    );
    ws.on_upgrade(move |socket| async move {
        handle_socket(socket, state, subscription, params.run, conn_id).await;
    })
}

/// Per-connection delivery bookkeeping: last seq delivered per run.
/// Lets the connection drop duplicates after a backlog refetch and
/// mint precise gap markers when events were lost to lag + eviction.
#[derive(Default)]
struct DeliveryState {
    last: HashMap<String, u64>,
}

impl DeliveryState {
    fn admit(&mut self, out: &mut Vec<Event>, event: Event) {
        if let EventKind::Resync { .. } = event.kind {
            // Skip the hub's marker when this viewer already holds
            // everything up to the marker point.
            match self.last.get(&event.run_id) {
                Some(&last) if last + 1 >= event.seq => {}
                _ => out.push(event),
            }
            return;
        }
        match self.last.get(&event.run_id).copied() {
            Some(last) if event.seq <= last => return,
            Some(last) if event.seq > last + 1 => out.push(Event {
                run_id: event.run_id.clone(),
                seq: event.seq,
                timestamp: Utc::now(),
                kind: EventKind::Resync {
                    dropped: event.seq - last - 1,
                },
            }),
            _ => {}
        }
        self.last.insert(event.run_id.clone(), event.seq);
        out.push(event);
    }
}

async fn handle_socket(
    mut socket: WebSocket,
    state: AppState,
    subscription: (Vec<Event>, broadcast::Receiver<Event>),
    run_filter: Option<String>,
    conn_id: String,
) {
    let (backlog, mut live) = subscription;
    let mut delivery = DeliveryState::default();

    // Backlog delivery is part of subscribing, never optional.
    let mut pending = Vec::new();
    for event in backlog {
        delivery.admit(&mut pending, event);
    }
    if !send_events(&mut socket, &conn_id, &pending).await {
        return;
    }
    info!(event = "backlog_sent", conn_id = %conn_id, count = pending.len());

    loop {
        tokio::select! {
            received = live.recv() => {
                let mut out = Vec::new();
                match received {
                    Ok(event) => {
                        if let Some(filter) = &run_filter {
                            if &event.run_id != filter {
                                continue;
                            }
                        }
                        delivery.admit(&mut out, event);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // This viewer fell behind; re-deliver from the
                        // replay buffers. Whatever is gone from both its
                        // queue and the buffers becomes a gap marker.
                        warn!(event = "viewer_lagged", conn_id = %conn_id, missed);
                        for event in state.hub.backlog(run_filter.as_deref()).await {
                            delivery.admit(&mut out, event);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                if !send_events(&mut socket, &conn_id, &out).await {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "viewer_read_error", conn_id = %conn_id, error = %err);
                        break;
                    }
                }
            }
        }
    }
    info!(event = "viewer_disconnected", conn_id = %conn_id);
}

async fn send_events(socket: &mut WebSocket, conn_id: &str, events: &[Event]) -> bool {
    for event in events {
        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "serialize_error", conn_id = %conn_id, error = %err);
                continue;
            }
        };
        let send = socket.send(Message::Text(text));
        match tokio::time::timeout(WRITE_TIMEOUT, send).await {
            Ok(Ok(())) => {}
            _ => {
                warn!(event = "viewer_write_error", conn_id = %conn_id);
                return false;
            }
        }
    }
    true
}

async fn list_runs(State(state): State<AppState>) -> Json<Vec<RunInfo>> {
    Json(state.registry.list().await)
}

async fn start_run(
    State(state): State<AppState>,
    Json(config): Json<RunConfig>,
) -> impl IntoResponse {
    match state.registry.start(config).await {
        Ok(run_id) => (StatusCode::CREATED, Json(StartedRun { run_id })).into_response(),
        Err(err @ StartError::EmptyCommand) => {
            (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()).into_response()
        }
    }
}

async fn stop_run(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    if state.registry.stop(&id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn run_backlog(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    if !state.hub.has_run(&id).await && state.registry.get(&id).await.is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(state.hub.backlog(Some(&id)).await).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(run: &str, seq: u64) -> Event {
        Event {
            run_id: run.to_string(),
            seq,
            timestamp: Utc::now(),
            kind: EventKind::Thought {
                slot: seq as u32,
                text: "t".to_string(),
            },
        }
    }

    #[test]
    fn admit_drops_duplicates_after_refetch() {
        let mut delivery = DeliveryState::default();
        let mut out = Vec::new();
        delivery.admit(&mut out, event("run-1", 0));
        delivery.admit(&mut out, event("run-1", 1));
        // Backlog refetch replays the same events.
        delivery.admit(&mut out, event("run-1", 0));
        delivery.admit(&mut out, event("run-1", 1));
        delivery.admit(&mut out, event("run-1", 2));
        let seqs: Vec<u64> = out.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn admit_marks_real_gaps() {
        let mut delivery = DeliveryState::default();
        let mut out = Vec::new();
        delivery.admit(&mut out, event("run-1", 0));
        delivery.admit(&mut out, event("run-1", 4));
        assert_eq!(out.len(), 3);
        match out[1].kind {
            EventKind::Resync { dropped } => assert_eq!(dropped, 3),
            ref other => panic!("expected gap marker, got {other:?}"),
        }
        assert_eq!(out[2].seq, 4);
    }

    #[test]
    fn hub_resync_is_skipped_when_viewer_is_contiguous() {
        let mut delivery = DeliveryState::default();
        let mut out = Vec::new();
        for seq in 0..6 {
            delivery.admit(&mut out, event("run-1", seq));
        }
        out.clear();
        // Refetched backlog starts with a marker at seq 4; this viewer
        // already has 0..=5, so the marker is noise.
        delivery.admit(
            &mut out,
            Event {
                run_id: "run-1".to_string(),
                seq: 4,
                timestamp: Utc::now(),
                kind: EventKind::Resync { dropped: 4 },
            },
        );
        assert!(out.is_empty());
    }

    #[test]
    fn late_joiner_keeps_hub_resync() {
        let mut delivery = DeliveryState::default();
        let mut out = Vec::new();
        delivery.admit(
            &mut out,
            Event {
                run_id: "run-1".to_string(),
                seq: 10,
                timestamp: Utc::now(),
                kind: EventKind::Resync { dropped: 10 },
            },
        );
        delivery.admit(&mut out, event("run-1", 10));
        assert_eq!(out.len(), 2);
        assert!(out[0].is_resync());
        assert_eq!(out[1].seq, 10);
    }

    #[test]
    fn runs_are_tracked_independently() {
        let mut delivery = DeliveryState::default();
        let mut out = Vec::new();
        delivery.admit(&mut out, event("run-a", 0));
        delivery.admit(&mut out, event("run-b", 0));
        delivery.admit(&mut out, event("run-a", 1));
        assert_eq!(out.len(), 3);
        assert!(!out.iter().any(|e| e.is_resync()));
    }
}
