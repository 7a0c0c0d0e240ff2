use chrono::Utc;
use lab_core::{Event, EventKind};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

pub const DEFAULT_REPLAY_CAPACITY: usize = 256;
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_SUBSCRIBERS: usize = 64;

/// Live fan-out channel depth per subscriber. A viewer that falls this
/// far behind starts losing its oldest pending events (only its own).
const LIVE_CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("subscriber limit reached ({0})")]
    Exhausted(usize),
}

#[derive(Debug)]
struct RunBuffer {
    events: VecDeque<Event>,
    /// Events evicted from the front; seq of the first retained event,
    /// since seqs are gap-free from 0.
    evicted: u64,
    ended_at: Option<Instant>,
}

impl RunBuffer {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            evicted: 0,
            ended_at: None,
        }
    }

    /// Buffered backlog, prefixed with a resync marker when the buffer
    /// no longer reaches back to seq 0.
    fn backlog(&self, run_id: &str) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.events.len() + 1);
        if self.evicted > 0 {
            events.push(Event {
                run_id: run_id.to_string(),
                seq: self.evicted,
                timestamp: Utc::now(),
                kind: EventKind::Resync {
                    dropped: self.evicted,
                },
            });
        }
        events.extend(self.events.iter().cloned());
        events
    }
}

/// Single point of fan-in from all runs and fan-out to all viewers.
/// Publishing never blocks: live delivery goes through a broadcast
/// channel whose slow receivers lag individually, and the per-run
/// replay buffer is bounded with oldest-first eviction.
pub struct Hub {
    replay_capacity: usize,
    retention: Duration,
    max_subscribers: usize,
    live: broadcast::Sender<Event>,
    runs: RwLock<HashMap<String, RunBuffer>>,
}

impl Hub {
    pub fn new(replay_capacity: usize, retention: Duration, max_subscribers: usize) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            replay_capacity: replay_capacity.max(1),
            retention,
            max_subscribers,
            live,
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn publish(&self, event: Event) {
        let mut runs = self.runs.write().await;
        let buffer = runs
            .entry(event.run_id.clone())
            .or_insert_with(RunBuffer::new);
        if let EventKind::Status { status, .. } = &event.kind {
            if status.is_terminal() {
                buffer.ended_at = Some(Instant::now());
            }
        }
        buffer.events.push_back(event.clone());
        if buffer.events.len() > self.replay_capacity {
            buffer.events.pop_front();
            buffer.evicted += 1;
        }
        drop(runs);
        // Err just means no live subscribers right now.
        let _ = self.live.send(event);
    }

    /// Hands a joiner the buffered backlog and a live receiver. The
    /// receiver is taken before the backlog snapshot so nothing falls
    /// between the two; overlap is absorbed by the viewer's store.
    pub async fn subscribe(
        &self,
        run_id: Option<&str>,
    ) -> Result<(Vec<Event>, broadcast::Receiver<Event>), SubscribeError> {
        if self.live.receiver_count() >= self.max_subscribers {
            warn!(event = "subscriber_limit", max = self.max_subscribers);
            return Err(SubscribeError::Exhausted(self.max_subscribers));
        }
        let receiver = self.live.subscribe();
        let backlog = self.backlog(run_id).await;
        Ok((backlog, receiver))
    }

    /// Buffered backlog for one run, or for every run in stable order.
    pub async fn backlog(&self, run_id: Option<&str>) -> Vec<Event> {
        let runs = self.runs.read().await;
        match run_id {
            Some(id) => runs
                .get(id)
                .map(|buffer| buffer.backlog(id))
                .unwrap_or_default(),
            None => {
                let mut ids: Vec<_> = runs.keys().cloned().collect();
                ids.sort();
                ids.iter()
                    .flat_map(|id| runs.get(id).map(|b| b.backlog(id)).unwrap_or_default())
                    .collect()
            }
        }
    }

    pub async fn has_run(&self, run_id: &str) -> bool {
        self.runs.read().await.contains_key(run_id)
    }

    /// Evicts replay buffers whose run ended longer than the retention
    /// window ago. Buffer lifetime is deliberately decoupled from the
    /// run registry: diagnostics can outlive replayability.
    pub async fn sweep(&self) {
        let retention = self.retention;
        let mut runs = self.runs.write().await;
        let before = runs.len();
        runs.retain(|id, buffer| match buffer.ended_at {
            Some(ended) if ended.elapsed() > retention => {
                debug!(event = "buffer_evicted", run_id = %id);
                false
            }
            _ => true,
        });
        if runs.len() < before {
            info!(event = "buffer_sweep", evicted = before - runs.len());
        }
    }

    pub fn start_sweeper(self: Arc<Self>) {
        let interval = (self.retention / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        });
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(
            DEFAULT_REPLAY_CAPACITY,
            DEFAULT_RETENTION,
            DEFAULT_MAX_SUBSCRIBERS,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_core::RunStatus;

    fn thought(run: &str, seq: u64, text: &str) -> Event {
        Event {
            run_id: run.to_string(),
            seq,
            timestamp: Utc::now(),
            kind: EventKind::Thought {
                slot: seq as u32,
                text: text.to_string(),
            },
        }
    }

    #[tokio::test]
    async fn late_joiner_gets_backlog_then_live() {
        let hub = Hub::default();
        hub.publish(thought("run-1", 0, "early")).await;
        hub.publish(thought("run-1", 1, "still early")).await;

        let (backlog, mut rx) = hub.subscribe(Some("run-1")).await.expect("subscribe");
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].seq, 0);

        hub.publish(thought("run-1", 2, "live")).await;
        let live = rx.recv().await.expect("live event");
        assert_eq!(live.seq, 2);
    }

    #[tokio::test]
    async fn evicted_backlog_is_prefixed_with_resync() {
        let hub = Hub::new(4, DEFAULT_RETENTION, DEFAULT_MAX_SUBSCRIBERS);
        for seq in 0..10 {
            hub.publish(thought("run-1", seq, "t")).await;
        }
        let backlog = hub.backlog(Some("run-1")).await;
        assert_eq!(backlog.len(), 5);
        match backlog[0].kind {
            EventKind::Resync { dropped } => assert_eq!(dropped, 6),
            ref other => panic!("expected resync marker, got {other:?}"),
        }
        assert_eq!(backlog[1].seq, 6);
        assert_eq!(backlog.last().unwrap().seq, 9);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_affect_healthy_one() {
        let hub = Hub::default();
        let (_, mut slow) = hub.subscribe(None).await.expect("subscribe slow");
        let (_, mut healthy) = hub.subscribe(None).await.expect("subscribe healthy");

        // Flood well past the live channel depth without draining
        // `slow`, keeping `healthy` drained as a real viewer would be.
        let total = LIVE_CHANNEL_CAPACITY as u64 + 200;
        let mut received = Vec::new();
        for seq in 0..total {
            hub.publish(thought("run-1", seq, "flood")).await;
            if seq % 100 == 0 {
                while let Ok(event) = healthy.try_recv() {
                    received.push(event.seq);
                }
            }
        }
        while let Ok(event) = healthy.try_recv() {
            received.push(event.seq);
        }

        // The healthy receiver saw everything, in order.
        assert_eq!(received.len() as u64, total);
        assert!(received.windows(2).all(|w| w[0] < w[1]));

        // The slow receiver is told it lagged instead of stalling others.
        match slow.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => assert!(missed > 0),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscriber_limit_is_a_reported_error() {
        let hub = Hub::new(DEFAULT_REPLAY_CAPACITY, DEFAULT_RETENTION, 2);
        let _a = hub.subscribe(None).await.expect("first");
        let _b = hub.subscribe(None).await.expect("second");
        assert!(matches!(
            hub.subscribe(None).await,
            Err(SubscribeError::Exhausted(2))
        ));
    }

    #[tokio::test]
    async fn sweep_evicts_only_ended_runs() {
        let hub = Hub::new(DEFAULT_REPLAY_CAPACITY, Duration::ZERO, DEFAULT_MAX_SUBSCRIBERS);
        hub.publish(thought("run-live", 0, "t")).await;
        hub.publish(Event {
            run_id: "run-done".to_string(),
            seq: 0,
            timestamp: Utc::now(),
            kind: EventKind::Status {
                status: RunStatus::Completed,
                reason: None,
            },
        })
        .await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        hub.sweep().await;
        assert!(hub.has_run("run-live").await);
        assert!(!hub.has_run("run-done").await);
    }

    #[tokio::test]
    async fn backlog_for_all_runs_is_grouped_and_ordered() {
        let hub = Hub::default();
        hub.publish(thought("run-b", 0, "b0")).await;
        hub.publish(thought("run-a", 0, "a0")).await;
        hub.publish(thought("run-a", 1, "a1")).await;

        let backlog = hub.backlog(None).await;
        let keys: Vec<(&str, u64)> = backlog
            .iter()
            .map(|e| (e.run_id.as_str(), e.seq))
            .collect();
        assert_eq!(keys, vec![("run-a", 0), ("run-a", 1), ("run-b", 0)]);
    }
}
