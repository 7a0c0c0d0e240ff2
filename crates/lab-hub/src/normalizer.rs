use chrono::Utc;
use lab_core::{ChartSpec, Event, EventKind, RunStatus};
use serde::Deserialize;
use tracing::debug;

/// Producer line shapes the normalizer recognizes. Anything else on
/// stdout is narrative noise and produces no event.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawLine {
    Thought {
        #[serde(default)]
        slot: Option<u32>,
        text: String,
    },
    Insight {
        #[serde(default)]
        id: Option<String>,
        summary: String,
        #[serde(default)]
        chart: Option<ChartSpec>,
    },
    Status {
        status: String,
    },
    Metadata {
        key: String,
        value: String,
    },
}

/// Turns one run's raw output lines into typed events. Sole owner of
/// that run's `seq`: every event minted here (including supervisor
/// lifecycle events) draws from the same monotonic counter, so the
/// sequence is gap-free at the source.
#[derive(Debug)]
pub struct Normalizer {
    run_id: String,
    next_seq: u64,
    next_slot: u32,
    dropped: u64,
}

impl Normalizer {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            next_seq: 0,
            next_slot: 0,
            dropped: 0,
        }
    }

    /// Malformed structured lines seen so far. Diagnostic only; a bad
    /// line is never fatal to the run.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Consumes one line; yields at most one event. Lines that do not
    /// look structured are ignored without counting; lines that look
    /// structured but fail to parse or validate are dropped and
    /// counted.
    pub fn normalize(&mut self, line: &str) -> Option<Event> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        let raw: RawLine = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(err) => {
                self.dropped += 1;
                debug!(event = "line_dropped", run_id = %self.run_id, error = %err);
                return None;
            }
        };
        let kind = match self.validate(raw) {
            Ok(kind) => kind,
            Err(reason) => {
                self.dropped += 1;
                debug!(event = "line_dropped", run_id = %self.run_id, reason);
                return None;
            }
        };
        Some(self.mint(kind))
    }

    /// Mints a supervisor-driven status event through the shared seq
    /// allocator.
    pub fn status_event(&mut self, status: RunStatus, reason: Option<String>) -> Event {
        self.mint(EventKind::Status { status, reason })
    }

    fn validate(&mut self, raw: RawLine) -> Result<EventKind, &'static str> {
        match raw {
            RawLine::Thought { slot, text } => {
                if text.is_empty() {
                    return Err("empty_thought");
                }
                // Slotless thoughts are each their own timeline item.
                let slot = match slot {
                    Some(slot) => {
                        self.next_slot = self.next_slot.max(slot + 1);
                        slot
                    }
                    None => {
                        let slot = self.next_slot;
                        self.next_slot += 1;
                        slot
                    }
                };
                Ok(EventKind::Thought { slot, text })
            }
            RawLine::Insight { id, summary, chart } => {
                if summary.is_empty() {
                    return Err("empty_summary");
                }
                let id = id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("{}-{}", self.run_id, self.next_seq));
                Ok(EventKind::Insight { id, summary, chart })
            }
            RawLine::Status { status } => {
                let status: RunStatus = status.parse().map_err(|_| "invalid_status")?;
                Ok(EventKind::Status {
                    status,
                    reason: None,
                })
            }
            RawLine::Metadata { key, value } => {
                if key.is_empty() {
                    return Err("empty_key");
                }
                Ok(EventKind::Metadata { key, value })
            }
        }
    }

    fn mint(&mut self, kind: EventKind) -> Event {
        let seq = self.next_seq;
        self.next_seq += 1;
        Event {
            run_id: self.run_id.clone(),
            seq,
            timestamp: Utc::now(),
            kind,
        }
    }
}
