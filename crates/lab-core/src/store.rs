use crate::event::{Event, EventKind, RunStatus};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Timeline items kept per agent before the oldest is evicted.
pub const THOUGHT_CAP: usize = 64;
/// Insight cards kept per agent, mirroring the rail cap.
pub const INSIGHT_CAP: usize = 24;

#[derive(Debug, Clone, PartialEq)]
pub struct Thought {
    pub slot: u32,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsightCard {
    pub id: String,
    pub summary: String,
    pub chart: Option<crate::event::ChartSpec>,
    pub timestamp: DateTime<Utc>,
    pub seq: u64,
}

/// Per-agent state reconstructed purely from that run's event history.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSnapshot {
    pub id: String,
    pub status: RunStatus,
    pub status_reason: Option<String>,
    pub meta: BTreeMap<String, String>,
    pub thoughts: Vec<Thought>,
    pub insights: Vec<InsightCard>,
    pub last_seq_applied: Option<u64>,
    /// Set when a resync marker told this viewer it missed events.
    pub behind: bool,
}

impl AgentSnapshot {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: RunStatus::Pending,
            status_reason: None,
            meta: BTreeMap::new(),
            thoughts: Vec::new(),
            insights: Vec::new(),
            last_seq_applied: None,
            behind: false,
        }
    }

    pub fn gpu(&self) -> Option<&str> {
        self.meta.get("gpu").map(String::as_str)
    }
}

/// Viewer-side reducer. Folding the same ordered event prefix through
/// two stores yields identical snapshot maps; duplicates and stale
/// seqs are absorbed so backlog replay after reconnect is harmless.
#[derive(Debug, Default)]
pub struct StateStore {
    agents: BTreeMap<String, AgentSnapshot>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentSnapshot> {
        self.agents.values()
    }

    pub fn agent(&self, run_id: &str) -> Option<&AgentSnapshot> {
        self.agents.get(run_id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Applies one event; returns whether any state changed. Unknown
    /// runs appear as pending agents on first contact.
    pub fn apply(&mut self, event: &Event) -> bool {
        let snapshot = self
            .agents
            .entry(event.run_id.clone())
            .or_insert_with(|| AgentSnapshot::new(&event.run_id));

        // Resync markers sit outside the run's seq space: they report a
        // gap, they do not occupy a slot in it.
        if let EventKind::Resync { .. } = event.kind {
            snapshot.behind = true;
            return true;
        }

        if let Some(last) = snapshot.last_seq_applied {
            if event.seq <= last {
                return false;
            }
        }
        snapshot.last_seq_applied = Some(event.seq);

        match &event.kind {
            EventKind::Thought { slot, text } => {
                if let Some(existing) = snapshot.thoughts.iter_mut().find(|t| t.slot == *slot) {
                    existing.text = text.clone();
                    existing.timestamp = event.timestamp;
                    existing.seq = event.seq;
                } else {
                    snapshot.thoughts.push(Thought {
                        slot: *slot,
                        text: text.clone(),
                        timestamp: event.timestamp,
                        seq: event.seq,
                    });
                    if snapshot.thoughts.len() > THOUGHT_CAP {
                        snapshot.thoughts.remove(0);
                    }
                }
            }
            EventKind::Insight { id, summary, chart } => {
                snapshot.insights.push(InsightCard {
                    id: id.clone(),
                    summary: summary.clone(),
                    chart: chart.clone(),
                    timestamp: event.timestamp,
                    seq: event.seq,
                });
                if snapshot.insights.len() > INSIGHT_CAP {
                    snapshot.insights.remove(0);
                }
            }
            EventKind::Status { status, reason } => {
                snapshot.status = *status;
                snapshot.status_reason = reason.clone();
            }
            EventKind::Metadata { key, value } => {
                snapshot.meta.insert(key.clone(), value.clone());
            }
            EventKind::Resync { .. } => unreachable!("handled above"),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ChartSpec, EventKind};
    use chrono::TimeZone;

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
            + chrono::Duration::seconds(secs as i64)
    }

    fn event(run: &str, seq: u64, kind: EventKind) -> Event {
        Event {
            run_id: run.to_string(),
            seq,
            timestamp: ts(seq as u32),
            kind,
        }
    }

    fn thought(run: &str, seq: u64, slot: u32, text: &str) -> Event {
        event(
            run,
            seq,
            EventKind::Thought {
                slot,
                text: text.to_string(),
            },
        )
    }

    #[test]
    fn unknown_run_appears_pending() {
        let mut store = StateStore::new();
        store.apply(&thought("run-9", 0, 0, "first contact"));
        let agent = store.agent("run-9").expect("agent exists");
        assert_eq!(agent.status, RunStatus::Pending);
        assert_eq!(agent.thoughts.len(), 1);
    }

    #[test]
    fn same_slot_updates_instead_of_appending() {
        let mut store = StateStore::new();
        store.apply(&thought("run-1", 0, 0, "a"));
        store.apply(&thought("run-1", 1, 0, "ab"));
        store.apply(&thought("run-1", 2, 1, "next item"));
        let agent = store.agent("run-1").unwrap();
        assert_eq!(agent.thoughts.len(), 2);
        assert_eq!(agent.thoughts[0].text, "ab");
        assert_eq!(agent.thoughts[0].seq, 1);
    }

    #[test]
    fn duplicate_and_stale_seqs_are_ignored() {
        let mut store = StateStore::new();
        store.apply(&thought("run-1", 0, 0, "a"));
        store.apply(&thought("run-1", 1, 1, "b"));
        let before = store.agent("run-1").unwrap().clone();

        assert!(!store.apply(&thought("run-1", 1, 1, "b")));
        assert!(!store.apply(&thought("run-1", 0, 0, "rewritten history")));
        assert_eq!(store.agent("run-1").unwrap(), &before);
    }

    #[test]
    fn fold_is_deterministic_for_any_prefix() {
        let events = vec![
            thought("run-1", 0, 0, "a"),
            event(
                "run-1",
                1,
                EventKind::Metadata {
                    key: "gpu".to_string(),
                    value: "A100".to_string(),
                },
            ),
            event(
                "run-1",
                2,
                EventKind::Insight {
                    id: "run-1-2".to_string(),
                    summary: "found it".to_string(),
                    chart: Some(ChartSpec::default()),
                },
            ),
            event(
                "run-1",
                3,
                EventKind::Status {
                    status: RunStatus::Completed,
                    reason: None,
                },
            ),
        ];
        for cut in 0..=events.len() {
            let mut a = StateStore::new();
            let mut b = StateStore::new();
            for e in &events[..cut] {
                a.apply(e);
                b.apply(e);
            }
            let left: Vec<_> = a.agents().cloned().collect();
            let right: Vec<_> = b.agents().cloned().collect();
            assert_eq!(left, right, "prefix of {cut} diverged");
        }
    }

    #[test]
    fn metadata_merges_and_gpu_surfaces() {
        let mut store = StateStore::new();
        store.apply(&event(
            "run-1",
            0,
            EventKind::Metadata {
                key: "gpu".to_string(),
                value: "H200".to_string(),
            },
        ));
        let agent = store.agent("run-1").unwrap();
        assert_eq!(agent.gpu(), Some("H200"));
        assert!(agent.thoughts.is_empty());
    }

    #[test]
    fn resync_marks_behind_without_consuming_a_seq() {
        let mut store = StateStore::new();
        store.apply(&thought("run-1", 0, 0, "a"));
        store.apply(&event("run-1", 5, EventKind::Resync { dropped: 4 }));
        let agent = store.agent("run-1").unwrap();
        assert!(agent.behind);
        assert_eq!(agent.last_seq_applied, Some(0));

        // The event sharing the marker's seq still applies.
        assert!(store.apply(&thought("run-1", 5, 2, "after the gap")));
    }

    #[test]
    fn thought_ring_evicts_oldest() {
        let mut store = StateStore::new();
        for i in 0..(THOUGHT_CAP as u64 + 5) {
            store.apply(&thought("run-1", i, i as u32, "t"));
        }
        let agent = store.agent("run-1").unwrap();
        assert_eq!(agent.thoughts.len(), THOUGHT_CAP);
        assert_eq!(agent.thoughts[0].slot, 5);
    }

    #[test]
    fn failed_status_keeps_reason() {
        let mut store = StateStore::new();
        store.apply(&event(
            "run-1",
            0,
            EventKind::Status {
                status: RunStatus::Failed,
                reason: Some("exit code 137".to_string()),
            },
        ));
        let agent = store.agent("run-1").unwrap();
        assert_eq!(agent.status, RunStatus::Failed);
        assert_eq!(agent.status_reason.as_deref(), Some("exit code 137"));
    }
}
