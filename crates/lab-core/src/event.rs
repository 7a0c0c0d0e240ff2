use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One immutable, per-run-ordered unit on the stream. Serialized as a
/// single flat JSON object with a `"type"` tag, one object per producer
/// line / WebSocket frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub run_id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Incremental narrative text. A later thought with the same slot
    /// updates the existing timeline item instead of appending.
    Thought { slot: u32, text: String },
    /// A terminal, displayable card. Immutable once emitted.
    Insight {
        id: String,
        summary: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chart: Option<ChartSpec>,
    },
    Status {
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Side-channel attribute merged into agent state, never shown as
    /// a timeline item.
    Metadata { key: String, value: String },
    /// Hub-generated gap marker: events before this point were evicted
    /// or dropped for this viewer. Not part of the normalizer's seq
    /// ownership; applied outside the duplicate check.
    Resync { dropped: u64 },
}

impl Event {
    pub fn is_resync(&self) -> bool {
        matches!(self.kind, EventKind::Resync { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" | "complete" | "done" => Ok(RunStatus::Completed),
            "failed" | "error" => Ok(RunStatus::Failed),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Line,
    Bar,
}

impl Default for ChartKind {
    fn default() -> Self {
        Self::Line
    }
}

/// Small numeric series attached to an insight. Only the first series
/// is ever rendered; additional series are carried untouched (see
/// `ChartGeometry::extra_series`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChartSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: ChartKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default)]
    pub series: Vec<Series>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Series {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub values: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn thought_wire_shape_is_flat_and_tagged() {
        let event = Event {
            run_id: "run-1".to_string(),
            seq: 3,
            timestamp: ts(),
            kind: EventKind::Thought {
                slot: 0,
                text: "scanning corpus".to_string(),
            },
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "thought");
        assert_eq!(json["run_id"], "run-1");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["slot"], 0);

        let back: Event = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, event);
    }

    #[test]
    fn insight_chart_is_optional_on_the_wire() {
        let raw = r#"{"run_id":"run-2","seq":7,"timestamp":"2026-03-01T12:00:00Z",
            "type":"insight","id":"run-2-7","summary":"loss plateaued"}"#;
        let event: Event = serde_json::from_str(raw).expect("deserialize");
        match event.kind {
            EventKind::Insight { chart, .. } => assert!(chart.is_none()),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn status_parses_leniently() {
        assert_eq!("Completed".parse::<RunStatus>(), Ok(RunStatus::Completed));
        assert_eq!("error".parse::<RunStatus>(), Ok(RunStatus::Failed));
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn chart_spec_defaults_to_line() {
        let spec: ChartSpec =
            serde_json::from_str(r#"{"series":[{"values":[1.0,2.0]}]}"#).expect("deserialize");
        assert_eq!(spec.kind, ChartKind::Line);
        assert!(spec.labels.is_empty());
    }
}
