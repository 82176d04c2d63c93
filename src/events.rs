use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::types::Stage;

/// Where a flow currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowState {
    Idle,
    SubmittingStage1,
    AwaitingStage1Artifact,
    PreparingStage2Input,
    SubmittingStage2,
    PollingStage2,
    Succeeded,
    Failed,
    Cancelled,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Succeeded | FlowState::Failed | FlowState::Cancelled)
    }
}

/// Named stopwatches reported while a flow runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timer {
    Flux,
    Nano,
    Upscale,
    Total,
}

/// Everything a render surface needs to display a flow.
///
/// Serialized with a `type` tag so it can be forwarded to a UI as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FlowEvent {
    /// State machine transition.
    #[serde(rename_all = "camelCase")]
    State { surface: String, state: FlowState },
    /// Loading overlay text.
    #[serde(rename_all = "camelCase")]
    Loading { surface: String, message: String },
    /// Stage-2 attempt counter.
    #[serde(rename_all = "camelCase")]
    Attempt { surface: String, current: u32, max: u32 },
    /// Status line for the surface log.
    #[serde(rename_all = "camelCase")]
    Log { surface: String, message: String },
    /// Raw backend status seen while polling.
    #[serde(rename_all = "camelCase")]
    Status {
        surface: String,
        stage: Stage,
        task_id: String,
        status: String,
    },
    #[serde(rename_all = "camelCase")]
    StageTimer {
        surface: String,
        timer: Timer,
        #[serde(with = "millis")]
        elapsed: Duration,
    },
    /// Downscaled JPEG data URI for display.
    #[serde(rename_all = "camelCase")]
    Preview { surface: String, data_uri: String },
    #[serde(rename_all = "camelCase")]
    Error {
        surface: String,
        message: String,
        debug: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Cancelled { surface: String },
    /// Terminal success; the download is named `file_name`.
    #[serde(rename_all = "camelCase")]
    Done { surface: String, file_name: String },
}

impl FlowEvent {
    pub fn surface(&self) -> &str {
        match self {
            FlowEvent::State { surface, .. }
            | FlowEvent::Loading { surface, .. }
            | FlowEvent::Attempt { surface, .. }
            | FlowEvent::Log { surface, .. }
            | FlowEvent::Status { surface, .. }
            | FlowEvent::StageTimer { surface, .. }
            | FlowEvent::Preview { surface, .. }
            | FlowEvent::Error { surface, .. }
            | FlowEvent::Cancelled { surface }
            | FlowEvent::Done { surface, .. } => surface,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Sending half of a flow's event stream.
///
/// A dropped receiver is not an error: the flow keeps running and events are
/// discarded.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<FlowEvent>>,
}

impl EventSink {
    /// Create a sink and the receiver a render layer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FlowEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: FlowEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Collapse whitespace and cut to 120 characters for log display.
pub fn prompt_preview(prompt: &str) -> String {
    const MAX: usize = 120;
    let collapsed = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > MAX {
        let cut: String = collapsed.chars().take(MAX).collect();
        format!("{}\u{2026}", cut)
    } else {
        collapsed
    }
}

/// Render a debug payload for the log, cut to 600 characters.
pub fn debug_preview(debug: &Value) -> String {
    const MAX: usize = 600;
    let text = match debug {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() > MAX {
        let cut: String = text.chars().take(MAX).collect();
        format!("{} \u{2026}", cut)
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let ev = FlowEvent::Attempt {
            surface: "result".into(),
            current: 2,
            max: 6,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "attempt");
        assert_eq!(v["current"], 2);
        assert_eq!(v["surface"], "result");
    }

    #[test]
    fn test_stage_timer_in_millis() {
        let ev = FlowEvent::StageTimer {
            surface: "s".into(),
            timer: Timer::Flux,
            elapsed: Duration::from_millis(1500),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "stageTimer");
        assert_eq!(v["timer"], "flux");
        assert_eq!(v["elapsed"], 1500);
    }

    #[test]
    fn test_discarding_sink_and_closed_receiver() {
        EventSink::discard().emit(FlowEvent::Cancelled { surface: "s".into() });
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(FlowEvent::Cancelled { surface: "s".into() });
    }

    #[test]
    fn test_prompt_preview() {
        assert_eq!(prompt_preview("  a \n\t b  "), "a b");
        let long = "x".repeat(200);
        let p = prompt_preview(&long);
        assert_eq!(p.chars().count(), 121);
        assert!(p.ends_with('\u{2026}'));
    }

    #[test]
    fn test_debug_preview() {
        assert_eq!(debug_preview(&json!("plain")), "plain");
        assert_eq!(debug_preview(&json!({"a": 1})), r#"{"a":1}"#);
        let long = json!("y".repeat(700));
        assert!(debug_preview(&long).ends_with(" \u{2026}"));
    }
}
