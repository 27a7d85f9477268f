//! Execution events.
//!
//! Events for one execution are totally ordered in the order the scheduler
//! produces them; transport (WebSocket/SSE) is outside the core, which only
//! writes to a typed channel.

use cascade_gml::Value;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ExecutionEvent {
    #[serde(rename = "start")]
    Start {
        execution_id: Uuid,
        flow_id: String,
        at: DateTime<Utc>,
    },
    #[serde(rename = "nodeStart")]
    NodeStart {
        node_id: String,
        input: Value,
        at: DateTime<Utc>,
    },
    #[serde(rename = "nodeComplete")]
    NodeComplete {
        node_id: String,
        output: Value,
        duration_ms: u64,
        at: DateTime<Utc>,
    },
    #[serde(rename = "nodeFailed")]
    NodeFailed {
        node_id: String,
        error: String,
        /// The node's last evaluated input, for debugging.
        input: Value,
        at: DateTime<Utc>,
    },
    #[serde(rename = "nodeSkipped")]
    NodeSkipped { node_id: String, reason: SkipReason },
    #[serde(rename = "iterationStart")]
    IterationStart { node_id: String, index: usize },
    #[serde(rename = "iterationEnd")]
    IterationEnd { node_id: String, index: usize },
    #[serde(rename = "paused")]
    Paused { node_id: String, at: DateTime<Utc> },
    #[serde(rename = "resumed")]
    Resumed { node_id: String, at: DateTime<Utc> },
    #[serde(rename = "complete")]
    Complete { result: Value, at: DateTime<Utc> },
    #[serde(rename = "failed")]
    Failed {
        error: String,
        node_id: Option<String>,
        at: DateTime<Utc>,
    },
    #[serde(rename = "cancelled")]
    Cancelled { at: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The node's `only` expression evaluated falsy.
    OnlyFalse,
    /// All incoming edges resolved along branches that were not taken.
    BranchNotTaken,
    /// Still unresolved when the execution finished (e.g. a failure
    /// handler whose source never failed).
    NotTriggered,
}

/// Send half of the execution's event channel. Receiver loss is fine;
/// events are observability, not control flow.
#[derive(Clone)]
pub struct EventSender(mpsc::UnboundedSender<ExecutionEvent>);

impl EventSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.0.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = ExecutionEvent::NodeComplete {
            node_id: "multiply".to_string(),
            output: Value::Int(6),
            duration_ms: 12,
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "nodeComplete");
        assert_eq!(json["nodeId"], "multiply");
        assert_eq!(json["output"], 6);
    }

    #[test]
    fn test_skip_reason_serialization() {
        let event = ExecutionEvent::NodeSkipped {
            node_id: "x".to_string(),
            reason: SkipReason::BranchNotTaken,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["reason"], "branch_not_taken");
    }

    #[tokio::test]
    async fn test_channel_round_trip() {
        let (tx, mut rx) = EventSender::channel();
        tx.emit(ExecutionEvent::Cancelled { at: Utc::now() });
        assert!(matches!(
            rx.recv().await,
            Some(ExecutionEvent::Cancelled { .. })
        ));
    }
}
