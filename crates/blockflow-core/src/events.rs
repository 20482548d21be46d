//! Progress events emitted for every block transition of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::BlockType;
use crate::variables::Variable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressState {
    Started,
    Completed,
    Failed,
    Cancelled,
    RunCompleted,
}

impl ProgressState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::RunCompleted => "run_completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub run_id: String,
    /// Command owning the block (the callee inside nested frames)
    pub command: String,
    pub block_id: String,
    pub block_name: String,
    pub block_type: BlockType,
    pub state: ProgressState,
    /// Frame stack depth, 1 for the root command
    pub depth: usize,
    /// Blocks executed so far in this run
    pub step: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Vec<Variable>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast channel for progress events. Cloning shares the channel.
#[derive(Clone)]
pub struct ProgressBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers; having none is fine.
    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(state: ProgressState) -> ProgressEvent {
        ProgressEvent {
            run_id: "r1".to_string(),
            command: "demo".to_string(),
            block_id: "b1".to_string(),
            block_name: "First".to_string(),
            block_type: BlockType::Bash,
            state,
            depth: 1,
            step: 1,
            variables: None,
            detail: None,
            duration_ms: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let bus = ProgressBus::default();
        let mut rx = bus.subscribe();
        bus.publish(event(ProgressState::Started));
        bus.publish(event(ProgressState::Completed));

        assert_eq!(rx.recv().await.unwrap().state, ProgressState::Started);
        assert_eq!(rx.recv().await.unwrap().state, ProgressState::Completed);
    }

    #[test]
    fn test_publish_without_subscribers() {
        ProgressBus::new(4).publish(event(ProgressState::Failed));
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(event(ProgressState::RunCompleted)).unwrap();
        assert_eq!(json["runId"], "r1");
        assert_eq!(json["blockType"], "bash");
        assert_eq!(json["state"], "run_completed");
        assert!(json.get("variables").is_none());
    }
}
