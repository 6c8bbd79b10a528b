//! Messages carried by the status bus.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Capture directive fanned out to the nodes.
///
/// `targets` lists the nodes expected to act on the trigger; an empty list
/// addresses every node listening on the bus. Individual retries are sent with
/// a single target and an incremented `attempt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerCommand {
    pub session_id: String,
    pub attempt: u32,
    pub targets: Vec<String>,
    /// Scheduled capture instant, so nodes fire together despite delivery jitter.
    pub capture_at: DateTime<Utc>,
    /// Session-scoped upload path relative to the coordinator, e.g. `/sessions/<id>/upload`.
    pub upload_path: String,
}

/// Lead time between publishing a trigger and the scheduled capture instant.
pub const MIN_TRIGGER_LEAD: Duration = Duration::from_millis(100);

impl TriggerCommand {
    pub fn new(session_id: &str, attempt: u32, targets: Vec<String>, delay: Duration) -> Self {
        let lead = chrono::Duration::from_std(delay.max(MIN_TRIGGER_LEAD))
            .unwrap_or_else(|_| chrono::Duration::milliseconds(100));
        Self {
            session_id: session_id.to_string(),
            attempt,
            targets,
            capture_at: Utc::now() + lead,
            upload_path: format!("/sessions/{}/upload", session_id),
        }
    }

    pub fn addresses(&self, node_id: &str) -> bool {
        self.targets.is_empty() || self.targets.iter().any(|t| t == node_id)
    }
}

/// Liveness/availability announcement published by a node on connect and reconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessAnnouncement {
    pub node_id: String,
    /// Best-known endpoint at which the node can be reached.
    pub reported_address: Option<String>,
    /// Where the most recent image can be fetched from the node, if any.
    pub retrieval_address: Option<String>,
    pub announced_at: DateTime<Utc>,
}

/// Node-side progress and outcome vocabulary.
///
/// `Capturing` doubles as the trigger acknowledgement; `Uploaded` and `Failed`
/// are terminal for the attempt they refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Capturing,
    Uploading,
    Uploaded,
    Failed,
}

impl OutcomeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutcomeStatus::Uploaded | OutcomeStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeReport {
    pub node_id: String,
    pub session_id: String,
    pub attempt: u32,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusMessage {
    Trigger(TriggerCommand),
    Liveness(LivenessAnnouncement),
    Outcome(OutcomeReport),
}

impl BusMessage {
    /// Subject the message is published on, below the rig `prefix`.
    pub fn subject(&self, prefix: &str) -> String {
        match self {
            BusMessage::Trigger(_) => format!("{}/cmd/capture", prefix),
            BusMessage::Liveness(a) => format!("{}/status/{}", prefix, a.node_id),
            BusMessage::Outcome(r) => format!("{}/outcome/{}", prefix, r.node_id),
        }
    }
}
