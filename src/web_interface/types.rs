use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::roster::Node;
use crate::session_management::{CaptureMetadata, SessionRequest, StartedSession};

/// API error payload
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub message: String,
}

/// Body of `POST /sessions`; without `nodes` every online node is targeted.
///
/// `patient_id`, `wound_location`, `operator` and `notes` sit at the top level
/// and are stored with the session.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StartSessionRequest {
    #[serde(default)]
    pub nodes: Option<Vec<String>>,
    #[serde(flatten)]
    pub metadata: CaptureMetadata,
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

impl From<StartSessionRequest> for SessionRequest {
    fn from(request: StartSessionRequest) -> Self {
        SessionRequest {
            nodes: request.nodes,
            metadata: request.metadata,
            delay: request.delay_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: String,
    pub capture_at: DateTime<Utc>,
    pub targets: Vec<String>,
}

impl From<StartedSession> for StartSessionResponse {
    fn from(started: StartedSession) -> Self {
        Self {
            session_id: started.session_id,
            capture_at: started.capture_at,
            targets: started.targets,
        }
    }
}

/// Body of `POST /nodes/{id}/heartbeat`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeResponse {
    #[serde(flatten)]
    pub node: Node,
    pub online: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TimeResponse {
    pub server_time_ms: i64,
    pub server_time: DateTime<Utc>,
}

impl TimeResponse {
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            server_time_ms: now.timestamp_millis(),
            server_time: now,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}
