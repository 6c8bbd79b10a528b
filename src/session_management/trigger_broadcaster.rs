use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info};

use super::assembler::AssemblerHandle;
use super::session::CaptureMetadata;
use crate::error_handling::types::SessionError;
use crate::roster::RosterRegistry;
use crate::status_bus::types::{BusMessage, TriggerCommand};
use crate::status_bus::StatusBus;
use crate::storage::types::is_valid_identifier;

/// What to capture and how soon.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    /// Expected nodes; every online node when `None`.
    pub nodes: Option<Vec<String>>,
    pub metadata: CaptureMetadata,
    /// Overrides the configured trigger delay. Never below `MIN_TRIGGER_LEAD`.
    pub delay: Option<Duration>,
}

impl SessionRequest {
    pub fn for_nodes(nodes: Vec<String>) -> Self {
        Self {
            nodes: Some(nodes),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedSession {
    pub session_id: String,
    pub capture_at: DateTime<Utc>,
    pub targets: Vec<String>,
}

/// Opens sessions and fans the trigger out over the status bus.
pub struct TriggerBroadcaster {
    assembler: AssemblerHandle,
    bus: Arc<dyn StatusBus>,
    roster: Arc<RosterRegistry>,
    freshness: chrono::Duration,
    trigger_delay: Duration,
}

impl TriggerBroadcaster {
    pub fn new(
        assembler: AssemblerHandle,
        bus: Arc<dyn StatusBus>,
        roster: Arc<RosterRegistry>,
        freshness: chrono::Duration,
        trigger_delay: Duration,
    ) -> Self {
        Self {
            assembler,
            bus,
            roster,
            freshness,
            trigger_delay,
        }
    }

    /// Starts a session for the requested nodes, or for every online node.
    ///
    /// Fails with `SessionBusy` while another session is pending; the pending
    /// session is left untouched.
    pub async fn start_session(
        &self,
        request: SessionRequest,
    ) -> Result<StartedSession, SessionError> {
        let expected: BTreeSet<String> = match request.nodes {
            Some(nodes) => nodes.into_iter().collect(),
            None => self.roster.online_nodes(self.freshness),
        };
        if expected.is_empty() {
            return Err(SessionError::RosterEmpty);
        }
        if let Some(bad) = expected.iter().find(|id| !is_valid_identifier(id)) {
            return Err(SessionError::InvalidNode(bad.clone()));
        }

        let targets: Vec<String> = expected.iter().cloned().collect();
        let session_id = self
            .assembler
            .open_session(expected, request.metadata)
            .await?;

        let delay = request.delay.unwrap_or(self.trigger_delay);
        let trigger = TriggerCommand::new(&session_id, 1, targets.clone(), delay);
        let capture_at = trigger.capture_at;
        if let Err(e) = self.bus.publish(BusMessage::Trigger(trigger)) {
            error!("[{}] trigger not delivered: {}", session_id, e);
            self.assembler
                .abort_session(&session_id, &format!("trigger not delivered: {}", e))
                .await?;
            return Err(SessionError::BusError(e));
        }
        info!("[{}] trigger published, capture at {}", session_id, capture_at);
        Ok(StartedSession {
            session_id,
            capture_at,
            targets,
        })
    }
}
