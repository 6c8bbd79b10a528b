use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error_handling::types::BusError;
use crate::status_bus::types::{BusMessage, LivenessAnnouncement};
use crate::status_bus::StatusBus;

/// A registered capture device, identified by hardware identity rather than address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub last_seen: DateTime<Utc>,
    pub reported_address: Option<String>,
    /// Where the node's most recent image can be fetched from.
    pub retrieval_address: Option<String>,
}

#[derive(Default)]
pub struct RosterRegistry {
    nodes: RwLock<HashMap<String, Node>>,
}

impl RosterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Node>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Node>> {
        self.nodes.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores an announcement. Absent addresses keep the previously known value.
    pub fn record_liveness(&self, announcement: &LivenessAnnouncement) {
        let mut nodes = self.write();
        match nodes.get_mut(&announcement.node_id) {
            Some(node) => {
                node.last_seen = node.last_seen.max(announcement.announced_at);
                if announcement.reported_address.is_some() {
                    node.reported_address = announcement.reported_address.clone();
                }
                if announcement.retrieval_address.is_some() {
                    node.retrieval_address = announcement.retrieval_address.clone();
                }
            }
            None => {
                info!("New node {} registered", announcement.node_id);
                nodes.insert(
                    announcement.node_id.clone(),
                    Node {
                        node_id: announcement.node_id.clone(),
                        last_seen: announcement.announced_at,
                        reported_address: announcement.reported_address.clone(),
                        retrieval_address: announcement.retrieval_address.clone(),
                    },
                );
            }
        }
    }

    /// Refreshes `last_seen` of a node that showed a sign of life.
    pub fn touch(&self, node_id: &str, at: DateTime<Utc>) {
        let mut nodes = self.write();
        match nodes.get_mut(node_id) {
            Some(node) => node.last_seen = node.last_seen.max(at),
            None => {
                info!("New node {} registered", node_id);
                nodes.insert(
                    node_id.to_string(),
                    Node {
                        node_id: node_id.to_string(),
                        last_seen: at,
                        reported_address: None,
                        retrieval_address: None,
                    },
                );
            }
        }
    }

    pub fn get(&self, node_id: &str) -> Option<Node> {
        self.read().get(node_id).cloned()
    }

    /// Every known node, sorted by id.
    pub fn list_known_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Nodes seen within `freshness` of `now`.
    pub fn online_nodes_at(
        &self,
        now: DateTime<Utc>,
        freshness: chrono::Duration,
    ) -> BTreeSet<String> {
        self.read()
            .values()
            .filter(|n| now - n.last_seen <= freshness)
            .map(|n| n.node_id.clone())
            .collect()
    }

    /// Default roster for a new session.
    pub fn online_nodes(&self, freshness: chrono::Duration) -> BTreeSet<String> {
        self.online_nodes_at(Utc::now(), freshness)
    }

    pub fn is_online(node: &Node, freshness: chrono::Duration) -> bool {
        Utc::now() - node.last_seen <= freshness
    }

    /// Keeps the registry current from liveness announcements and outcome reports.
    pub fn spawn_listener(
        self: Arc<Self>,
        bus: &dyn StatusBus,
    ) -> Result<JoinHandle<()>, BusError> {
        let mut rx = bus.subscribe()?;
        Ok(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(BusMessage::Liveness(announcement)) => {
                        debug!("Liveness from {}", announcement.node_id);
                        self.record_liveness(&announcement);
                    }
                    Ok(BusMessage::Outcome(report)) => {
                        self.touch(&report.node_id, report.reported_at)
                    }
                    Ok(BusMessage::Trigger(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Roster listener lagged, {} bus message(s) lost", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Roster listener stopped");
        }))
    }
}
