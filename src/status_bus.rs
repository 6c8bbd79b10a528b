//! Status bus: the publish/subscribe channel between the coordinator and the nodes.
//!
//! Three message kinds travel on it: trigger commands, liveness announcements
//! and per-node outcome reports (see [`types::BusMessage`]). The bus itself is
//! purely event-driven; retained liveness state is owned by the roster
//! registry, not by the transport.

use tokio::sync::broadcast;

use crate::error_handling::types::BusError;

pub mod in_process;
pub mod types;

pub use in_process::InProcStatusBus;
pub use types::{BusMessage, LivenessAnnouncement, OutcomeReport, OutcomeStatus, TriggerCommand};

/// Transport-agnostic view of the status bus.
///
/// `subscribe` may fail when the control channel is down; callers reconnect
/// with backoff. A receiver reporting `Closed` means the connection was lost.
pub trait StatusBus: Send + Sync {
    fn publish(&self, message: BusMessage) -> Result<(), BusError>;

    fn subscribe(&self) -> Result<broadcast::Receiver<BusMessage>, BusError>;
}
