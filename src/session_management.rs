//! Session management core module.
//!
//! This module provides the capture-session coordination core: the session
//! record and its per-node state machine, the verdict policy, the single-writer
//! session assembler and the trigger broadcaster.

use serde::{Deserialize, Serialize};

/// Single-writer owner of all session records.
pub mod assembler;
/// Session record, per-node status and snapshots.
pub mod session;
/// Session opening and trigger fan-out.
pub mod trigger_broadcaster;
/// Verdict policy.
pub mod verdict;


pub use assembler::{
    spawn_outcome_bridge, AssemblerHandle, AssemblerSettings, SessionAssembler, SessionPhase,
};
pub use session::{CaptureMetadata, NodeStatus, Session, SessionSnapshot};
pub use trigger_broadcaster::{SessionRequest, StartedSession, TriggerBroadcaster};
pub use verdict::VerdictPolicy;

/// Terminal classification of a session's completeness.
///
/// Variants:
/// - `Pending`: deadline not reached and at least one expected node still outstanding.
/// - `Complete`: every expected node uploaded.
/// - `Degraded`: some but not all expected nodes uploaded, at or above the success threshold.
/// - `Failed`: below the success threshold, or no node uploaded at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pending,
    Complete,
    Degraded,
    Failed,
}

impl Verdict {
    pub fn is_final(&self) -> bool {
        !matches!(self, Verdict::Pending)
    }
}

/// Per-node state within one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    AwaitingTriggerAck,
    Capturing,
    Uploading,
    Uploaded,
    Failed,
    TimedOut,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Uploaded | NodeState::Failed | NodeState::TimedOut
        )
    }

    /// Position in the attempt lifecycle; progress never moves backwards.
    fn rank(&self) -> u8 {
        match self {
            NodeState::AwaitingTriggerAck => 0,
            NodeState::Capturing => 1,
            NodeState::Uploading => 2,
            NodeState::Uploaded | NodeState::Failed | NodeState::TimedOut => 3,
        }
    }

    pub fn precedes(&self, other: NodeState) -> bool {
        self.rank() < other.rank()
    }
}
