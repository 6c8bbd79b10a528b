use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::verdict::VerdictPolicy;
use super::{NodeState, Verdict};
use crate::status_bus::types::{OutcomeReport, OutcomeStatus};
use crate::storage::types::{ImageArrival, ImageRef};

/// Why an event left a node untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The event refers to an attempt that has since been superseded by a retry.
    StaleAttempt,
    /// The event refers to an attempt the coordinator never triggered.
    UnknownAttempt,
    AlreadyTerminal,
    /// Progress older than the current state (reordered delivery).
    Regression,
    Duplicate,
}

/// Effect of applying one event to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advanced(NodeState),
    Terminal(NodeState),
    Ignored(IgnoreReason),
    /// The node is not part of the expected roster; recorded only.
    RosterMismatch,
    /// The session is already finalized; recorded in the audit trail only.
    Audited,
}

/// Closed attempt of a node that was retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub state: NodeState,
    pub image_ref: Option<ImageRef>,
    pub detail: Option<String>,
    pub ended_at: DateTime<Utc>,
}

/// Tracks one node within one session. The fields describe the current attempt;
/// earlier attempts are kept in `previous_attempts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// `false` for nodes that reported into the session without being expected.
    pub in_roster: bool,
    pub state: NodeState,
    pub attempt_count: u32,
    /// Set once `state` is `Uploaded`.
    pub image_ref: Option<ImageRef>,
    pub last_update: DateTime<Utc>,
    /// Image stored for the current attempt while its outcome report is outstanding.
    pub pending_image: Option<ImageRef>,
    /// The node reported `uploaded` for the current attempt.
    pub upload_reported: bool,
    pub detail: Option<String>,
    pub previous_attempts: Vec<AttemptRecord>,
}

impl NodeStatus {
    pub fn expected(now: DateTime<Utc>) -> Self {
        Self {
            in_roster: true,
            state: NodeState::AwaitingTriggerAck,
            attempt_count: 1,
            image_ref: None,
            last_update: now,
            pending_image: None,
            upload_reported: false,
            detail: None,
            previous_attempts: Vec::new(),
        }
    }

    fn stray(attempt: u32, now: DateTime<Utc>) -> Self {
        Self {
            in_roster: false,
            attempt_count: attempt.max(1),
            ..Self::expected(now)
        }
    }

    fn check_attempt(&self, attempt: u32) -> Option<IgnoreReason> {
        if attempt < self.attempt_count {
            Some(IgnoreReason::StaleAttempt)
        } else if attempt > self.attempt_count {
            Some(IgnoreReason::UnknownAttempt)
        } else {
            None
        }
    }

    fn advance(&mut self, target: NodeState, now: DateTime<Utc>) -> Transition {
        if self.state.precedes(target) {
            self.state = target;
            self.last_update = now;
            Transition::Advanced(target)
        } else {
            Transition::Ignored(IgnoreReason::Regression)
        }
    }

    fn finish(&mut self, target: NodeState, now: DateTime<Utc>) -> Transition {
        self.state = target;
        self.last_update = now;
        Transition::Terminal(target)
    }

    fn apply_report(&mut self, report: &OutcomeReport, now: DateTime<Utc>) -> Transition {
        if let Some(reason) = self.check_attempt(report.attempt) {
            return Transition::Ignored(reason);
        }
        if self.state.is_terminal() {
            return Transition::Ignored(IgnoreReason::AlreadyTerminal);
        }
        match report.status {
            OutcomeStatus::Capturing => self.advance(NodeState::Capturing, now),
            OutcomeStatus::Uploading => self.advance(NodeState::Uploading, now),
            OutcomeStatus::Uploaded => {
                if self.upload_reported {
                    return Transition::Ignored(IgnoreReason::Duplicate);
                }
                self.upload_reported = true;
                match self.pending_image.take() {
                    Some(image) => {
                        self.image_ref = Some(image);
                        self.finish(NodeState::Uploaded, now)
                    }
                    // acknowledged on the control path, data path not seen yet
                    None => {
                        self.state = NodeState::Uploading;
                        self.last_update = now;
                        Transition::Advanced(NodeState::Uploading)
                    }
                }
            }
            OutcomeStatus::Failed => {
                self.detail = report.detail.clone();
                self.finish(NodeState::Failed, now)
            }
        }
    }

    fn apply_arrival(&mut self, image: &ImageRef, attempt: u32, now: DateTime<Utc>) -> Transition {
        if let Some(reason) = self.check_attempt(attempt) {
            return Transition::Ignored(reason);
        }
        if self.state == NodeState::Uploaded {
            // retransmission of the same attempt overwrote the same file
            return Transition::Ignored(IgnoreReason::Duplicate);
        }
        if self.state.is_terminal() {
            return Transition::Ignored(IgnoreReason::AlreadyTerminal);
        }
        if self.upload_reported {
            self.image_ref = Some(image.clone());
            return self.finish(NodeState::Uploaded, now);
        }
        let duplicate = self.pending_image.is_some();
        self.pending_image = Some(image.clone());
        self.last_update = now;
        if self.state.precedes(NodeState::Uploading) {
            self.state = NodeState::Uploading;
        }
        if duplicate {
            Transition::Ignored(IgnoreReason::Duplicate)
        } else {
            Transition::Advanced(NodeState::Uploading)
        }
    }

    /// Closes the current attempt and opens a fresh one. Returns the new attempt number.
    fn begin_retry(&mut self, now: DateTime<Utc>) -> u32 {
        let image_ref = self.image_ref.take().or_else(|| self.pending_image.take());
        self.previous_attempts.push(AttemptRecord {
            attempt: self.attempt_count,
            state: self.state,
            image_ref,
            detail: self.detail.take(),
            ended_at: self.last_update,
        });
        self.attempt_count += 1;
        self.state = NodeState::AwaitingTriggerAck;
        self.upload_reported = false;
        self.last_update = now;
        self.attempt_count
    }

    /// Deadline handling for a non-terminal node. An image that arrived without
    /// its outcome report is accepted once the deadline has passed.
    fn expire(&mut self, now: DateTime<Utc>) -> Option<NodeState> {
        if self.state.is_terminal() {
            return None;
        }
        let next = match self.pending_image.take() {
            Some(image) => {
                self.image_ref = Some(image);
                NodeState::Uploaded
            }
            None => NodeState::TimedOut,
        };
        self.finish(next, now);
        Some(next)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    Report { status: OutcomeStatus },
    Arrival { path: PathBuf },
    BelatedUpload { path: PathBuf },
    RosterMismatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub node_id: String,
    pub attempt: u32,
    pub event: AuditEvent,
}

/// Operator-supplied context stored with a session. All fields are optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wound_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl CaptureMetadata {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// One synchronized capture attempt.
///
/// Mutated only by the session assembler. Once `verdict` leaves `Pending` it is
/// never revised; later events only extend `audit`.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub expected_nodes: BTreeSet<String>,
    pub node_states: BTreeMap<String, NodeStatus>,
    pub opened_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub verdict: Verdict,
    pub directory: PathBuf,
    pub metadata: CaptureMetadata,
    pub audit: Vec<AuditEntry>,
}

impl Session {
    pub fn open(
        session_id: String,
        expected_nodes: BTreeSet<String>,
        opened_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
        directory: PathBuf,
    ) -> Self {
        let node_states = expected_nodes
            .iter()
            .map(|id| (id.clone(), NodeStatus::expected(opened_at)))
            .collect();
        Self {
            session_id,
            expected_nodes,
            node_states,
            opened_at,
            deadline,
            finalized_at: None,
            verdict: Verdict::Pending,
            directory,
            metadata: CaptureMetadata::default(),
            audit: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: CaptureMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_open(&self) -> bool {
        !self.verdict.is_final()
    }

    fn record(&mut self, at: DateTime<Utc>, node_id: &str, attempt: u32, event: AuditEvent) {
        self.audit.push(AuditEntry {
            at,
            node_id: node_id.to_string(),
            attempt,
            event,
        });
    }

    /// Records a node outside the roster. Returns `true` for such nodes.
    fn note_roster_mismatch(&mut self, node_id: &str, attempt: u32, now: DateTime<Utc>) -> bool {
        if self.expected_nodes.contains(node_id) {
            return false;
        }
        warn!(
            "[{}] event from {} which is not in the expected roster",
            self.session_id, node_id
        );
        self.node_states
            .entry(node_id.to_string())
            .or_insert_with(|| NodeStatus::stray(attempt, now));
        self.record(now, node_id, attempt, AuditEvent::RosterMismatch);
        true
    }

    pub fn apply_report(&mut self, report: &OutcomeReport, now: DateTime<Utc>) -> Transition {
        if !self.is_open() {
            self.record(
                now,
                &report.node_id,
                report.attempt,
                AuditEvent::Report {
                    status: report.status,
                },
            );
            return Transition::Audited;
        }
        let mismatch = self.note_roster_mismatch(&report.node_id, report.attempt, now);
        let transition = match self.node_states.get_mut(&report.node_id) {
            Some(status) => status.apply_report(report, now),
            None => Transition::Ignored(IgnoreReason::UnknownAttempt),
        };
        debug!(
            "[{}] report {:?} from {} attempt {}: {:?}",
            self.session_id, report.status, report.node_id, report.attempt, transition
        );
        if mismatch {
            Transition::RosterMismatch
        } else {
            transition
        }
    }

    pub fn apply_arrival(&mut self, arrival: &ImageArrival, now: DateTime<Utc>) -> Transition {
        let key = &arrival.key;
        if !self.is_open() {
            self.record(
                now,
                &key.node_id,
                key.attempt,
                AuditEvent::Arrival {
                    path: arrival.image.path.clone(),
                },
            );
            return Transition::Audited;
        }
        let mismatch = self.note_roster_mismatch(&key.node_id, key.attempt, now);
        let transition = match self.node_states.get_mut(&key.node_id) {
            Some(status) => status.apply_arrival(&arrival.image, key.attempt, now),
            None => Transition::Ignored(IgnoreReason::UnknownAttempt),
        };
        debug!(
            "[{}] image from {} attempt {}: {:?}",
            self.session_id, key.node_id, key.attempt, transition
        );
        if mismatch {
            Transition::RosterMismatch
        } else {
            transition
        }
    }

    /// Records an upload that was diverted to the orphan bucket.
    pub fn record_belated(&mut self, arrival: &ImageArrival, now: DateTime<Utc>) {
        self.record(
            now,
            &arrival.key.node_id,
            arrival.key.attempt,
            AuditEvent::BelatedUpload {
                path: arrival.image.path.clone(),
            },
        );
    }

    /// Whether `node_id` failed its current attempt and may be triggered again.
    pub fn can_retry(&self, node_id: &str, max_attempts: u32) -> bool {
        self.is_open()
            && self.node_states.get(node_id).is_some_and(|s| {
                s.in_roster && s.state == NodeState::Failed && s.attempt_count < max_attempts
            })
    }

    pub fn begin_retry(&mut self, node_id: &str, now: DateTime<Utc>) -> Option<u32> {
        if !self.is_open() {
            return None;
        }
        let status = self.node_states.get_mut(node_id)?;
        let attempt = status.begin_retry(now);
        info!("[{}] retrying {} as attempt {}", self.session_id, node_id, attempt);
        Some(attempt)
    }

    /// Marks every outstanding expected node as timed out. Returns the nodes changed.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<(String, NodeState)> {
        if !self.is_open() {
            return Vec::new();
        }
        let mut changed = Vec::new();
        for (node_id, status) in self.node_states.iter_mut().filter(|(_, s)| s.in_roster) {
            if let Some(state) = status.expire(now) {
                if state == NodeState::Uploaded {
                    warn!(
                        "[{}] accepting image from {} without outcome report",
                        self.session_id, node_id
                    );
                }
                changed.push((node_id.clone(), state));
            }
        }
        changed
    }

    /// Fails every outstanding expected node with `reason`.
    pub fn abort(&mut self, reason: &str, now: DateTime<Utc>) {
        if !self.is_open() {
            return;
        }
        for status in self.node_states.values_mut().filter(|s| s.in_roster) {
            if !status.state.is_terminal() {
                status.detail = Some(reason.to_string());
                status.finish(NodeState::Failed, now);
            }
        }
    }

    pub fn all_terminal(&self) -> bool {
        self.node_states
            .values()
            .filter(|s| s.in_roster)
            .all(|s| s.state.is_terminal())
    }

    pub fn succeeded(&self) -> usize {
        self.node_states
            .values()
            .filter(|s| s.in_roster && s.state == NodeState::Uploaded)
            .count()
    }

    /// Sets the verdict. Returns `None` if it was already set.
    pub fn finalize(&mut self, policy: &VerdictPolicy, now: DateTime<Utc>) -> Option<Verdict> {
        if !self.is_open() {
            return None;
        }
        let verdict = policy.evaluate(self.expected_nodes.len(), self.succeeded());
        self.verdict = verdict;
        self.finalized_at = Some(now);
        Some(verdict)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            verdict: self.verdict,
            directory_path: self.directory.clone(),
            opened_at: self.opened_at,
            deadline: self.deadline,
            finalized_at: self.finalized_at,
            expected_nodes: self.expected_nodes.iter().cloned().collect(),
            succeeded: self.succeeded(),
            per_node_status: self.node_states.clone(),
            metadata: self.metadata.clone(),
            audit: self.audit.clone(),
        }
    }
}

/// Read-only view of a session, also the on-disk metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub verdict: Verdict,
    pub directory_path: PathBuf,
    pub opened_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub expected_nodes: Vec<String>,
    pub succeeded: usize,
    pub per_node_status: BTreeMap<String, NodeStatus>,
    #[serde(default)]
    pub metadata: CaptureMetadata,
    pub audit: Vec<AuditEntry>,
}

impl SessionSnapshot {
    /// Expected nodes that did not end in `Uploaded`.
    pub fn missing(&self) -> Vec<String> {
        self.expected_nodes
            .iter()
            .filter(|id| {
                self.per_node_status
                    .get(*id)
                    .map_or(true, |s| s.state != NodeState::Uploaded)
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::types::SuccessThreshold;
    use crate::storage::types::ImageKey;

    fn session(nodes: &[&str]) -> Session {
        let now = Utc::now();
        Session::open(
            "session_t".to_string(),
            nodes.iter().map(|n| n.to_string()).collect(),
            now,
            now + chrono::Duration::seconds(30),
            PathBuf::from("/tmp/session_t"),
        )
    }

    fn report(node: &str, attempt: u32, status: OutcomeStatus) -> OutcomeReport {
        OutcomeReport {
            node_id: node.to_string(),
            session_id: "session_t".to_string(),
            attempt,
            status,
            detail: None,
            reported_at: Utc::now(),
        }
    }

    fn arrival(node: &str, attempt: u32) -> ImageArrival {
        let key = ImageKey::new("session_t", node, attempt);
        ImageArrival {
            image: ImageRef {
                path: PathBuf::from(format!("/tmp/session_t/images/{}", key.file_name("jpg"))),
                size: 3,
                sha256: "00".repeat(32),
                stored_at: Utc::now(),
            },
            key,
            orphan: false,
        }
    }

    #[test]
    fn test_report_then_arrival_uploads() {
        let mut s = session(&["cam01"]);
        let now = Utc::now();
        assert_eq!(
            s.apply_report(&report("cam01", 1, OutcomeStatus::Uploaded), now),
            Transition::Advanced(NodeState::Uploading)
        );
        assert_eq!(
            s.apply_arrival(&arrival("cam01", 1), now),
            Transition::Terminal(NodeState::Uploaded)
        );
        let status = &s.node_states["cam01"];
        assert_eq!(status.state, NodeState::Uploaded);
        assert!(status.image_ref.is_some());
        assert!(status.pending_image.is_none());
    }

    #[test]
    fn test_arrival_then_report_uploads() {
        let mut s = session(&["cam01"]);
        let now = Utc::now();
        assert_eq!(
            s.apply_arrival(&arrival("cam01", 1), now),
            Transition::Advanced(NodeState::Uploading)
        );
        // the data path alone is not enough
        assert_eq!(s.node_states["cam01"].state, NodeState::Uploading);
        assert!(s.node_states["cam01"].image_ref.is_none());

        assert_eq!(
            s.apply_report(&report("cam01", 1, OutcomeStatus::Uploaded), now),
            Transition::Terminal(NodeState::Uploaded)
        );
        assert_eq!(s.node_states["cam01"].state, NodeState::Uploaded);
    }

    #[test]
    fn test_progress_never_regresses() {
        let mut s = session(&["cam01"]);
        let now = Utc::now();
        s.apply_report(&report("cam01", 1, OutcomeStatus::Uploading), now);
        assert_eq!(
            s.apply_report(&report("cam01", 1, OutcomeStatus::Capturing), now),
            Transition::Ignored(IgnoreReason::Regression)
        );
        assert_eq!(s.node_states["cam01"].state, NodeState::Uploading);

        s.apply_report(&report("cam01", 1, OutcomeStatus::Failed), now);
        for status in [OutcomeStatus::Capturing, OutcomeStatus::Uploaded, OutcomeStatus::Failed] {
            assert_eq!(
                s.apply_report(&report("cam01", 1, status), now),
                Transition::Ignored(IgnoreReason::AlreadyTerminal)
            );
        }
        assert_eq!(
            s.apply_arrival(&arrival("cam01", 1), now),
            Transition::Ignored(IgnoreReason::AlreadyTerminal)
        );
        assert_eq!(s.node_states["cam01"].state, NodeState::Failed);
    }

    #[test]
    fn test_duplicate_events_after_upload_are_ignored() {
        let mut s = session(&["cam01"]);
        let now = Utc::now();
        s.apply_arrival(&arrival("cam01", 1), now);
        s.apply_report(&report("cam01", 1, OutcomeStatus::Uploaded), now);
        let before = s.node_states["cam01"].clone();

        assert_eq!(
            s.apply_arrival(&arrival("cam01", 1), now),
            Transition::Ignored(IgnoreReason::Duplicate)
        );
        assert_eq!(
            s.apply_report(&report("cam01", 1, OutcomeStatus::Uploaded), now),
            Transition::Ignored(IgnoreReason::AlreadyTerminal)
        );
        assert_eq!(s.node_states["cam01"], before);
    }

    #[test]
    fn test_retry_opens_fresh_attempt() {
        let mut s = session(&["cam01"]);
        let now = Utc::now();
        s.apply_report(&report("cam01", 1, OutcomeStatus::Failed), now);
        assert!(s.can_retry("cam01", 2));
        assert!(!s.can_retry("cam01", 1));

        assert_eq!(s.begin_retry("cam01", now), Some(2));
        let status = &s.node_states["cam01"];
        assert_eq!(status.state, NodeState::AwaitingTriggerAck);
        assert_eq!(status.attempt_count, 2);
        assert_eq!(status.previous_attempts.len(), 1);
        assert_eq!(status.previous_attempts[0].state, NodeState::Failed);
        assert!(!s.can_retry("cam01", 2));

        // late events from the first attempt do not touch the second
        assert_eq!(
            s.apply_arrival(&arrival("cam01", 1), now),
            Transition::Ignored(IgnoreReason::StaleAttempt)
        );
        assert_eq!(
            s.apply_report(&report("cam01", 3, OutcomeStatus::Uploaded), now),
            Transition::Ignored(IgnoreReason::UnknownAttempt)
        );
    }

    #[test]
    fn test_roster_mismatch_is_recorded_but_excluded() {
        let mut s = session(&["cam01"]);
        let now = Utc::now();
        assert_eq!(
            s.apply_arrival(&arrival("cam99", 1), now),
            Transition::RosterMismatch
        );
        s.apply_report(&report("cam99", 1, OutcomeStatus::Uploaded), now);
        assert!(!s.node_states["cam99"].in_roster);
        assert_eq!(s.succeeded(), 0);
        assert!(!s.all_terminal());
        assert!(!s.can_retry("cam99", 5));
        assert!(s
            .audit
            .iter()
            .any(|e| e.node_id == "cam99" && e.event == AuditEvent::RosterMismatch));
    }

    #[test]
    fn test_expire_resolves_outstanding_nodes() {
        let mut s = session(&["cam01", "cam02", "cam03"]);
        let now = Utc::now();
        s.apply_arrival(&arrival("cam01", 1), now);
        s.apply_report(&report("cam02", 1, OutcomeStatus::Capturing), now);
        s.apply_report(&report("cam03", 1, OutcomeStatus::Failed), now);

        let changed = s.expire(now);
        assert_eq!(
            changed,
            vec![
                ("cam01".to_string(), NodeState::Uploaded),
                ("cam02".to_string(), NodeState::TimedOut),
            ]
        );
        assert!(s.all_terminal());
        assert_eq!(s.node_states["cam03"].state, NodeState::Failed);
    }

    #[test]
    fn test_finalize_is_set_once_and_later_events_are_audited() {
        let mut s = session(&["cam01", "cam02"]);
        let policy = VerdictPolicy::new(SuccessThreshold::AtLeast(1));
        let now = Utc::now();
        s.apply_arrival(&arrival("cam01", 1), now);
        s.apply_report(&report("cam01", 1, OutcomeStatus::Uploaded), now);
        s.expire(now);

        assert_eq!(s.finalize(&policy, now), Some(Verdict::Degraded));
        assert_eq!(s.finalize(&VerdictPolicy::new(SuccessThreshold::All), now), None);
        assert_eq!(s.verdict, Verdict::Degraded);

        let states = s.node_states.clone();
        assert_eq!(
            s.apply_report(&report("cam02", 1, OutcomeStatus::Uploaded), now),
            Transition::Audited
        );
        assert_eq!(s.apply_arrival(&arrival("cam02", 1), now), Transition::Audited);
        assert_eq!(s.node_states, states);
        assert_eq!(s.verdict, Verdict::Degraded);
        assert_eq!(s.audit.len(), 2);
        assert!(s.expire(now).is_empty());
        assert_eq!(s.begin_retry("cam02", now), None);
    }

    #[test]
    fn test_abort_fails_outstanding_nodes() {
        let mut s = session(&["cam01", "cam02"]);
        let now = Utc::now();
        s.abort("trigger not delivered", now);
        assert!(s.all_terminal());
        assert_eq!(
            s.node_states["cam02"].detail.as_deref(),
            Some("trigger not delivered")
        );
        assert_eq!(s.finalize(&VerdictPolicy::default(), now), Some(Verdict::Failed));
    }

    #[test]
    fn test_snapshot_lists_missing_nodes() {
        let mut s = session(&["cam01", "cam02"]);
        let now = Utc::now();
        s.apply_arrival(&arrival("cam02", 1), now);
        s.apply_report(&report("cam02", 1, OutcomeStatus::Uploaded), now);
        let snapshot = s.snapshot();
        assert_eq!(snapshot.missing(), vec!["cam01".to_string()]);
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.verdict, Verdict::Pending);
    }

    #[test]
    fn test_metadata_is_kept_and_optional_in_records() {
        let metadata = CaptureMetadata {
            patient_id: Some("pA17".to_string()),
            notes: Some("second visit".to_string()),
            ..CaptureMetadata::default()
        };
        let snapshot = session(&["cam01"]).with_metadata(metadata.clone()).snapshot();
        assert_eq!(snapshot.metadata, metadata);

        let mut value = serde_json::to_value(&snapshot).unwrap();
        assert!(value["metadata"].get("operator").is_none());
        value.as_object_mut().unwrap().remove("metadata");
        let older: SessionSnapshot = serde_json::from_value(value).unwrap();
        assert!(older.metadata.is_empty());
    }
}
