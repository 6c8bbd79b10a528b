//! # Session Assembler
//!
//! Single owner of every [`Session`]. All events touching session state are
//! funneled through one queue and applied one at a time by [`SessionAssembler::run`],
//! so per-session transitions are linearizable even though they originate from
//! many concurrent connections.
//!
//! ```text
//! ┌──────────────────┐  open / abort   ┌───────────────────┐  finalized  ┌────────────────┐
//! │ TriggerBroadcaster│───────────────▶│                   │────────────▶│ subscribers    │
//! └──────────────────┘                 │                   │  snapshots  │ (handoff)      │
//! ┌──────────────────┐  image_arrived  │ SessionAssembler  │             └────────────────┘
//! │ UploadReceiver   │────────────────▶│   (mpsc queue)    │  retrigger  ┌────────────────┐
//! └──────────────────┘  belated_upload │                   │────────────▶│ StatusBus      │
//! ┌──────────────────┐  outcome        │                   │             └────────────────┘
//! │ outcome bridge   │────────────────▶│                   │
//! └──────────────────┘  deadline timer └───────────────────┘
//! ```
//!
//! Callers talk to the actor through a cloneable [`AssemblerHandle`]; queries are
//! answered over oneshot channels.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::session::{
    AuditEntry, AuditEvent, CaptureMetadata, Session, SessionSnapshot, Transition,
};
use super::verdict::VerdictPolicy;
use super::{NodeState, Verdict};
use crate::configuration::Config;
use crate::error_handling::types::{BusError, SessionError, StorageError};
use crate::status_bus::types::{BusMessage, OutcomeReport, OutcomeStatus, TriggerCommand};
use crate::status_bus::StatusBus;
use crate::storage::storage_trait::SessionRecordStore;
use crate::storage::types::ImageArrival;

const EVENT_QUEUE_CAPACITY: usize = 1024;
const FINALIZED_CAPACITY: usize = 64;

/// Policy knobs of the assembler.
#[derive(Debug, Clone)]
pub struct AssemblerSettings {
    pub deadline: Duration,
    pub max_attempts: u32,
    pub policy: VerdictPolicy,
    pub trigger_delay: Duration,
    /// Finalized sessions kept in memory; older ones are served from their record.
    pub retained_sessions: usize,
}

impl AssemblerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            deadline: config.session_deadline(),
            max_attempts: config.max_attempts,
            policy: VerdictPolicy::new(config.success_threshold),
            trigger_delay: config.trigger_delay(),
            retained_sessions: config.retained_sessions,
        }
    }

    fn deadline_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.deadline).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

/// Where an upload for a given session id belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Open,
    Finalized(Verdict),
    Unknown,
}

enum AssemblerEvent {
    Open {
        roster: BTreeSet<String>,
        metadata: CaptureMetadata,
        reply: oneshot::Sender<Result<String, SessionError>>,
    },
    Outcome(OutcomeReport),
    ImageArrived(ImageArrival),
    BelatedUpload(ImageArrival),
    DeadlineExpired {
        session_id: String,
    },
    Abort {
        session_id: String,
        reason: String,
        reply: oneshot::Sender<()>,
    },
    Resolve {
        session_id: String,
        reply: oneshot::Sender<SessionPhase>,
    },
    Get {
        session_id: String,
        reply: oneshot::Sender<Result<SessionSnapshot, SessionError>>,
    },
    List {
        reply: oneshot::Sender<Vec<SessionSnapshot>>,
    },
    Shutdown,
}

/// Cloneable front door to the assembler actor.
#[derive(Clone)]
pub struct AssemblerHandle {
    events: mpsc::Sender<AssemblerEvent>,
    finalized: broadcast::Sender<SessionSnapshot>,
}

impl AssemblerHandle {
    async fn send(&self, event: AssemblerEvent) -> Result<(), SessionError> {
        self.events
            .send(event)
            .await
            .map_err(|_| SessionError::AssemblerUnavailable)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> AssemblerEvent,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.send(build(reply)).await?;
        response.await.map_err(|_| SessionError::AssemblerUnavailable)
    }

    /// Opens a session for `roster`. Fails with `SessionBusy` while another is pending.
    pub async fn open_session(
        &self,
        roster: BTreeSet<String>,
        metadata: CaptureMetadata,
    ) -> Result<String, SessionError> {
        self.request(|reply| AssemblerEvent::Open {
            roster,
            metadata,
            reply,
        })
        .await?
    }

    pub async fn report_outcome(&self, report: OutcomeReport) -> Result<(), SessionError> {
        self.send(AssemblerEvent::Outcome(report)).await
    }

    pub async fn image_arrived(&self, arrival: ImageArrival) -> Result<(), SessionError> {
        self.send(AssemblerEvent::ImageArrived(arrival)).await
    }

    pub async fn belated_upload(&self, arrival: ImageArrival) -> Result<(), SessionError> {
        self.send(AssemblerEvent::BelatedUpload(arrival)).await
    }

    /// Fails every outstanding node of an open session and finalizes it.
    pub async fn abort_session(&self, session_id: &str, reason: &str) -> Result<(), SessionError> {
        let session_id = session_id.to_string();
        let reason = reason.to_string();
        self.request(|reply| AssemblerEvent::Abort {
            session_id,
            reason,
            reply,
        })
        .await
    }

    pub async fn resolve(&self, session_id: &str) -> Result<SessionPhase, SessionError> {
        let session_id = session_id.to_string();
        self.request(|reply| AssemblerEvent::Resolve { session_id, reply })
            .await
    }

    /// Read-only snapshot of one session, from memory or from its record on disk.
    pub async fn get_session(&self, session_id: &str) -> Result<SessionSnapshot, SessionError> {
        let session_id = session_id.to_string();
        self.request(|reply| AssemblerEvent::Get { session_id, reply })
            .await?
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSnapshot>, SessionError> {
        self.request(|reply| AssemblerEvent::List { reply }).await
    }

    /// Snapshots of sessions as they are finalized: the handoff feed for the
    /// reconstruction stage.
    pub fn subscribe_finalized(&self) -> broadcast::Receiver<SessionSnapshot> {
        self.finalized.subscribe()
    }

    pub async fn shutdown(&self) {
        let _ = self.events.send(AssemblerEvent::Shutdown).await;
    }
}

pub struct SessionAssembler {
    settings: AssemblerSettings,
    bus: Arc<dyn StatusBus>,
    records: Arc<dyn SessionRecordStore>,
    sessions: HashMap<String, Session>,
    open_session: Option<String>,
    finalized_order: VecDeque<String>,
    events_rx: mpsc::Receiver<AssemblerEvent>,
    /// Only held weakly so the loop ends once every handle is gone.
    timers: mpsc::WeakSender<AssemblerEvent>,
    finalized: broadcast::Sender<SessionSnapshot>,
    last_id_base: String,
    id_sequence: u32,
}

impl SessionAssembler {
    pub fn new(
        settings: AssemblerSettings,
        bus: Arc<dyn StatusBus>,
        records: Arc<dyn SessionRecordStore>,
    ) -> (Self, AssemblerHandle) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (finalized, _) = broadcast::channel(FINALIZED_CAPACITY);
        let handle = AssemblerHandle {
            events: events_tx.clone(),
            finalized: finalized.clone(),
        };
        let assembler = Self {
            settings,
            bus,
            records,
            sessions: HashMap::new(),
            open_session: None,
            finalized_order: VecDeque::new(),
            events_rx,
            timers: events_tx.downgrade(),
            finalized,
            last_id_base: String::new(),
            id_sequence: 0,
        };
        (assembler, handle)
    }

    /// Applies events until shutdown or until every handle has been dropped.
    pub async fn run(mut self) {
        info!(
            "Session assembler started (deadline {:?}, max_attempts {}, threshold {})",
            self.settings.deadline, self.settings.max_attempts, self.settings.policy.threshold
        );
        while let Some(event) = self.events_rx.recv().await {
            if matches!(event, AssemblerEvent::Shutdown) {
                break;
            }
            self.handle_event(event);
        }
        if let Some(id) = &self.open_session {
            warn!("[{}] assembler stopped with session still pending", id);
        }
        info!("Session assembler stopped");
    }

    fn handle_event(&mut self, event: AssemblerEvent) {
        match event {
            AssemblerEvent::Open {
                roster,
                metadata,
                reply,
            } => {
                let _ = reply.send(self.open(roster, metadata));
            }
            AssemblerEvent::Outcome(report) => self.on_outcome(report),
            AssemblerEvent::ImageArrived(arrival) => self.on_arrival(arrival),
            AssemblerEvent::BelatedUpload(arrival) => self.on_belated(arrival),
            AssemblerEvent::DeadlineExpired { session_id } => self.on_deadline(&session_id),
            AssemblerEvent::Abort {
                session_id,
                reason,
                reply,
            } => {
                self.abort(&session_id, &reason);
                let _ = reply.send(());
            }
            AssemblerEvent::Resolve { session_id, reply } => {
                let _ = reply.send(self.resolve(&session_id));
            }
            AssemblerEvent::Get { session_id, reply } => {
                let _ = reply.send(self.snapshot(&session_id));
            }
            AssemblerEvent::List { reply } => {
                let _ = reply.send(self.list());
            }
            AssemblerEvent::Shutdown => {}
        }
    }

    /// `session_<UTC timestamp>`, suffixed when several sessions share a second.
    fn next_session_id(&mut self, now: DateTime<Utc>) -> String {
        let base = now.format("session_%Y%m%dT%H%M%S").to_string();
        if base == self.last_id_base {
            self.id_sequence += 1;
        } else {
            self.last_id_base = base.clone();
            self.id_sequence = 0;
        }
        loop {
            let id = match self.id_sequence {
                0 => base.clone(),
                n => format!("{}_{}", base, n),
            };
            if !self.sessions.contains_key(&id) && !self.records.session_dir(&id).exists() {
                return id;
            }
            self.id_sequence += 1;
        }
    }

    fn open(
        &mut self,
        roster: BTreeSet<String>,
        metadata: CaptureMetadata,
    ) -> Result<String, SessionError> {
        if let Some(id) = &self.open_session {
            warn!("[{}] start rejected: session still pending", id);
            return Err(SessionError::SessionBusy(id.clone()));
        }
        if roster.is_empty() {
            return Err(SessionError::RosterEmpty);
        }
        let now = Utc::now();
        let session_id = self.next_session_id(now);
        let directory = self.records.prepare_session(&session_id)?;
        let session = Session::open(
            session_id.clone(),
            roster,
            now,
            self.settings.deadline_at(now),
            directory,
        )
        .with_metadata(metadata);
        self.records.save_session_record(&session.snapshot())?;
        self.arm_deadline(&session_id);
        info!(
            "[{}] opened with {} expected node(s), deadline {}",
            session_id,
            session.expected_nodes.len(),
            session.deadline
        );
        self.sessions.insert(session_id.clone(), session);
        self.open_session = Some(session_id.clone());
        Ok(session_id)
    }

    fn arm_deadline(&self, session_id: &str) {
        let timers = self.timers.clone();
        let deadline = self.settings.deadline;
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(events) = timers.upgrade() {
                let _ = events
                    .send(AssemblerEvent::DeadlineExpired { session_id })
                    .await;
            }
        });
    }

    fn on_outcome(&mut self, report: OutcomeReport) {
        let now = Utc::now();
        let Some(session) = self.sessions.get_mut(&report.session_id) else {
            let entry = AuditEntry {
                at: now,
                node_id: report.node_id.clone(),
                attempt: report.attempt,
                event: AuditEvent::Report {
                    status: report.status,
                },
            };
            if !self.audit_released(&report.session_id, entry) {
                debug!(
                    "[{}] outcome from {} for an unknown session",
                    report.session_id, report.node_id
                );
            }
            return;
        };
        let transition = session.apply_report(&report, now);
        match transition {
            Transition::Audited => persist(self.records.as_ref(), session),
            Transition::Terminal(NodeState::Failed) => {
                warn!(
                    "[{}] {} failed attempt {}: {}",
                    report.session_id,
                    report.node_id,
                    report.attempt,
                    report.detail.as_deref().unwrap_or("no detail")
                );
                if session.can_retry(&report.node_id, self.settings.max_attempts) {
                    self.retrigger(&report.session_id, &report.node_id);
                }
            }
            _ => {}
        }
        self.finalize_if_settled(&report.session_id);
    }

    fn retrigger(&mut self, session_id: &str, node_id: &str) {
        let now = Utc::now();
        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        let Some(attempt) = session.begin_retry(node_id, now) else {
            return;
        };
        let trigger = TriggerCommand::new(
            session_id,
            attempt,
            vec![node_id.to_string()],
            self.settings.trigger_delay,
        );
        if let Err(e) = self.bus.publish(BusMessage::Trigger(trigger)) {
            error!("[{}] retrigger of {} not delivered: {}", session_id, node_id, e);
            let failed = OutcomeReport {
                node_id: node_id.to_string(),
                session_id: session_id.to_string(),
                attempt,
                status: OutcomeStatus::Failed,
                detail: Some(format!("retrigger not delivered: {}", e)),
                reported_at: now,
            };
            session.apply_report(&failed, now);
        }
    }

    fn on_arrival(&mut self, arrival: ImageArrival) {
        let now = Utc::now();
        let session_id = arrival.key.session_id.clone();
        if !self.sessions.contains_key(&session_id) {
            // released from memory in the meantime
            self.on_belated(arrival);
            return;
        }
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if session.apply_arrival(&arrival, now) == Transition::Audited {
            persist(self.records.as_ref(), session);
        }
        self.finalize_if_settled(&session_id);
    }

    fn on_belated(&mut self, arrival: ImageArrival) {
        let now = Utc::now();
        let session_id = &arrival.key.session_id;
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.record_belated(&arrival, now);
            if !session.is_open() {
                persist(self.records.as_ref(), session);
            }
            return;
        }
        let entry = AuditEntry {
            at: now,
            node_id: arrival.key.node_id.clone(),
            attempt: arrival.key.attempt,
            event: AuditEvent::BelatedUpload {
                path: arrival.image.path.clone(),
            },
        };
        if !self.audit_released(session_id, entry) {
            warn!(
                "[{}] orphan upload from {} for an unknown session kept at {}",
                session_id,
                arrival.key.node_id,
                arrival.image.path.display()
            );
        }
    }

    /// Appends `entry` to the record of a session no longer held in memory.
    /// Returns `false` when no record exists for `session_id`.
    fn audit_released(&self, session_id: &str, entry: AuditEntry) -> bool {
        let Ok(mut record) = self.records.load_session_record(session_id) else {
            return false;
        };
        record.audit.push(entry);
        if let Err(e) = self.records.save_session_record(&record) {
            error!("[{}] could not append audit entry: {}", session_id, e);
        }
        true
    }

    fn on_deadline(&mut self, session_id: &str) {
        let now = Utc::now();
        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        if !session.is_open() {
            return;
        }
        for (node_id, state) in session.expire(now) {
            if state == NodeState::TimedOut {
                warn!("[{}] {} timed out", session_id, node_id);
            }
        }
        self.finalize(session_id);
    }

    fn abort(&mut self, session_id: &str, reason: &str) {
        let now = Utc::now();
        if let Some(session) = self.sessions.get_mut(session_id) {
            error!("[{}] aborted: {}", session_id, reason);
            session.abort(reason, now);
            self.finalize(session_id);
        }
    }

    fn finalize_if_settled(&mut self, session_id: &str) {
        let settled = self
            .sessions
            .get(session_id)
            .is_some_and(|s| s.is_open() && s.all_terminal());
        if settled {
            self.finalize(session_id);
        }
    }

    fn finalize(&mut self, session_id: &str) {
        let now = Utc::now();
        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        let Some(verdict) = session.finalize(&self.settings.policy, now) else {
            return;
        };
        info!(
            "[{}] finalized {:?}: {}/{} node(s) uploaded, directory {}",
            session_id,
            verdict,
            session.succeeded(),
            session.expected_nodes.len(),
            session.directory.display()
        );
        persist(self.records.as_ref(), session);
        let snapshot = session.snapshot();
        if self.open_session.as_deref() == Some(session_id) {
            self.open_session = None;
        }
        let _ = self.finalized.send(snapshot);
        self.finalized_order.push_back(session_id.to_string());
        self.release_finalized();
    }

    fn release_finalized(&mut self) {
        while self.finalized_order.len() > self.settings.retained_sessions {
            if let Some(id) = self.finalized_order.pop_front() {
                debug!("[{}] released from memory", id);
                self.sessions.remove(&id);
            }
        }
    }

    fn resolve(&self, session_id: &str) -> SessionPhase {
        if let Some(session) = self.sessions.get(session_id) {
            return match session.verdict {
                Verdict::Pending => SessionPhase::Open,
                verdict => SessionPhase::Finalized(verdict),
            };
        }
        match self.records.load_session_record(session_id) {
            Ok(record) if record.verdict.is_final() => SessionPhase::Finalized(record.verdict),
            _ => SessionPhase::Unknown,
        }
    }

    fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot, SessionError> {
        if let Some(session) = self.sessions.get(session_id) {
            return Ok(session.snapshot());
        }
        self.records
            .load_session_record(session_id)
            .map_err(|e| match e {
                StorageError::NotFound | StorageError::InvalidKey(_) => {
                    SessionError::NotFound(session_id.to_string())
                }
                other => SessionError::StorageError(other),
            })
    }

    fn list(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> =
            self.sessions.values().map(Session::snapshot).collect();
        match self.records.list_session_ids() {
            Ok(ids) => {
                for id in ids.iter().filter(|id| !self.sessions.contains_key(*id)) {
                    match self.records.load_session_record(id) {
                        Ok(record) => snapshots.push(record),
                        Err(e) => warn!("[{}] unreadable session record: {}", id, e),
                    }
                }
            }
            Err(e) => error!("Could not list session records: {}", e),
        }
        snapshots.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        snapshots
    }
}

fn persist(records: &dyn SessionRecordStore, session: &Session) {
    if let Err(e) = records.save_session_record(&session.snapshot()) {
        error!("[{}] could not write session record: {}", session.session_id, e);
    }
}

/// Forwards outcome reports from the bus into the assembler queue.
///
/// Subscribes before returning, so reports published afterwards are not missed.
pub fn spawn_outcome_bridge(
    handle: AssemblerHandle,
    bus: &dyn StatusBus,
) -> Result<JoinHandle<()>, BusError> {
    let mut rx = bus.subscribe()?;
    Ok(tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(BusMessage::Outcome(report)) => {
                    if handle.report_outcome(report).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Outcome bridge lagged, {} bus message(s) lost", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Outcome bridge stopped");
    }))
}
