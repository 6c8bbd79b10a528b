use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, watch};

use super::backoff::Backoff;
use super::camera::Camera;
use super::uploader::Uploader;
use crate::error_handling::types::NodeError;
use crate::status_bus::types::{
    BusMessage, LivenessAnnouncement, OutcomeReport, OutcomeStatus, TriggerCommand,
};
use crate::status_bus::StatusBus;

/// Remembered `(session_id, attempt)` pairs for duplicate trigger detection.
const HANDLED_TRIGGERS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Capturing,
    Persisting,
    Uploading,
    ReportedOk,
    ReportedFailed,
}

#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub node_id: String,
    /// Endpoint advertised in liveness announcements.
    pub reported_address: Option<String>,
    /// Where captures are kept on the node.
    pub local_dir: PathBuf,
    pub image_extension: String,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl NodeSettings {
    pub fn new(node_id: &str, local_dir: PathBuf) -> Self {
        Self {
            node_id: node_id.to_string(),
            reported_address: None,
            local_dir,
            image_extension: "jpg".to_string(),
            reconnect_initial: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(10),
        }
    }
}

/// Physical-button path into the agent.
///
/// Presses are queued for the agent, which alone decides whether the sensor
/// is free. Presses waiting while a network trigger starts are served by that
/// capture; presses made during a capture are discarded once it ends.
#[derive(Clone)]
pub struct LocalTrigger {
    requests: mpsc::Sender<()>,
}

impl LocalTrigger {
    /// Returns `false` when the press was merged with one already queued.
    pub fn press(&self) -> bool {
        self.requests.try_send(()).is_ok()
    }
}

pub struct NodeAgent {
    settings: NodeSettings,
    bus: Arc<dyn StatusBus>,
    camera: Arc<dyn Camera>,
    uploader: Arc<dyn Uploader>,
    local_requests: mpsc::Receiver<()>,
    state: AgentState,
    handled: VecDeque<(String, u32)>,
    last_retrieval: Option<String>,
}

impl NodeAgent {
    pub fn new(
        settings: NodeSettings,
        bus: Arc<dyn StatusBus>,
        camera: Arc<dyn Camera>,
        uploader: Arc<dyn Uploader>,
    ) -> (Self, LocalTrigger) {
        let (requests, local_requests) = mpsc::channel(1);
        let trigger = LocalTrigger { requests };
        let agent = Self {
            settings,
            bus,
            camera,
            uploader,
            local_requests,
            state: AgentState::Idle,
            handled: VecDeque::new(),
            last_retrieval: None,
        };
        (agent, trigger)
    }

    pub fn node_id(&self) -> &str {
        &self.settings.node_id
    }

    fn enter(&mut self, state: AgentState) {
        debug!("{}: {:?} -> {:?}", self.settings.node_id, self.state, state);
        self.state = state;
        if state == AgentState::Idle {
            let dropped = self.drain_local_requests();
            if dropped > 0 {
                debug!("{}: local capture dropped, sensor was busy", self.settings.node_id);
            }
        }
    }

    fn drain_local_requests(&mut self) -> usize {
        let mut drained = 0;
        while self.local_requests.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    fn publish(&self, message: BusMessage) {
        if let Err(e) = self.bus.publish(message) {
            // lost reports are resolved by the coordinator's deadline
            warn!("{}: status bus publish failed: {}", self.settings.node_id, e);
        }
    }

    fn report(&self, trigger: &TriggerCommand, status: OutcomeStatus, detail: Option<String>) {
        self.publish(BusMessage::Outcome(OutcomeReport {
            node_id: self.settings.node_id.clone(),
            session_id: trigger.session_id.clone(),
            attempt: trigger.attempt,
            status,
            detail,
            reported_at: Utc::now(),
        }));
    }

    fn announcement(&self) -> LivenessAnnouncement {
        LivenessAnnouncement {
            node_id: self.settings.node_id.clone(),
            reported_address: self.settings.reported_address.clone(),
            retrieval_address: self.last_retrieval.clone(),
            announced_at: Utc::now(),
        }
    }

    /// Subscribes to the control channel and announces liveness.
    fn connect(&self) -> Result<broadcast::Receiver<BusMessage>, NodeError> {
        let rx = self.bus.subscribe()?;
        self.bus.publish(BusMessage::Liveness(self.announcement()))?;
        info!("{}: connected to status bus", self.settings.node_id);
        Ok(rx)
    }

    /// Serves triggers until `shutdown` flips to `true`, reconnecting with
    /// backoff whenever the control channel drops.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff =
            Backoff::new(self.settings.reconnect_initial, self.settings.reconnect_max);
        'connect: loop {
            if *shutdown.borrow() {
                break;
            }
            let mut rx = match self.connect() {
                Ok(rx) => {
                    backoff.reset();
                    rx
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        "{}: control channel unavailable ({}), retrying in {:?}",
                        self.settings.node_id, e, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue 'connect,
                        _ = shutdown.changed() => break 'connect,
                    }
                }
            };
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break 'connect,
                    message = rx.recv() => match message {
                        Ok(BusMessage::Trigger(trigger)) => {
                            if trigger.addresses(&self.settings.node_id) {
                                self.handle_trigger(trigger).await;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("{}: lagged, {} bus message(s) lost", self.settings.node_id, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("{}: control channel lost", self.settings.node_id);
                            continue 'connect;
                        }
                    },
                    Some(()) = self.local_requests.recv() => self.handle_local().await,
                }
            }
        }
        info!("{}: agent stopped", self.settings.node_id);
    }

    fn already_handled(&mut self, trigger: &TriggerCommand) -> bool {
        let key = (trigger.session_id.clone(), trigger.attempt);
        if self.handled.contains(&key) {
            return true;
        }
        if self.handled.len() == HANDLED_TRIGGERS {
            self.handled.pop_front();
        }
        self.handled.push_back(key);
        false
    }

    async fn persist_locally(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf, NodeError> {
        let path = self.settings.local_dir.join(file_name);
        tokio::fs::create_dir_all(&self.settings.local_dir)
            .await
            .map_err(|e| NodeError::PersistFailed(e.to_string()))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| NodeError::PersistFailed(e.to_string()))?;
        Ok(path)
    }

    fn retrieval_address(&self, local: &Option<PathBuf>, file_name: &str) -> String {
        match (&self.settings.reported_address, local) {
            (Some(address), _) => format!("{}/images/{}", address.trim_end_matches('/'), file_name),
            (None, Some(path)) => format!("file://{}", path.display()),
            (None, None) => format!("memory://{}/{}", self.settings.node_id, file_name),
        }
    }

    async fn handle_trigger(&mut self, trigger: TriggerCommand) {
        let node_id = self.settings.node_id.clone();
        if self.already_handled(&trigger) {
            debug!(
                "[{}] {}: duplicate trigger for attempt {} ignored",
                trigger.session_id, node_id, trigger.attempt
            );
            return;
        }
        if self.drain_local_requests() > 0 {
            debug!("{}: local capture request served by network trigger", node_id);
        }

        self.enter(AgentState::Capturing);
        self.report(&trigger, OutcomeStatus::Capturing, None);
        let wait = (trigger.capture_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        let frame = match self.camera.capture().await {
            Ok(frame) => frame,
            Err(e) => {
                error!("[{}] {}: {}", trigger.session_id, node_id, e);
                self.enter(AgentState::ReportedFailed);
                self.report(&trigger, OutcomeStatus::Failed, Some(e.to_string()));
                self.enter(AgentState::Idle);
                return;
            }
        };

        self.enter(AgentState::Persisting);
        let file_name = format!(
            "{}_{}_a{}.{}",
            trigger.session_id, node_id, trigger.attempt, self.settings.image_extension
        );
        let local = match self.persist_locally(&file_name, &frame.bytes).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(
                    "[{}] {}: local copy not kept, uploading anyway: {}",
                    trigger.session_id, node_id, e
                );
                None
            }
        };

        self.enter(AgentState::Uploading);
        self.report(&trigger, OutcomeStatus::Uploading, None);
        match self
            .uploader
            .upload(&trigger.upload_path, &node_id, trigger.attempt, frame.bytes)
            .await
        {
            Ok(()) => {
                self.enter(AgentState::ReportedOk);
                self.last_retrieval = Some(self.retrieval_address(&local, &file_name));
                self.publish(BusMessage::Liveness(self.announcement()));
                self.report(&trigger, OutcomeStatus::Uploaded, None);
                info!(
                    "[{}] {}: attempt {} uploaded",
                    trigger.session_id, node_id, trigger.attempt
                );
            }
            Err(e) => {
                error!("[{}] {}: {}", trigger.session_id, node_id, e);
                self.enter(AgentState::ReportedFailed);
                self.report(&trigger, OutcomeStatus::Failed, Some(e.to_string()));
            }
        }
        self.enter(AgentState::Idle);
    }

    /// Button capture: kept on the node, never uploaded nor reported.
    async fn handle_local(&mut self) {
        self.enter(AgentState::Capturing);
        match self.camera.capture().await {
            Ok(frame) => {
                self.enter(AgentState::Persisting);
                let file_name = format!(
                    "local_{}.{}",
                    frame.captured_at.format("%Y%m%dT%H%M%S%3f"),
                    self.settings.image_extension
                );
                match self.persist_locally(&file_name, &frame.bytes).await {
                    Ok(path) => info!(
                        "{}: local capture kept at {}",
                        self.settings.node_id,
                        path.display()
                    ),
                    Err(e) => warn!("{}: local capture lost: {}", self.settings.node_id, e),
                }
            }
            Err(e) => warn!("{}: local capture failed: {}", self.settings.node_id, e),
        }
        self.enter(AgentState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_handling::types::BusError;
    use crate::node_agent::camera::SyntheticCamera;
    use crate::status_bus::InProcStatusBus;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingUploader {
        calls: Mutex<Vec<(String, String, u32, usize)>>,
        reject: AtomicBool,
    }

    #[async_trait]
    impl Uploader for RecordingUploader {
        async fn upload(
            &self,
            upload_path: &str,
            node_id: &str,
            attempt: u32,
            image: Bytes,
        ) -> Result<(), NodeError> {
            self.calls.lock().unwrap().push((
                upload_path.to_string(),
                node_id.to_string(),
                attempt,
                image.len(),
            ));
            if self.reject.load(Ordering::SeqCst) {
                return Err(NodeError::TransportFailure("upload rejected with 500".into()));
            }
            Ok(())
        }
    }

    /// Bus whose connection can be cut, and which refuses a number of
    /// subscriptions before accepting them again.
    struct FlakyBus {
        sender: Mutex<broadcast::Sender<BusMessage>>,
        refusals: Mutex<u32>,
        observer: broadcast::Sender<BusMessage>,
    }

    impl FlakyBus {
        fn new() -> Self {
            Self {
                sender: Mutex::new(broadcast::channel(64).0),
                refusals: Mutex::new(0),
                observer: broadcast::channel(64).0,
            }
        }

        fn cut(&self, refusals: u32) {
            *self.refusals.lock().unwrap() = refusals;
            *self.sender.lock().unwrap() = broadcast::channel(64).0;
        }

        fn observe(&self) -> broadcast::Receiver<BusMessage> {
            self.observer.subscribe()
        }
    }

    impl StatusBus for FlakyBus {
        fn publish(&self, message: BusMessage) -> Result<(), BusError> {
            let _ = self.observer.send(message.clone());
            let _ = self.sender.lock().unwrap().send(message);
            Ok(())
        }

        fn subscribe(&self) -> Result<broadcast::Receiver<BusMessage>, BusError> {
            let mut refusals = self.refusals.lock().unwrap();
            if *refusals > 0 {
                *refusals -= 1;
                return Err(BusError::Disconnected);
            }
            Ok(self.sender.lock().unwrap().subscribe())
        }
    }

    struct Fixture {
        _dir: TempDir,
        local_dir: PathBuf,
        bus: Arc<InProcStatusBus>,
        camera: Arc<SyntheticCamera>,
        uploader: Arc<RecordingUploader>,
        local: LocalTrigger,
        observed: broadcast::Receiver<BusMessage>,
        shutdown: watch::Sender<bool>,
    }

    /// Spawns an agent and waits for its first liveness announcement.
    async fn fixture(exposure: Duration) -> Fixture {
        let dir = TempDir::new().unwrap();
        let local_dir = dir.path().join("cam01");
        let bus = Arc::new(InProcStatusBus::new("dome/test", 64));
        let observed = bus.subscribe().unwrap();
        let camera = Arc::new(SyntheticCamera::new("cam01", exposure));
        let uploader = Arc::new(RecordingUploader::default());
        let mut settings = NodeSettings::new("cam01", local_dir.clone());
        settings.reported_address = Some("http://10.0.0.21".into());
        let (agent, local) =
            NodeAgent::new(settings, bus.clone(), camera.clone(), uploader.clone());
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(agent.run(shutdown_rx));
        let mut observed = observed;
        match next_from_node(&mut observed).await {
            BusMessage::Liveness(a) => assert!(a.retrieval_address.is_none()),
            other => panic!("expected liveness, got {:?}", other),
        }
        Fixture {
            _dir: dir,
            local_dir,
            bus,
            camera,
            uploader,
            local,
            observed,
            shutdown,
        }
    }

    fn trigger(session: &str, attempt: u32, targets: &[&str]) -> BusMessage {
        BusMessage::Trigger(TriggerCommand::new(
            session,
            attempt,
            targets.iter().map(|t| t.to_string()).collect(),
            Duration::ZERO,
        ))
    }

    async fn next_from_node(rx: &mut broadcast::Receiver<BusMessage>) -> BusMessage {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("no bus message within 5s")
                .unwrap();
            if !matches!(message, BusMessage::Trigger(_)) {
                return message;
            }
        }
    }

    async fn next_outcome(rx: &mut broadcast::Receiver<BusMessage>) -> OutcomeReport {
        loop {
            if let BusMessage::Outcome(report) = next_from_node(rx).await {
                return report;
            }
        }
    }

    #[tokio::test]
    async fn test_trigger_runs_full_cycle() {
        let mut f = fixture(Duration::ZERO).await;
        f.bus.publish(trigger("session_1", 1, &[])).unwrap();
        let statuses = [
            next_outcome(&mut f.observed).await.status,
            next_outcome(&mut f.observed).await.status,
        ];
        assert_eq!(statuses, [OutcomeStatus::Capturing, OutcomeStatus::Uploading]);
        match next_from_node(&mut f.observed).await {
            BusMessage::Liveness(a) => assert_eq!(
                a.retrieval_address.as_deref(),
                Some("http://10.0.0.21/images/session_1_cam01_a1.jpg")
            ),
            other => panic!("expected liveness, got {:?}", other),
        }
        let done = next_outcome(&mut f.observed).await;
        assert_eq!(done.status, OutcomeStatus::Uploaded);
        assert_eq!(done.session_id, "session_1");
        assert_eq!(done.attempt, 1);

        let calls = f.uploader.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "/sessions/session_1/upload");
        assert!(f.local_dir.join("session_1_cam01_a1.jpg").is_file());
        f.shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_sensor_failure_reports_failed_without_upload() {
        let mut f = fixture(Duration::ZERO).await;
        f.camera.fail_next(1);
        f.bus.publish(trigger("session_2", 1, &["cam01"])).unwrap();

        assert_eq!(next_outcome(&mut f.observed).await.status, OutcomeStatus::Capturing);
        let failed = next_outcome(&mut f.observed).await;
        assert_eq!(failed.status, OutcomeStatus::Failed);
        assert!(failed.detail.unwrap().contains("frame not acquired"));
        assert!(f.uploader.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_failure_reports_failed() {
        let mut f = fixture(Duration::ZERO).await;
        f.uploader.reject.store(true, Ordering::SeqCst);
        f.bus.publish(trigger("session_3", 1, &[])).unwrap();

        let mut last = next_outcome(&mut f.observed).await;
        while !last.status.is_terminal() {
            last = next_outcome(&mut f.observed).await;
        }
        assert_eq!(last.status, OutcomeStatus::Failed);
        assert!(last.detail.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn test_duplicate_and_foreign_triggers_are_ignored() {
        let mut f = fixture(Duration::ZERO).await;
        f.bus.publish(trigger("session_4", 1, &["cam09"])).unwrap();
        f.bus.publish(trigger("session_4", 1, &[])).unwrap();
        f.bus.publish(trigger("session_4", 1, &[])).unwrap();
        f.bus.publish(trigger("session_4", 2, &["cam01"])).unwrap();

        let mut uploaded = Vec::new();
        while uploaded.len() < 2 {
            let report = next_outcome(&mut f.observed).await;
            if report.status == OutcomeStatus::Uploaded {
                uploaded.push(report.attempt);
            }
        }
        assert_eq!(uploaded, vec![1, 2]);
        let attempts: Vec<u32> = f.uploader.calls.lock().unwrap().iter().map(|c| c.2).collect();
        assert_eq!(attempts, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_local_capture_stays_local_and_presses_during_capture_drop() {
        let mut f = fixture(Duration::from_millis(300)).await;
        f.bus.publish(trigger("session_5", 1, &[])).unwrap();
        assert_eq!(next_outcome(&mut f.observed).await.status, OutcomeStatus::Capturing);
        // queued while busy, merged, then discarded when the agent is idle again
        assert!(f.local.press());
        assert!(!f.local.press());

        while next_outcome(&mut f.observed).await.status != OutcomeStatus::Uploaded {}
        // let the agent return to idle
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.local.press());
        tokio::time::sleep(Duration::from_millis(600)).await;

        let locals: Vec<_> = std::fs::read_dir(&f.local_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n.starts_with("local_"))
            .collect();
        assert_eq!(locals.len(), 1);
        assert_eq!(f.uploader.calls.lock().unwrap().len(), 1);
        assert!(tokio::time::timeout(Duration::from_millis(100), f.observed.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_reconnect_republishes_liveness_with_last_retrieval_address() {
        let dir = TempDir::new().unwrap();
        let bus = Arc::new(FlakyBus::new());
        let mut observed = bus.observe();
        let mut settings = NodeSettings::new("cam01", dir.path().to_path_buf());
        settings.reconnect_initial = Duration::from_millis(10);
        settings.reconnect_max = Duration::from_millis(40);
        let (agent, _local) = NodeAgent::new(
            settings,
            bus.clone(),
            Arc::new(SyntheticCamera::new("cam01", Duration::ZERO)),
            Arc::new(RecordingUploader::default()),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(agent.run(shutdown_rx));

        assert!(matches!(next_from_node(&mut observed).await, BusMessage::Liveness(_)));
        bus.publish(trigger("session_6", 1, &[])).unwrap();
        while next_outcome(&mut observed).await.status != OutcomeStatus::Uploaded {}

        bus.cut(2);
        let announcement = loop {
            if let BusMessage::Liveness(a) = next_from_node(&mut observed).await {
                break a;
            }
        };
        assert!(announcement
            .retrieval_address
            .unwrap()
            .ends_with("session_6_cam01_a1.jpg"));

        // triggers still reach the agent on the new connection
        bus.publish(trigger("session_7", 1, &[])).unwrap();
        assert_eq!(next_outcome(&mut observed).await.session_id, "session_7");

        shutdown.send(true).unwrap();
        task.await.unwrap();
    }
}
