use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::configuration::config::Config;
use crate::error_handling::types::*;
use crate::node_agent::{HttpUploader, LocalTrigger, NodeAgent, NodeSettings, SyntheticCamera};
use crate::roster::RosterRegistry;
use crate::session_management::{
    spawn_outcome_bridge, AssemblerHandle, AssemblerSettings, SessionAssembler, SessionSnapshot,
    TriggerBroadcaster,
};
use crate::status_bus::{InProcStatusBus, StatusBus};
use crate::storage::FileStorage;
use crate::upload_receiver::UploadReceiver;
use crate::web_interface::{WebContext, WebServer};

const SIMULATED_EXPOSURE: Duration = Duration::from_millis(20);
const SIMULATED_UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Controller {
    pub config: Config,
    simulated_nodes: usize,
    simulation_dir: PathBuf,
}

/// Handles to a started coordinator.
pub struct RunningCoordinator {
    pub http_addr: SocketAddr,
    pub assembler: AssemblerHandle,
    pub broadcaster: Arc<TriggerBroadcaster>,
    pub roster: Arc<RosterRegistry>,
    /// Button handles of the simulated nodes, in node-id order.
    pub local_triggers: Vec<LocalTrigger>,
    shutdown: watch::Sender<bool>,
    /// Tasks that stop on their own once shutdown is signalled.
    tasks: Vec<JoinHandle<()>>,
    /// Bus and feed listeners, aborted on shutdown.
    listeners: Vec<JoinHandle<()>>,
}

impl Controller {
    pub fn new(config: Config) -> Result<Self, ControllerError> {
        config.validate().map_err(|e| {
            error!("Invalid configuration: {}", e);
            ControllerError::ConfigurationError(e)
        })?;
        Ok(Self {
            config,
            simulated_nodes: 0,
            simulation_dir: std::env::temp_dir().join("domecap-simulated"),
        })
    }

    /// Runs `count` in-process nodes with synthetic cameras, keeping their
    /// local captures under `dir`.
    pub fn with_simulated_nodes(mut self, count: usize, dir: PathBuf) -> Self {
        self.simulated_nodes = count;
        self.simulation_dir = dir;
        self
    }

    fn bind_addr(&self) -> Result<SocketAddr, ControllerError> {
        let ip: IpAddr = self.config.bind_address.parse().map_err(|_| {
            ControllerError::ConfigurationError(ConfigError::InvalidValue(format!(
                "bind_address {:?} is not an IP address",
                self.config.bind_address
            )))
        })?;
        Ok(SocketAddr::new(ip, self.config.http_port))
    }

    /// Builds every component and starts its task.
    pub async fn start(&self) -> Result<RunningCoordinator, ControllerError> {
        let config = &self.config;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        let mut listeners = Vec::new();

        let storage = Arc::new(FileStorage::new(&config.storage_root, &config.image_extension)?);
        info!("Storing sessions under {}", config.storage_root.display());

        let bus = Arc::new(InProcStatusBus::new(config.bus_prefix.clone(), config.bus_capacity));
        let roster = Arc::new(RosterRegistry::new());
        listeners.push(roster.clone().spawn_listener(bus.as_ref())?);

        let (assembler, handle) = SessionAssembler::new(
            AssemblerSettings::from_config(config),
            bus.clone(),
            storage.clone(),
        );
        // the bridge must subscribe before the first trigger goes out
        listeners.push(spawn_outcome_bridge(handle.clone(), bus.as_ref())?);
        tasks.push(tokio::spawn(assembler.run()));
        listeners.push(spawn_finalized_logger(handle.subscribe_finalized()));

        let broadcaster = Arc::new(TriggerBroadcaster::new(
            handle.clone(),
            bus.clone(),
            roster.clone(),
            config.node_freshness(),
            config.trigger_delay(),
        ));
        let receiver = Arc::new(UploadReceiver::new(
            storage,
            handle.clone(),
            config.max_upload_bytes,
        ));
        let web = WebServer::new(WebContext {
            broadcaster: broadcaster.clone(),
            assembler: handle.clone(),
            receiver,
            roster: roster.clone(),
            freshness: config.node_freshness(),
        });
        let (http_addr, web_task) = web.start(self.bind_addr()?, shutdown_rx.clone())?;
        tasks.push(web_task);

        let mut local_triggers = Vec::new();
        for index in 1..=self.simulated_nodes {
            let node_id = format!("sim{:02}", index);
            let (task, trigger) =
                self.spawn_simulated_node(&node_id, http_addr, bus.clone(), shutdown_rx.clone())?;
            tasks.push(task);
            local_triggers.push(trigger);
        }
        if self.simulated_nodes > 0 {
            info!("Started {} simulated node(s)", self.simulated_nodes);
        }

        Ok(RunningCoordinator {
            http_addr,
            assembler: handle,
            broadcaster,
            roster,
            local_triggers,
            shutdown,
            tasks,
            listeners,
        })
    }

    fn spawn_simulated_node(
        &self,
        node_id: &str,
        http_addr: SocketAddr,
        bus: Arc<dyn StatusBus>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(JoinHandle<()>, LocalTrigger), ControllerError> {
        // a wildcard bind is reachable over loopback
        let host = if http_addr.ip().is_unspecified() {
            SocketAddr::from(([127, 0, 0, 1], http_addr.port()))
        } else {
            http_addr
        };
        let uploader = HttpUploader::new(format!("http://{}", host), SIMULATED_UPLOAD_TIMEOUT)
            .map_err(|e| ControllerError::InitializationFailed(e.to_string()))?;
        let mut settings = NodeSettings::new(node_id, self.simulation_dir.join(node_id));
        settings.image_extension = self.config.image_extension.clone();
        let (agent, trigger) = NodeAgent::new(
            settings,
            bus,
            Arc::new(SyntheticCamera::new(node_id, SIMULATED_EXPOSURE)),
            Arc::new(uploader),
        );
        Ok((tokio::spawn(agent.run(shutdown)), trigger))
    }

    /// Runs the coordinator until Ctrl-C.
    pub async fn run(&self) -> Result<(), ControllerError> {
        let running = self.start().await?;
        info!("Coordinator ready on http://{}", running.http_addr);
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Unable to listen for Ctrl-C: {}", e);
        }
        info!("Shutdown requested");
        running.shutdown().await;
        Ok(())
    }
}

impl RunningCoordinator {
    /// Stops the HTTP server, the simulated nodes and the assembler.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.assembler.shutdown().await;
        for task in self.tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("A coordinator task did not stop in time");
            }
        }
        for listener in self.listeners {
            listener.abort();
        }
        info!("Coordinator stopped");
    }
}

fn spawn_finalized_logger(mut finalized: broadcast::Receiver<SessionSnapshot>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match finalized.recv().await {
                Ok(snapshot) => {
                    info!(
                        "[{}] {:?} with {}/{} image(s), missing {:?}",
                        snapshot.session_id,
                        snapshot.verdict,
                        snapshot.succeeded,
                        snapshot.expected_nodes.len(),
                        snapshot.missing()
                    );
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Finalization log lagged, {} session(s) skipped", n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::types::SuccessThreshold;
    use crate::session_management::{SessionRequest, Verdict};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        Config {
            bind_address: "127.0.0.1".to_string(),
            http_port: 0,
            storage_root: dir.path().join("uploads"),
            session_deadline_secs: 10,
            success_threshold: SuccessThreshold::All,
            trigger_delay_ms: 100,
            ..Config::default()
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = Config::default();
        config.max_attempts = 0;
        assert!(matches!(
            Controller::new(config),
            Err(ControllerError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_bind_address() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.bind_address = "localhost:80".to_string();
        let controller = Controller::new(config).unwrap();
        assert!(matches!(
            controller.start().await,
            Err(ControllerError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_simulated_fleet_completes_a_session() {
        let dir = TempDir::new().unwrap();
        let controller = Controller::new(config(&dir))
            .unwrap()
            .with_simulated_nodes(3, dir.path().join("nodes"));
        let running = controller.start().await.unwrap();
        let mut finalized = running.assembler.subscribe_finalized();

        let freshness = chrono::Duration::seconds(60);
        tokio::time::timeout(Duration::from_secs(5), async {
            while running.roster.online_nodes(freshness).len() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let session_id = running
            .broadcaster
            .start_session(SessionRequest::default())
            .await
            .unwrap()
            .session_id;
        let snapshot = tokio::time::timeout(Duration::from_secs(10), finalized.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.session_id, session_id);
        assert_eq!(snapshot.verdict, Verdict::Complete);
        assert_eq!(snapshot.succeeded, 3);
        assert!(snapshot.missing().is_empty());
        for node in ["sim01", "sim02", "sim03"] {
            assert!(dir
                .path()
                .join("uploads")
                .join(&session_id)
                .join("images")
                .join(format!("{}_a1.jpg", node))
                .is_file());
        }

        running.shutdown().await;
    }
}
