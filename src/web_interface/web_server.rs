use std::net::SocketAddr;

use log::info;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::routes::{routes, WebContext};
use crate::error_handling::types::WebError;

/// HTTP server for the session API and the upload path.
pub struct WebServer {
    context: WebContext,
}

impl WebServer {
    pub fn new(context: WebContext) -> Self {
        Self { context }
    }

    /// Binds `addr` and serves until `shutdown` turns true.
    ///
    /// Returns the bound address, which differs from `addr` when port 0 was
    /// requested, together with the serving task.
    pub fn start(
        &self,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(SocketAddr, JoinHandle<()>), WebError> {
        let signal = async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        };
        let (bound, server) = warp::serve(routes(self.context.clone()))
            .try_bind_with_graceful_shutdown(addr, signal)
            .map_err(|e| WebError::BindFailed(format!("{}: {}", addr, e)))?;
        info!("HTTP server listening on {}", bound);
        let task = tokio::spawn(async move {
            server.await;
            info!("HTTP server stopped");
        });
        Ok((bound, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::types::SuccessThreshold;
    use crate::roster::RosterRegistry;
    use crate::session_management::{
        AssemblerSettings, SessionAssembler, TriggerBroadcaster, VerdictPolicy,
    };
    use crate::status_bus::InProcStatusBus;
    use crate::storage::FileStorage;
    use crate::upload_receiver::UploadReceiver;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn server(dir: &TempDir) -> WebServer {
        let storage = Arc::new(FileStorage::new(dir.path(), "jpg").unwrap());
        let bus = Arc::new(InProcStatusBus::new("dome/test", 16));
        let settings = AssemblerSettings {
            deadline: Duration::from_secs(30),
            max_attempts: 1,
            policy: VerdictPolicy::new(SuccessThreshold::All),
            trigger_delay: Duration::from_millis(100),
            retained_sessions: 8,
        };
        let (actor, assembler) = SessionAssembler::new(settings, bus.clone(), storage.clone());
        tokio::spawn(actor.run());
        let roster = Arc::new(RosterRegistry::new());
        let freshness = chrono::Duration::seconds(60);
        WebServer::new(WebContext {
            broadcaster: Arc::new(TriggerBroadcaster::new(
                assembler.clone(),
                bus,
                roster.clone(),
                freshness,
                Duration::from_millis(100),
            )),
            receiver: Arc::new(UploadReceiver::new(storage, assembler.clone(), 1024)),
            assembler,
            roster,
            freshness,
        })
    }

    #[tokio::test]
    async fn test_serves_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = watch::channel(false);
        let (addr, task) = server(&dir)
            .start(([127, 0, 0, 1], 0).into(), rx)
            .unwrap();
        assert_ne!(addr.port(), 0);

        let resp = reqwest::get(format!("http://{}/healthz", addr)).await.unwrap();
        assert!(resp.status().is_success());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_port_in_use_is_bind_failure() {
        let dir = TempDir::new().unwrap();
        let (_tx, rx) = watch::channel(false);
        let web = server(&dir);
        let (addr, _task) = web.start(([127, 0, 0, 1], 0).into(), rx.clone()).unwrap();
        assert!(matches!(
            web.start(addr, rx),
            Err(WebError::BindFailed(_))
        ));
    }
}
