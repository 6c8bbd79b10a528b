use log::{debug, trace};
use tokio::sync::broadcast;

use super::types::BusMessage;
use super::StatusBus;
use crate::error_handling::types::BusError;

/// In-process status bus fanning every message out to all subscribers.
///
/// Publishing with no subscriber is not an error: like a broker with nobody
/// listening, the message is simply dropped.
pub struct InProcStatusBus {
    sender: broadcast::Sender<BusMessage>,
    prefix: String,
}

impl InProcStatusBus {
    pub fn new(prefix: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            prefix: prefix.into(),
        }
    }
}

impl StatusBus for InProcStatusBus {
    fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        let subject = message.subject(&self.prefix);
        trace!("publish {} {:?}", subject, message);
        match self.sender.send(message) {
            Ok(n) => debug!("published on {} to {} subscriber(s)", subject, n),
            Err(_) => debug!("published on {} with no subscriber", subject),
        }
        Ok(())
    }

    fn subscribe(&self) -> Result<broadcast::Receiver<BusMessage>, BusError> {
        Ok(self.sender.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_bus::types::{OutcomeReport, OutcomeStatus};
    use chrono::Utc;

    fn report(node: &str) -> BusMessage {
        BusMessage::Outcome(OutcomeReport {
            node_id: node.into(),
            session_id: "session_1".into(),
            attempt: 1,
            status: OutcomeStatus::Uploaded,
            detail: None,
            reported_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn fans_out_to_every_subscriber() {
        let bus = InProcStatusBus::new("dome/test", 16);
        let mut a = bus.subscribe().unwrap();
        let mut b = bus.subscribe().unwrap();

        let sent = report("cam01");
        bus.publish(sent.clone()).unwrap();

        assert_eq!(a.recv().await.unwrap(), sent);
        assert_eq!(b.recv().await.unwrap(), sent);
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus = InProcStatusBus::new("dome/test", 4);
        assert!(bus.publish(report("cam01")).is_ok());
    }
}
