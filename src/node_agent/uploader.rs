use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use reqwest::Client;

use super::backoff::Backoff;
use crate::error_handling::types::NodeError;
use crate::upload_receiver::{ATTEMPT_HEADER, NODE_ID_HEADER};

/// Outbound image delivery to the coordinator.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Delivers `image` to the session-scoped `upload_path`.
    async fn upload(
        &self,
        upload_path: &str,
        node_id: &str,
        attempt: u32,
        image: Bytes,
    ) -> Result<(), NodeError>;
}

/// Raw-body HTTP POST uploader.
///
/// Transport errors and 5xx responses are retried with backoff; a 4xx answer
/// is a final rejection.
pub struct HttpUploader {
    base_url: String,
    client: Client,
    max_tries: u32,
    retry_initial: Duration,
    retry_max: Duration,
}

impl HttpUploader {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, NodeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NodeError::TransportFailure(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            max_tries: 4,
            retry_initial: Duration::from_millis(200),
            retry_max: Duration::from_secs(2),
        })
    }

    pub fn with_retries(mut self, max_tries: u32, initial: Duration, max: Duration) -> Self {
        self.max_tries = max_tries.max(1);
        self.retry_initial = initial;
        self.retry_max = max;
        self
    }

    fn url(&self, upload_path: &str) -> String {
        format!("{}/{}", self.base_url, upload_path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(
        &self,
        upload_path: &str,
        node_id: &str,
        attempt: u32,
        image: Bytes,
    ) -> Result<(), NodeError> {
        let url = self.url(upload_path);
        let mut backoff = Backoff::new(self.retry_initial, self.retry_max);
        let mut tries = 0;
        loop {
            tries += 1;
            let result = self
                .client
                .post(&url)
                .header(NODE_ID_HEADER, node_id)
                .header(ATTEMPT_HEADER, attempt.to_string())
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(image.clone())
                .send()
                .await;
            let failure = match result {
                Ok(resp) if resp.status().is_success() => {
                    debug!("{} uploaded {} bytes to {}", node_id, image.len(), url);
                    return Ok(());
                }
                Ok(resp) if resp.status().is_client_error() => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(NodeError::TransportFailure(format!(
                        "upload rejected with {} {}",
                        status, body
                    )));
                }
                Ok(resp) => format!("server answered {}", resp.status()),
                Err(e) => e.to_string(),
            };
            if tries >= self.max_tries {
                return Err(NodeError::TransportFailure(format!(
                    "upload failed after {} tries: {}",
                    tries, failure
                )));
            }
            let delay = backoff.next_delay();
            warn!(
                "{} upload try {} failed ({}), retrying in {:?}",
                node_id, tries, failure, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
