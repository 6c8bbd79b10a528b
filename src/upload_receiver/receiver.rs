use std::sync::Arc;

use bytes::Bytes;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error_handling::types::{StorageError, UploadError};
use crate::session_management::{AssemblerHandle, SessionPhase};
use crate::storage::storage_trait::ImageStore;
use crate::storage::types::{is_valid_identifier, ImageArrival, ImageKey};

/// Header carrying the uploading node's identity.
pub const NODE_ID_HEADER: &str = "x-node-id";
/// Header carrying the attempt number the image belongs to.
pub const ATTEMPT_HEADER: &str = "x-attempt";

/// One inbound image transfer. Node identity and attempt travel out-of-band
/// (request headers); the payload is opaque.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub session_id: String,
    pub node_id: String,
    pub attempt: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub session_id: String,
    pub node_id: String,
    pub attempt: u32,
    pub size: u64,
    pub sha256: String,
    /// The session was not open, the image went to the orphan bucket.
    pub orphan: bool,
}

pub struct UploadReceiver {
    store: Arc<dyn ImageStore>,
    assembler: AssemblerHandle,
    max_bytes: usize,
}

impl UploadReceiver {
    pub fn new(store: Arc<dyn ImageStore>, assembler: AssemblerHandle, max_bytes: usize) -> Self {
        Self {
            store,
            assembler,
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    fn validate(&self, request: &UploadRequest) -> Result<(), UploadError> {
        if request.payload.is_empty() {
            return Err(UploadError::EmptyPayload);
        }
        if request.payload.len() > self.max_bytes {
            return Err(UploadError::PayloadTooLarge {
                size: request.payload.len(),
                max: self.max_bytes,
            });
        }
        for id in [&request.session_id, &request.node_id] {
            if !is_valid_identifier(id) {
                return Err(UploadError::InvalidIdentifier(id.clone()));
            }
        }
        if request.attempt == 0 {
            return Err(UploadError::InvalidAttempt(request.attempt));
        }
        Ok(())
    }

    /// Stores the image and signals its arrival.
    ///
    /// Uploads for a session that is not open are still kept, in the orphan
    /// bucket, and reported as belated. A storage failure is returned to the
    /// caller so the node can retry.
    pub async fn accept(&self, request: UploadRequest) -> Result<UploadReceipt, UploadError> {
        if let Err(e) = self.validate(&request) {
            warn!(
                "[{}] rejected upload from {}: {}",
                request.session_id, request.node_id, e
            );
            return Err(e);
        }

        let phase = match self.assembler.resolve(&request.session_id).await {
            Ok(phase) => phase,
            Err(e) => {
                warn!("[{}] session lookup failed: {}", request.session_id, e);
                SessionPhase::Unknown
            }
        };
        let orphan = phase != SessionPhase::Open;
        let key = ImageKey::new(request.session_id, request.node_id, request.attempt);

        let store = self.store.clone();
        let write_key = key.clone();
        let payload = request.payload;
        let image = tokio::task::spawn_blocking(move || {
            if orphan {
                store.save_orphan(&write_key, &payload)
            } else {
                store.save_image(&write_key, &payload)
            }
        })
        .await
        .map_err(|e| {
            error!("[{}] upload write task failed: {}", key.session_id, e);
            UploadError::StorageError(StorageError::WriteFailed)
        })??;

        let receipt = UploadReceipt {
            session_id: key.session_id.clone(),
            node_id: key.node_id.clone(),
            attempt: key.attempt,
            size: image.size,
            sha256: image.sha256.clone(),
            orphan,
        };
        let arrival = ImageArrival { key, image, orphan };
        let notified = if orphan {
            info!(
                "[{}] belated upload from {} ({:?})",
                receipt.session_id, receipt.node_id, phase
            );
            self.assembler.belated_upload(arrival).await
        } else {
            debug!(
                "[{}] image from {} attempt {} stored",
                receipt.session_id, receipt.node_id, receipt.attempt
            );
            self.assembler.image_arrived(arrival).await
        };
        if let Err(e) = notified {
            error!(
                "[{}] image from {} stored but not signalled: {}",
                receipt.session_id, receipt.node_id, e
            );
        }
        Ok(receipt)
    }
}
