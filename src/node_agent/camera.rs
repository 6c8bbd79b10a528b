use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::debug;

use crate::error_handling::types::NodeError;

/// One acquired frame, already encoded.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub bytes: Bytes,
    pub captured_at: DateTime<Utc>,
}

/// Sensor driver interface.
#[async_trait]
pub trait Camera: Send + Sync {
    async fn capture(&self) -> Result<CapturedFrame, NodeError>;
}

/// Stand-in sensor producing small JPEG-framed payloads.
pub struct SyntheticCamera {
    node_id: String,
    exposure: Duration,
    pending_failures: AtomicU32,
    frames: AtomicU64,
}

impl SyntheticCamera {
    pub fn new(node_id: &str, exposure: Duration) -> Self {
        Self {
            node_id: node_id.to_string(),
            exposure,
            pending_failures: AtomicU32::new(0),
            frames: AtomicU64::new(0),
        }
    }

    /// Makes the next `count` acquisitions fail.
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    pub fn frames_taken(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Camera for SyntheticCamera {
    async fn capture(&self) -> Result<CapturedFrame, NodeError> {
        tokio::time::sleep(self.exposure).await;
        let failed = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(NodeError::SensorAcquisitionFailure(format!(
                "{}: frame not acquired",
                self.node_id
            )));
        }
        let seq = self.frames.fetch_add(1, Ordering::SeqCst) + 1;
        let captured_at = Utc::now();
        let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
        bytes.extend_from_slice(
            format!("{} frame {} at {}", self.node_id, seq, captured_at.to_rfc3339()).as_bytes(),
        );
        bytes.extend_from_slice(&[0xFF, 0xD9]);
        debug!("{} acquired frame {} ({} bytes)", self.node_id, seq, bytes.len());
        Ok(CapturedFrame {
            bytes: Bytes::from(bytes),
            captured_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_jpeg_framed_payloads() {
        let camera = SyntheticCamera::new("cam01", Duration::ZERO);
        let frame = tokio_test::block_on(camera.capture()).unwrap();
        assert_eq!(&frame.bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(&frame.bytes[frame.bytes.len() - 2..], &[0xFF, 0xD9]);
        assert_eq!(camera.frames_taken(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let camera = SyntheticCamera::new("cam01", Duration::ZERO);
        camera.fail_next(2);
        assert!(matches!(
            camera.capture().await,
            Err(NodeError::SensorAcquisitionFailure(_))
        ));
        assert!(camera.capture().await.is_err());
        assert!(camera.capture().await.is_ok());
        assert_eq!(camera.frames_taken(), 1);
    }
}
