//! Storage Traits
//!
//! The data path and the control path write to disjoint parts of a session
//! directory, so they are described by two traits:
//! - [`ImageStore`] is used by the upload receiver only and owns image bytes.
//! - [`SessionRecordStore`] is used by the session assembler only and owns the
//!   metadata record.
//!
//! All methods return a `Result` to handle potential storage errors.

use std::path::PathBuf;

use crate::error_handling::types::StorageError;
use crate::session_management::session::SessionSnapshot;
use crate::storage::types::{ImageKey, ImageRef};

/// Persists image blobs keyed by `(session_id, node_id, attempt)`.
///
/// Writing the same key twice replaces the earlier file: a retransmission
/// never produces a second image.
pub trait ImageStore: Send + Sync {
    /// Stores an image inside its session directory.
    fn save_image(&self, key: &ImageKey, bytes: &[u8]) -> Result<ImageRef, StorageError>;

    /// Stores an image in the orphan bucket, for uploads without a resolvable open session.
    fn save_orphan(&self, key: &ImageKey, bytes: &[u8]) -> Result<ImageRef, StorageError>;
}

/// Persists the per-session metadata record.
pub trait SessionRecordStore: Send + Sync {
    /// Directory handed to the reconstruction stage for this session.
    fn session_dir(&self, session_id: &str) -> PathBuf;

    /// Creates the session directory layout.
    fn prepare_session(&self, session_id: &str) -> Result<PathBuf, StorageError>;

    fn save_session_record(&self, record: &SessionSnapshot) -> Result<(), StorageError>;

    fn load_session_record(&self, session_id: &str) -> Result<SessionSnapshot, StorageError>;

    /// Ids of every session with a metadata record on disk.
    fn list_session_ids(&self) -> Result<Vec<String>, StorageError>;
}
