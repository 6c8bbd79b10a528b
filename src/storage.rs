//! Storage subsystem
//!
//! Durable per-session directories holding image files and a metadata record.
//!
//! Components:
//! - `storage_trait`: the [`ImageStore`] and [`SessionRecordStore`] traits.
//! - `types`: image keys, image handles and arrival events.
//! - `file_storage`: filesystem-backed implementation of both traits.

pub mod file_storage;
pub mod storage_trait;
pub mod types;

pub use file_storage::FileStorage;
pub use storage_trait::{ImageStore, SessionRecordStore};
pub use types::{ImageArrival, ImageKey, ImageRef};
