use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$").expect("identifier regex"));

/// Whether `id` is safe to use as a session or node identifier, and thus as a path component.
pub fn is_valid_identifier(id: &str) -> bool {
    IDENTIFIER.is_match(id) && !id.contains("..")
}

/// Storage key of one image: retransmissions of the same attempt map to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageKey {
    pub session_id: String,
    pub node_id: String,
    pub attempt: u32,
}

impl ImageKey {
    pub fn new(session_id: impl Into<String>, node_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            session_id: session_id.into(),
            node_id: node_id.into(),
            attempt,
        }
    }

    pub fn file_name(&self, extension: &str) -> String {
        format!("{}_a{}.{}", self.node_id, self.attempt, extension)
    }
}

/// Handle to a persisted image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub path: PathBuf,
    pub size: u64,
    /// Hex encoded SHA-256 of the stored bytes.
    pub sha256: String,
    pub stored_at: DateTime<Utc>,
}

/// Event emitted by the upload receiver after a successful write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageArrival {
    pub key: ImageKey,
    pub image: ImageRef,
    /// Stored in the orphan bucket instead of the session directory.
    pub orphan: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_rules() {
        assert!(is_valid_identifier("cam01"));
        assert!(is_valid_identifier("session_20261016T101500123_0001"));
        assert!(is_valid_identifier("esp32-a4.cf.12"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("../etc"));
        assert!(!is_valid_identifier("a..b"));
        assert!(!is_valid_identifier("cam/01"));
        assert!(!is_valid_identifier(".hidden"));
        assert!(!is_valid_identifier(&"x".repeat(65)));
    }

    #[test]
    fn file_name_includes_attempt() {
        let key = ImageKey::new("session_1", "cam02", 3);
        assert_eq!(key.file_name("jpg"), "cam02_a3.jpg");
    }
}
