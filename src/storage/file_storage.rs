use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, error, info};
use sha2::{Digest, Sha256};

use crate::error_handling::types::StorageError;
use crate::session_management::session::SessionSnapshot;
use crate::storage::storage_trait::{ImageStore, SessionRecordStore};
use crate::storage::types::{is_valid_identifier, ImageKey, ImageRef};

const RECORD_FILE: &str = "session.json";
const IMAGES_DIR: &str = "images";
const ORPHANS_DIR: &str = "orphans";

/// Filesystem-backed storage.
///
/// ```text
/// <base>/<session_id>/session.json
/// <base>/<session_id>/images/<node_id>_a<attempt>.<ext>
/// <base>/orphans/<session_id>/<node_id>_a<attempt>.<ext>
/// ```
pub struct FileStorage {
    base_path: PathBuf,
    extension: String,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(base_path: P, extension: &str) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        let orphans = base_path.join(ORPHANS_DIR);
        fs::create_dir_all(&orphans).map_err(|e| {
            error!("Failed to create storage root {}: {}", orphans.display(), e);
            StorageError::WriteFailed
        })?;
        info!("FileStorage initialized at {}", base_path.display());
        Ok(Self {
            base_path,
            extension: extension.to_string(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn check_key(key: &ImageKey) -> Result<(), StorageError> {
        for id in [&key.session_id, &key.node_id] {
            if !is_valid_identifier(id) {
                error!("Rejected storage key component {:?}", id);
                return Err(StorageError::InvalidKey(id.clone()));
            }
        }
        Ok(())
    }

    fn images_dir(&self, session_id: &str) -> PathBuf {
        self.base_path.join(session_id).join(IMAGES_DIR)
    }

    fn orphans_dir(&self, session_id: &str) -> PathBuf {
        self.base_path.join(ORPHANS_DIR).join(session_id)
    }

    fn record_path(&self, session_id: &str) -> PathBuf {
        self.base_path.join(session_id).join(RECORD_FILE)
    }

    /// Writes through a temporary sibling and renames it into place, so readers
    /// never observe a half-written file and a rewrite replaces the old content.
    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let dir = path.parent().ok_or_else(|| {
            error!("No parent directory for {}", path.display());
            StorageError::WriteFailed
        })?;
        fs::create_dir_all(dir).map_err(|e| {
            error!("Failed to create dir {}: {}", dir.display(), e);
            StorageError::WriteFailed
        })?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(StorageError::WriteFailed)?;
        let tmp = dir.join(format!(".{}.tmp", file_name));
        let mut f = File::create(&tmp).map_err(|e| {
            error!("Create failed {}: {}", tmp.display(), e);
            StorageError::WriteFailed
        })?;
        f.write_all(bytes).map_err(|e| {
            error!("Write failed {}: {}", tmp.display(), e);
            StorageError::WriteFailed
        })?;
        f.sync_all().map_err(|e| {
            error!("Sync failed {}: {}", tmp.display(), e);
            StorageError::WriteFailed
        })?;
        fs::rename(&tmp, path).map_err(|e| {
            error!("Rename {} -> {} failed: {}", tmp.display(), path.display(), e);
            StorageError::WriteFailed
        })?;
        Ok(())
    }

    fn store(&self, dir: PathBuf, key: &ImageKey, bytes: &[u8]) -> Result<ImageRef, StorageError> {
        Self::check_key(key)?;
        let path = dir.join(key.file_name(&self.extension));
        Self::write_atomic(&path, bytes)?;
        let sha256 = hex::encode(Sha256::digest(bytes));
        debug!(
            "[{}] stored {} byte(s) for {} attempt {} at {}",
            key.session_id,
            bytes.len(),
            key.node_id,
            key.attempt,
            path.display()
        );
        Ok(ImageRef {
            path,
            size: bytes.len() as u64,
            sha256,
            stored_at: Utc::now(),
        })
    }
}

impl ImageStore for FileStorage {
    fn save_image(&self, key: &ImageKey, bytes: &[u8]) -> Result<ImageRef, StorageError> {
        self.store(self.images_dir(&key.session_id), key, bytes)
    }

    fn save_orphan(&self, key: &ImageKey, bytes: &[u8]) -> Result<ImageRef, StorageError> {
        let image = self.store(self.orphans_dir(&key.session_id), key, bytes)?;
        info!(
            "[{}] orphan upload from {} stored at {}",
            key.session_id,
            key.node_id,
            image.path.display()
        );
        Ok(image)
    }
}

impl SessionRecordStore for FileStorage {
    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.base_path.join(session_id)
    }

    fn prepare_session(&self, session_id: &str) -> Result<PathBuf, StorageError> {
        if !is_valid_identifier(session_id) {
            return Err(StorageError::InvalidKey(session_id.to_string()));
        }
        let images = self.images_dir(session_id);
        fs::create_dir_all(&images).map_err(|e| {
            error!("Failed to create session dir {}: {}", images.display(), e);
            StorageError::WriteFailed
        })?;
        Ok(self.session_dir(session_id))
    }

    fn save_session_record(&self, record: &SessionSnapshot) -> Result<(), StorageError> {
        if !is_valid_identifier(&record.session_id) {
            return Err(StorageError::InvalidKey(record.session_id.clone()));
        }
        let json = serde_json::to_vec_pretty(record).map_err(|e| {
            error!("Failed to serialize session {}: {}", record.session_id, e);
            StorageError::Serialization(e.to_string())
        })?;
        let path = self.record_path(&record.session_id);
        Self::write_atomic(&path, &json)?;
        debug!("[{}] session record written to {}", record.session_id, path.display());
        Ok(())
    }

    fn load_session_record(&self, session_id: &str) -> Result<SessionSnapshot, StorageError> {
        if !is_valid_identifier(session_id) {
            return Err(StorageError::InvalidKey(session_id.to_string()));
        }
        let path = self.record_path(session_id);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound)
            }
            Err(e) => {
                error!("Read failed {}: {}", path.display(), e);
                return Err(StorageError::ReadFailed);
            }
        };
        serde_json::from_slice(&raw).map_err(|e| {
            error!("Invalid session record {}: {}", path.display(), e);
            StorageError::Serialization(e.to_string())
        })
    }

    fn list_session_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        let entries = fs::read_dir(&self.base_path).map_err(|e| {
            error!("Failed to read storage root {}: {}", self.base_path.display(), e);
            StorageError::ReadFailed
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| {
                error!("Dir entry error: {}", e);
                StorageError::ReadFailed
            })?;
            let path = entry.path();
            if !path.join(RECORD_FILE).is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        debug!("Found {} session record(s)", ids.len());
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_management::session::Session;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn storage() -> (TempDir, FileStorage) {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path(), "jpg").unwrap();
        (dir, storage)
    }

    #[test]
    fn test_retransmission_overwrites() {
        let (_dir, storage) = storage();
        let key = ImageKey::new("session_1", "cam01", 1);

        let first = storage.save_image(&key, b"first").unwrap();
        let second = storage.save_image(&key, b"second!").unwrap();

        assert_eq!(first.path, second.path);
        assert_eq!(second.size, 7);
        assert_eq!(fs::read(&second.path).unwrap(), b"second!");
        let images: Vec<_> = fs::read_dir(storage.images_dir("session_1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(images, vec!["cam01_a1.jpg".to_string()]);
    }

    #[test]
    fn test_attempts_are_distinct_files() {
        let (_dir, storage) = storage();
        let a1 = storage.save_image(&ImageKey::new("session_1", "cam01", 1), b"x").unwrap();
        let a2 = storage.save_image(&ImageKey::new("session_1", "cam01", 2), b"y").unwrap();
        assert_ne!(a1.path, a2.path);
    }

    #[test]
    fn test_digest_is_sha256_hex() {
        let (_dir, storage) = storage();
        let image = storage.save_image(&ImageKey::new("session_1", "cam01", 1), b"abc").unwrap();
        assert_eq!(
            image.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_orphans_are_kept_apart() {
        let (dir, storage) = storage();
        let key = ImageKey::new("session_old", "cam04", 1);
        let image = storage.save_orphan(&key, b"late").unwrap();
        assert!(image.path.starts_with(dir.path().join("orphans").join("session_old")));
        assert!(!storage.session_dir("session_old").exists());
    }

    #[test]
    fn test_traversal_rejected() {
        let (_dir, storage) = storage();
        let key = ImageKey::new("..", "cam01", 1);
        assert!(matches!(
            storage.save_image(&key, b"x"),
            Err(StorageError::InvalidKey(_))
        ));
        let key = ImageKey::new("session_1", "cam/01", 1);
        assert!(matches!(
            storage.save_orphan(&key, b"x"),
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_session_record_roundtrip_and_listing() {
        let (_dir, storage) = storage();
        let expected: BTreeSet<String> = ["cam01", "cam02"].iter().map(|s| s.to_string()).collect();
        let dir = storage.prepare_session("session_b").unwrap();
        let now = Utc::now();
        let session = Session::open(
            "session_b".to_string(),
            expected,
            now,
            now + chrono::Duration::seconds(30),
            dir.clone(),
        );
        storage.save_session_record(&session.snapshot()).unwrap();
        storage.prepare_session("session_a").unwrap();

        let loaded = storage.load_session_record("session_b").unwrap();
        assert_eq!(loaded.session_id, "session_b");
        assert_eq!(loaded.directory_path, dir);
        assert_eq!(loaded.per_node_status.len(), 2);

        // session_a has no record yet
        assert_eq!(storage.list_session_ids().unwrap(), vec!["session_b".to_string()]);
        assert!(matches!(
            storage.load_session_record("session_a"),
            Err(StorageError::NotFound)
        ));
    }
}
