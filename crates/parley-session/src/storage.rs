//! Storage backend abstraction.
//!
//! A backend keeps one durable document per session. Implementations are
//! blocking; the persistence manager moves every call onto the blocking
//! thread pool so request handling never waits on disk.

use std::path::Path;
use std::sync::Arc;

use parley_core::{config::StorageBackendKind, Session, StorageError};

use crate::json_storage::JsonFileStorage;
use crate::sqlite_storage::SqliteStorage;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Durable per-session storage.
///
/// `save` must replace the stored document atomically: a reader either sees
/// the previous version or the new one, never a partial write.
pub trait SessionStorage: Send + Sync {
    /// Persist the session, replacing any previous version.
    fn save(&self, session: &Session) -> Result<()>;

    /// Load one session, `None` if it was never saved or has been deleted.
    fn load(&self, id: &str) -> Result<Option<Session>>;

    /// Load every readable session. Unreadable entries are skipped with a warning.
    fn load_all(&self) -> Result<Vec<Session>>;

    /// Remove a session. Removing an unknown id is not an error.
    fn delete(&self, id: &str) -> Result<()>;

    /// Whether a document exists for the id.
    fn exists(&self, id: &str) -> Result<bool>;

    /// Release resources. Later calls fail with [`StorageError::Closed`].
    fn close(&self) -> Result<()>;
}

/// Reject ids that could escape the storage directory or break a file name.
pub(crate) fn validate_key(id: &str) -> Result<()> {
    let bad = id.is_empty()
        || id == "."
        || id.contains("..")
        || id
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control());
    if bad {
        return Err(StorageError::InvalidKey(id.to_string()));
    }
    Ok(())
}

/// Open the configured backend under `data_dir`.
pub fn open_backend(
    kind: StorageBackendKind,
    data_dir: impl AsRef<Path>,
) -> Result<Arc<dyn SessionStorage>> {
    let data_dir = data_dir.as_ref();
    let storage: Arc<dyn SessionStorage> = match kind {
        StorageBackendKind::Json => Arc::new(JsonFileStorage::new(data_dir.join("sessions"))?),
        StorageBackendKind::Sqlite => Arc::new(SqliteStorage::open(data_dir.join("sessions.db"))?),
    };
    tracing::debug!(backend = ?kind, dir = %data_dir.display(), "Opened session storage");
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("5f0c6c1e-6a4e-4b59-9d1f-2d7d0c4f8e21").is_ok());
        assert!(validate_key("abc_123").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("a/b").is_err());
        assert!(validate_key("a\\b").is_err());
    }

    #[test]
    fn test_open_backend_kinds() {
        let tmp = tempfile::TempDir::new().unwrap();

        let json = open_backend(StorageBackendKind::Json, tmp.path()).unwrap();
        assert!(!json.exists("missing").unwrap());
        assert!(tmp.path().join("sessions").is_dir());

        let sqlite = open_backend(StorageBackendKind::Sqlite, tmp.path()).unwrap();
        assert!(!sqlite.exists("missing").unwrap());
        assert!(tmp.path().join("sessions.db").exists());
    }
}
