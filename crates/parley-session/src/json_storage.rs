//! JSON-on-disk storage backend.
//!
//! Each session lives in `<dir>/<id>.json`. Writes go to `<id>.json.tmp` in
//! the same directory, are synced, then renamed over the target.

use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parley_core::{Session, StorageError};

use crate::storage::{validate_key, Result, SessionStorage};

const EXTENSION: &str = "json";
const TEMP_SUFFIX: &str = ".json.tmp";

/// File-per-session storage.
pub struct JsonFileStorage {
    dir: PathBuf,
    closed: AtomicBool,
}

impl JsonFileStorage {
    /// Create the storage, creating `dir` if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            closed: AtomicBool::new(false),
        })
    }

    /// Directory holding the session files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, EXTENSION))
    }

    fn temp_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", id, TEMP_SUFFIX))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn read_file(path: &Path) -> Result<Session> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl SessionStorage for JsonFileStorage {
    fn save(&self, session: &Session) -> Result<()> {
        self.ensure_open()?;
        validate_key(session.id())?;

        let target = self.session_path(session.id());
        let temp = self.temp_path(session.id());

        {
            let file = File::create(&temp)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, session)?;
            writer.flush()?;
            let file = writer
                .into_inner()
                .map_err(|e| StorageError::Io(e.into_error()))?;
            file.sync_all()?;
        }

        // Atomic rename
        if let Err(e) = fs::rename(&temp, &target) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }

        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<Session>> {
        self.ensure_open()?;
        validate_key(id)?;

        match Self::read_file(&self.session_path(id)) {
            Ok(session) => Ok(Some(session)),
            Err(StorageError::Io(e)) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn load_all(&self) -> Result<Vec<Session>> {
        self.ensure_open()?;

        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                // Leftover temp files from an interrupted write land here too.
                continue;
            }

            match Self::read_file(&path) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session file");
                }
            }
        }

        Ok(sessions)
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.ensure_open()?;
        validate_key(id)?;

        match fs::remove_file(self.session_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, id: &str) -> Result<bool> {
        self.ensure_open()?;
        validate_key(id)?;
        Ok(self.session_path(id).is_file())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::Message;
    use tempfile::TempDir;

    fn create_test_storage() -> (JsonFileStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = JsonFileStorage::new(temp_dir.path()).unwrap();
        (storage, temp_dir)
    }

    fn sample_session(text: &str) -> Session {
        let mut session = Session::new(None);
        session.push_message(Message::user(text), 50);
        session.push_message(Message::assistant("Sure.").with_actual_tokens(4), 50);
        session
    }

    #[test]
    fn test_save_and_load() {
        let (storage, _tmp) = create_test_storage();
        let session = sample_session("Hello");

        storage.save(&session).unwrap();

        let loaded = storage.load(session.id()).unwrap().unwrap();
        assert_eq!(loaded, session);
        assert!(storage.exists(session.id()).unwrap());
    }

    #[test]
    fn test_save_replaces_and_leaves_no_temp_file() {
        let (storage, tmp) = create_test_storage();
        let mut session = sample_session("Hello");
        storage.save(&session).unwrap();

        session.set_title(Some("Renamed".to_string()));
        storage.save(&session).unwrap();

        let loaded = storage.load(session.id()).unwrap().unwrap();
        assert_eq!(loaded.title(), Some("Renamed"));

        let names: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![format!("{}.json", session.id())]);
    }

    #[test]
    fn test_load_missing_is_none() {
        let (storage, _tmp) = create_test_storage();
        assert!(storage.load("does-not-exist").unwrap().is_none());
    }

    #[test]
    fn test_load_all_skips_corrupt_and_temp_files() {
        let (storage, tmp) = create_test_storage();
        let a = sample_session("first");
        let b = sample_session("second");
        storage.save(&a).unwrap();
        storage.save(&b).unwrap();

        fs::write(tmp.path().join("broken.json"), "{ not json").unwrap();
        fs::write(tmp.path().join("half.json.tmp"), "{\"id\":").unwrap();
        fs::write(tmp.path().join("notes.txt"), "ignore me").unwrap();

        let mut loaded = storage.load_all().unwrap();
        loaded.sort_by(|x, y| x.id().cmp(y.id()));
        let mut expected = vec![a, b];
        expected.sort_by(|x, y| x.id().cmp(y.id()));
        assert_eq!(loaded, expected);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (storage, _tmp) = create_test_storage();
        let session = sample_session("bye");
        storage.save(&session).unwrap();

        storage.delete(session.id()).unwrap();
        assert!(!storage.exists(session.id()).unwrap());
        storage.delete(session.id()).unwrap();
    }

    #[test]
    fn test_rejects_path_traversal() {
        let (storage, _tmp) = create_test_storage();
        let session = Session::with_id("../escape", None);
        assert!(matches!(
            storage.save(&session),
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_closed_storage_refuses_work() {
        let (storage, _tmp) = create_test_storage();
        storage.close().unwrap();
        assert!(matches!(
            storage.save(&sample_session("x")),
            Err(StorageError::Closed)
        ));
        assert!(matches!(storage.load_all(), Err(StorageError::Closed)));
    }
}
