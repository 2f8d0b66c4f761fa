//! In-memory storage for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use parley_core::{Session, StorageError};

use crate::storage::{Result, SessionStorage};

/// Storage that keeps sessions in a map and can be told to fail saves.
#[derive(Default)]
pub(crate) struct MemoryStorage {
    sessions: Mutex<HashMap<String, Session>>,
    saves: AtomicUsize,
    attempts: AtomicUsize,
    failing: AtomicBool,
    closed: AtomicBool,
    /// Held by `save` and `close` for their whole duration.
    gate: Mutex<()>,
}

impl MemoryStorage {
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub(crate) fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Saves started, including ones still blocked or failed.
    pub(crate) fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Block every `save` and `close` until the guard is dropped.
    pub(crate) fn hold(&self) -> MutexGuard<'_, ()> {
        self.gate.lock()
    }

    pub(crate) fn get(&self, id: &str) -> Option<Session> {
        self.sessions.lock().get(id).cloned()
    }

    pub(crate) fn insert(&self, session: Session) {
        self.sessions.lock().insert(session.id().to_string(), session);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl SessionStorage for MemoryStorage {
    fn save(&self, session: &Session) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let _gate = self.gate.lock();
        self.ensure_open()?;
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("disk unavailable")));
        }
        self.insert(session.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<Session>> {
        self.ensure_open()?;
        Ok(self.get(id))
    }

    fn load_all(&self) -> Result<Vec<Session>> {
        self.ensure_open()?;
        Ok(self.sessions.lock().values().cloned().collect())
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.ensure_open()?;
        self.sessions.lock().remove(id);
        Ok(())
    }

    fn exists(&self, id: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.sessions.lock().contains_key(id))
    }

    fn close(&self) -> Result<()> {
        let _gate = self.gate.lock();
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
