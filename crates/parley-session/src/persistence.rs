//! Write-behind persistence.
//!
//! Mutations record the latest snapshot of a session as dirty and return
//! immediately. A background loop writes dirty snapshots to storage in small
//! batches, so a burst of edits to one session becomes a single write.
//! Failed writes stay pending and are retried on a later pass.
//!
//! All storage I/O runs on the blocking pool. Saves and deletes share one I/O
//! lock, so a flush already holding a snapshot can never write a session back
//! after it was deleted.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use parley_core::{config::PersistenceConfig, Error, Result, Session};

use crate::storage::{self, SessionStorage};

/// Counters exposed for monitoring and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistenceStats {
    /// Successful background and shutdown saves.
    pub saves: u64,
    /// Failed save attempts, including ones later retried.
    pub failures: u64,
    /// Sessions currently waiting to be written.
    pub pending: usize,
}

/// Batches dirty sessions and writes them behind the caller's back.
pub struct PersistenceManager {
    storage: Arc<dyn SessionStorage>,
    config: PersistenceConfig,
    /// Latest unsaved snapshot per session.
    pending: Mutex<HashMap<String, Arc<Session>>>,
    /// Wakes the flush loop. Dropped at shutdown to stop it.
    signal: Mutex<Option<mpsc::UnboundedSender<String>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Ids whose last save failed, retried on the next pass.
    retry: Mutex<HashSet<String>>,
    /// Serializes storage writes and deletes.
    io_lock: tokio::sync::Mutex<()>,
    /// Only changed while `pending` is locked.
    accepting: AtomicBool,
    /// Set once shutdown has completed.
    stopped: tokio::sync::Mutex<bool>,
    saves: AtomicU64,
    failures: AtomicU64,
}

impl PersistenceManager {
    /// Create the manager and spawn its flush loop on the current runtime.
    pub fn start(storage: Arc<dyn SessionStorage>, config: PersistenceConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            storage,
            config,
            pending: Mutex::new(HashMap::new()),
            signal: Mutex::new(Some(tx)),
            worker: Mutex::new(None),
            retry: Mutex::new(HashSet::new()),
            io_lock: tokio::sync::Mutex::new(()),
            accepting: AtomicBool::new(true),
            stopped: tokio::sync::Mutex::new(false),
            saves: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        });

        let loop_manager = Arc::clone(&manager);
        let handle = tokio::spawn(async move {
            loop_manager.flush_loop(rx).await;
        });
        *manager.worker.lock() = Some(handle);

        debug!(
            save_delay_ms = manager.config.save_delay_ms,
            batch_size = manager.config.batch_size,
            "Persistence manager started"
        );
        manager
    }

    /// Record the session's current state for a later background write.
    ///
    /// Never blocks on I/O. A snapshot older than the one already pending is
    /// ignored. Returns `false` once shutdown has begun, in which case the
    /// snapshot will not be written.
    pub fn mark_dirty(&self, session: &Session) -> bool {
        let id = session.id().to_string();
        {
            // Checked under the same lock shutdown takes to stop accepting,
            // so an accepted snapshot is always seen by the shutdown drain.
            let mut pending = self.pending.lock();
            if !self.accepting.load(Ordering::Acquire) {
                warn!(session_id = %id, "Refusing dirty session after shutdown");
                return false;
            }
            if pending
                .get(&id)
                .is_some_and(|existing| existing.revision() > session.revision())
            {
                return true;
            }
            pending.insert(id.clone(), Arc::new(session.clone()));
        }

        if let Some(tx) = self.signal.lock().as_ref() {
            // The loop only stops at shutdown; the snapshot is drained then.
            let _ = tx.send(id);
        }
        true
    }

    /// Write the session now and wait for the result.
    ///
    /// A pending snapshot with a higher revision stays queued; anything
    /// older or equal is superseded by this write.
    pub async fn save_now(&self, session: &Session) -> Result<()> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }

        let id = session.id().to_string();
        let revision = session.revision();
        let snapshot = Arc::new(session.clone());

        let _io = self.io_lock.lock().await;
        self.write(Arc::clone(&snapshot)).await?;
        self.saves.fetch_add(1, Ordering::Relaxed);

        let mut pending = self.pending.lock();
        if pending.get(&id).is_some_and(|p| p.revision() <= revision) {
            pending.remove(&id);
        }
        Ok(())
    }

    /// Load one session. An unsaved snapshot wins over the stored copy.
    pub async fn load(&self, id: &str) -> Result<Option<Session>> {
        let pending = self.pending.lock().get(id).cloned();
        if let Some(snapshot) = pending {
            return Ok(Some(Session::clone(&snapshot)));
        }

        let id = id.to_string();
        self.blocking(move |s| s.load(&id)).await
    }

    /// Load every stored session.
    pub async fn load_all(&self) -> Result<Vec<Session>> {
        self.blocking(|s| s.load_all()).await
    }

    /// Remove a session from storage and forget any pending write for it.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let _io = self.io_lock.lock().await;
        self.pending.lock().remove(id);

        let owned = id.to_string();
        self.blocking(move |s| s.delete(&owned)).await?;
        debug!(session_id = %id, "Deleted session from storage");
        Ok(())
    }

    /// Write everything pending now. Failures stay pending.
    pub async fn flush(&self) {
        let ids: Vec<String> = self.pending.lock().keys().cloned().collect();
        if !ids.is_empty() {
            self.flush_ids(ids).await;
        }
    }

    /// Number of sessions waiting to be written.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            saves: self.saves.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            pending: self.pending_count(),
        }
    }

    /// Whether new dirty markers are still accepted.
    pub fn is_running(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Stop the flush loop, write what is left once, and close storage.
    ///
    /// The whole sequence is bounded by `shutdown_timeout_ms`. Snapshots that
    /// fail to save here are logged and dropped. Calling this again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        let mut stopped = self.stopped.lock().await;
        if *stopped {
            return Ok(());
        }

        self.stop_accepting();
        let deadline = Instant::now() + self.config.shutdown_timeout();

        // Closing the channel ends the loop once it has drained its signals
        drop(self.signal.lock().take());
        let worker = self.worker.lock().take();
        if let Some(mut handle) = worker {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Flush loop ended abnormally"),
                Err(_) => {
                    warn!("Flush loop did not stop in time, aborting it");
                    handle.abort();
                }
            }
        }

        let remaining: Vec<(String, Arc<Session>)> = self.pending.lock().drain().collect();
        let total = remaining.len();
        let mut saved = 0usize;

        for (id, snapshot) in remaining {
            let Ok(_io) = tokio::time::timeout_at(deadline, self.io_lock.lock()).await else {
                break;
            };
            match tokio::time::timeout_at(deadline, self.write(snapshot)).await {
                Ok(Ok(())) => {
                    self.saves.fetch_add(1, Ordering::Relaxed);
                    saved += 1;
                }
                Ok(Err(e)) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    error!(session_id = %id, error = %e, "Dropping unsaved session at shutdown");
                }
                Err(_) => break,
            }
        }

        if saved < total {
            error!(
                saved,
                total,
                "Shutdown deadline reached or saves failed, unsaved sessions were dropped"
            );
        }

        let closed = match tokio::time::timeout_at(deadline, self.blocking(|s| s.close())).await {
            Ok(result) => result,
            Err(_) => {
                error!("Storage did not close before the shutdown deadline");
                Ok(())
            }
        };
        *stopped = true;
        info!(saved, "Persistence manager stopped");
        closed
    }

    fn stop_accepting(&self) {
        let _pending = self.pending.lock();
        self.accepting.store(false, Ordering::Release);
    }

    async fn flush_loop(&self, mut rx: mpsc::UnboundedReceiver<String>) {
        let batch_size = self.config.batch_size.max(1);
        let delay = self.config.save_delay();

        loop {
            let mut batch = match tokio::time::timeout(delay, rx.recv()).await {
                Ok(Some(id)) => collect_batch(&mut rx, id, batch_size),
                Ok(None) => break,
                // Quiet period: retry whatever earlier passes left behind
                Err(_) => self.pending.lock().keys().take(batch_size).cloned().collect(),
            };

            // Failed ids ride along with the next batch even under steady traffic
            batch.extend(self.retry.lock().drain());

            if batch.is_empty() {
                continue;
            }

            let mut seen = HashSet::with_capacity(batch.len());
            batch.retain(|id| seen.insert(id.clone()));
            self.flush_ids(batch).await;
        }

        debug!("Flush loop stopped");
    }

    /// Write the current snapshot of each id, re-queueing failures.
    async fn flush_ids(&self, ids: Vec<String>) {
        let start = std::time::Instant::now();
        let mut written = 0usize;
        let mut failed = 0usize;

        for id in ids {
            let _io = self.io_lock.lock().await;
            let Some(snapshot) = self.pending.lock().remove(&id) else {
                continue;
            };

            match self.write(Arc::clone(&snapshot)).await {
                Ok(()) => {
                    self.saves.fetch_add(1, Ordering::Relaxed);
                    written += 1;
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    failed += 1;
                    warn!(session_id = %id, error = %e, "Session save failed, will retry");
                    // A newer snapshot marked meanwhile takes precedence
                    self.pending.lock().entry(id.clone()).or_insert(snapshot);
                    self.retry.lock().insert(id);
                }
            }
        }

        if written + failed > 0 {
            debug!(
                written,
                failed,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Flushed dirty sessions"
            );
        }
    }

    async fn write(&self, snapshot: Arc<Session>) -> Result<()> {
        self.blocking(move |s| s.save(&snapshot)).await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn SessionStorage) -> storage::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = Arc::clone(&self.storage);
        tokio::task::spawn_blocking(move || f(storage.as_ref()))
            .await
            .map_err(|e| Error::Internal(format!("storage task failed: {}", e)))?
            .map_err(Error::from)
    }
}

/// The first signalled id plus up to `batch_size` more that are already queued.
fn collect_batch(
    rx: &mut mpsc::UnboundedReceiver<String>,
    first: String,
    batch_size: usize,
) -> Vec<String> {
    let mut batch = vec![first];
    for _ in 0..batch_size {
        match rx.try_recv() {
            Ok(id) => batch.push(id),
            Err(_) => break,
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_storage::JsonFileStorage;
    use crate::testing::MemoryStorage;
    use parley_core::Message;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_config() -> PersistenceConfig {
        PersistenceConfig {
            save_delay_ms: 20,
            batch_size: 8,
            shutdown_timeout_ms: 2_000,
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn session_with(text: &str) -> Session {
        let mut session = Session::new(None);
        session.push_message(Message::user(text), 50);
        session
    }

    #[tokio::test]
    async fn test_collapses_writes_to_one_save() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = PersistenceManager::start(storage.clone(), fast_config());

        let mut session = session_with("first");
        manager.mark_dirty(&session);
        session.push_message(Message::assistant("second"), 50);
        manager.mark_dirty(&session);

        wait_until(|| manager.pending_count() == 0 && storage.save_count() > 0).await;

        assert_eq!(storage.save_count(), 1);
        let stored = storage.get(session.id()).unwrap();
        assert_eq!(stored.messages().len(), 2);
        assert_eq!(stored.revision(), session.revision());
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_round_trip_after_shutdown() {
        let tmp = TempDir::new().unwrap();
        let storage = Arc::new(JsonFileStorage::new(tmp.path()).unwrap());
        let manager = PersistenceManager::start(
            storage,
            PersistenceConfig {
                save_delay_ms: 60_000,
                ..fast_config()
            },
        );

        let session = session_with("remember me");
        manager.mark_dirty(&session);
        manager.shutdown().await.unwrap();

        let reopened = JsonFileStorage::new(tmp.path()).unwrap();
        let loaded = reopened.load(session.id()).unwrap().unwrap();
        assert_eq!(loaded, session);
    }

    #[tokio::test]
    async fn test_failed_save_is_retried() {
        let storage = Arc::new(MemoryStorage::default());
        storage.set_failing(true);
        let manager = PersistenceManager::start(storage.clone(), fast_config());

        let session = session_with("retry");
        manager.mark_dirty(&session);

        wait_until(|| manager.stats().failures >= 1).await;
        assert!(storage.get(session.id()).is_none());

        storage.set_failing(false);
        wait_until(|| storage.get(session.id()).is_some()).await;

        assert_eq!(storage.get(session.id()).unwrap(), session);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_newer_snapshot_survives_failed_save() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = PersistenceManager::start(
            storage.clone(),
            PersistenceConfig {
                save_delay_ms: 60_000,
                ..fast_config()
            },
        );
        storage.set_failing(true);

        let mut session = session_with("v1");
        manager.mark_dirty(&session);
        manager.flush().await;
        assert_eq!(manager.pending_count(), 1);

        session.push_message(Message::assistant("v2"), 50);
        manager.mark_dirty(&session);
        storage.set_failing(false);
        manager.flush().await;

        assert_eq!(storage.get(session.id()).unwrap().messages().len(), 2);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_drops_pending_write() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = PersistenceManager::start(
            storage.clone(),
            PersistenceConfig {
                save_delay_ms: 60_000,
                ..fast_config()
            },
        );

        let session = session_with("gone soon");
        manager.save_now(&session).await.unwrap();
        manager.mark_dirty(&session);
        manager.delete(session.id()).await.unwrap();

        assert_eq!(manager.pending_count(), 0);
        manager.shutdown().await.unwrap();
        assert!(storage.get(session.id()).is_none());
    }

    #[tokio::test]
    async fn test_save_now_keeps_newer_pending_snapshot() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = PersistenceManager::start(
            storage.clone(),
            PersistenceConfig {
                save_delay_ms: 60_000,
                ..fast_config()
            },
        );

        let old = session_with("old");
        let mut newer = old.clone();
        newer.push_message(Message::assistant("newer"), 50);

        manager.mark_dirty(&newer);
        manager.save_now(&old).await.unwrap();
        assert_eq!(manager.pending_count(), 1);

        manager.save_now(&newer).await.unwrap();
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(storage.get(newer.id()).unwrap(), newer);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_mark_is_ignored() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = PersistenceManager::start(
            storage.clone(),
            PersistenceConfig {
                save_delay_ms: 60_000,
                ..fast_config()
            },
        );

        let old = session_with("old");
        let mut newer = old.clone();
        newer.set_title(Some("New".to_string()));

        manager.mark_dirty(&newer);
        manager.mark_dirty(&old);
        manager.shutdown().await.unwrap();

        assert_eq!(storage.get(old.id()).unwrap().title(), Some("New"));
    }

    #[tokio::test]
    async fn test_load_prefers_pending_snapshot() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = PersistenceManager::start(
            storage.clone(),
            PersistenceConfig {
                save_delay_ms: 60_000,
                ..fast_config()
            },
        );

        let mut session = session_with("a");
        manager.save_now(&session).await.unwrap();
        session.set_title(Some("Pending".to_string()));
        manager.mark_dirty(&session);

        let loaded = manager.load(session.id()).await.unwrap().unwrap();
        assert_eq!(loaded.title(), Some("Pending"));
        assert!(manager.load("missing").await.unwrap().is_none());
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_stops_accepting() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = PersistenceManager::start(storage.clone(), fast_config());

        manager.shutdown().await.unwrap();
        manager.shutdown().await.unwrap();
        assert!(!manager.is_running());
        assert!(storage.is_closed());

        assert!(!manager.mark_dirty(&session_with("late")));
        assert_eq!(manager.pending_count(), 0);
        assert!(matches!(
            manager.save_now(&session_with("late")).await,
            Err(Error::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_drops_failed_saves() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = PersistenceManager::start(
            storage.clone(),
            PersistenceConfig {
                save_delay_ms: 60_000,
                ..fast_config()
            },
        );
        storage.set_failing(true);

        manager.mark_dirty(&session_with("lost"));
        manager.shutdown().await.unwrap();

        assert_eq!(manager.pending_count(), 0);
        assert!(manager.stats().failures >= 1);
        assert_eq!(storage.save_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_save_retried_under_steady_traffic() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = PersistenceManager::start(
            storage.clone(),
            PersistenceConfig {
                save_delay_ms: 100,
                ..fast_config()
            },
        );
        storage.set_failing(true);

        let unlucky = session_with("unlucky");
        manager.mark_dirty(&unlucky);
        wait_until(|| manager.stats().failures >= 1).await;
        storage.set_failing(false);

        // A busy neighbour signals faster than the quiet period
        let mut busy = session_with("busy");
        for _ in 0..100 {
            if storage.get(unlucky.id()).is_some() {
                break;
            }
            busy.set_title(Some(format!("rev {}", busy.revision())));
            manager.mark_dirty(&busy);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(storage.get(unlucky.id()).unwrap(), unlucky);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded_when_storage_hangs() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = PersistenceManager::start(
            storage.clone(),
            PersistenceConfig {
                shutdown_timeout_ms: 200,
                ..fast_config()
            },
        );

        let gate = storage.hold();
        manager.mark_dirty(&session_with("stuck"));
        wait_until(|| storage.attempt_count() == 1).await;
        // Left for the shutdown drain, which runs out of time on it
        manager.mark_dirty(&session_with("queued"));

        let started = std::time::Instant::now();
        manager.shutdown().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!manager.is_running());
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(storage.save_count(), 0);
        assert!(!storage.is_closed());

        drop(gate);
    }

    #[test]
    fn test_batch_is_first_signal_plus_batch_size() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..5 {
            tx.send(format!("s{}", i)).unwrap();
        }

        let first = rx.try_recv().unwrap();
        let batch = collect_batch(&mut rx, first, 2);
        assert_eq!(batch, vec!["s0", "s1", "s2"]);
        assert_eq!(collect_batch(&mut rx, "s1".to_string(), 8), vec!["s1", "s3", "s4"]);
    }
}
