//! In-memory session registry.
//!
//! [`SessionStore`] owns every live session. Each session sits behind its own
//! lock, so unrelated sessions never contend, and every mutation hands a
//! fresh snapshot to the [`PersistenceManager`] while that lock is held.
//! Callers only ever receive owned copies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info};

use parley_core::{
    session::DEFAULT_TITLE_MAX_CHARS, CompressionConfig, CompressionStrategy, Config, Error,
    Message, Result, Session, SessionLink,
};

use crate::compaction::{self, summary_message, CompressionResult, Summarizer, TimeoutSummarizer};
use crate::context::{total_tokens, ContextUsage, TokenEstimator};
use crate::persistence::PersistenceManager;

/// Registry-wide settings, normally taken from [`Config`].
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Compression settings given to new sessions.
    pub compression_defaults: CompressionConfig,
    /// Maximum length of a derived title.
    pub title_max_chars: usize,
    /// Characters per token for local estimates.
    pub chars_per_token: f32,
    /// Upper bound for a single summarizer call.
    pub summarizer_timeout: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            compression_defaults: CompressionConfig::default(),
            title_max_chars: DEFAULT_TITLE_MAX_CHARS,
            chars_per_token: 4.0,
            summarizer_timeout: Duration::from_secs(120),
        }
    }
}

impl StoreSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            compression_defaults: config.compaction.defaults.clone(),
            title_max_chars: config.sessions.title_max_chars,
            chars_per_token: config.compaction.chars_per_token,
            summarizer_timeout: config.compaction.summarizer_timeout(),
        }
    }
}

/// Summary of a session for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: Option<String>,
    pub link: Option<SessionLink>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub message_count: usize,
    pub archived_count: usize,
    pub total_tokens: u64,
    pub compression_count: u32,
}

impl SessionSummary {
    fn of(session: &Session) -> Self {
        Self {
            id: session.id().to_string(),
            title: session.title().map(str::to_string),
            link: session.link().cloned(),
            created_at: session.created_at(),
            last_accessed_at: session.last_accessed_at(),
            message_count: session.messages().len(),
            archived_count: session.archived_messages().len(),
            total_tokens: total_tokens(session.messages()),
            compression_count: session.compression_count(),
        }
    }
}

/// A registered session and its locks.
struct SessionHandle {
    session: Mutex<Session>,
    /// Set under the session lock when the session is deleted.
    deleted: AtomicBool,
    /// Held for the whole of a compaction pass.
    compaction: tokio::sync::Mutex<()>,
}

impl SessionHandle {
    fn new(session: Session) -> Arc<Self> {
        Arc::new(Self {
            session: Mutex::new(session),
            deleted: AtomicBool::new(false),
            compaction: tokio::sync::Mutex::new(()),
        })
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }
}

fn not_found(id: &str) -> Error {
    Error::NotFound(format!("session '{}'", id))
}

/// Concurrent registry of live sessions.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    persistence: Arc<PersistenceManager>,
    settings: StoreSettings,
    estimator: TokenEstimator,
}

impl SessionStore {
    pub fn new(persistence: Arc<PersistenceManager>, settings: StoreSettings) -> Self {
        let estimator = TokenEstimator::new(settings.chars_per_token);
        Self {
            sessions: RwLock::new(HashMap::new()),
            persistence,
            settings,
            estimator,
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn persistence(&self) -> &Arc<PersistenceManager> {
        &self.persistence
    }

    /// Load every persisted session into memory.
    ///
    /// Sessions already registered are left alone. Returns how many were added.
    pub async fn restore(&self) -> Result<usize> {
        let stored = self.persistence.load_all().await?;
        let total = stored.len();

        let mut sessions = self.sessions.write();
        let mut added = 0;
        for session in stored {
            if sessions.contains_key(session.id()) {
                continue;
            }
            sessions.insert(session.id().to_string(), SessionHandle::new(session));
            added += 1;
        }

        info!(restored = added, stored = total, "Restored sessions");
        Ok(added)
    }

    /// Create an empty session and return its id.
    pub fn create(&self, link: Option<SessionLink>) -> Result<String> {
        self.ensure_running()?;

        let session =
            Session::new(link).with_compression_config(self.settings.compression_defaults.clone());
        let id = session.id().to_string();

        if !self.persistence.mark_dirty(&session) {
            return Err(Error::ShuttingDown);
        }
        self.sessions
            .write()
            .insert(id.clone(), SessionHandle::new(session));

        debug!(session_id = %id, "Created session");
        Ok(id)
    }

    /// Owned snapshot of a session. Counts as an access.
    ///
    /// The new `last_accessed_at` is not queued for saving on its own; it
    /// reaches storage with the session's next mutation.
    pub fn get(&self, id: &str) -> Result<Session> {
        let handle = self.handle(id)?;
        let mut session = handle.session.lock();
        if handle.is_deleted() {
            return Err(not_found(id));
        }
        session.touch();
        Ok(session.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a message.
    ///
    /// The first user message of an untitled session names it. Messages
    /// without a token estimate get one.
    pub fn add_message(&self, id: &str, mut message: Message) -> Result<()> {
        self.estimator.annotate(&mut message);
        let title_max = self.settings.title_max_chars;

        let titled = self.mutate(id, |session| Ok(session.push_message(message, title_max)))?;
        if titled {
            debug!(session_id = %id, "Derived session title");
        }
        Ok(())
    }

    /// Append to an existing session, or to a new one when no id is given.
    pub fn append_or_create(&self, id: Option<&str>, message: Message) -> Result<String> {
        let id = match id {
            Some(id) => id.to_string(),
            None => self.create(None)?,
        };
        self.add_message(&id, message)?;
        Ok(id)
    }

    /// Set or clear the title. Blank titles clear it.
    pub fn update_title(&self, id: &str, title: Option<String>) -> Result<()> {
        let title = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        self.mutate(id, |session| {
            session.set_title(title);
            Ok(())
        })
    }

    /// Drop the active history, keeping the archive and settings.
    pub fn clear(&self, id: &str) -> Result<()> {
        self.mutate(id, |session| {
            session.clear_messages();
            Ok(())
        })
    }

    pub fn set_compression_config(&self, id: &str, config: CompressionConfig) -> Result<()> {
        config.ensure_valid()?;
        self.mutate(id, |session| {
            session.set_compression_config(config);
            Ok(())
        })
    }

    /// Deep-copy a session into a new, unlinked one and return the new id.
    pub fn copy(&self, id: &str) -> Result<String> {
        self.ensure_running()?;
        let source = self.get(id)?;

        let copy = source.duplicate(uuid::Uuid::new_v4().to_string());
        let new_id = copy.id().to_string();

        if !self.persistence.mark_dirty(&copy) {
            return Err(Error::ShuttingDown);
        }
        self.sessions
            .write()
            .insert(new_id.clone(), SessionHandle::new(copy));

        debug!(source = %id, session_id = %new_id, "Copied session");
        Ok(new_id)
    }

    /// Remove a session from memory and storage.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.ensure_running()?;

        let handle = self
            .sessions
            .write()
            .remove(id)
            .ok_or_else(|| not_found(id))?;
        {
            let _session = handle.session.lock();
            handle.deleted.store(true, Ordering::Release);
        }

        self.persistence.delete(id).await?;
        info!(session_id = %id, "Deleted session");
        Ok(())
    }

    /// All sessions, most recently accessed first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let handles: Vec<Arc<SessionHandle>> = self.sessions.read().values().cloned().collect();

        let mut summaries: Vec<SessionSummary> = handles
            .iter()
            .map(|h| SessionSummary::of(&h.session.lock()))
            .collect();
        summaries.sort_by(|a, b| b.last_accessed_at.cmp(&a.last_accessed_at));
        summaries
    }

    /// Resolve a full id or a unique id prefix.
    pub fn resolve_prefix(&self, prefix: &str) -> Result<String> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Err(Error::Validation("session id must not be empty".to_string()));
        }

        let sessions = self.sessions.read();
        if sessions.contains_key(prefix) {
            return Ok(prefix.to_string());
        }

        let matches: Vec<&String> = sessions.keys().filter(|id| id.starts_with(prefix)).collect();
        match matches.as_slice() {
            [] => Err(not_found(prefix)),
            [id] => Ok((*id).clone()),
            _ => Err(Error::AmbiguousPrefix {
                prefix: prefix.to_string(),
                count: matches.len(),
            }),
        }
    }

    /// Token usage of the active history.
    pub fn context_usage(&self, id: &str, context_window: Option<u64>) -> Result<ContextUsage> {
        let session = self.get(id)?;
        Ok(ContextUsage::measure(session.messages(), context_window))
    }

    /// Compact a session with its configured strategy.
    pub async fn compact(
        &self,
        id: &str,
        summarizer: &dyn Summarizer,
        context_window: Option<u64>,
    ) -> Result<CompressionResult> {
        let result = self.run_compaction(id, summarizer, context_window, false).await?;
        result.ok_or_else(|| Error::Internal("compaction skipped unexpectedly".to_string()))
    }

    /// Compact only when the session has crossed its strategy's threshold.
    pub async fn compact_if_needed(
        &self,
        id: &str,
        summarizer: &dyn Summarizer,
        context_window: Option<u64>,
    ) -> Result<Option<CompressionResult>> {
        self.run_compaction(id, summarizer, context_window, true).await
    }

    /// Write a session to storage now.
    pub async fn save_now(&self, id: &str) -> Result<()> {
        let snapshot = self.get(id)?;
        self.persistence.save_now(&snapshot).await
    }

    /// Stop background persistence after writing everything pending.
    pub async fn shutdown(&self) -> Result<()> {
        self.persistence.shutdown().await
    }

    async fn run_compaction(
        &self,
        id: &str,
        summarizer: &dyn Summarizer,
        context_window: Option<u64>,
        only_if_needed: bool,
    ) -> Result<Option<CompressionResult>> {
        self.ensure_running()?;
        let handle = self.handle(id)?;

        // One pass per session at a time; later callers see its outcome
        let _pass = handle.compaction.lock().await;

        let (snapshot, config) = {
            let mut session = handle.session.lock();
            if handle.is_deleted() {
                return Err(not_found(id));
            }
            session.touch();
            (
                session.messages().to_vec(),
                session.compression_config().clone(),
            )
        };

        if only_if_needed && !compaction::should_compress(&snapshot, &config, context_window) {
            return Ok(None);
        }

        let bounded = TimeoutSummarizer::new(summarizer, self.settings.summarizer_timeout);
        let result = compaction::compress(&snapshot, &config, &bounded).await;
        if result.is_noop() {
            return Ok(Some(result));
        }

        let summary = match config.strategy {
            CompressionStrategy::SlidingWindow => None,
            CompressionStrategy::FullReplacement | CompressionStrategy::TokenBased => result
                .summary
                .as_deref()
                .map(|s| summary_message(s, result.archived_messages.len())),
        };

        self.mutate_handle(&handle, id, |session| {
            let current = session.messages();
            if current.len() < snapshot.len() || current[..snapshot.len()] != snapshot[..] {
                return Err(Error::Conflict(format!(
                    "session '{}' changed during compaction",
                    id
                )));
            }
            let appended = current[snapshot.len()..].to_vec();

            let mut messages = Vec::with_capacity(result.new_messages.len() + appended.len() + 1);
            messages.extend(summary);
            messages.extend(result.new_messages.iter().cloned());
            messages.extend(appended);

            session.apply_compaction(messages, result.archived_messages.clone());
            Ok(())
        })?;

        info!(
            session_id = %id,
            strategy = %config.strategy,
            archived = result.archived_messages.len(),
            ratio = result.compression_ratio(),
            used_fallback = result.used_fallback,
            "Compacted session"
        );
        Ok(Some(result))
    }

    fn handle(&self, id: &str) -> Result<Arc<SessionHandle>> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    fn mutate<T>(&self, id: &str, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        let handle = self.handle(id)?;
        self.mutate_handle(&handle, id, f)
    }

    /// Apply `f` under the session lock and mark the result dirty.
    fn mutate_handle<T>(
        &self,
        handle: &SessionHandle,
        id: &str,
        f: impl FnOnce(&mut Session) -> Result<T>,
    ) -> Result<T> {
        let mut session = handle.session.lock();
        if handle.is_deleted() {
            return Err(not_found(id));
        }
        self.ensure_running()?;

        let out = f(&mut session)?;
        if !self.persistence.mark_dirty(&session) {
            // Shutdown began while `f` ran; the change stays in memory only
            return Err(Error::ShuttingDown);
        }
        Ok(out)
    }

    fn ensure_running(&self) -> Result<()> {
        if !self.persistence.is_running() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }
}
