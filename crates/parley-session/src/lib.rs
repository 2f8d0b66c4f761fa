//! # parley-session
//!
//! Session lifecycle, context compaction and write-behind persistence for
//! Parley.
//!
//! This crate provides:
//! - A concurrent in-memory session registry with CRUD and prefix lookup
//! - Three compaction strategies driven by a pluggable summarizer
//! - A background persistence manager that batches writes
//! - JSON-file and SQLite storage backends
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use parley_session::{open_backend, PersistenceManager, SessionStore, StoreSettings};
//!
//! let config = parley_core::Config::load_validated()?;
//! let storage = open_backend(config.storage.backend, config.storage.data_dir())?;
//! let persistence = PersistenceManager::start(storage, config.persistence.clone());
//!
//! let store = SessionStore::new(persistence, StoreSettings::from_config(&config));
//! store.restore().await?;
//!
//! let id = store.append_or_create(None, Message::user("Hello"))?;
//! store.compact_if_needed(&id, &summarizer, Some(128_000)).await?;
//!
//! store.shutdown().await?;
//! ```
//!
//! ## Storage Layout
//!
//! - JSON backend: `<data_dir>/sessions/<id>.json`
//! - SQLite backend: `<data_dir>/sessions.db`

pub mod compaction;
pub mod context;
pub mod json_storage;
pub mod persistence;
pub mod registry;
pub mod sqlite_storage;
pub mod storage;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use compaction::{
    build_summary_prompt, compress, should_compress, CompactionStrategy, CompressionResult,
    ExcerptSummarizer, FnSummarizer, Summarizer, TimeoutSummarizer,
};
pub use context::{total_tokens, ContextUsage, TokenEstimator};
pub use json_storage::JsonFileStorage;
pub use persistence::{PersistenceManager, PersistenceStats};
pub use registry::{SessionStore, SessionSummary, StoreSettings};
pub use sqlite_storage::SqliteStorage;
pub use storage::{open_backend, SessionStorage};
