//! Session and compression settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ValidationResult;
use crate::error::{Error, Result};
use crate::message::{Message, Role};

/// Algorithm used to shrink a session's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionStrategy {
    /// Summarize everything into a single system message
    FullReplacement,
    /// Summarize all but the most recent messages
    SlidingWindow,
    /// Summarize the oldest messages until a token budget is met
    TokenBased,
}

impl std::fmt::Display for CompressionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompressionStrategy::FullReplacement => "full_replacement",
            CompressionStrategy::SlidingWindow => "sliding_window",
            CompressionStrategy::TokenBased => "token_based",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for CompressionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "full_replacement" | "full" => Ok(CompressionStrategy::FullReplacement),
            "sliding_window" | "sliding" => Ok(CompressionStrategy::SlidingWindow),
            "token_based" | "tokens" => Ok(CompressionStrategy::TokenBased),
            other => Err(Error::Validation(format!(
                "unknown compression strategy '{}'",
                other
            ))),
        }
    }
}

/// Per-session compression settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Active strategy
    pub strategy: CompressionStrategy,
    /// Message count that triggers a full replacement
    pub full_replacement_message_threshold: usize,
    /// Message count that triggers a sliding-window pass
    pub sliding_window_message_threshold: usize,
    /// Messages kept verbatim by the sliding window
    pub sliding_window_keep_last: usize,
    /// Fraction of the context window that triggers token-based compaction
    pub token_based_threshold_percent: f64,
    /// Fraction of the current tokens kept after token-based compaction
    pub token_based_keep_percent: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            strategy: CompressionStrategy::SlidingWindow,
            full_replacement_message_threshold: 40,
            sliding_window_message_threshold: 30,
            sliding_window_keep_last: 10,
            token_based_threshold_percent: 0.8,
            token_based_keep_percent: 0.3,
        }
    }
}

impl CompressionConfig {
    /// Check thresholds, collecting errors and warnings under `prefix`.
    pub fn validate_into(&self, prefix: &str, result: &mut ValidationResult) {
        let field = |name: &str| format!("{}{}", prefix, name);

        if self.full_replacement_message_threshold == 0 {
            result.add_error(
                field("full_replacement_message_threshold"),
                "must be greater than 0",
            );
        }

        if self.sliding_window_message_threshold == 0 {
            result.add_error(
                field("sliding_window_message_threshold"),
                "must be greater than 0",
            );
        }

        if self.sliding_window_keep_last == 0 {
            result.add_error(field("sliding_window_keep_last"), "must be greater than 0");
        } else if self.sliding_window_keep_last + 1 >= self.sliding_window_message_threshold {
            result.add_warning(
                field("sliding_window_keep_last"),
                "keep_last + 1 reaches the threshold; every compaction result will qualify again",
            );
        }

        let threshold = self.token_based_threshold_percent;
        if !threshold.is_finite() || threshold <= 0.0 || threshold > 1.0 {
            result.add_error(
                field("token_based_threshold_percent"),
                format!("must be in (0, 1], got {}", threshold),
            );
        }

        let keep = self.token_based_keep_percent;
        if !keep.is_finite() || !(0.0..1.0).contains(&keep) {
            result.add_error(
                field("token_based_keep_percent"),
                format!("must be in [0, 1), got {}", keep),
            );
        }
    }

    /// Validate and fail on the first class of errors.
    pub fn ensure_valid(&self) -> Result<()> {
        let mut result = ValidationResult::new();
        self.validate_into("", &mut result);
        result.into_result()
    }
}

/// The entity a session belongs to. A session has at most one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionLink {
    /// Owned by a configured assistant
    Assistant(String),
    /// Created by a recurring task run
    ScheduledTask(String),
    /// Created by a multi-assistant pipeline
    Pipeline(String),
}

/// Default maximum length of a derived title.
pub const DEFAULT_TITLE_MAX_CHARS: usize = 50;

/// Derive a session title from the first user message.
///
/// Returns `None` when the text has no visible characters.
pub fn derive_title(text: &str, max_chars: usize) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }

    if collapsed.chars().count() <= max_chars {
        Some(collapsed)
    } else {
        let truncated: String = collapsed.chars().take(max_chars).collect();
        Some(format!("{}...", truncated.trim_end()))
    }
}

/// A conversation with its active history and archive.
///
/// Histories are only changed through the methods below, which keep the
/// archive append-only and bump the revision on every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    id: String,
    title: Option<String>,
    messages: Vec<Message>,
    #[serde(default)]
    archived_messages: Vec<Message>,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    #[serde(default)]
    compression_config: CompressionConfig,
    #[serde(default)]
    compression_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    link: Option<SessionLink>,
    #[serde(default)]
    revision: u64,
}

impl Session {
    /// Create a new empty session.
    pub fn new(link: Option<SessionLink>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), link)
    }

    /// Create a new empty session with a caller-chosen id.
    pub fn with_id(id: impl Into<String>, link: Option<SessionLink>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: None,
            messages: vec![],
            archived_messages: vec![],
            created_at: now,
            last_accessed_at: now,
            compression_config: CompressionConfig::default(),
            compression_count: 0,
            link,
            revision: 0,
        }
    }

    /// Use the given compression settings.
    pub fn with_compression_config(mut self, config: CompressionConfig) -> Self {
        self.compression_config = config;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn archived_messages(&self) -> &[Message] {
        &self.archived_messages
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_accessed_at(&self) -> DateTime<Utc> {
        self.last_accessed_at
    }

    pub fn compression_config(&self) -> &CompressionConfig {
        &self.compression_config
    }

    pub fn compression_count(&self) -> u32 {
        self.compression_count
    }

    pub fn link(&self) -> Option<&SessionLink> {
        self.link.as_ref()
    }

    /// Mutation counter, used to order snapshots of the same session.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Advance `last_accessed_at`, never moving it backwards.
    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now().max(self.last_accessed_at);
    }

    fn bump(&mut self) {
        self.revision += 1;
        self.touch();
    }

    /// Append a message.
    ///
    /// The first user message of an untitled session also sets the title.
    /// Returns `true` when a title was derived.
    pub fn push_message(&mut self, message: Message, title_max_chars: usize) -> bool {
        let derive = self.title.is_none()
            && message.role == Role::User
            && !self.has_user_message();

        let mut titled = false;
        if derive {
            if let Some(title) = derive_title(&message.content.as_text(), title_max_chars) {
                self.title = Some(title);
                titled = true;
            }
        }

        self.messages.push(message);
        self.bump();
        titled
    }

    fn has_user_message(&self) -> bool {
        self.messages
            .iter()
            .chain(self.archived_messages.iter())
            .any(|m| m.role == Role::User)
    }

    pub fn set_title(&mut self, title: Option<String>) {
        self.title = title;
        self.bump();
    }

    /// Drop the active history. The archive and settings are kept.
    pub fn clear_messages(&mut self) {
        self.messages.clear();
        self.bump();
    }

    pub fn set_compression_config(&mut self, config: CompressionConfig) {
        self.compression_config = config;
        self.bump();
    }

    /// Replace the active history after a compaction pass and archive the
    /// removed messages.
    pub fn apply_compaction(&mut self, messages: Vec<Message>, archived: Vec<Message>) {
        self.messages = messages;
        self.archived_messages.extend(archived);
        self.compression_count += 1;
        self.bump();
    }

    /// Deep copy into a new, unlinked session.
    pub fn duplicate(&self, new_id: impl Into<String>) -> Session {
        let mut copy = Session::with_id(new_id, None);
        copy.title = self.title.as_ref().map(|t| format!("{} (copy)", t));
        copy.messages = self.messages.clone();
        copy.archived_messages = self.archived_messages.clone();
        copy.compression_config = self.compression_config.clone();
        copy
    }
}
