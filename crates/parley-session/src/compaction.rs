//! Context compaction.
//!
//! Three interchangeable strategies shrink a message history with the help
//! of a caller-supplied [`Summarizer`]. Compaction never fails: when the
//! summarizer errors, times out or returns nothing, a deterministic fallback
//! summary built from the messages themselves is used instead.
//!
//! The engine only computes results. Applying them to a session (and
//! inserting the summary message for strategies that leave that to the
//! caller) is done by [`crate::registry::SessionStore::compact`].
//!
//! Nothing here depends on a particular async runtime except
//! [`TimeoutSummarizer`], which uses tokio's timer.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use parley_core::{CompressionConfig, CompressionStrategy, Error, Message, Role};

use crate::context::total_tokens;

/// Messages quoted in a fallback summary.
const FALLBACK_EXCERPT_MESSAGES: usize = 3;
/// Characters per quoted excerpt.
const FALLBACK_EXCERPT_CHARS: usize = 100;

/// Condenses a list of messages into text, usually by calling an LLM.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize the given messages.
    async fn summarize(&self, messages: &[Message]) -> anyhow::Result<String>;
}

#[async_trait]
impl<T: Summarizer + ?Sized> Summarizer for &T {
    async fn summarize(&self, messages: &[Message]) -> anyhow::Result<String> {
        (**self).summarize(messages).await
    }
}

#[async_trait]
impl<T: Summarizer + ?Sized> Summarizer for Arc<T> {
    async fn summarize(&self, messages: &[Message]) -> anyhow::Result<String> {
        (**self).summarize(messages).await
    }
}

/// Adapts an async closure into a [`Summarizer`].
///
/// ```rust,ignore
/// let summarizer = FnSummarizer(|messages: Vec<Message>| async move {
///     provider.complete(build_summary_prompt(&messages)).await
/// });
/// ```
pub struct FnSummarizer<F>(pub F);

#[async_trait]
impl<F, Fut> Summarizer for FnSummarizer<F>
where
    F: Fn(Vec<Message>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<String>> + Send,
{
    async fn summarize(&self, messages: &[Message]) -> anyhow::Result<String> {
        (self.0)(messages.to_vec()).await
    }
}

/// Bounds every call of the wrapped summarizer.
pub struct TimeoutSummarizer<S> {
    inner: S,
    timeout: Duration,
}

impl<S> TimeoutSummarizer<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl<S: Summarizer> Summarizer for TimeoutSummarizer<S> {
    async fn summarize(&self, messages: &[Message]) -> anyhow::Result<String> {
        match tokio::time::timeout(self.timeout, self.inner.summarize(messages)).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("summarizer timed out after {:?}", self.timeout),
        }
    }
}

/// Summarizer that works without a model: it lists what the user asked for
/// and where the assistant left off.
#[derive(Debug, Clone, Default)]
pub struct ExcerptSummarizer;

impl ExcerptSummarizer {
    fn user_goal(message: &Message) -> Option<String> {
        let text = message.content.as_text();
        let text = text.trim();

        // Skip very short messages
        if text.chars().count() < 10 {
            return None;
        }

        Some(truncate_chars(text, 200))
    }
}

#[async_trait]
impl Summarizer for ExcerptSummarizer {
    async fn summarize(&self, messages: &[Message]) -> anyhow::Result<String> {
        let goals: Vec<String> = messages
            .iter()
            .filter(|m| m.role == Role::User)
            .filter_map(Self::user_goal)
            .take(5)
            .collect();

        let mut parts = Vec::new();
        if !goals.is_empty() {
            parts.push("User requested:".to_string());
            for goal in &goals {
                parts.push(format!("- {}", goal));
            }
        }

        let last_reply = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_text())
            .filter(|t| !t.trim().is_empty());
        if let Some(reply) = last_reply {
            parts.push(format!("Last assistant reply: {}", truncate_chars(reply.trim(), 300)));
        }

        if parts.is_empty() {
            return Ok(format!(
                "Compacted {} messages from the conversation.",
                messages.len()
            ));
        }

        Ok(parts.join("\n"))
    }
}

/// Outcome of a compaction pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionResult {
    /// Messages that stay in the active history (see each strategy for what
    /// the caller still prepends).
    pub new_messages: Vec<Message>,
    /// Messages moved to the archive.
    pub archived_messages: Vec<Message>,
    /// Summary text for the caller to insert, when the strategy leaves that to it.
    pub summary: Option<String>,
    /// Whether a summary (possibly the fallback) was produced.
    pub summary_generated: bool,
    /// Whether the fallback summary replaced the summarizer's output.
    pub used_fallback: bool,
    /// Messages before compaction.
    pub original_message_count: usize,
    /// Messages after compaction, counting the summary message.
    pub new_message_count: usize,
}

impl CompressionResult {
    /// A result that leaves the history untouched.
    pub fn unchanged(messages: &[Message]) -> Self {
        Self {
            new_messages: messages.to_vec(),
            archived_messages: vec![],
            summary: None,
            summary_generated: false,
            used_fallback: false,
            original_message_count: messages.len(),
            new_message_count: messages.len(),
        }
    }

    /// `1 - new / original`, in `[0, 1)`.
    pub fn compression_ratio(&self) -> f64 {
        if self.original_message_count == 0 || self.new_message_count >= self.original_message_count
        {
            return 0.0;
        }
        1.0 - self.new_message_count as f64 / self.original_message_count as f64
    }

    /// Whether the pass changed anything.
    pub fn is_noop(&self) -> bool {
        !self.summary_generated
    }
}

/// A compaction algorithm.
#[async_trait]
pub trait CompactionStrategy: Send + Sync {
    /// Which configured strategy this is.
    fn kind(&self) -> CompressionStrategy;

    /// Whether the history has grown past this strategy's threshold.
    fn should_compress(
        &self,
        messages: &[Message],
        config: &CompressionConfig,
        context_window: Option<u64>,
    ) -> bool;

    /// Shrink the history.
    async fn compress(
        &self,
        messages: &[Message],
        config: &CompressionConfig,
        summarizer: &dyn Summarizer,
    ) -> CompressionResult;
}

/// Summarize everything; the caller inserts one system message with the summary.
pub struct FullReplacement;

#[async_trait]
impl CompactionStrategy for FullReplacement {
    fn kind(&self) -> CompressionStrategy {
        CompressionStrategy::FullReplacement
    }

    fn should_compress(
        &self,
        messages: &[Message],
        config: &CompressionConfig,
        _context_window: Option<u64>,
    ) -> bool {
        !messages.is_empty() && messages.len() >= config.full_replacement_message_threshold
    }

    async fn compress(
        &self,
        messages: &[Message],
        _config: &CompressionConfig,
        summarizer: &dyn Summarizer,
    ) -> CompressionResult {
        if messages.is_empty() {
            return CompressionResult::unchanged(messages);
        }

        let (summary, used_fallback) = summarize_or_fallback(summarizer, messages).await;

        CompressionResult {
            new_messages: vec![],
            archived_messages: messages.to_vec(),
            summary: Some(summary),
            summary_generated: true,
            used_fallback,
            original_message_count: messages.len(),
            new_message_count: 1,
        }
    }
}

/// Summarize all but the last `keep_last` messages into a context message.
pub struct SlidingWindow;

#[async_trait]
impl CompactionStrategy for SlidingWindow {
    fn kind(&self) -> CompressionStrategy {
        CompressionStrategy::SlidingWindow
    }

    fn should_compress(
        &self,
        messages: &[Message],
        config: &CompressionConfig,
        _context_window: Option<u64>,
    ) -> bool {
        !messages.is_empty() && messages.len() >= config.sliding_window_message_threshold
    }

    async fn compress(
        &self,
        messages: &[Message],
        config: &CompressionConfig,
        summarizer: &dyn Summarizer,
    ) -> CompressionResult {
        let keep_last = config.sliding_window_keep_last;
        if messages.len() <= keep_last {
            return CompressionResult::unchanged(messages);
        }

        let split = messages.len() - keep_last;
        let (to_compress, to_keep) = messages.split_at(split);

        let (summary, used_fallback) = summarize_or_fallback(summarizer, to_compress).await;

        let mut new_messages = Vec::with_capacity(to_keep.len() + 1);
        new_messages.push(context_message(&summary, to_compress.len(), to_keep.len()));
        new_messages.extend_from_slice(to_keep);

        CompressionResult {
            new_message_count: new_messages.len(),
            new_messages,
            archived_messages: to_compress.to_vec(),
            summary: Some(summary),
            summary_generated: true,
            used_fallback,
            original_message_count: messages.len(),
        }
    }
}

/// Summarize the oldest messages until the kept tail fits a token budget.
pub struct TokenBased;

impl TokenBased {
    /// Index where the kept tail starts. Always leaves at least one message.
    fn split_index(messages: &[Message], keep_percent: f64) -> usize {
        if messages.is_empty() {
            return 0;
        }

        let budget = total_tokens(messages) as f64 * keep_percent;
        let mut kept: u64 = 0;
        let mut split = messages.len();

        for (i, message) in messages.iter().enumerate().rev() {
            let tokens = u64::from(message.tokens());
            if (kept + tokens) as f64 > budget {
                break;
            }
            kept += tokens;
            split = i;
        }

        split.min(messages.len() - 1)
    }
}

#[async_trait]
impl CompactionStrategy for TokenBased {
    fn kind(&self) -> CompressionStrategy {
        CompressionStrategy::TokenBased
    }

    fn should_compress(
        &self,
        messages: &[Message],
        config: &CompressionConfig,
        context_window: Option<u64>,
    ) -> bool {
        let Some(window) = context_window.filter(|w| *w > 0) else {
            return false;
        };
        if messages.is_empty() {
            return false;
        }

        total_tokens(messages) as f64 >= window as f64 * config.token_based_threshold_percent
    }

    async fn compress(
        &self,
        messages: &[Message],
        config: &CompressionConfig,
        summarizer: &dyn Summarizer,
    ) -> CompressionResult {
        let split = Self::split_index(messages, config.token_based_keep_percent);
        if split == 0 {
            return CompressionResult::unchanged(messages);
        }

        let (to_compress, to_keep) = messages.split_at(split);
        let (summary, used_fallback) = summarize_or_fallback(summarizer, to_compress).await;

        CompressionResult {
            new_messages: to_keep.to_vec(),
            archived_messages: to_compress.to_vec(),
            summary: Some(summary),
            summary_generated: true,
            used_fallback,
            original_message_count: messages.len(),
            // The caller prepends the summary message.
            new_message_count: to_keep.len() + 1,
        }
    }
}

/// The strategy implementation for a configured kind.
pub fn strategy_for(kind: CompressionStrategy) -> &'static dyn CompactionStrategy {
    match kind {
        CompressionStrategy::FullReplacement => &FullReplacement,
        CompressionStrategy::SlidingWindow => &SlidingWindow,
        CompressionStrategy::TokenBased => &TokenBased,
    }
}

/// Threshold check for the configured strategy.
pub fn should_compress(
    messages: &[Message],
    config: &CompressionConfig,
    context_window: Option<u64>,
) -> bool {
    strategy_for(config.strategy).should_compress(messages, config, context_window)
}

/// Compact with the configured strategy.
pub async fn compress(
    messages: &[Message],
    config: &CompressionConfig,
    summarizer: &dyn Summarizer,
) -> CompressionResult {
    strategy_for(config.strategy)
        .compress(messages, config, summarizer)
        .await
}

/// Run the summarizer, substituting the fallback summary on failure.
async fn summarize_or_fallback(summarizer: &dyn Summarizer, messages: &[Message]) -> (String, bool) {
    match summarizer.summarize(messages).await {
        Ok(text) if !text.trim().is_empty() => (text.trim().to_string(), false),
        Ok(_) => {
            tracing::warn!(
                messages = messages.len(),
                "Summarizer returned empty text, using fallback summary"
            );
            (fallback_summary(messages), true)
        }
        Err(e) => {
            let err = Error::Summarization(format!("{:#}", e));
            tracing::warn!(
                messages = messages.len(),
                error = %err,
                "Using fallback summary"
            );
            (fallback_summary(messages), true)
        }
    }
}

/// Deterministic summary used when the summarizer is unavailable.
pub fn fallback_summary(messages: &[Message]) -> String {
    let user = messages.iter().filter(|m| m.role == Role::User).count();
    let assistant = messages.iter().filter(|m| m.role == Role::Assistant).count();

    let mut summary = format!(
        "Earlier conversation of {} messages ({} from the user, {} from the assistant).",
        messages.len(),
        user,
        assistant
    );

    let excerpts: Vec<String> = messages
        .iter()
        .take(FALLBACK_EXCERPT_MESSAGES)
        .map(|m| {
            format!(
                "- {}: {}",
                m.role.label(),
                truncate_chars(m.content.as_text().trim(), FALLBACK_EXCERPT_CHARS)
            )
        })
        .collect();

    if !excerpts.is_empty() {
        summary.push_str("\nIt began with:\n");
        summary.push_str(&excerpts.join("\n"));
    }

    summary
}

/// The system message a sliding-window pass puts in front of the kept tail.
pub fn context_message(summary: &str, compacted: usize, kept: usize) -> Message {
    Message::system(format!(
        "[Summary of {} earlier messages; the {} most recent messages follow]\n\n{}",
        compacted, kept, summary
    ))
}

/// The system message inserted for full-replacement and token-based passes.
pub fn summary_message(summary: &str, archived: usize) -> Message {
    Message::system(format!(
        "[Summary of {} earlier messages]\n\n{}",
        archived, summary
    ))
}

/// Build the prompt an invoking service sends to its model for a summary.
pub fn build_summary_prompt(messages: &[Message]) -> String {
    let mut prompt_parts = Vec::new();

    prompt_parts.push(
        "Summarize the following conversation concisely, focusing on:
1. What the user wanted to accomplish
2. What was answered or decided
3. Any open questions or pending work

Keep the summary under 500 words. Be factual and specific."
            .to_string(),
    );

    prompt_parts.push("\n## Conversation to Summarize".to_string());

    for msg in messages {
        let content = msg.content.as_text();
        prompt_parts.push(format!(
            "\n**{}**: {}",
            msg.role.label(),
            truncate_chars(&content, 500)
        ));
    }

    prompt_parts.join("\n")
}

/// Truncate on a character boundary, marking the cut with `...`.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut)
}
