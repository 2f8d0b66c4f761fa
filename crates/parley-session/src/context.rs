//! Context window accounting.
//!
//! Tracks token usage for a message history. Provider-reported counts win;
//! locally estimated counts fill the gaps; messages with neither count as zero.

use serde::{Deserialize, Serialize};

use parley_core::{Message, MessageMetadata};

/// Count total tokens in a slice of messages.
pub fn total_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(|m| u64::from(m.tokens())).sum()
}

/// Character-based token estimator.
#[derive(Debug, Clone, Copy)]
pub struct TokenEstimator {
    chars_per_token: f32,
}

impl TokenEstimator {
    pub fn new(chars_per_token: f32) -> Self {
        Self { chars_per_token }
    }

    /// Estimate tokens for a message's content.
    pub fn estimate(&self, message: &Message) -> u32 {
        let chars = message.content.char_len() as f32;
        (chars / self.chars_per_token).ceil() as u32
    }

    /// Fill in `estimated_tokens` when the message carries no estimate yet.
    pub fn annotate(&self, message: &mut Message) {
        let has_estimate = message
            .metadata
            .map(|m| m.estimated_tokens.is_some())
            .unwrap_or(false);
        if has_estimate {
            return;
        }

        let estimate = self.estimate(message);
        let metadata = message.metadata.get_or_insert_with(MessageMetadata::default);
        metadata.estimated_tokens = Some(estimate);
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(4.0)
    }
}

/// Current context usage statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextUsage {
    /// Total tokens in the active history.
    pub total_tokens: u64,
    /// Number of messages in the active history.
    pub message_count: usize,
    /// Fraction of the context window used, when the window is known.
    pub usage_percent: Option<f64>,
}

impl ContextUsage {
    /// Measure a history against an optional context window.
    pub fn measure(messages: &[Message], context_window: Option<u64>) -> Self {
        let total = total_tokens(messages);
        let usage_percent = context_window
            .filter(|w| *w > 0)
            .map(|w| total as f64 / w as f64);

        Self {
            total_tokens: total,
            message_count: messages.len(),
            usage_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_tokens_prefers_actual() {
        let messages = vec![
            Message::user("a").with_actual_tokens(10).with_estimated_tokens(99),
            Message::assistant("b").with_estimated_tokens(5),
            Message::user("c"),
        ];
        assert_eq!(total_tokens(&messages), 15);
    }

    #[test]
    fn test_estimate_rounds_up() {
        let estimator = TokenEstimator::default();
        // 27 chars / 4 = 6.75 -> 7
        assert_eq!(estimator.estimate(&Message::user("Hello, how are you today?!!")), 7);
        assert_eq!(estimator.estimate(&Message::user("")), 0);
    }

    #[test]
    fn test_annotate_keeps_existing_estimate() {
        let estimator = TokenEstimator::new(1.0);

        let mut msg = Message::user("abcd").with_actual_tokens(2);
        estimator.annotate(&mut msg);
        assert_eq!(msg.metadata.unwrap().estimated_tokens, Some(4));
        assert_eq!(msg.tokens(), 2);

        let mut msg = Message::user("abcd").with_estimated_tokens(1);
        estimator.annotate(&mut msg);
        assert_eq!(msg.tokens(), 1);
    }

    #[test]
    fn test_context_usage() {
        let messages = vec![
            Message::user("a").with_actual_tokens(300),
            Message::assistant("b").with_actual_tokens(200),
        ];
        let usage = ContextUsage::measure(&messages, Some(1000));
        assert_eq!(usage.total_tokens, 500);
        assert_eq!(usage.message_count, 2);
        assert_eq!(usage.usage_percent, Some(0.5));

        assert!(ContextUsage::measure(&messages, None).usage_percent.is_none());
    }
}
