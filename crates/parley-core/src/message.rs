//! Message and conversation primitives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message (instructions, summaries)
    System,
    /// User message
    User,
    /// Assistant response
    Assistant,
}

impl Role {
    /// Human-readable label used in prompts and summaries.
    pub fn label(&self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// Message content types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    /// Plain text content
    Text(String),
    /// Sequence of typed blocks (multimodal, tool traffic)
    Blocks(Vec<ContentBlock>),
}

impl Content {
    /// Create text content.
    pub fn text(s: impl Into<String>) -> Self {
        Content::Text(s.into())
    }

    /// Get content as text (concatenates text blocks if needed).
    pub fn as_text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::ToolResult { content, .. } => Some(content.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Number of characters that count towards the token estimate.
    pub fn char_len(&self) -> usize {
        match self {
            Content::Text(s) => s.chars().count(),
            Content::Blocks(blocks) => blocks.iter().map(ContentBlock::char_len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(s) => s.is_empty(),
            Content::Blocks(blocks) => blocks.is_empty(),
        }
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

/// A typed content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    /// Text content
    #[serde(rename = "text")]
    Text { text: String },
    /// Image content
    #[serde(rename = "image")]
    Image {
        /// Base64-encoded image data or URL
        source: ImageSource,
    },
    /// Tool use request emitted by the assistant
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Tool result fed back to the model
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    fn char_len(&self) -> usize {
        match self {
            ContentBlock::Text { text } => text.chars().count(),
            ContentBlock::ToolUse { name, input, .. } => {
                name.chars().count() + input.to_string().chars().count()
            }
            ContentBlock::ToolResult { content, .. } => content.chars().count(),
            // Images are priced by the provider, not by characters.
            ContentBlock::Image { .. } => 0,
        }
    }
}

/// Image source for multimodal content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ImageSource {
    /// Base64-encoded image
    #[serde(rename = "base64")]
    Base64 { media_type: String, data: String },
    /// URL reference
    #[serde(rename = "url")]
    Url { url: String },
}

/// Token accounting attached to a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Token count reported by the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_tokens: Option<u32>,
    /// Locally estimated token count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_tokens: Option<u32>,
}

impl MessageMetadata {
    /// Tokens for this message: provider count first, then the estimate, else zero.
    pub fn tokens(&self) -> u32 {
        self.actual_tokens.or(self.estimated_tokens).unwrap_or(0)
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,
    /// Message role
    pub role: Role,
    /// Message content
    pub content: Content,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Token accounting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    /// Create a message with the given role and content.
    pub fn new(role: Role, content: impl Into<Content>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into())
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content.into())
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content.into())
    }

    /// Attach the provider-reported token count.
    pub fn with_actual_tokens(mut self, tokens: u32) -> Self {
        self.metadata.get_or_insert_with(Default::default).actual_tokens = Some(tokens);
        self
    }

    /// Attach a locally estimated token count.
    pub fn with_estimated_tokens(mut self, tokens: u32) -> Self {
        self.metadata.get_or_insert_with(Default::default).estimated_tokens = Some(tokens);
        self
    }

    /// Token count used for context accounting.
    pub fn tokens(&self) -> u32 {
        self.metadata.map(|m| m.tokens()).unwrap_or(0)
    }
}
