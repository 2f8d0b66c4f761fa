//! # parley-core
//!
//! Core types and abstractions for Parley, a conversation backend that keeps
//! chat sessions durable and within a model's context window.
//!
//! This crate provides:
//! - Message and content primitives
//! - The session data model and compression settings
//! - Configuration system
//! - Common error types

pub mod config;
pub mod error;
pub mod message;
pub mod session;

pub use config::Config;
pub use error::{Error, Result, StorageError};
pub use message::{Content, ContentBlock, Message, MessageMetadata, Role};
pub use session::{CompressionConfig, CompressionStrategy, Session, SessionLink};
