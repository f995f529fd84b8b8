//! Chat data model
//!
//! Conversations and messages share one identifier space and one logical
//! collection; the `type` tag tells them apart.

pub mod document;
pub mod id;

pub use document::{ChatDocument, Conversation, Document, Message, MessageStatus};
pub use id::{generate_id, now_millis, IdKind};
