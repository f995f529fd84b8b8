//! Conversation and message documents
//!
//! These are the typed views of what the store holds. On disk and on the
//! wire they are plain JSON objects with a `type` tag, an `_id` and (once
//! stored) a `_rev`.

use serde::{Deserialize, Serialize};

use crate::storage::Doc;

/// Delivery state of a message.
///
/// The variants are declared in lifecycle order; a message's status may
/// only move forward.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

/// A two-party conversation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// `convo:<millis>:<random>`
    #[serde(rename = "_id")]
    pub id: String,

    pub title: String,

    /// CSS-style colour used for the avatar bubble
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_color: Option<String>,

    pub created_at: i64,

    /// Advanced every time a message is appended
    pub updated_at: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<i64>,
}

/// A single chat message
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// `msg:<millis>:<random>`
    #[serde(rename = "_id")]
    pub id: String,

    /// The conversation this message belongs to
    pub conversation_id: String,

    pub sender_id: String,

    pub body: String,

    pub created_at: i64,

    pub status: MessageStatus,
}

/// Either document variant, tagged by `type`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Document {
    Conversation(Conversation),
    Message(Message),
}

impl Document {
    pub fn id(&self) -> &str {
        match self {
            Document::Conversation(c) => &c.id,
            Document::Message(m) => &m.id,
        }
    }

    /// The value of the `type` tag for this variant.
    pub fn type_name(&self) -> &'static str {
        match self {
            Document::Conversation(_) => "conversation",
            Document::Message(_) => "message",
        }
    }

    /// Convert into the untyped form the store works with. The result
    /// carries no revision.
    pub fn into_doc(self) -> Result<Doc, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(self)?)
    }

    /// Read a typed document back out of a stored one.
    pub fn from_doc(doc: &Doc) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(doc)?)
    }
}

impl From<Conversation> for Document {
    fn from(conversation: Conversation) -> Self {
        Document::Conversation(conversation)
    }
}

impl From<Message> for Document {
    fn from(message: Message) -> Self {
        Document::Message(message)
    }
}

/// Implemented by both document variants so typed reads and writes can be
/// written once.
pub trait ChatDocument: Clone + Into<Document> + Sized {
    /// The `type` tag selecting this variant.
    const TYPE_NAME: &'static str;

    fn id(&self) -> &str;

    /// Extract this variant, or `None` if the document is the other kind.
    fn from_document(document: Document) -> Option<Self>;
}

impl ChatDocument for Conversation {
    const TYPE_NAME: &'static str = "conversation";

    fn id(&self) -> &str {
        &self.id
    }

    fn from_document(document: Document) -> Option<Self> {
        match document {
            Document::Conversation(c) => Some(c),
            _ => None,
        }
    }
}

impl ChatDocument for Message {
    const TYPE_NAME: &'static str = "message";

    fn id(&self) -> &str {
        &self.id
    }

    fn from_document(document: Document) -> Option<Self> {
        match document {
            Document::Message(m) => Some(m),
            _ => None,
        }
    }
}
