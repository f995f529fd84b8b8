//! The chat data layer as the presentation layer sees it
//!
//! `ChatDb` wraps a shared [`DocumentStore`] and exposes the handful of
//! operations a chat screen needs: the startup sequence, the two list
//! views, typed upserts and the sync toggle. Writes that would break the
//! data model (an empty message, a message for a conversation that doesn't
//! exist, a status moving backwards) are rejected before they reach the
//! store.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::query::{QueryService, DEFAULT_LIMIT};
use crate::replication::{configure_sync, SyncConfig, SyncError, SyncHandle};
use crate::seed;
use crate::storage::{DocumentStore, Revision, StorageConfig, StorageError};
use crate::types::{
    generate_id, now_millis, ChatDocument, Conversation, Document, IdKind, Message, MessageStatus,
};

/// Indexes the list views are answered from
pub const REQUIRED_INDEXES: [&[&str]; 3] = [
    &["type"],
    &["type", "updatedAt"],
    &["type", "conversationId", "createdAt"],
];

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Message body is empty")]
    EmptyBody,

    #[error("Conversation title is empty")]
    EmptyTitle,

    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("Message status cannot move from {from:?} to {to:?}")]
    StatusRegression {
        from: MessageStatus,
        to: MessageStatus,
    },

    #[error("Message field '{0}' cannot change once sent")]
    ImmutableField(&'static str),
}

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Serialization(e.to_string())
    }
}

pub struct ChatDb {
    store: Arc<DocumentStore>,
    queries: QueryService,
}

impl ChatDb {
    pub async fn open(config: StorageConfig) -> Result<Self, ChatError> {
        let store = DocumentStore::open(config).await?;
        Ok(Self::with_store(Arc::new(store)))
    }

    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(DocumentStore::in_memory()))
    }

    pub fn with_store(store: Arc<DocumentStore>) -> Self {
        let queries = QueryService::new(store.clone());
        Self { store, queries }
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub async fn ensure_indexes(&self) -> Result<(), ChatError> {
        for fields in REQUIRED_INDEXES {
            self.store.ensure_index(fields.iter().copied()).await?;
        }
        Ok(())
    }

    pub async fn seed_if_empty(&self) -> Result<bool, ChatError> {
        Ok(seed::seed_if_empty(&self.store).await?)
    }

    /// Startup sequence: indexes, demo data, then the first conversation
    /// list.
    pub async fn bootstrap(&self) -> Result<Vec<Conversation>, ChatError> {
        self.ensure_indexes().await?;
        self.seed_if_empty().await?;
        Ok(self.list_conversations(DEFAULT_LIMIT).await)
    }

    pub async fn list_conversations(&self, limit: usize) -> Vec<Conversation> {
        self.queries.list_conversations(limit).await
    }

    pub async fn list_messages(&self, conversation_id: &str, limit: usize) -> Vec<Message> {
        self.queries.list_messages(conversation_id, limit).await
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Conversation, ChatError> {
        self.get_typed(id).await
    }

    pub async fn get_message(&self, id: &str) -> Result<Message, ChatError> {
        self.get_typed(id).await
    }

    async fn get_typed<T: ChatDocument>(&self, id: &str) -> Result<T, ChatError> {
        let doc = self.store.get(id).await?;
        T::from_document(Document::from_doc(&doc)?)
            .ok_or_else(|| StorageError::NotFound(id.to_string()).into())
    }

    /// Create or update a typed document. Returns the new revision.
    pub async fn upsert<T: ChatDocument>(&self, document: T) -> Result<Revision, ChatError> {
        let document: Document = document.into();
        self.validate(&document).await?;

        let written = self.store.upsert(document.into_doc()?).await?;
        written
            .rev
            .ok_or_else(|| ChatError::Serialization("upsert returned no revision".into()))
    }

    async fn validate(&self, document: &Document) -> Result<(), ChatError> {
        match document {
            Document::Conversation(c) => {
                if c.title.trim().is_empty() {
                    return Err(ValidationError::EmptyTitle.into());
                }
            }
            Document::Message(m) => {
                if m.body.trim().is_empty() {
                    return Err(ValidationError::EmptyBody.into());
                }
                match self.get_conversation(&m.conversation_id).await {
                    Ok(_) => {}
                    Err(ChatError::Storage(e)) if e.is_not_found() => {
                        return Err(ValidationError::UnknownConversation(m.conversation_id.clone()).into())
                    }
                    Err(e) => return Err(e),
                }
                match self.get_message(&m.id).await {
                    Ok(existing) => check_message_update(&existing, m)?,
                    Err(ChatError::Storage(e)) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    pub async fn create_conversation(
        &self,
        title: &str,
        avatar_color: Option<String>,
    ) -> Result<Conversation, ChatError> {
        let now = now_millis();
        let conversation = Conversation {
            id: generate_id(IdKind::Conversation),
            title: title.trim().to_string(),
            avatar_color,
            created_at: now,
            updated_at: now,
            last_message_at: None,
        };
        self.upsert(conversation.clone()).await?;
        Ok(conversation)
    }

    /// Append a message and bump the conversation's timestamps to the
    /// message's creation time.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        body: &str,
    ) -> Result<Message, ChatError> {
        let message = Message {
            id: generate_id(IdKind::Message),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            body: body.trim().to_string(),
            created_at: now_millis(),
            status: MessageStatus::Sent,
        };
        self.upsert(message.clone()).await?;
        self.touch_conversation(conversation_id, message.created_at).await?;

        log::debug!("Sent {} in {}", message.id, conversation_id);
        Ok(message)
    }

    /// Move `updatedAt` and `lastMessageAt` forward to `at`. Neither ever
    /// moves back. A concurrent write to the conversation is re-read and
    /// the bump applied on top of it.
    async fn touch_conversation(&self, conversation_id: &str, at: i64) -> Result<(), ChatError> {
        loop {
            let mut doc = self.store.get(conversation_id).await?;
            let mut changed = false;
            for field in ["updatedAt", "lastMessageAt"] {
                let current = doc.get(field).and_then(Value::as_i64);
                if current.map_or(true, |current| current < at) {
                    doc.fields.insert(field.to_string(), at.into());
                    changed = true;
                }
            }
            if !changed {
                return Ok(());
            }

            match self.store.put(doc).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    log::debug!("Conversation {} changed underneath, retrying", conversation_id);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Move a message's status forward. Setting the current status again is
    /// a no-op.
    pub async fn advance_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<Message, ChatError> {
        let mut message = self.get_message(message_id).await?;
        if message.status == status {
            return Ok(message);
        }
        message.status = status;
        self.upsert(message.clone()).await?;
        Ok(message)
    }

    /// Start replicating with `remote_url`, or get an inert handle when it
    /// is `None` or blank.
    pub fn configure_sync(
        &self,
        remote_url: Option<&str>,
        config: &SyncConfig,
    ) -> Result<SyncHandle, SyncError> {
        configure_sync(self.store.clone(), remote_url, config)
    }
}

/// A stored message may only move its status forward.
fn check_message_update(existing: &Message, update: &Message) -> Result<(), ValidationError> {
    if update.conversation_id != existing.conversation_id {
        return Err(ValidationError::ImmutableField("conversationId"));
    }
    if update.sender_id != existing.sender_id {
        return Err(ValidationError::ImmutableField("senderId"));
    }
    if update.body != existing.body {
        return Err(ValidationError::ImmutableField("body"));
    }
    if update.created_at != existing.created_at {
        return Err(ValidationError::ImmutableField("createdAt"));
    }
    if update.status < existing.status {
        return Err(ValidationError::StatusRegression {
            from: existing.status,
            to: update.status,
        });
    }
    Ok(())
}
