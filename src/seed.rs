//! Demo data for a fresh store

use crate::storage::{Doc, DocumentStore, StorageError};
use crate::types::{
    generate_id, now_millis, Conversation, Document, IdKind, Message, MessageStatus,
};

pub const DEMO_TITLE: &str = "Demo Chat";
pub const DEMO_AVATAR_COLOR: &str = "#25d366";

/// The two participants of the demo conversation
pub const LOCAL_SENDER: &str = "me";
pub const REMOTE_SENDER: &str = "you";

/// Populate an empty store with one conversation and two messages.
///
/// Returns whether anything was written. A store holding any document at
/// all is left alone.
pub async fn seed_if_empty(store: &DocumentStore) -> Result<bool, StorageError> {
    if store.info().await.doc_count > 0 {
        return Ok(false);
    }

    let now = now_millis();
    let conversation = Conversation {
        id: generate_id(IdKind::Conversation),
        title: DEMO_TITLE.to_string(),
        avatar_color: Some(DEMO_AVATAR_COLOR.to_string()),
        created_at: now,
        updated_at: now,
        last_message_at: Some(now),
    };
    let messages = [
        (LOCAL_SENDER, "Hi! This chat lives on this device.", now - 60_000),
        (REMOTE_SENDER, "It works offline and syncs when a remote is set.", now - 30_000),
    ]
    .into_iter()
    .map(|(sender, body, created_at)| Message {
        id: generate_id(IdKind::Message),
        conversation_id: conversation.id.clone(),
        sender_id: sender.to_string(),
        body: body.to_string(),
        created_at,
        status: MessageStatus::Read,
    });

    let docs = std::iter::once(Document::from(conversation.clone()))
        .chain(messages.map(Document::from))
        .map(|d| d.into_doc().map_err(|e| StorageError::SerializationError(e.to_string())))
        .collect::<Result<Vec<Doc>, _>>()?;

    for result in store.bulk_put(docs).await {
        result?;
    }

    log::info!("Seeded demo conversation {}", conversation.id);
    Ok(true)
}
