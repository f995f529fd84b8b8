// Chatzap - Local-first chat data layer

pub mod chat;
pub mod config;
pub mod index;
pub mod network;
pub mod query;
pub mod replication;
pub mod seed;
pub mod storage;
pub mod types;
pub mod upsert;

pub use chat::{ChatDb, ChatError, ValidationError};
pub use config::ChatConfig;
pub use query::{Query, QueryPlan, QueryService, SortDirection, DEFAULT_LIMIT};
pub use replication::{configure_sync, SyncConfig, SyncHandle, SyncState, SyncStatus};
pub use storage::{Doc, DocumentStore, Revision, StorageConfig, StorageError};
