//! Document storage for chatzap
//!
//! This module holds the revisioned document store, its on-disk layer and
//! the record types the replication protocol exchanges.

pub mod local;
pub mod revision;
pub mod store;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub use local::LocalStorage;
pub use revision::Revision;
pub use store::DocumentStore;

/// Error types for storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Document update conflict: {0}")]
    Conflict(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Invalid index: {0}")]
    InvalidIndex(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}

/// Configuration for the document store
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Base directory for persisted documents
    pub base_dir: PathBuf,

    /// Whether documents are written to `base_dir` at all
    pub persist: bool,

    /// How many ancestor revisions each document remembers
    pub revs_limit: usize,

    /// Capacity of the change notification channel
    pub change_buffer: usize,
}

impl StorageConfig {
    /// A configuration that never touches the file system.
    pub fn in_memory() -> Self {
        Self {
            persist: false,
            ..Self::default()
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./chatzap_data"),
            persist: true,
            revs_limit: 1000,
            change_buffer: 256,
        }
    }
}

/// A document as callers see it: identifier, optional revision and a flat
/// JSON object of fields.
///
/// On `put`, `rev` is the revision the write is based on (`None` to create).
/// On `get`, it is the current stored revision.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Doc {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Doc {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            fields,
        }
    }

    /// Build a document from a JSON object. Keys `_id` and `_rev` are lifted
    /// out of the field map.
    pub fn from_value(value: Value) -> Result<Self, StorageError> {
        serde_json::from_value(value).map_err(|e| StorageError::InvalidDocument(e.to_string()))
    }

    pub fn with_rev(mut self, rev: Revision) -> Self {
        self.rev = Some(rev);
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// A document as it travels between replicas: the winning revision, the
/// ancestry leading to it (newest first) and the losing revisions the
/// sender knows about.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReplicatedDoc {
    pub doc: Doc,
    pub revisions: Vec<Revision>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Revision>,
}

/// One entry of the change feed: the latest state of a document that was
/// written at `seq`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Change {
    pub seq: u64,
    pub doc: Doc,
    pub revisions: Vec<Revision>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Revision>,
}

impl From<Change> for ReplicatedDoc {
    fn from(change: Change) -> Self {
        Self {
            doc: change.doc,
            revisions: change.revisions,
            conflicts: change.conflicts,
        }
    }
}

/// A page of the change feed
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ChangesPage {
    pub results: Vec<Change>,

    /// Pass this as `since` to continue after this page
    pub last_seq: u64,
}

/// Lightweight notification broadcast after every committed write
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeNotice {
    pub seq: u64,
    pub id: String,
    pub rev: Revision,
}

/// Summary of a store instance
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoreInfo {
    pub instance_id: Uuid,
    pub doc_count: usize,
    pub update_seq: u64,
}

/// What happened to one replicated document on arrival
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Stored as new, or fast-forwarded over the local revision
    Applied { id: String, rev: Revision },

    /// The revision (or a descendant of it) was already here
    AlreadyPresent { id: String },

    /// Divergent histories; `winner` is now the stored revision and `loser`
    /// was recorded as a conflict
    Conflict {
        id: String,
        winner: Revision,
        loser: Revision,
    },

    /// The document was malformed and ignored
    Rejected { id: String, reason: String },
}

impl ApplyOutcome {
    /// Whether the local winning revision changed.
    pub fn changed_winner(&self) -> bool {
        match self {
            ApplyOutcome::Applied { .. } => true,
            ApplyOutcome::Conflict { .. } => true,
            ApplyOutcome::AlreadyPresent { .. } | ApplyOutcome::Rejected { .. } => false,
        }
    }
}
