//! Wire messages of the replication HTTP protocol
//!
//! `GET /` returns a [`StoreInfo`](crate::storage::StoreInfo),
//! `GET /_changes` a [`ChangesPage`](crate::storage::ChangesPage) and
//! `POST /_bulk_docs` takes a [`BulkDocsRequest`] and answers with a
//! [`BulkDocsResponse`].

use serde::{Deserialize, Serialize};

use crate::storage::{ApplyOutcome, ReplicatedDoc};

pub const CHANGES_PATH: &str = "_changes";
pub const BULK_DOCS_PATH: &str = "_bulk_docs";

/// Query string of `GET /_changes`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChangesParams {
    #[serde(default)]
    pub since: u64,

    #[serde(default = "default_changes_limit")]
    pub limit: usize,
}

fn default_changes_limit() -> usize {
    100
}

/// Body of `POST /_bulk_docs`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BulkDocsRequest {
    pub docs: Vec<ReplicatedDoc>,

    /// Only `false` is supported: the revisions in `docs` are kept as-is
    #[serde(default)]
    pub new_edits: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BulkDocsResponse {
    pub results: Vec<ApplyOutcome>,
}

/// Body of every error reply
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
    pub reason: String,
}
