//! The other side of a replication
//!
//! The engine talks to its peer through [`RemoteStore`]. A
//! [`DocumentStore`] in the same process is a remote by itself;
//! [`HttpRemote`] reaches one served by [`crate::network::server`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;

use crate::storage::{ApplyOutcome, ChangesPage, DocumentStore, ReplicatedDoc, StoreInfo};

use super::protocol::{BulkDocsRequest, BulkDocsResponse, ChangesParams, BULK_DOCS_PATH, CHANGES_PATH};
use super::SyncError;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_info(&self) -> Result<StoreInfo, SyncError>;

    /// Changes with a sequence number above `since`, at most `limit`.
    async fn fetch_changes(&self, since: u64, limit: usize) -> Result<ChangesPage, SyncError>;

    /// Store documents keeping their revisions.
    async fn bulk_apply(&self, docs: Vec<ReplicatedDoc>) -> Result<Vec<ApplyOutcome>, SyncError>;
}

#[async_trait]
impl RemoteStore for DocumentStore {
    async fn fetch_info(&self) -> Result<StoreInfo, SyncError> {
        Ok(self.info().await)
    }

    async fn fetch_changes(&self, since: u64, limit: usize) -> Result<ChangesPage, SyncError> {
        Ok(self.changes_since(since, limit).await)
    }

    async fn bulk_apply(&self, docs: Vec<ReplicatedDoc>) -> Result<Vec<ApplyOutcome>, SyncError> {
        Ok(self.apply_replicated(docs).await?)
    }
}

/// A remote store reached over HTTP
#[derive(Clone, Debug)]
pub struct HttpRemote {
    client: Client,
    base: Url,
}

impl HttpRemote {
    pub fn new(url: &str, request_timeout: Duration) -> Result<Self, SyncError> {
        let mut base = Url::parse(url.trim()).map_err(|e| SyncError::InvalidRemote(format!("{}: {}", url, e)))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(SyncError::InvalidRemote(format!(
                "{}: unsupported scheme '{}'",
                url,
                base.scheme()
            )));
        }
        // so that join() appends instead of replacing the last segment
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, SyncError> {
        self.base
            .join(path)
            .map_err(|e| SyncError::InvalidRemote(e.to_string()))
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, SyncError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(SyncError::Remote {
            status: status.as_u16(),
            message,
        });
    }
    response
        .json()
        .await
        .map_err(|e| SyncError::Transport(e.to_string()))
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn fetch_info(&self) -> Result<StoreInfo, SyncError> {
        let response = self
            .client
            .get(self.base.clone())
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        read_json(response).await
    }

    async fn fetch_changes(&self, since: u64, limit: usize) -> Result<ChangesPage, SyncError> {
        let response = self
            .client
            .get(self.endpoint(CHANGES_PATH)?)
            .query(&ChangesParams { since, limit })
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        read_json(response).await
    }

    async fn bulk_apply(&self, docs: Vec<ReplicatedDoc>) -> Result<Vec<ApplyOutcome>, SyncError> {
        let request = BulkDocsRequest {
            docs,
            new_edits: false,
        };
        let response = self
            .client
            .post(self.endpoint(BULK_DOCS_PATH)?)
            .json(&request)
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let body: BulkDocsResponse = read_json(response).await?;
        Ok(body.results)
    }
}
