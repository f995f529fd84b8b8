//! Live bidirectional replication
//!
//! Replication is opt-in. [`configure_sync`] with no remote URL hands back
//! an inert [`SyncHandle`]; with one, it spawns a background task that
//! pushes local changes to the remote, pulls remote changes into the local
//! store, and then waits for the next local write or the poll interval.
//! Failures are retried with exponential backoff forever; the task only
//! stops when the handle is cancelled or dropped.
//!
//! Documents are merged by id and revision with the store's own rules, so
//! divergent edits end up with the same winner on both sides and the loser
//! recorded as a conflict.

pub mod backoff;
mod engine;
pub mod protocol;
pub mod remote;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::storage::{DocumentStore, StorageError};

pub use backoff::Backoff;
pub use remote::{HttpRemote, RemoteStore};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("Invalid remote: {0}")]
    InvalidRemote(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Replication cancelled")]
    Cancelled,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Not replicating, or caught up and waiting for work
    #[default]
    Idle,
    Syncing,
    /// The last attempt failed; waiting to retry
    ErrorBackoff,
    Cancelled,
}

/// Coarse replication progress for display
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,

    /// Documents the remote accepted from us
    pub pushed: u64,

    /// Remote documents written locally
    pub pulled: u64,

    /// Conflicts seen on either side
    pub conflicts: u64,

    /// Consecutive failed attempts
    pub failures: u32,
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Documents per push or pull request
    pub batch_size: usize,

    /// How long to wait for a local change before polling the remote
    pub poll_interval: Duration,

    pub initial_backoff: Duration,
    pub max_backoff: Duration,

    /// Per-request timeout for HTTP remotes
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Controls one replication. Dropping the handle stops it.
pub struct SyncHandle {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    status_tx: Arc<watch::Sender<SyncStatus>>,
    status_rx: watch::Receiver<SyncStatus>,
}

impl SyncHandle {
    /// A handle with nothing behind it. Stays `Idle`.
    pub fn inert() -> Self {
        let (status_tx, status_rx) = watch::channel(SyncStatus::default());
        Self {
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            status_tx: Arc::new(status_tx),
            status_rx,
        }
    }

    /// Whether a replication task is running behind this handle.
    pub fn is_active(&self) -> bool {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        task.is_some() && !self.cancel.is_cancelled()
    }

    pub fn status(&self) -> SyncStatus {
        self.status_rx.borrow().clone()
    }

    /// Follow status changes.
    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    /// Stop replicating and wait for the task to exit. Once this returns,
    /// nothing more from the remote is written locally and the remote
    /// connection is released. Calling it again, or on an inert handle,
    /// does nothing.
    pub async fn cancel(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(task) = task else {
            return;
        };

        self.cancel.cancel();
        if let Err(e) = task.await {
            if !e.is_cancelled() {
                log::warn!("Replication task ended abnormally: {}", e);
            }
        }
        self.status_tx.send_modify(|s| s.state = SyncState::Cancelled);
        log::info!("Replication cancelled");
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        let task = self.task.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// Start replicating `local` with the store at `remote_url`. `None` or a
/// blank URL disables replication and returns an inert handle.
///
/// Must be called from within a tokio runtime.
pub fn configure_sync(
    local: Arc<DocumentStore>,
    remote_url: Option<&str>,
    config: &SyncConfig,
) -> Result<SyncHandle, SyncError> {
    match remote_url.map(str::trim).filter(|url| !url.is_empty()) {
        None => {
            log::debug!("No remote configured, replication disabled");
            Ok(SyncHandle::inert())
        }
        Some(url) => {
            let remote = HttpRemote::new(url, config.request_timeout)?;
            log::info!("Replicating with {}", remote.base_url());
            Ok(start_replication(local, Arc::new(remote), config.clone()))
        }
    }
}

/// Start replicating `local` with any [`RemoteStore`].
///
/// Must be called from within a tokio runtime.
pub fn start_replication(
    local: Arc<DocumentStore>,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
) -> SyncHandle {
    let cancel = CancellationToken::new();
    let (status_tx, status_rx) = watch::channel(SyncStatus::default());
    let status_tx = Arc::new(status_tx);

    let engine = engine::Engine::new(local, remote, config, cancel.clone(), status_tx.clone());
    let task = tokio::spawn(engine.run());

    SyncHandle {
        cancel,
        task: Mutex::new(Some(task)),
        status_tx,
        status_rx,
    }
}
