//! The replication task

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::storage::{ApplyOutcome, DocumentStore, ReplicatedDoc};

use super::{Backoff, RemoteStore, SyncConfig, SyncError, SyncState, SyncStatus};

pub(super) struct Engine {
    local: Arc<DocumentStore>,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    cancel: CancellationToken,
    status: Arc<watch::Sender<SyncStatus>>,

    /// Whether the remote answered since the last failure
    connected: bool,

    /// Identity of the remote store the checkpoints refer to
    remote_id: Option<Uuid>,

    /// Highest remote-bound seq the remote acknowledged (local feed)
    push_since: u64,

    /// Highest seq applied from the remote feed
    pull_since: u64,
}

/// What a batch of apply outcomes amounts to
#[derive(Default)]
struct Tally {
    written: u64,
    conflicts: u64,
}

impl Tally {
    fn of(outcomes: &[ApplyOutcome], side: &str) -> Self {
        let mut tally = Tally::default();
        for outcome in outcomes {
            match outcome {
                ApplyOutcome::Applied { .. } => tally.written += 1,
                ApplyOutcome::Conflict { .. } => {
                    tally.written += 1;
                    tally.conflicts += 1;
                }
                ApplyOutcome::AlreadyPresent { .. } => {}
                ApplyOutcome::Rejected { id, reason } => {
                    log::warn!("{} store rejected {}: {}", side, id, reason);
                }
            }
        }
        tally
    }
}

impl Engine {
    pub(super) fn new(
        local: Arc<DocumentStore>,
        remote: Arc<dyn RemoteStore>,
        config: SyncConfig,
        cancel: CancellationToken,
        status: Arc<watch::Sender<SyncStatus>>,
    ) -> Self {
        Self {
            local,
            remote,
            config,
            cancel,
            status,
            connected: false,
            remote_id: None,
            push_since: 0,
            pull_since: 0,
        }
    }

    /// Update the published status unless the handle already marked the
    /// replication cancelled.
    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut SyncStatus),
    {
        self.status.send_if_modified(|status| {
            if status.state == SyncState::Cancelled {
                return false;
            }
            f(status);
            true
        });
    }

    fn set_state(&self, state: SyncState) {
        self.update(|status| status.state = state);
    }

    pub(super) async fn run(mut self) {
        log::info!("Replication started");

        let cancel = self.cancel.clone();
        let mut changes = self.local.subscribe();
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);

        loop {
            self.set_state(SyncState::Syncing);

            match self.sync_once().await {
                Err(SyncError::Cancelled) => break,
                Ok(()) => {
                    if backoff.attempts() > 0 {
                        log::info!("Replication recovered after {} failed attempts", backoff.attempts());
                    }
                    backoff.reset();
                    self.update(|status| {
                        status.state = SyncState::Idle;
                        status.failures = 0;
                    });

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        notice = changes.recv() => {
                            if let Err(RecvError::Lagged(n)) = notice {
                                log::debug!("Missed {} change notices, resyncing", n);
                            }
                            // one pass covers every write so far
                            loop {
                                match changes.try_recv() {
                                    Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                                    Err(_) => break,
                                }
                            }
                        }
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    self.connected = false;
                    let delay = backoff.next_delay();
                    log::warn!("Replication attempt failed: {}; retrying in {:?}", e, delay);
                    self.update(|status| {
                        status.state = SyncState::ErrorBackoff;
                        status.failures = backoff.attempts();
                    });

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        log::info!("Replication stopped");
    }

    /// Run a remote call unless the replication is cancelled first.
    async fn remote_call<T, F>(&self, call: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, SyncError>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            result = call => result,
        }
    }

    async fn sync_once(&mut self) -> Result<(), SyncError> {
        if !self.connected {
            let info = self.remote_call(self.remote.fetch_info()).await?;
            if info.instance_id == self.local.instance_id() {
                return Err(SyncError::InvalidRemote("remote is the local store".into()));
            }
            if self.remote_id.map_or(false, |id| id != info.instance_id) {
                log::warn!("Remote store changed identity, replicating from scratch");
                self.push_since = 0;
                self.pull_since = 0;
            }
            log::info!(
                "Connected to remote store {} ({} documents, seq {})",
                info.instance_id,
                info.doc_count,
                info.update_seq
            );
            self.remote_id = Some(info.instance_id);
            self.connected = true;
        }

        self.push().await?;
        self.pull().await
    }

    async fn push(&mut self) -> Result<(), SyncError> {
        let batch = self.config.batch_size.max(1);
        loop {
            let page = self.local.changes_since(self.push_since, batch).await;
            if page.results.is_empty() {
                return Ok(());
            }
            let count = page.results.len();
            let docs: Vec<ReplicatedDoc> = page.results.into_iter().map(Into::into).collect();

            let outcomes = self.remote_call(self.remote.bulk_apply(docs)).await?;
            let tally = Tally::of(&outcomes, "Remote");
            self.push_since = page.last_seq;
            log::debug!("Pushed {} changes up to seq {}", count, self.push_since);
            self.update(|status| {
                status.pushed += tally.written;
                status.conflicts += tally.conflicts;
            });

            if count < batch {
                return Ok(());
            }
        }
    }

    async fn pull(&mut self) -> Result<(), SyncError> {
        let batch = self.config.batch_size.max(1);
        loop {
            let page = self
                .remote_call(self.remote.fetch_changes(self.pull_since, batch))
                .await?;
            if page.results.is_empty() {
                return Ok(());
            }
            let count = page.results.len();
            let docs: Vec<ReplicatedDoc> = page.results.into_iter().map(Into::into).collect();

            let cancel = self.cancel.clone();
            let outcomes = self
                .local
                .apply_replicated_while(docs, || !cancel.is_cancelled())
                .await?;
            let tally = Tally::of(&outcomes, "Local");
            self.update(|status| {
                status.pulled += tally.written;
                status.conflicts += tally.conflicts;
            });
            if outcomes.len() < count {
                // the checkpoint stays put
                return Err(SyncError::Cancelled);
            }

            self.pull_since = page.last_seq;
            log::debug!("Pulled {} changes up to remote seq {}", count, self.pull_since);

            if count < batch {
                return Ok(());
            }
        }
    }
}
