//! The revisioned document store
//!
//! `DocumentStore` owns the canonical copy of every document. Writes go
//! through a single `RwLock`, so two writers racing on one id are ordered:
//! the second one presents a revision that is no longer current and gets a
//! conflict. Every committed write gets the next store-wide sequence number,
//! which is what the change feed and the replication engine walk.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, RwLock, RwLockReadGuard};
use uuid::Uuid;

use crate::index::{IndexManager, IndexSpec};

use super::local::LocalStorage;
use super::{
    ApplyOutcome, Change, ChangeNotice, ChangesPage, Doc, ReplicatedDoc, Revision, StorageConfig,
    StorageError, StoreInfo,
};

/// A document as the store keeps it
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoredRecord {
    pub id: String,

    /// Current winning revision
    pub rev: Revision,

    /// Ancestry of `rev`, newest first, `rev` included
    pub revisions: Vec<Revision>,

    /// Revisions that lost a replication conflict against this document
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Revision>,

    /// Sequence number of the last write
    pub seq: u64,

    pub fields: Map<String, Value>,
}

impl StoredRecord {
    pub fn to_doc(&self) -> Doc {
        Doc {
            id: self.id.clone(),
            rev: Some(self.rev.clone()),
            fields: self.fields.clone(),
        }
    }

    pub fn to_change(&self) -> Change {
        Change {
            seq: self.seq,
            doc: self.to_doc(),
            revisions: self.revisions.clone(),
            conflicts: self.conflicts.clone(),
        }
    }

    fn descends_from(&self, rev: &Revision) -> bool {
        self.revisions.contains(rev)
    }
}

/// State guarded by the store lock
#[derive(Debug, Default)]
pub(crate) struct StoreInner {
    pub(crate) records: BTreeMap<String, StoredRecord>,

    /// seq -> id of the document last written at that seq
    by_seq: BTreeMap<u64, String>,

    update_seq: u64,

    pub(crate) indexes: IndexManager,
}

/// Durable keyed storage of revisioned JSON documents
pub struct DocumentStore {
    config: StorageConfig,
    instance_id: Uuid,
    local: Option<LocalStorage>,
    inner: RwLock<StoreInner>,
    changes_tx: broadcast::Sender<ChangeNotice>,
}

impl DocumentStore {
    /// Open a store. With `persist` set, documents already under
    /// `base_dir` are loaded.
    pub async fn open(config: StorageConfig) -> Result<Self, StorageError> {
        if !config.persist {
            return Ok(Self::with_config(config));
        }

        let local = LocalStorage::new(&config.base_dir).await?;
        let instance_id = local.load_or_create_instance_id().await?;

        let mut inner = StoreInner::default();
        for record in local.load_all().await? {
            inner.update_seq = inner.update_seq.max(record.seq);
            inner.by_seq.insert(record.seq, record.id.clone());
            inner.records.insert(record.id.clone(), record);
        }

        log::info!(
            "Opened document store {} at {} ({} documents, seq {})",
            instance_id,
            config.base_dir.display(),
            inner.records.len(),
            inner.update_seq
        );

        let (changes_tx, _) = broadcast::channel(config.change_buffer.max(1));
        Ok(Self {
            config,
            instance_id,
            local: Some(local),
            inner: RwLock::new(inner),
            changes_tx,
        })
    }

    /// A store that lives only in memory.
    pub fn in_memory() -> Self {
        Self::with_config(StorageConfig::in_memory())
    }

    fn with_config(config: StorageConfig) -> Self {
        let (changes_tx, _) = broadcast::channel(config.change_buffer.max(1));
        Self {
            config,
            instance_id: Uuid::new_v4(),
            local: None,
            inner: RwLock::new(StoreInner::default()),
            changes_tx,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().await
    }

    /// Fetch the current version of a document.
    pub async fn get(&self, id: &str) -> Result<Doc, StorageError> {
        let inner = self.inner.read().await;
        inner
            .records
            .get(id)
            .map(StoredRecord::to_doc)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    /// Write a document. `doc.rev` must be the current revision for an
    /// existing id and `None` for a new one; anything else is a conflict.
    pub async fn put(&self, doc: Doc) -> Result<Revision, StorageError> {
        let mut inner = self.inner.write().await;
        self.put_locked(&mut inner, doc).await
    }

    /// Write several documents. Each one succeeds or fails on its own.
    pub async fn bulk_put(&self, docs: Vec<Doc>) -> Vec<Result<Revision, StorageError>> {
        let mut inner = self.inner.write().await;
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            results.push(self.put_locked(&mut inner, doc).await);
        }
        results
    }

    async fn put_locked(&self, inner: &mut StoreInner, doc: Doc) -> Result<Revision, StorageError> {
        validate(&doc)?;

        let existing = inner.records.get(&doc.id);
        let parent = match (existing, &doc.rev) {
            (Some(current), Some(expected)) if &current.rev == expected => Some(current),
            (None, None) => None,
            _ => return Err(StorageError::Conflict(doc.id)),
        };

        let rev = Revision::next(parent.map(|p| &p.rev), &doc.fields);
        let mut revisions = vec![rev.clone()];
        let mut conflicts = Vec::new();
        if let Some(parent) = parent {
            revisions.extend(parent.revisions.iter().cloned());
            conflicts = parent.conflicts.clone();
        }
        revisions.truncate(self.config.revs_limit.max(1));

        let record = StoredRecord {
            id: doc.id,
            rev: rev.clone(),
            revisions,
            conflicts,
            seq: inner.update_seq + 1,
            fields: doc.fields,
        };
        self.commit(inner, record).await?;

        Ok(rev)
    }

    /// Persist a record and make it visible: bumps the sequence, refiles
    /// the document in every index and notifies subscribers.
    async fn commit(&self, inner: &mut StoreInner, record: StoredRecord) -> Result<(), StorageError> {
        if let Some(local) = &self.local {
            local.write(&record).await?;
        }

        if let Some(old) = inner.records.get(&record.id) {
            inner.by_seq.remove(&old.seq);
        }
        inner.update_seq = record.seq;
        inner.by_seq.insert(record.seq, record.id.clone());
        inner.indexes.update(&record.id, &record.fields);

        log::debug!("Committed {} at rev {} (seq {})", record.id, record.rev, record.seq);

        let notice = ChangeNotice {
            seq: record.seq,
            id: record.id.clone(),
            rev: record.rev.clone(),
        };
        inner.records.insert(record.id.clone(), record);

        // no subscribers is fine
        let _ = self.changes_tx.send(notice);
        Ok(())
    }

    pub async fn info(&self) -> StoreInfo {
        let inner = self.inner.read().await;
        StoreInfo {
            instance_id: self.instance_id,
            doc_count: inner.records.len(),
            update_seq: inner.update_seq,
        }
    }

    /// Documents written after `since`, oldest first, at most `limit`.
    pub async fn changes_since(&self, since: u64, limit: usize) -> ChangesPage {
        let inner = self.inner.read().await;
        let results: Vec<Change> = inner
            .by_seq
            .range(since.saturating_add(1)..)
            .take(limit)
            .filter_map(|(_, id)| inner.records.get(id))
            .map(StoredRecord::to_change)
            .collect();

        let last_seq = results.last().map_or(since, |c| c.seq);
        ChangesPage { results, last_seq }
    }

    /// Receive a notice for every committed write from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotice> {
        self.changes_tx.subscribe()
    }

    /// Revisions that lost a replication conflict on this document.
    pub async fn conflicts(&self, id: &str) -> Result<Vec<Revision>, StorageError> {
        let inner = self.inner.read().await;
        inner
            .records
            .get(id)
            .map(|r| r.conflicts.clone())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    /// Declare a secondary index. Idempotent; returns whether it was new.
    pub async fn ensure_index<I, S>(&self, fields: I) -> Result<bool, StorageError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = IndexSpec::new(fields)?;
        let mut inner = self.inner.write().await;
        let StoreInner { records, indexes, .. } = &mut *inner;

        let created = indexes.ensure(
            spec.clone(),
            records.iter().map(|(id, r)| (id.as_str(), &r.fields)),
        );
        if created {
            log::info!("Created index {}", spec);
        }
        Ok(created)
    }

    /// Currently declared indexes.
    pub async fn indexes(&self) -> Vec<IndexSpec> {
        let inner = self.inner.read().await;
        inner.indexes.specs().cloned().collect()
    }

    /// Store documents that arrived from another replica, keeping their
    /// revisions instead of minting new ones.
    pub async fn apply_replicated(
        &self,
        docs: Vec<ReplicatedDoc>,
    ) -> Result<Vec<ApplyOutcome>, StorageError> {
        self.apply_replicated_while(docs, || true).await
    }

    /// Like [`apply_replicated`](Self::apply_replicated), but checks
    /// `keep_going` under the write lock before each document and stops as
    /// soon as it returns false. The result then covers only the documents
    /// that were processed.
    pub async fn apply_replicated_while<F>(
        &self,
        docs: Vec<ReplicatedDoc>,
        keep_going: F,
    ) -> Result<Vec<ApplyOutcome>, StorageError>
    where
        F: Fn() -> bool,
    {
        let mut inner = self.inner.write().await;
        let mut outcomes = Vec::with_capacity(docs.len());

        for incoming in docs {
            if !keep_going() {
                break;
            }
            let outcome = self.apply_one(&mut inner, incoming).await?;
            if let ApplyOutcome::Conflict { id, winner, loser } = &outcome {
                log::warn!("Replication conflict on {}: {} wins over {}", id, winner, loser);
            }
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    async fn apply_one(
        &self,
        inner: &mut StoreInner,
        incoming: ReplicatedDoc,
    ) -> Result<ApplyOutcome, StorageError> {
        let ReplicatedDoc {
            doc,
            mut revisions,
            conflicts: incoming_conflicts,
        } = incoming;
        let id = doc.id.clone();

        let rev = match (&doc.rev, validate(&doc)) {
            (Some(rev), Ok(())) => rev.clone(),
            (None, _) => {
                return Ok(ApplyOutcome::Rejected {
                    id,
                    reason: "missing revision".into(),
                })
            }
            (_, Err(e)) => {
                return Ok(ApplyOutcome::Rejected {
                    id,
                    reason: e.to_string(),
                })
            }
        };
        if revisions.first() != Some(&rev) {
            revisions.retain(|r| r != &rev);
            revisions.insert(0, rev.clone());
        }
        revisions.truncate(self.config.revs_limit.max(1));

        let seq = inner.update_seq + 1;
        let existing = match inner.records.get(&id).cloned() {
            None => {
                let mut conflicts = Vec::new();
                merge_conflicts(&mut conflicts, &incoming_conflicts, &rev);
                let record = StoredRecord {
                    id: id.clone(),
                    rev: rev.clone(),
                    revisions,
                    conflicts,
                    seq,
                    fields: doc.fields,
                };
                self.commit(inner, record).await?;
                return Ok(ApplyOutcome::Applied { id, rev });
            }
            Some(existing) => existing,
        };

        // same revision, an ancestor of it, or a loser we already know
        if existing.descends_from(&rev) || existing.conflicts.contains(&rev) {
            let mut record = existing;
            let winner = record.rev.clone();
            if merge_conflicts(&mut record.conflicts, &incoming_conflicts, &winner) {
                self.record_conflicts(inner, record).await?;
            }
            return Ok(ApplyOutcome::AlreadyPresent { id });
        }

        if revisions.contains(&existing.rev) {
            // fast-forward
            let mut conflicts = existing.conflicts;
            merge_conflicts(&mut conflicts, &incoming_conflicts, &rev);
            let record = StoredRecord {
                id: id.clone(),
                rev: rev.clone(),
                revisions,
                conflicts,
                seq,
                fields: doc.fields,
            };
            self.commit(inner, record).await?;
            return Ok(ApplyOutcome::Applied { id, rev });
        }

        if Revision::winner(&existing.rev, &rev) == &rev {
            let mut conflicts = existing.conflicts.clone();
            merge_conflicts(&mut conflicts, &incoming_conflicts, &rev);
            merge_conflicts(&mut conflicts, std::slice::from_ref(&existing.rev), &rev);

            let record = StoredRecord {
                id: id.clone(),
                rev: rev.clone(),
                revisions,
                conflicts,
                seq,
                fields: doc.fields,
            };
            self.commit(inner, record).await?;

            Ok(ApplyOutcome::Conflict {
                id,
                winner: rev,
                loser: existing.rev,
            })
        } else {
            let mut record = existing;
            let winner = record.rev.clone();
            merge_conflicts(&mut record.conflicts, &incoming_conflicts, &winner);
            merge_conflicts(&mut record.conflicts, std::slice::from_ref(&rev), &winner);
            self.record_conflicts(inner, record).await?;

            Ok(ApplyOutcome::Conflict {
                id,
                winner,
                loser: rev,
            })
        }
    }

    /// Store a record whose winning revision stayed the same but whose
    /// conflict list grew. It gets a new sequence number so the grown list
    /// reaches other replicas through the change feed. Only growth is
    /// committed, so two replicas stop exchanging the record once their
    /// lists agree.
    async fn record_conflicts(
        &self,
        inner: &mut StoreInner,
        mut record: StoredRecord,
    ) -> Result<(), StorageError> {
        record.seq = inner.update_seq + 1;
        self.commit(inner, record).await
    }
}

/// Add the revisions of `from` that aren't `winner` and aren't in `into`
/// yet. Returns whether anything was added.
fn merge_conflicts(into: &mut Vec<Revision>, from: &[Revision], winner: &Revision) -> bool {
    let before = into.len();
    for rev in from {
        if rev != winner && !into.contains(rev) {
            into.push(rev.clone());
        }
    }
    into.retain(|r| r != winner);
    into.len() != before
}

fn validate(doc: &Doc) -> Result<(), StorageError> {
    if doc.id.is_empty() {
        return Err(StorageError::InvalidDocument("empty document id".into()));
    }
    if let Some(key) = doc.fields.keys().find(|k| k.starts_with('_')) {
        return Err(StorageError::InvalidDocument(format!(
            "{}: field names starting with '_' are reserved ({})",
            doc.id, key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn make_doc(id: &str, value: Value) -> Doc {
        match value {
            Value::Object(fields) => Doc::new(id, fields),
            _ => panic!("expected an object"),
        }
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = DocumentStore::in_memory();
        let doc = make_doc("convo:1:1", json!({"type": "conversation", "title": "hi"}));

        let rev = store.put(doc.clone()).await.unwrap();
        let fetched = store.get("convo:1:1").await.unwrap();

        assert_eq!(fetched.rev, Some(rev));
        assert_eq!(fetched.fields, doc.fields);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = DocumentStore::in_memory();
        let err = store.get("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_put_without_rev_on_existing_conflicts() {
        let store = DocumentStore::in_memory();
        store.put(make_doc("a", json!({"n": 1}))).await.unwrap();

        let err = store.put(make_doc("a", json!({"n": 2}))).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get("a").await.unwrap().get("n"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_stale_rev_conflicts_and_keeps_prior_write() {
        let store = DocumentStore::in_memory();
        let first = store.put(make_doc("a", json!({"n": 1}))).await.unwrap();
        let second = store
            .put(make_doc("a", json!({"n": 2})).with_rev(first.clone()))
            .await
            .unwrap();

        let err = store
            .put(make_doc("a", json!({"n": 3})).with_rev(first))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let current = store.get("a").await.unwrap();
        assert_eq!(current.rev, Some(second));
        assert_eq!(current.get("n"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_rev_on_missing_doc_conflicts() {
        let store = DocumentStore::in_memory();
        let rev: Revision = "1-abcd".parse().unwrap();
        let err = store.put(make_doc("a", json!({})).with_rev(rev)).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_reserved_field_rejected() {
        let store = DocumentStore::in_memory();
        let err = store.put(make_doc("a", json!({"_deleted": true}))).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidDocument(_)));

        let err = store.put(make_doc("", json!({}))).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidDocument(_)));
    }

    #[tokio::test]
    async fn test_concurrent_puts_exactly_one_wins() {
        let store = Arc::new(DocumentStore::in_memory());
        let rev = store.put(make_doc("a", json!({"n": 0}))).await.unwrap();

        let mut handles = Vec::new();
        for n in 1..=8 {
            let store = store.clone();
            let rev = rev.clone();
            handles.push(tokio::spawn(async move {
                store.put(make_doc("a", json!({"n": n})).with_rev(rev)).await
            }));
        }

        let mut ok = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) if e.is_conflict() => conflicts += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(conflicts, 7);
    }

    #[tokio::test]
    async fn test_bulk_put_results_per_document() {
        let store = DocumentStore::in_memory();
        store.put(make_doc("taken", json!({}))).await.unwrap();

        let results = store
            .bulk_put(vec![
                make_doc("a", json!({"n": 1})),
                make_doc("taken", json!({"n": 2})),
                make_doc("b", json!({"n": 3})),
            ])
            .await;

        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().is_conflict());
        assert!(results[2].is_ok());
        assert_eq!(store.info().await.doc_count, 3);
    }

    #[tokio::test]
    async fn test_changes_feed_reports_latest_per_doc() {
        let store = DocumentStore::in_memory();
        let rev = store.put(make_doc("a", json!({"n": 1}))).await.unwrap();
        store.put(make_doc("b", json!({"n": 1}))).await.unwrap();
        store.put(make_doc("a", json!({"n": 2})).with_rev(rev)).await.unwrap();

        let page = store.changes_since(0, 10).await;
        let ids: Vec<&str> = page.results.iter().map(|c| c.doc.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(page.last_seq, 3);
        assert_eq!(page.results[1].revisions.len(), 2);

        let rest = store.changes_since(3, 10).await;
        assert!(rest.results.is_empty());
        assert_eq!(rest.last_seq, 3);

        let limited = store.changes_since(0, 1).await;
        assert_eq!(limited.results.len(), 1);
        assert_eq!(limited.last_seq, 2);
    }

    #[tokio::test]
    async fn test_subscribe_sees_writes() {
        let store = DocumentStore::in_memory();
        let mut rx = store.subscribe();

        let rev = store.put(make_doc("a", json!({}))).await.unwrap();
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.id, "a");
        assert_eq!(notice.rev, rev);
        assert_eq!(notice.seq, 1);
    }

    #[tokio::test]
    async fn test_replicated_insert_and_fast_forward() {
        let source = DocumentStore::in_memory();
        let target = DocumentStore::in_memory();

        let rev1 = source.put(make_doc("a", json!({"n": 1}))).await.unwrap();
        let page = source.changes_since(0, 10).await;
        let outcomes = target
            .apply_replicated(page.results.into_iter().map(Into::into).collect())
            .await
            .unwrap();
        assert_eq!(outcomes, vec![ApplyOutcome::Applied { id: "a".into(), rev: rev1.clone() }]);

        let rev2 = source.put(make_doc("a", json!({"n": 2})).with_rev(rev1)).await.unwrap();
        let page = source.changes_since(1, 10).await;
        let outcomes = target
            .apply_replicated(page.results.into_iter().map(Into::into).collect())
            .await
            .unwrap();
        assert_eq!(outcomes, vec![ApplyOutcome::Applied { id: "a".into(), rev: rev2.clone() }]);

        // a local update on the target builds on the replicated revision
        let doc = target.get("a").await.unwrap();
        assert_eq!(doc.rev, Some(rev2));
        target.put(doc).await.unwrap();
    }

    #[tokio::test]
    async fn test_replicated_same_or_older_is_already_present() {
        let source = DocumentStore::in_memory();
        let target = DocumentStore::in_memory();

        let rev1 = source.put(make_doc("a", json!({"n": 1}))).await.unwrap();
        let first: Vec<ReplicatedDoc> = source
            .changes_since(0, 10)
            .await
            .results
            .into_iter()
            .map(Into::into)
            .collect();
        source.put(make_doc("a", json!({"n": 2})).with_rev(rev1)).await.unwrap();
        let second: Vec<ReplicatedDoc> = source
            .changes_since(0, 10)
            .await
            .results
            .into_iter()
            .map(Into::into)
            .collect();

        target.apply_replicated(second.clone()).await.unwrap();
        let again = target.apply_replicated(second).await.unwrap();
        let stale = target.apply_replicated(first).await.unwrap();

        assert_eq!(again, vec![ApplyOutcome::AlreadyPresent { id: "a".into() }]);
        assert_eq!(stale, vec![ApplyOutcome::AlreadyPresent { id: "a".into() }]);
        assert_eq!(target.get("a").await.unwrap().get("n"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_divergent_replicas_pick_the_same_winner() {
        let a = DocumentStore::in_memory();
        let b = DocumentStore::in_memory();

        let base = a.put(make_doc("x", json!({"n": 0}))).await.unwrap();
        b.apply_replicated(a.changes_since(0, 10).await.results.into_iter().map(Into::into).collect())
            .await
            .unwrap();

        let rev_a = a.put(make_doc("x", json!({"n": 1})).with_rev(base.clone())).await.unwrap();
        let rev_b = b.put(make_doc("x", json!({"n": 2})).with_rev(base)).await.unwrap();
        let expected_winner = Revision::winner(&rev_a, &rev_b).clone();

        let from_a: Vec<ReplicatedDoc> =
            a.changes_since(0, 10).await.results.into_iter().map(Into::into).collect();
        let from_b: Vec<ReplicatedDoc> =
            b.changes_since(0, 10).await.results.into_iter().map(Into::into).collect();

        let on_b = b.apply_replicated(from_a).await.unwrap();
        let on_a = a.apply_replicated(from_b).await.unwrap();
        assert!(matches!(on_a[0], ApplyOutcome::Conflict { .. }));
        assert!(matches!(on_b[0], ApplyOutcome::Conflict { .. }));

        let doc_a = a.get("x").await.unwrap();
        let doc_b = b.get("x").await.unwrap();
        assert_eq!(doc_a.rev, Some(expected_winner.clone()));
        assert_eq!(doc_b.rev, Some(expected_winner));
        assert_eq!(doc_a.fields, doc_b.fields);
        assert_eq!(a.conflicts("x").await.unwrap().len(), 1);
        assert_eq!(b.conflicts("x").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conflicts_travel_with_the_winner() {
        let a = DocumentStore::in_memory();
        let b = DocumentStore::in_memory();
        let c = DocumentStore::in_memory();

        let base = a.put(make_doc("x", json!({"n": 0}))).await.unwrap();
        b.apply_replicated(a.changes_since(0, 10).await.results.into_iter().map(Into::into).collect())
            .await
            .unwrap();
        a.put(make_doc("x", json!({"n": 1})).with_rev(base.clone())).await.unwrap();
        b.put(make_doc("x", json!({"n": 2})).with_rev(base)).await.unwrap();

        // b learns about a's edit, then c copies b
        b.apply_replicated(a.changes_since(0, 10).await.results.into_iter().map(Into::into).collect())
            .await
            .unwrap();
        c.apply_replicated(b.changes_since(0, 10).await.results.into_iter().map(Into::into).collect())
            .await
            .unwrap();

        assert_eq!(c.get("x").await.unwrap(), b.get("x").await.unwrap());
        assert_eq!(c.conflicts("x").await.unwrap(), b.conflicts("x").await.unwrap());
        assert_eq!(c.conflicts("x").await.unwrap().len(), 1);

        // re-sending the loser is not a new conflict
        let loser = b.conflicts("x").await.unwrap().remove(0);
        let loser_doc = ReplicatedDoc {
            doc: make_doc("x", json!({})).with_rev(loser.clone()),
            revisions: vec![loser],
            conflicts: Vec::new(),
        };
        let outcomes = b.apply_replicated(vec![loser_doc]).await.unwrap();
        assert_eq!(outcomes, vec![ApplyOutcome::AlreadyPresent { id: "x".into() }]);
    }

    #[tokio::test]
    async fn test_new_loser_reaches_downstream_replicas() {
        let a = DocumentStore::in_memory();
        let b = DocumentStore::in_memory();
        let c = DocumentStore::in_memory();

        let base = a.put(make_doc("x", json!({"n": 0}))).await.unwrap();
        let from_a: Vec<ReplicatedDoc> =
            a.changes_since(0, 10).await.results.into_iter().map(Into::into).collect();
        b.apply_replicated(from_a).await.unwrap();

        // b moves two generations ahead, so its revision wins any conflict with a
        let rev = b.put(make_doc("x", json!({"n": 1})).with_rev(base.clone())).await.unwrap();
        b.put(make_doc("x", json!({"n": 2})).with_rev(rev)).await.unwrap();

        // c is caught up with b before any conflict exists
        let page = b.changes_since(0, 10).await;
        c.apply_replicated(page.results.into_iter().map(Into::into).collect())
            .await
            .unwrap();
        let c_checkpoint = page.last_seq;
        assert!(c.conflicts("x").await.unwrap().is_empty());

        // a's divergent edit loses on b; b's winner stays the same
        let loser = a.put(make_doc("x", json!({"n": 9})).with_rev(base)).await.unwrap();
        let from_a: Vec<ReplicatedDoc> =
            a.changes_since(0, 10).await.results.into_iter().map(Into::into).collect();
        let outcomes = b.apply_replicated(from_a).await.unwrap();
        assert!(matches!(&outcomes[0], ApplyOutcome::Conflict { loser: l, .. } if l == &loser));

        // the grown conflict list shows up in b's feed and reaches c
        let page = b.changes_since(c_checkpoint, 10).await;
        assert_eq!(page.results.len(), 1);
        let outcomes = c
            .apply_replicated(page.results.into_iter().map(Into::into).collect())
            .await
            .unwrap();
        assert_eq!(outcomes, vec![ApplyOutcome::AlreadyPresent { id: "x".into() }]);
        assert_eq!(c.conflicts("x").await.unwrap(), vec![loser]);
        assert_eq!(c.get("x").await.unwrap(), b.get("x").await.unwrap());

        // sending it back to b changes nothing more
        let seq = b.info().await.update_seq;
        let from_c: Vec<ReplicatedDoc> =
            c.changes_since(0, 10).await.results.into_iter().map(Into::into).collect();
        b.apply_replicated(from_c).await.unwrap();
        assert_eq!(b.info().await.update_seq, seq);
    }

    #[tokio::test]
    async fn test_apply_stops_when_told() {
        let source = DocumentStore::in_memory();
        let target = DocumentStore::in_memory();
        source.put(make_doc("a", json!({}))).await.unwrap();
        source.put(make_doc("b", json!({}))).await.unwrap();

        let docs: Vec<ReplicatedDoc> =
            source.changes_since(0, 10).await.results.into_iter().map(Into::into).collect();
        let outcomes = target.apply_replicated_while(docs, || false).await.unwrap();

        assert!(outcomes.is_empty());
        assert_eq!(target.info().await.doc_count, 0);
    }

    #[tokio::test]
    async fn test_replicated_without_rev_is_rejected() {
        let target = DocumentStore::in_memory();
        let outcomes = target
            .apply_replicated(vec![ReplicatedDoc {
                doc: make_doc("a", json!({})),
                revisions: Vec::new(),
                conflicts: Vec::new(),
            }])
            .await
            .unwrap();
        assert!(matches!(outcomes[0], ApplyOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_persisted_store_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            base_dir: dir.path().join("db"),
            ..StorageConfig::default()
        };

        let (instance_id, rev) = {
            let store = DocumentStore::open(config.clone()).await.unwrap();
            store.ensure_index(["type"]).await.unwrap();
            let rev = store
                .put(make_doc("convo:1:1", json!({"type": "conversation", "title": "hi"})))
                .await
                .unwrap();
            store.put(make_doc("msg:1:2", json!({"type": "message"}))).await.unwrap();
            (store.instance_id(), rev)
        };

        let store = DocumentStore::open(config).await.unwrap();
        assert_eq!(store.instance_id(), instance_id);

        let info = store.info().await;
        assert_eq!(info.doc_count, 2);
        assert_eq!(info.update_seq, 2);

        let doc = store.get("convo:1:1").await.unwrap();
        assert_eq!(doc.rev, Some(rev));
        assert_eq!(doc.get("title"), Some(&json!("hi")));

        // indexes are declared per process and rebuilt from the loaded docs
        assert!(store.indexes().await.is_empty());
        assert!(store.ensure_index(["type"]).await.unwrap());
    }
}
