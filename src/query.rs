//! Queries over the document store
//!
//! A query is an equality selector over top-level fields, an optional sort
//! on one field and a result limit. The planner answers it from a secondary
//! index when one fits and scans every document otherwise; both paths
//! return the same rows in the same order.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::index::IndexValue;
use crate::storage::{Doc, DocumentStore};
use crate::types::{ChatDocument, Conversation, Document, Message};

/// Result limit the chat views use when the caller doesn't pick one
pub const DEFAULT_LIMIT: usize = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// An equality selector with an optional single-field sort
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    selector: Vec<(String, Value)>,
    sort: Option<(String, SortDirection)>,
    limit: usize,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            selector: Vec::new(),
            sort: None,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field` to equal `value`.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.selector.push((field.into(), value.into()));
        self
    }

    /// Order results by `field`. Documents without the field don't match.
    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn matches(&self, fields: &Map<String, Value>) -> bool {
        let selected = self.selector.iter().all(|(field, wanted)| {
            fields.get(field).map_or(false, |have| values_equal(have, wanted))
        });
        selected && self.sort_key(fields).is_some()
    }

    /// The value a document sorts by. `Some(Null)` when the query has no
    /// sort; `None` when the document can't be sorted.
    fn sort_key(&self, fields: &Map<String, Value>) -> Option<IndexValue> {
        match &self.sort {
            None => Some(IndexValue::Null),
            Some((field, _)) => fields.get(field).and_then(IndexValue::from_json),
        }
    }

    fn direction(&self) -> SortDirection {
        self.sort.as_ref().map_or(SortDirection::Asc, |(_, d)| *d)
    }
}

/// How a query was answered
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryPlan {
    /// Walked the named index. `presorted` means the index order was the
    /// requested sort order.
    Index { index: String, presorted: bool },
    FullScan,
}

fn values_equal(have: &Value, wanted: &Value) -> bool {
    match (IndexValue::from_json(have), IndexValue::from_json(wanted)) {
        (Some(a), Some(b)) => a == b,
        _ => have == wanted,
    }
}

impl DocumentStore {
    /// Run a query against a snapshot of the store.
    pub async fn find(&self, query: &Query) -> Vec<Doc> {
        self.find_with_plan(query).await.0
    }

    /// Run a query and report which plan answered it.
    pub async fn find_with_plan(&self, query: &Query) -> (Vec<Doc>, QueryPlan) {
        let inner = self.read().await;

        let selector_fields: Vec<&str> = query.selector.iter().map(|(f, _)| f.as_str()).collect();
        let sort_field = query.sort.as_ref().map(|(f, _)| f.as_str());

        // (sort key, id) of every matching document
        let mut hits: Vec<(IndexValue, &str)> = Vec::new();
        let mut plan = QueryPlan::FullScan;
        let mut sorted = false;

        let index_match = inner.indexes.find_for(&selector_fields, sort_field);
        let prefix = index_match.as_ref().and_then(|m| {
            let k = selector_fields.len();
            m.index.spec().fields()[..k]
                .iter()
                .map(|field| {
                    query
                        .selector
                        .iter()
                        .find(|(f, _)| f == field)
                        .and_then(|(_, v)| IndexValue::from_json(v))
                })
                .collect::<Option<Vec<IndexValue>>>()
        });

        match (index_match, prefix) {
            (Some(m), Some(prefix)) => {
                for (_, id) in m.index.scan_prefix(&prefix) {
                    let Some(record) = inner.records.get(id) else {
                        continue;
                    };
                    if let Some(key) = query.sort_key(&record.fields) {
                        hits.push((key, id));
                    }
                }
                sorted = m.presorted && query.direction() == SortDirection::Asc;
                plan = QueryPlan::Index {
                    index: m.index.spec().to_string(),
                    presorted: m.presorted,
                };
            }
            _ => {
                for (id, record) in &inner.records {
                    if query.matches(&record.fields) {
                        if let Some(key) = query.sort_key(&record.fields) {
                            hits.push((key, id.as_str()));
                        }
                    }
                }
            }
        }

        if !sorted {
            let direction = query.direction();
            hits.sort_by(|(ka, ia), (kb, ib)| {
                let by_key = match direction {
                    SortDirection::Asc => ka.cmp(kb),
                    SortDirection::Desc => kb.cmp(ka),
                };
                by_key.then_with(|| ia.cmp(ib))
            });
        }

        let docs = hits
            .into_iter()
            .take(query.limit)
            .filter_map(|(_, id)| inner.records.get(id))
            .map(|record| record.to_doc())
            .collect();

        log::debug!("Query {:?} answered by {:?}", query, plan);
        (docs, plan)
    }
}

/// The two list views the chat screens need
#[derive(Clone)]
pub struct QueryService {
    store: Arc<DocumentStore>,
}

impl QueryService {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    /// Conversations, most recently updated first.
    pub async fn list_conversations(&self, limit: usize) -> Vec<Conversation> {
        let query = Query::new()
            .eq("type", Conversation::TYPE_NAME)
            .sort_by("updatedAt", SortDirection::Desc)
            .limit(limit);
        decode(self.store.find(&query).await)
    }

    /// Messages of one conversation, oldest first.
    pub async fn list_messages(&self, conversation_id: &str, limit: usize) -> Vec<Message> {
        let query = Query::new()
            .eq("type", Message::TYPE_NAME)
            .eq("conversationId", conversation_id)
            .sort_by("createdAt", SortDirection::Asc)
            .limit(limit);
        decode(self.store.find(&query).await)
    }
}

/// Typed view of query results. Documents that don't parse are skipped.
fn decode<T: ChatDocument>(docs: Vec<Doc>) -> Vec<T> {
    docs.iter()
        .filter_map(|doc| match Document::from_doc(doc) {
            Ok(document) => T::from_document(document),
            Err(e) => {
                log::warn!("Skipping malformed {} {}: {}", T::TYPE_NAME, doc.id, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn put(store: &DocumentStore, id: &str, value: Value) {
        let Value::Object(fields) = value else {
            panic!("expected an object");
        };
        store.put(Doc::new(id, fields)).await.unwrap();
    }

    async fn populated() -> DocumentStore {
        let store = DocumentStore::in_memory();
        put(&store, "m3", json!({"type": "message", "conversationId": "c1", "createdAt": 30})).await;
        put(&store, "m1", json!({"type": "message", "conversationId": "c1", "createdAt": 10})).await;
        put(&store, "m2", json!({"type": "message", "conversationId": "c2", "createdAt": 20})).await;
        put(&store, "m4", json!({"type": "message", "conversationId": "c1", "createdAt": 10})).await;
        put(&store, "m5", json!({"type": "message", "conversationId": "c1"})).await;
        put(&store, "c1", json!({"type": "conversation", "updatedAt": 5})).await;
        store
    }

    fn ids(docs: &[Doc]) -> Vec<&str> {
        docs.iter().map(|d| d.id.as_str()).collect()
    }

    fn messages_of(conversation: &str) -> Query {
        Query::new()
            .eq("type", "message")
            .eq("conversationId", conversation)
            .sort_by("createdAt", SortDirection::Asc)
    }

    #[tokio::test]
    async fn test_full_scan_filters_and_sorts() {
        let store = populated().await;
        let (docs, plan) = store.find_with_plan(&messages_of("c1")).await;

        assert_eq!(plan, QueryPlan::FullScan);
        // m5 has no createdAt; m1 and m4 tie and fall back to id order
        assert_eq!(ids(&docs), vec!["m1", "m4", "m3"]);
    }

    #[tokio::test]
    async fn test_index_plan_matches_scan() {
        let store = populated().await;
        let scanned = store.find(&messages_of("c1")).await;

        store.ensure_index(["type", "conversationId", "createdAt"]).await.unwrap();
        let (indexed, plan) = store.find_with_plan(&messages_of("c1")).await;

        assert_eq!(
            plan,
            QueryPlan::Index {
                index: "[type, conversationId, createdAt]".into(),
                presorted: true
            }
        );
        assert_eq!(indexed, scanned);
    }

    #[tokio::test]
    async fn test_descending_sort_keeps_id_tiebreak() {
        let store = populated().await;
        let query = Query::new()
            .eq("conversationId", "c1")
            .sort_by("createdAt", SortDirection::Desc);

        let scanned = store.find(&query).await;
        assert_eq!(ids(&scanned), vec!["m3", "m1", "m4"]);

        store.ensure_index(["conversationId", "createdAt"]).await.unwrap();
        let (indexed, plan) = store.find_with_plan(&query).await;
        assert!(matches!(plan, QueryPlan::Index { presorted: true, .. }));
        assert_eq!(indexed, scanned);
    }

    #[tokio::test]
    async fn test_selector_only_index_still_filters_sort_field() {
        let store = populated().await;
        store.ensure_index(["type"]).await.unwrap();

        let query = Query::new().eq("type", "message").sort_by("createdAt", SortDirection::Asc);
        let (docs, plan) = store.find_with_plan(&query).await;

        assert!(matches!(plan, QueryPlan::Index { presorted: false, .. }));
        assert_eq!(ids(&docs), vec!["m1", "m4", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_limit_truncates() {
        let store = populated().await;
        let docs = store.find(&messages_of("c1").limit(2)).await;
        assert_eq!(ids(&docs), vec!["m1", "m4"]);

        assert!(store.find(&messages_of("c1").limit(0)).await.is_empty());
    }

    #[tokio::test]
    async fn test_numbers_compare_by_value() {
        let store = DocumentStore::in_memory();
        put(&store, "a", json!({"n": 1.0})).await;
        put(&store, "b", json!({"n": 1})).await;
        put(&store, "c", json!({"n": "1"})).await;

        let docs = store.find(&Query::new().eq("n", 1)).await;
        assert_eq!(ids(&docs), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_query_service_skips_malformed() {
        let store = Arc::new(DocumentStore::in_memory());
        put(&store, "convo:1:1", json!({"type": "conversation", "title": "ok", "createdAt": 1, "updatedAt": 2})).await;
        put(&store, "convo:1:2", json!({"type": "conversation", "updatedAt": 3})).await;

        let service = QueryService::new(store);
        let conversations = service.list_conversations(DEFAULT_LIMIT).await;

        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].title, "ok");
    }
}
