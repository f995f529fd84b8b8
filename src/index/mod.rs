//! Secondary indexes
//!
//! An index is declared over an ordered list of top-level field names. It
//! keeps every document that has all of those fields, ordered by the tuple
//! of their values and then by document id, so an equality prefix followed
//! by a range walk answers a query without touching unrelated documents.
//!
//! Indexes only speed queries up; a query with no usable index falls back
//! to a scan and returns the same rows.

mod value;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde_json::{Map, Value};

use crate::storage::StorageError;

pub use value::IndexValue;

/// The tuple of field values a document is filed under
pub type IndexKey = Vec<IndexValue>;

/// An ordered list of field names
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexSpec {
    fields: Vec<String>,
}

impl IndexSpec {
    pub fn new<I, S>(fields: I) -> Result<Self, StorageError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();

        if fields.is_empty() {
            return Err(StorageError::InvalidIndex("an index needs at least one field".into()));
        }
        if fields.iter().any(|f| f.is_empty()) {
            return Err(StorageError::InvalidIndex("empty field name".into()));
        }
        let distinct: BTreeSet<&String> = fields.iter().collect();
        if distinct.len() != fields.len() {
            return Err(StorageError::InvalidIndex(format!(
                "duplicate field in [{}]",
                fields.join(", ")
            )));
        }

        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Key for a document, or `None` when a field is missing or holds a
    /// value that can't be ordered (objects, arrays).
    pub fn key_for(&self, fields: &Map<String, Value>) -> Option<IndexKey> {
        self.fields
            .iter()
            .map(|f| fields.get(f).and_then(IndexValue::from_json))
            .collect()
    }
}

impl fmt::Display for IndexSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.fields.join(", "))
    }
}

/// One maintained index
#[derive(Debug)]
pub struct SecondaryIndex {
    spec: IndexSpec,

    /// (key, document id), ordered
    entries: BTreeSet<(IndexKey, String)>,

    /// Reverse map so an update can find the entry it replaces
    keys: HashMap<String, IndexKey>,
}

impl SecondaryIndex {
    fn new(spec: IndexSpec) -> Self {
        Self {
            spec,
            entries: BTreeSet::new(),
            keys: HashMap::new(),
        }
    }

    pub fn spec(&self) -> &IndexSpec {
        &self.spec
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn update(&mut self, id: &str, fields: &Map<String, Value>) {
        self.remove(id);
        if let Some(key) = self.spec.key_for(fields) {
            self.entries.insert((key.clone(), id.to_string()));
            self.keys.insert(id.to_string(), key);
        }
    }

    fn remove(&mut self, id: &str) {
        if let Some(old) = self.keys.remove(id) {
            self.entries.remove(&(old, id.to_string()));
        }
    }

    /// All entries whose key starts with `prefix`, in index order.
    pub fn scan_prefix(&self, prefix: &[IndexValue]) -> Vec<(&IndexKey, &str)> {
        // a strict prefix sorts before every key that extends it
        let start = (prefix.to_vec(), String::new());
        self.entries
            .range(start..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, id)| (key, id.as_str()))
            .collect()
    }
}

/// How a query with a given selector and sort can use an index
#[derive(Debug)]
pub struct IndexMatch<'a> {
    pub index: &'a SecondaryIndex,

    /// Whether the index order already matches the requested sort field
    pub presorted: bool,
}

/// The set of declared indexes
#[derive(Debug, Default)]
pub struct IndexManager {
    indexes: BTreeMap<IndexSpec, SecondaryIndex>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an index and build it over `docs`. Returns `false` if it was
    /// already declared.
    pub fn ensure<'a, I>(&mut self, spec: IndexSpec, docs: I) -> bool
    where
        I: IntoIterator<Item = (&'a str, &'a Map<String, Value>)>,
    {
        if self.indexes.contains_key(&spec) {
            return false;
        }

        let mut index = SecondaryIndex::new(spec.clone());
        for (id, fields) in docs {
            index.update(id, fields);
        }
        log::debug!("Built index {} with {} entries", spec, index.len());
        self.indexes.insert(spec, index);
        true
    }

    /// Refile a document in every index after it was written.
    pub fn update(&mut self, id: &str, fields: &Map<String, Value>) {
        for index in self.indexes.values_mut() {
            index.update(id, fields);
        }
    }

    pub fn specs(&self) -> impl Iterator<Item = &IndexSpec> {
        self.indexes.keys()
    }

    pub fn get(&self, spec: &IndexSpec) -> Option<&SecondaryIndex> {
        self.indexes.get(spec)
    }

    /// Find an index answering an equality match on `selector` fields with
    /// an optional sort.
    ///
    /// Usable indexes start with exactly the selector fields (in any order)
    /// and have at most one more field, which must be the sort field. That
    /// keeps index membership identical to what a scan would match. Indexes
    /// that also deliver the sort order are preferred.
    pub fn find_for(&self, selector: &[&str], sort: Option<&str>) -> Option<IndexMatch<'_>> {
        let wanted: BTreeSet<&str> = selector.iter().copied().collect();
        if wanted.len() != selector.len() {
            return None;
        }
        let k = wanted.len();

        let mut best: Option<IndexMatch<'_>> = None;
        for (spec, index) in &self.indexes {
            let fields = spec.fields();
            if fields.len() < k || fields.len() > k + 1 {
                continue;
            }
            let head: BTreeSet<&str> = fields[..k].iter().map(String::as_str).collect();
            if head != wanted {
                continue;
            }

            let presorted = match (fields.get(k), sort) {
                (None, _) => false,
                (Some(extra), Some(sort)) if extra == sort => true,
                (Some(_), _) => continue,
            };

            let better = match &best {
                None => true,
                Some(current) => presorted && !current.presorted,
            };
            if better {
                best = Some(IndexMatch { index, presorted });
            }
        }
        best
    }
}
