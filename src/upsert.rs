//! Create-or-update writes

use crate::storage::{Doc, DocumentStore, StorageError};

impl DocumentStore {
    /// Write `doc` whether or not its id exists yet.
    ///
    /// An existing document has `doc`'s fields merged over its own (top
    /// level only) and is written at its current revision. A missing one is
    /// created. Any revision on `doc` is ignored. A write racing this one
    /// surfaces as [`StorageError::Conflict`]; it is not retried here.
    ///
    /// Returns `doc` with the new revision attached.
    pub async fn upsert(&self, mut doc: Doc) -> Result<Doc, StorageError> {
        let rev = match self.get(&doc.id).await {
            Ok(existing) => {
                let mut merged = existing;
                merged.fields.extend(doc.fields.clone());
                self.put(merged).await?
            }
            Err(e) if e.is_not_found() => {
                let create = Doc::new(doc.id.clone(), doc.fields.clone());
                self.put(create).await?
            }
            Err(e) => return Err(e),
        };

        doc.rev = Some(rev);
        Ok(doc)
    }
}
