//! Local file system persistence for the document store
//!
//! Each document is written as JSON to `docs/<hh>/<sha256(id)>.json`, where
//! `<hh>` is the first two hex characters of the hash. A `store.json` file
//! next to `docs/` records the store's instance id.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs as tokio_fs;
use uuid::Uuid;

use super::store::StoredRecord;
use super::StorageError;

/// Contents of `store.json`
#[derive(Debug, Serialize, Deserialize)]
struct StoreMeta {
    instance_id: Uuid,
}

/// A storage provider that uses the local file system
#[derive(Clone, Debug)]
pub struct LocalStorage {
    /// Base directory for storage
    base_dir: PathBuf,
}

impl LocalStorage {
    /// Create a local storage provider, creating the directory layout if
    /// it doesn't exist yet.
    pub async fn new(base_dir: &Path) -> Result<Self, StorageError> {
        let docs_dir = base_dir.join("docs");
        if !docs_dir.exists() {
            tokio_fs::create_dir_all(&docs_dir).await?;
        }

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Get the path for a specific document identifier
    fn get_path(&self, id: &str) -> PathBuf {
        let hash = hex::encode(Sha256::digest(id.as_bytes()));
        let prefix = &hash[0..2];

        self.base_dir
            .join("docs")
            .join(prefix)
            .join(format!("{}.json", hash))
    }

    /// Read the instance id, generating and persisting one on first use.
    pub async fn load_or_create_instance_id(&self) -> Result<Uuid, StorageError> {
        let path = self.base_dir.join("store.json");

        if path.exists() {
            let data = tokio_fs::read(&path).await?;
            let meta: StoreMeta = serde_json::from_slice(&data)
                .map_err(|e| StorageError::SerializationError(e.to_string()))?;
            return Ok(meta.instance_id);
        }

        let meta = StoreMeta {
            instance_id: Uuid::new_v4(),
        };
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        write_atomic(&path, &json).await?;

        Ok(meta.instance_id)
    }

    /// Write one document record.
    pub async fn write(&self, record: &StoredRecord) -> Result<(), StorageError> {
        let path = self.get_path(&record.id);
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio_fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_vec(record)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        write_atomic(&path, &json).await
    }

    /// Load every persisted document record.
    pub async fn load_all(&self) -> Result<Vec<StoredRecord>, StorageError> {
        let mut records = Vec::new();

        let docs_dir = self.base_dir.join("docs");
        if !docs_dir.exists() {
            return Ok(records);
        }

        let mut dir_entries = tokio_fs::read_dir(&docs_dir).await?;
        while let Some(entry) = dir_entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let mut file_entries = tokio_fs::read_dir(&path).await?;
            while let Some(file_entry) = file_entries.next_entry().await? {
                let file_path = file_entry.path();
                if file_path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    continue;
                }

                let data = tokio_fs::read(&file_path).await?;
                let record: StoredRecord = serde_json::from_slice(&data).map_err(|e| {
                    StorageError::SerializationError(format!("{}: {}", file_path.display(), e))
                })?;
                records.push(record);
            }
        }

        Ok(records)
    }
}

/// Write through a temporary file so a crash never leaves a torn document.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("json.tmp");
    tokio_fs::write(&tmp, data).await?;
    tokio_fs::rename(&tmp, path).await?;
    Ok(())
}
