//! Deployment configuration

use std::env;
use std::path::PathBuf;

use crate::replication::SyncConfig;
use crate::storage::StorageConfig;

/// Directory the document store persists to
pub const DATA_DIR_VAR: &str = "CHATZAP_DATA_DIR";

/// Remote replica URL; unset or blank disables sync
pub const REMOTE_URL_VAR: &str = "CHATZAP_REMOTE_URL";

#[derive(Clone, Debug, Default)]
pub struct ChatConfig {
    pub storage: StorageConfig,
    pub remote_url: Option<String>,
    pub sync: SyncConfig,
}

impl ChatConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup(DATA_DIR_VAR).filter(|d| !d.trim().is_empty()) {
            config.storage.base_dir = PathBuf::from(dir);
        }
        config.remote_url = lookup(REMOTE_URL_VAR)
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        config
    }

    /// Whether replication should be started at all.
    pub fn sync_enabled(&self) -> bool {
        self.remote_url.is_some()
    }
}
