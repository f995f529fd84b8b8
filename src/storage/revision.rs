//! Revision tokens
//!
//! A revision is `<generation>-<digest>`. The generation counts writes along
//! a document's history; the digest is derived from the parent revision and
//! the new body, so two replicas making the same edit from the same parent
//! arrive at the same token.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::StorageError;

/// Number of hex characters kept from the SHA-256 digest.
const DIGEST_LEN: usize = 32;

/// An opaque-to-callers revision token.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Revision {
    generation: u64,
    digest: String,
}

impl Revision {
    /// Compute the revision that follows `parent` when `fields` is written.
    pub fn next(parent: Option<&Revision>, fields: &Map<String, Value>) -> Self {
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update([0u8]);
        // serde_json's Map is ordered by key, so this encoding is canonical
        hasher.update(Value::Object(fields.clone()).to_string().as_bytes());

        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(DIGEST_LEN);

        Self {
            generation: parent.map_or(1, |p| p.generation + 1),
            digest,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Pick the winner between two divergent revisions of one document:
    /// higher generation first, then the lexicographically greater digest.
    pub fn winner<'a>(a: &'a Revision, b: &'a Revision) -> &'a Revision {
        if a >= b {
            a
        } else {
            b
        }
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.digest.cmp(&other.digest))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for Revision {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StorageError::InvalidDocument(format!("malformed revision '{}'", s));

        let (generation, digest) = s.split_once('-').ok_or_else(invalid)?;
        let generation: u64 = generation.parse().map_err(|_| invalid())?;
        if generation == 0 || digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }

        Ok(Self {
            generation,
            digest: digest.to_string(),
        })
    }
}

impl Serialize for Revision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
