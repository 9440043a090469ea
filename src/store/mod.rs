//! Content-addressed chunk storage and the recipes that reassemble files from it.
//!
//! Both stores are async traits so the reconciler and reconstructor can hold them as
//! `Arc<dyn …>` without caring which backend is behind them.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::fingerprint::{FileDigest, Fingerprint};

pub mod fjall_impl;
pub mod mem_impl;

pub use fjall_impl::FjallStore;
pub use mem_impl::MemoryStore;

/// Milliseconds since the unix epoch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        SystemTime::now().into()
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        let millis = time
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        Self(millis)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("entry not found")]
    NotFound,
    #[error("recipe for {file_id:?} does not match the expected version (current: {current:?})")]
    Conflict {
        file_id: String,
        current: Option<u64>,
    },
    #[error("transaction on {0:?} kept conflicting")]
    Contention(String),
    #[error("storage backend failure")]
    Backend(#[from] fjall::Error),
    #[error("malformed stored value")]
    Encoding(#[from] postcard::Error),
    #[error("stored key is not a fingerprint")]
    CorruptKey,
    #[error("failed to prepare storage directory")]
    Io(#[from] std::io::Error),
    #[error("storage task did not complete")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub chunks: u64,
    pub bytes: u64,
}

/// Content-addressed storage for chunk payloads.
///
/// A fingerprint, once stored, is never removed and never rewritten. `put` does not
/// check that the payload hashes to the fingerprint; that is the caller's job.
#[async_trait::async_trait]
pub trait ChunkStore: Send + Sync {
    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        let present = self.exists_batch(std::slice::from_ref(fingerprint)).await?;
        Ok(!present.is_empty())
    }

    /// Returns the subset of `fingerprints` that is present.
    async fn exists_batch(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<HashSet<Fingerprint>, StoreError>;

    /// Payload length of each present fingerprint. Absent ones are left out.
    async fn sizes(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<HashMap<Fingerprint, u64>, StoreError>;

    /// Stores `payload` unless the fingerprint is already present.
    ///
    /// Returns whether this call stored the payload. Concurrent calls for the same
    /// fingerprint all succeed and exactly one of them returns `true`.
    async fn put(&self, fingerprint: Fingerprint, payload: Bytes) -> Result<bool, StoreError>;

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Bytes, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// Maps a file id to the ordered list of chunks it consists of.
#[async_trait::async_trait]
pub trait RecipeStore: Send + Sync {
    /// Replaces the recipe for `recipe.file_id` as a whole, if `precondition` holds.
    ///
    /// Writing the same chunk sequence the file already has is a no-op that returns the
    /// stored recipe untouched.
    async fn put(&self, recipe: NewRecipe, precondition: Precondition)
        -> Result<Recipe, StoreError>;

    async fn get(&self, file_id: &str) -> Result<Recipe, StoreError>;

    /// All stored recipes, most recently updated first.
    async fn list(&self) -> Result<Vec<RecipeSummary>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub file_id: String,
    pub chunks: Vec<Fingerprint>,
    pub size: u64,
    pub digest: FileDigest,
    pub updated_at: Timestamp,
    pub version: u64,
}

impl Recipe {
    pub fn summary(&self) -> RecipeSummary {
        RecipeSummary {
            file_id: self.file_id.clone(),
            updated_at: self.updated_at,
            size: self.size,
            chunk_count: self.chunks.len() as u64,
            version: self.version,
            digest: self.digest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecipe {
    pub file_id: String,
    pub chunks: Vec<Fingerprint>,
    pub size: u64,
    pub digest: FileDigest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeSummary {
    pub file_id: String,
    pub updated_at: Timestamp,
    pub size: u64,
    pub chunk_count: u64,
    pub version: u64,
    pub digest: FileDigest,
}

/// Condition on the currently stored recipe that must hold for a `put` to go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    Unconditional,
    /// No recipe exists for the file yet.
    Absent,
    /// The stored recipe is at exactly this version.
    Version(u64),
}

impl Precondition {
    pub fn from_base_version(base_version: Option<u64>) -> Self {
        match base_version {
            Some(version) => Self::Version(version),
            None => Self::Absent,
        }
    }

    fn holds(&self, current: Option<&Recipe>) -> bool {
        match (self, current) {
            (Self::Unconditional, _) => true,
            (Self::Absent, current) => current.is_none(),
            (Self::Version(expected), Some(current)) => current.version == *expected,
            (Self::Version(_), None) => false,
        }
    }
}

pub(crate) enum RecipeUpdate {
    Unchanged(Recipe),
    Replaced(Recipe),
}

/// The replace-or-keep decision shared by all backends. Callers must hold whatever
/// serializes writes to `new.file_id` while applying the result.
pub(crate) fn apply_update(
    current: Option<Recipe>,
    new: &NewRecipe,
    precondition: Precondition,
) -> Result<RecipeUpdate, StoreError> {
    if let Some(current) = current.as_ref() {
        if current.chunks == new.chunks {
            return Ok(RecipeUpdate::Unchanged(current.clone()));
        }
    }
    if !precondition.holds(current.as_ref()) {
        return Err(StoreError::Conflict {
            file_id: new.file_id.clone(),
            current: current.map(|recipe| recipe.version),
        });
    }

    let updated_at = match &current {
        // keep `updated_at` monotonic per file even if the clock steps back
        Some(current) => Timestamp::now().max(Timestamp(current.updated_at.0 + 1)),
        None => Timestamp::now(),
    };
    Ok(RecipeUpdate::Replaced(Recipe {
        file_id: new.file_id.clone(),
        chunks: new.chunks.clone(),
        size: new.size,
        digest: new.digest,
        updated_at,
        version: current.map_or(1, |recipe| recipe.version + 1),
    }))
}

pub(crate) fn sort_summaries(summaries: &mut [RecipeSummary]) {
    summaries.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.file_id.cmp(&b.file_id))
    });
}
