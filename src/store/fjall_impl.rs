use core::fmt;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use bytes::Bytes;
use fjall::{PersistMode, TransactionalKeyspace, TransactionalPartitionHandle};
use tempfile::TempDir;
use tracing::{debug, info};

use super::*;

/// How often a write transaction is retried after losing a conflict to a concurrent one.
const MAX_TX_ATTEMPTS: usize = 16;

/// Chunks and recipes in an embedded fjall keyspace, one partition each.
///
/// Writes run in serializable transactions, which is what keeps concurrent puts of the
/// same chunk, and concurrent replaces of the same recipe, from stepping on each other.
/// fjall blocks on disk I/O, so every call is moved onto the blocking thread pool.
pub struct FjallStore {
    db: Partitions,

    // declared last so the keyspace is closed before the directory goes away
    _tempdir: Option<TempDir>,
}

/// Cheaply cloneable handles, moved into each blocking task.
#[derive(Clone)]
struct Partitions {
    database: TransactionalKeyspace,
    chunks: TransactionalPartitionHandle,
    recipes: TransactionalPartitionHandle,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let store = Self::open_in(path, None)?;
        info!(path = %path.display(), "opened chunk store");
        Ok(store)
    }

    /// A store in a fresh temporary directory, removed when the store is dropped.
    pub fn temporary() -> Result<Self, StoreError> {
        let tempdir = tempfile::tempdir()?;
        let path = tempdir.path().to_owned();
        let store = Self::open_in(&path, Some(tempdir))?;
        info!(path = %path.display(), "opened temporary chunk store");
        Ok(store)
    }

    fn open_in(path: &Path, tempdir: Option<TempDir>) -> Result<Self, StoreError> {
        let database = fjall::Config::new(path).open_transactional()?;
        let chunks = database.open_partition("chunks", Default::default())?;
        let recipes = database.open_partition("recipes", Default::default())?;

        Ok(Self {
            db: Partitions {
                database,
                chunks,
                recipes,
            },
            _tempdir: tempdir,
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(Partitions) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db)).await?
    }
}

impl fmt::Debug for FjallStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FjallStore").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl ChunkStore for FjallStore {
    async fn exists_batch(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<HashSet<Fingerprint>, StoreError> {
        let fingerprints = fingerprints.to_vec();
        self.blocking(move |db| {
            let read_tx = db.database.read_tx();
            let mut present = HashSet::new();
            for fingerprint in fingerprints {
                if read_tx.contains_key(&db.chunks, fingerprint.as_bytes())? {
                    present.insert(fingerprint);
                }
            }
            Ok(present)
        })
        .await
    }

    async fn sizes(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<HashMap<Fingerprint, u64>, StoreError> {
        let fingerprints = fingerprints.to_vec();
        self.blocking(move |db| {
            let read_tx = db.database.read_tx();
            let mut sizes = HashMap::new();
            for fingerprint in fingerprints {
                if let Some(payload) = read_tx.get(&db.chunks, fingerprint.as_bytes())? {
                    sizes.insert(fingerprint, payload.len() as u64);
                }
            }
            Ok(sizes)
        })
        .await
    }

    async fn put(&self, fingerprint: Fingerprint, payload: Bytes) -> Result<bool, StoreError> {
        self.blocking(move |db| {
            let key = &fingerprint.as_bytes()[..];

            for attempt in 0..MAX_TX_ATTEMPTS {
                let mut write_tx = db.database.write_tx()?;
                if write_tx.contains_key(&db.chunks, key)? {
                    return Ok(false);
                }
                write_tx.insert(&db.chunks, key, &payload[..]);

                if write_tx.commit()?.is_ok() {
                    db.database.persist(PersistMode::SyncAll)?;
                    return Ok(true);
                }
                // someone else committed in between, most likely the very same chunk
                debug!(?fingerprint, attempt, "chunk insert conflicted, retrying");
            }
            Err(StoreError::Contention(fingerprint.to_string()))
        })
        .await
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Bytes, StoreError> {
        let fingerprint = *fingerprint;
        self.blocking(move |db| {
            let read_tx = db.database.read_tx();
            let payload = read_tx
                .get(&db.chunks, fingerprint.as_bytes())?
                .ok_or(StoreError::NotFound)?;
            Ok(Bytes::copy_from_slice(&payload))
        })
        .await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.blocking(|db| {
            let read_tx = db.database.read_tx();
            let mut stats = StoreStats::default();
            for entry in read_tx.iter(&db.chunks) {
                let (key, payload) = entry?;
                if key.len() != 32 {
                    return Err(StoreError::CorruptKey);
                }
                stats.chunks += 1;
                stats.bytes += payload.len() as u64;
            }
            Ok(stats)
        })
        .await
    }
}

#[async_trait::async_trait]
impl RecipeStore for FjallStore {
    async fn put(
        &self,
        recipe: NewRecipe,
        precondition: Precondition,
    ) -> Result<Recipe, StoreError> {
        self.blocking(move |db| {
            let key = recipe.file_id.as_bytes();

            for attempt in 0..MAX_TX_ATTEMPTS {
                let mut write_tx = db.database.write_tx()?;
                let current = match write_tx.get(&db.recipes, key)? {
                    Some(stored) => Some(postcard::from_bytes::<Recipe>(&stored)?),
                    None => None,
                };

                let replaced = match apply_update(current, &recipe, precondition)? {
                    RecipeUpdate::Unchanged(recipe) => return Ok(recipe),
                    RecipeUpdate::Replaced(recipe) => recipe,
                };
                write_tx.insert(&db.recipes, key, postcard::to_stdvec(&replaced)?);

                if write_tx.commit()?.is_ok() {
                    db.database.persist(PersistMode::SyncAll)?;
                    return Ok(replaced);
                }
                // re-evaluate the precondition against whatever won the race
                debug!(file_id = %recipe.file_id, attempt, "recipe replace conflicted, retrying");
            }
            Err(StoreError::Contention(recipe.file_id.clone()))
        })
        .await
    }

    async fn get(&self, file_id: &str) -> Result<Recipe, StoreError> {
        let file_id = file_id.to_owned();
        self.blocking(move |db| {
            let read_tx = db.database.read_tx();
            let stored = read_tx
                .get(&db.recipes, file_id.as_bytes())?
                .ok_or(StoreError::NotFound)?;
            Ok(postcard::from_bytes(&stored)?)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<RecipeSummary>, StoreError> {
        self.blocking(|db| {
            let read_tx = db.database.read_tx();
            let mut summaries = vec![];
            for entry in read_tx.iter(&db.recipes) {
                let (_file_id, stored) = entry?;
                let recipe: Recipe = postcard::from_bytes(&stored)?;
                summaries.push(recipe.summary());
            }
            sort_summaries(&mut summaries);
            Ok(summaries)
        })
        .await
    }
}
