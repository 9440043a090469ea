use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use bytes::Bytes;

use super::*;

/// Keeps chunks and recipes in process memory. Everything is lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    chunks: RwLock<HashMap<Fingerprint, Bytes>>,
    recipes: RwLock<HashMap<String, Recipe>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

// A panic while holding one of the locks cannot leave a map half-updated, so a
// poisoned lock is still safe to use.

#[async_trait::async_trait]
impl ChunkStore for MemoryStore {
    async fn exists_batch(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<HashSet<Fingerprint>, StoreError> {
        let chunks = self.chunks.read().unwrap_or_else(PoisonError::into_inner);
        Ok(fingerprints
            .iter()
            .filter(|fingerprint| chunks.contains_key(fingerprint))
            .copied()
            .collect())
    }

    async fn sizes(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<HashMap<Fingerprint, u64>, StoreError> {
        let chunks = self.chunks.read().unwrap_or_else(PoisonError::into_inner);
        Ok(fingerprints
            .iter()
            .filter_map(|fingerprint| {
                let payload = chunks.get(fingerprint)?;
                Some((*fingerprint, payload.len() as u64))
            })
            .collect())
    }

    async fn put(&self, fingerprint: Fingerprint, payload: Bytes) -> Result<bool, StoreError> {
        let mut chunks = self.chunks.write().unwrap_or_else(PoisonError::into_inner);
        if chunks.contains_key(&fingerprint) {
            return Ok(false);
        }
        chunks.insert(fingerprint, payload);
        Ok(true)
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Bytes, StoreError> {
        let chunks = self.chunks.read().unwrap_or_else(PoisonError::into_inner);
        chunks.get(fingerprint).cloned().ok_or(StoreError::NotFound)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let chunks = self.chunks.read().unwrap_or_else(PoisonError::into_inner);
        Ok(StoreStats {
            chunks: chunks.len() as u64,
            bytes: chunks.values().map(|payload| payload.len() as u64).sum(),
        })
    }
}

#[async_trait::async_trait]
impl RecipeStore for MemoryStore {
    async fn put(
        &self,
        recipe: NewRecipe,
        precondition: Precondition,
    ) -> Result<Recipe, StoreError> {
        // the write lock serializes concurrent replaces of the same file
        let mut recipes = self.recipes.write().unwrap_or_else(PoisonError::into_inner);
        let current = recipes.get(&recipe.file_id).cloned();

        match apply_update(current, &recipe, precondition)? {
            RecipeUpdate::Unchanged(recipe) => Ok(recipe),
            RecipeUpdate::Replaced(recipe) => {
                recipes.insert(recipe.file_id.clone(), recipe.clone());
                Ok(recipe)
            }
        }
    }

    async fn get(&self, file_id: &str) -> Result<Recipe, StoreError> {
        let recipes = self.recipes.read().unwrap_or_else(PoisonError::into_inner);
        recipes.get(file_id).cloned().ok_or(StoreError::NotFound)
    }

    async fn list(&self) -> Result<Vec<RecipeSummary>, StoreError> {
        let mut summaries: Vec<_> = {
            let recipes = self.recipes.read().unwrap_or_else(PoisonError::into_inner);
            recipes.values().map(Recipe::summary).collect()
        };
        sort_summaries(&mut summaries);
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::contract;
    use super::*;

    #[tokio::test]
    async fn chunk_store_contract() {
        contract::chunk_store_dedups(&MemoryStore::new()).await;
        contract::first_writer_wins(&MemoryStore::new()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_store_once() {
        contract::concurrent_puts(Arc::new(MemoryStore::new())).await;
    }

    #[tokio::test]
    async fn recipe_store_contract() {
        contract::recipes_replace_wholesale(&MemoryStore::new()).await;
        contract::identical_recipe_is_noop(&MemoryStore::new()).await;
        contract::stale_precondition_conflicts(&MemoryStore::new()).await;
        contract::lists_recent_first(&MemoryStore::new()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_replaces_admit_one_writer() {
        contract::concurrent_recipe_replace(Arc::new(MemoryStore::new())).await;
    }
}
