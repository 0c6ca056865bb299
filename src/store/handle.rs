//! Handle to one named store (one column family).

use super::Backend;
use crate::error::Result;
use crate::types::{Entry, KeyMutation, StoreMutations, StoreTransaction};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A store opened through [`super::StoreManager::open_store`].
///
/// Cheap to clone; all clones share the manager's pool and trackers.
#[derive(Clone)]
pub struct KeyColumnValueStore {
    name: String,
    backend: Arc<Backend>,
}

impl KeyColumnValueStore {
    pub(crate) fn new(name: String, backend: Arc<Backend>) -> Self {
        Self { name, backend }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read one column, `None` if it does not exist.
    pub async fn get(
        &self,
        key: &[u8],
        column: &[u8],
        tx: &StoreTransaction,
    ) -> Result<Option<Bytes>> {
        self.backend
            .get_column(&self.name, key, column, tx.read_consistency())
            .await
    }

    /// Apply additions and deletions to one key of this store.
    pub async fn mutate(
        &self,
        key: Bytes,
        additions: Vec<Entry>,
        deletions: Vec<Bytes>,
        tx: &StoreTransaction,
    ) -> Result<()> {
        let mut by_key = BTreeMap::new();
        by_key.insert(key, KeyMutation::new(additions, deletions));
        let mut mutations = StoreMutations::new();
        mutations.insert(self.name.clone(), by_key);
        self.backend.mutate_many(&mutations, tx).await
    }

    /// Write a single column.
    pub async fn insert(
        &self,
        key: &[u8],
        column: Bytes,
        value: Bytes,
        tx: &StoreTransaction,
    ) -> Result<()> {
        self.backend
            .insert_column(&self.name, key, column, value, tx.write_consistency())
            .await
    }
}

impl fmt::Debug for KeyColumnValueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyColumnValueStore")
            .field("name", &self.name)
            .field("keyspace", &self.backend.config.keyspace)
            .finish()
    }
}
