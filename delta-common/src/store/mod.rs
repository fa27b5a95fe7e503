//! Keyed entity store holding the last published version of every record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{Record, StateKey};

mod redis;

pub use self::redis::RedisEntityStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("entity store unavailable: {0}")]
    Unavailable(String),
    #[error("stored entity {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Result of a batched lookup. Every requested key lands in exactly one of the
/// two halves.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FetchResult {
    pub found: HashMap<StateKey, Record>,
    pub missing: Vec<StateKey>,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_multi(
        &self,
        collection: &str,
        keys: &[StateKey],
    ) -> Result<FetchResult, StoreError>;

    /// Replace each entity by key; this is not a field-level merge.
    async fn put_multi(
        &self,
        collection: &str,
        entities: Vec<(StateKey, Record)>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockStoreCall {
    GetMulti { collection: String, keys: usize },
    PutMulti { collection: String, entities: usize },
}

/// In-memory entity store recording every batched call.
#[derive(Clone, Default)]
pub struct MemoryEntityStore {
    entities: Arc<Mutex<HashMap<(String, StateKey), Record>>>,
    calls: Arc<Mutex<Vec<MockStoreCall>>>,
    get_error: Option<StoreError>,
    put_error: Option<StoreError>,
    fail_put_after: Option<usize>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_error(mut self, err: StoreError) -> Self {
        self.get_error = Some(err);
        self
    }

    pub fn put_error(mut self, err: StoreError) -> Self {
        self.put_error = Some(err);
        self
    }

    /// Let the first `calls` batched writes succeed, then fail with the
    /// configured put error.
    pub fn fail_put_after(mut self, calls: usize) -> Self {
        self.fail_put_after = Some(calls);
        self
    }

    pub fn insert(&self, collection: &str, key: StateKey, record: Record) {
        lock(&self.entities).insert((collection.to_owned(), key), record);
    }

    pub fn get(&self, collection: &str, key: &StateKey) -> Option<Record> {
        lock(&self.entities)
            .get(&(collection.to_owned(), key.clone()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.entities).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn calls(&self) -> Vec<MockStoreCall> {
        lock(&self.calls).clone()
    }

    fn put_calls(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, MockStoreCall::PutMulti { .. }))
            .count()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn get_multi(
        &self,
        collection: &str,
        keys: &[StateKey],
    ) -> Result<FetchResult, StoreError> {
        lock(&self.calls).push(MockStoreCall::GetMulti {
            collection: collection.to_owned(),
            keys: keys.len(),
        });
        if let Some(err) = &self.get_error {
            return Err(err.clone());
        }

        let entities = lock(&self.entities);
        let mut result = FetchResult::default();
        for key in keys {
            match entities.get(&(collection.to_owned(), key.clone())) {
                Some(entity) => {
                    result.found.insert(key.clone(), entity.clone());
                }
                None => result.missing.push(key.clone()),
            }
        }
        Ok(result)
    }

    async fn put_multi(
        &self,
        collection: &str,
        entities: Vec<(StateKey, Record)>,
    ) -> Result<(), StoreError> {
        let previous_puts = self.put_calls();
        lock(&self.calls).push(MockStoreCall::PutMulti {
            collection: collection.to_owned(),
            entities: entities.len(),
        });
        if let Some(err) = &self.put_error {
            if self.fail_put_after.map_or(true, |n| previous_puts >= n) {
                return Err(err.clone());
            }
        }

        let mut stored = lock(&self.entities);
        for (key, record) in entities {
            stored.insert((collection.to_owned(), key), record);
        }
        Ok(())
    }
}
