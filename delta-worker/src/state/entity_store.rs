use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use delta_common::metrics::{STORE_LOOKUPS_TOTAL, STORE_UPSERTS_TOTAL};
use delta_common::record::index_by_key;
use delta_common::store::EntityStore;
use delta_common::{transform, MappingSpec, Record, StateKey};
use metrics::counter;
use tracing::debug;

use super::{Delta, RecordStage, SnapshotInput, StateProvider};
use crate::error::PipelineError;

/// Compares every record against the entity last stored under its key.
///
/// Records are mapped onto the published shape before they are keyed, so
/// `id_property` names an output field and the store holds published records.
pub struct EntityStoreProvider {
    store: Arc<dyn EntityStore>,
    collection: String,
    id_property: String,
    chunk_size: NonZeroUsize,
    mapping: Option<MappingSpec>,
}

impl EntityStoreProvider {
    pub fn new(
        store: Arc<dyn EntityStore>,
        collection: String,
        id_property: String,
        chunk_size: NonZeroUsize,
        mapping: Option<MappingSpec>,
    ) -> Self {
        Self {
            store,
            collection,
            id_property,
            chunk_size,
            mapping,
        }
    }
}

/// Fields only present on the stored side never count as a change.
fn differs(new: &Record, stored: &Record) -> bool {
    new.iter()
        .any(|(field, value)| stored.get(field) != Some(value))
}

#[async_trait]
impl StateProvider for EntityStoreProvider {
    fn name(&self) -> &'static str {
        "entity_store"
    }

    async fn diff(&self, input: SnapshotInput<'_>) -> Result<Delta, PipelineError> {
        let published = input
            .records
            .iter()
            .map(|record| transform(record, self.mapping.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let keyed = index_by_key(published, &self.id_property)?;

        if input.full_load {
            return Ok(Delta {
                records: keyed.into_iter().map(|(_, record)| record).collect(),
                stage: RecordStage::Output,
            });
        }

        let mut changed = Vec::new();
        for chunk in keyed.chunks(self.chunk_size.get()) {
            let keys: Vec<StateKey> = chunk.iter().map(|(key, _)| key.clone()).collect();
            let current = self.store.get_multi(&self.collection, &keys).await?;
            counter!(STORE_LOOKUPS_TOTAL).increment(1);
            debug!(
                "looked up {} keys in {}: {} found, {} missing",
                keys.len(),
                self.collection,
                current.found.len(),
                current.missing.len()
            );

            for (key, record) in chunk {
                let is_changed = match current.found.get(key) {
                    Some(stored) => differs(record, stored),
                    None => true,
                };
                if is_changed {
                    changed.push(record.clone());
                }
            }
        }

        Ok(Delta {
            records: changed,
            stage: RecordStage::Output,
        })
    }

    async fn persist(&self, delta: &Delta) -> Result<(), PipelineError> {
        for chunk in delta.records.chunks(self.chunk_size.get()) {
            let entities = chunk
                .iter()
                .map(|record| {
                    StateKey::from_record(record, &self.id_property)
                        .map(|key| (key, record.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            self.store.put_multi(&self.collection, entities).await?;
            counter!(STORE_UPSERTS_TOTAL).increment(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delta_common::blob::BlobLocation;
    use delta_common::store::{MemoryEntityStore, MockStoreCall, StoreError};
    use serde_json::{json, Value};

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn provider(store: &MemoryEntityStore, chunk_size: usize) -> EntityStoreProvider {
        EntityStoreProvider::new(
            Arc::new(store.clone()),
            "orders".to_string(),
            "id".to_string(),
            NonZeroUsize::new(chunk_size).unwrap(),
            None,
        )
    }

    async fn diff(provider: &EntityStoreProvider, records: Vec<Record>) -> Result<Delta, PipelineError> {
        let location = BlobLocation::new("inbox", "orders.json");
        provider
            .diff(SnapshotInput {
                location: &location,
                records,
                full_load: false,
            })
            .await
    }

    #[tokio::test]
    async fn unseen_keys_are_new() {
        let store = MemoryEntityStore::new();
        let delta = diff(&provider(&store, 300), vec![record(json!({"id": "1", "v": 1}))])
            .await
            .unwrap();
        assert_eq!(delta.records, vec![record(json!({"id": "1", "v": 1}))]);
        assert_eq!(delta.stage, RecordStage::Output);
    }

    #[tokio::test]
    async fn equal_records_are_dropped_despite_extra_stored_fields() {
        let store = MemoryEntityStore::new();
        store.insert(
            "orders",
            StateKey::new("1"),
            record(json!({"id": "1", "v": 1, "legacy": "x"})),
        );
        let delta = diff(&provider(&store, 300), vec![record(json!({"id": "1", "v": 1}))])
            .await
            .unwrap();
        assert!(delta.is_empty());
    }

    #[tokio::test]
    async fn changed_records_carry_the_new_value() {
        let store = MemoryEntityStore::new();
        store.insert("orders", StateKey::new("1"), record(json!({"id": "1", "v": 1})));
        store.insert("orders", StateKey::new("2"), record(json!({"id": "2"})));

        let delta = diff(
            &provider(&store, 300),
            vec![
                record(json!({"id": "1", "v": 2})),
                // A field missing on the stored side is a change
                record(json!({"id": "2", "v": null})),
            ],
        )
        .await
        .unwrap();
        assert_eq!(
            delta.records,
            vec![
                record(json!({"id": "1", "v": 2})),
                record(json!({"id": "2", "v": null}))
            ]
        );
    }

    #[tokio::test]
    async fn lookups_are_chunked_and_keys_deduplicated() {
        let store = MemoryEntityStore::new();
        let mut records: Vec<Record> = (0..7).map(|i| record(json!({"id": i, "v": "a"}))).collect();
        records.push(record(json!({"id": 3, "v": "b"})));

        let delta = diff(&provider(&store, 3), records).await.unwrap();
        assert_eq!(delta.len(), 7);
        assert_eq!(delta.records[3], record(json!({"id": 3, "v": "b"})));
        assert_eq!(
            store.calls(),
            vec![
                MockStoreCall::GetMulti { collection: "orders".to_string(), keys: 3 },
                MockStoreCall::GetMulti { collection: "orders".to_string(), keys: 3 },
                MockStoreCall::GetMulti { collection: "orders".to_string(), keys: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn full_load_skips_lookups() {
        let store = MemoryEntityStore::new();
        store.insert("orders", StateKey::new("1"), record(json!({"id": "1"})));
        let location = BlobLocation::new("inbox", "orders.json");
        let delta = provider(&store, 300)
            .diff(SnapshotInput {
                location: &location,
                records: vec![record(json!({"id": "1"}))],
                full_load: true,
            })
            .await
            .unwrap();
        assert_eq!(delta.len(), 1);
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn identity_is_taken_from_the_mapped_record() {
        let store = MemoryEntityStore::new();
        let mapping: MappingSpec = r#"{"id": "Nummer", "naam": "Naam"}"#.parse().unwrap();
        let provider = EntityStoreProvider::new(
            Arc::new(store.clone()),
            "orders".to_string(),
            "id".to_string(),
            NonZeroUsize::new(300).unwrap(),
            Some(mapping),
        );
        let delta = diff(&provider, vec![record(json!({"Nummer": "7", "Naam": "x", "Extra": 1}))])
            .await
            .unwrap();
        assert_eq!(delta.records, vec![record(json!({"id": "7", "naam": "x"}))]);

        let err = diff(&provider, vec![record(json!({"Naam": "x"}))]).await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingIdentity(_)));
    }

    #[tokio::test]
    async fn persist_upserts_in_chunks() {
        let store = MemoryEntityStore::new();
        let provider = provider(&store, 2);
        let delta = Delta {
            records: (0..5).map(|i| record(json!({"id": i}))).collect(),
            stage: RecordStage::Output,
        };
        provider.persist(&delta).await.unwrap();
        assert_eq!(store.len(), 5);
        assert_eq!(store.calls().len(), 3);
    }

    #[tokio::test]
    async fn store_failures_surface() {
        let store = MemoryEntityStore::new().get_error(StoreError::Unavailable("down".to_string()));
        let err = diff(&provider(&store, 300), vec![record(json!({"id": "1"}))])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StoreUnavailable(_)));
    }
}
