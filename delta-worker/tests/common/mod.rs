//! In-memory pipeline wiring shared by the scenario tests.

#![allow(dead_code)]

use std::num::NonZeroUsize;
use std::sync::Arc;

use delta_common::blob::{BlobLocation, MemoryBlobStore};
use delta_common::bus::MemoryMessageBus;
use delta_common::store::MemoryEntityStore;
use delta_common::{MappingSpec, Record};
use delta_worker::config::{PipelineSettings, StateSettings};
use delta_worker::pipeline::Pipeline;
use delta_worker::state::{EntityStoreProvider, SnapshotArchiveProvider};
use serde_json::Value;

pub const INBOX: &str = "inbox";
pub const ARCHIVE: &str = "archive";
pub const ERROR: &str = "error";
pub const COLLECTION: &str = "orders";

pub struct Harness {
    pub blobs: MemoryBlobStore,
    pub bus: MemoryMessageBus,
    pub store: MemoryEntityStore,
    pub pipeline: Pipeline,
}

impl Harness {
    /// Deliver `contents` to the inbox and run the pipeline on it.
    pub async fn deliver(
        &self,
        name: &str,
        contents: &str,
    ) -> Result<delta_worker::pipeline::RunReport, delta_worker::error::PipelineError> {
        self.blobs.put(INBOX, name, contents);
        self.pipeline.run(&BlobLocation::new(INBOX, name)).await
    }

    pub fn published(&self) -> Vec<Value> {
        self.bus.json_messages()
    }
}

pub fn snapshot_settings(columns_nonpii: &[&str]) -> PipelineSettings {
    let mut settings = PipelineSettings::new(
        INBOX,
        ARCHIVE,
        StateSettings::SnapshotArchive {
            id_property: None,
            columns_nonpii: columns_nonpii.iter().map(|c| c.to_string()).collect(),
        },
    );
    settings.error = Some(ERROR.to_string());
    settings
}

pub fn entity_settings(id_property: &str, chunk_size: usize) -> PipelineSettings {
    let mut settings = PipelineSettings::new(
        INBOX,
        ARCHIVE,
        StateSettings::EntityStore {
            id_property: id_property.to_string(),
            collection: COLLECTION.to_string(),
            chunk_size: NonZeroUsize::new(chunk_size).unwrap(),
        },
    );
    settings.error = Some(ERROR.to_string());
    settings
}

pub fn mapping(json: &str) -> MappingSpec {
    json.parse().unwrap()
}

pub fn harness(settings: PipelineSettings) -> Harness {
    harness_with(settings, MemoryBlobStore::new(), MemoryMessageBus::new())
}

pub fn harness_with(
    settings: PipelineSettings,
    blobs: MemoryBlobStore,
    bus: MemoryMessageBus,
) -> Harness {
    build(settings, blobs, bus, MemoryEntityStore::new())
}

pub fn harness_with_store(settings: PipelineSettings, store: MemoryEntityStore) -> Harness {
    build(settings, MemoryBlobStore::new(), MemoryMessageBus::new(), store)
}

fn build(
    settings: PipelineSettings,
    blobs: MemoryBlobStore,
    bus: MemoryMessageBus,
    store: MemoryEntityStore,
) -> Harness {
    let pipeline = match &settings.state {
        StateSettings::EntityStore {
            id_property,
            collection,
            chunk_size,
        } => {
            let provider = EntityStoreProvider::new(
                Arc::new(store.clone()),
                collection.clone(),
                id_property.clone(),
                *chunk_size,
                settings.mapping.clone(),
            );
            Pipeline::new(
                settings,
                Arc::new(blobs.clone()),
                Arc::new(provider),
                Arc::new(bus.clone()),
            )
        }
        StateSettings::SnapshotArchive { .. } => {
            let provider = SnapshotArchiveProvider::new(Arc::new(blobs.clone()), &settings);
            Pipeline::new(
                settings,
                Arc::new(blobs.clone()),
                Arc::new(provider),
                Arc::new(bus.clone()),
            )
        }
    };
    Harness {
        blobs,
        bus,
        store,
        pipeline,
    }
}

pub fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}
