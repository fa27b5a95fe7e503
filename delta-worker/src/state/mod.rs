//! Previous-state providers: what the last successful run left behind, and how
//! a new snapshot is compared against it.

use async_trait::async_trait;
use delta_common::blob::BlobLocation;
use delta_common::Record;

use crate::error::PipelineError;

mod entity_store;
mod snapshot_archive;

pub use entity_store::EntityStoreProvider;
pub use snapshot_archive::SnapshotArchiveProvider;

/// Whether the records of a delta still need mapping onto the published shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStage {
    Source,
    Output,
}

/// The new-or-changed records of a snapshot, in snapshot order.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    pub records: Vec<Record>,
    pub stage: RecordStage,
}

impl Delta {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// One snapshot on its way through a run.
#[derive(Debug)]
pub struct SnapshotInput<'a> {
    pub location: &'a BlobLocation,
    /// Decoded records, with dropped columns and duplicates already removed.
    pub records: Vec<Record>,
    /// Compare against nothing, every record is part of the delta.
    pub full_load: bool,
}

#[async_trait]
pub trait StateProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn diff(&self, input: SnapshotInput<'_>) -> Result<Delta, PipelineError>;

    /// Record the published delta as the new state. Only called once every
    /// message of the run has been acknowledged.
    async fn persist(&self, delta: &Delta) -> Result<(), PipelineError>;
}
