use std::sync::Arc;

use delta_common::blob::BlobLocation;
use delta_common::record::{drop_columns, drop_duplicates};
use delta_common::Record;
use tracing::debug;

use crate::config::PipelineSettings;
use crate::error::PipelineError;
use crate::state::{Delta, SnapshotInput, StateProvider};

/// Prepares a decoded snapshot and hands it to the configured provider.
pub struct DiffEngine {
    provider: Arc<dyn StateProvider>,
    path_prefix_filter: Option<String>,
    drop_duplicates: bool,
    columns_drop: Vec<String>,
    full_load: bool,
}

impl DiffEngine {
    pub fn new(provider: Arc<dyn StateProvider>, settings: &PipelineSettings) -> Self {
        Self {
            provider,
            path_prefix_filter: settings.path_prefix_filter.clone(),
            drop_duplicates: settings.drop_duplicates,
            columns_drop: settings.columns_drop.clone(),
            full_load: settings.full_load,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Deliveries outside the prefix filter are not processed at all.
    pub fn accepts(&self, location: &BlobLocation) -> bool {
        match &self.path_prefix_filter {
            Some(prefix) => location.name.starts_with(prefix.as_str()),
            None => true,
        }
    }

    pub async fn diff(
        &self,
        location: &BlobLocation,
        mut records: Vec<Record>,
    ) -> Result<Delta, PipelineError> {
        drop_columns(&mut records, &self.columns_drop);
        if self.drop_duplicates {
            let before = records.len();
            records = drop_duplicates(records);
            debug!("dropped {} duplicate records", before - records.len());
        }

        self.provider
            .diff(SnapshotInput {
                location,
                records,
                full_load: self.full_load,
            })
            .await
    }

    pub async fn persist(&self, delta: &Delta) -> Result<(), PipelineError> {
        self.provider.persist(delta).await
    }
}
