use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use delta_common::blob::{BlobLocation, BlobMeta, BlobStore};
use delta_common::codec::{CodecOptions, SnapshotFormat};
use delta_common::record::{columns, drop_columns, drop_duplicates, fingerprint};
use delta_common::{Record, StateKey};
use tracing::info;

use super::{Delta, RecordStage, SnapshotInput, StateProvider};
use crate::config::{PipelineSettings, StateSettings};
use crate::error::PipelineError;

/// Compares a snapshot against the most recent one in the archive.
///
/// A record is part of the delta when no previous record has the same value for
/// every compared column.
pub struct SnapshotArchiveProvider {
    blobs: Arc<dyn BlobStore>,
    archive: String,
    prefix: String,
    archives_in_place: bool,
    columns_drop: Vec<String>,
    drop_duplicates: bool,
    columns_nonpii: BTreeSet<String>,
    id_property: Option<String>,
    codec: CodecOptions,
}

impl SnapshotArchiveProvider {
    pub fn new(blobs: Arc<dyn BlobStore>, settings: &PipelineSettings) -> Self {
        let (id_property, columns_nonpii) = match &settings.state {
            StateSettings::SnapshotArchive {
                id_property,
                columns_nonpii,
            } => (id_property.clone(), columns_nonpii.iter().cloned().collect()),
            StateSettings::EntityStore { .. } => (None, BTreeSet::new()),
        };
        Self {
            blobs,
            archive: settings.archive.clone(),
            prefix: settings.path_prefix_filter.clone().unwrap_or_default(),
            archives_in_place: settings.archives_in_place(),
            columns_drop: settings.columns_drop.clone(),
            drop_duplicates: settings.drop_duplicates,
            columns_nonpii,
            id_property,
            codec: settings.codec.clone(),
        }
    }

    /// The newest archived snapshot other than the delivery itself. When the
    /// inbox is the archive, objects that landed after the delivery are not
    /// its predecessors either.
    fn pick_previous(&self, listed: Vec<BlobMeta>, current: &BlobLocation) -> Option<BlobMeta> {
        let (own, mut candidates): (Vec<BlobMeta>, Vec<BlobMeta>) = listed
            .into_iter()
            .partition(|meta| self.archives_in_place && meta.name == current.name);
        if let Some(own) = own.first() {
            candidates.retain(|meta| meta.last_modified <= own.last_modified);
        }
        candidates.into_iter().max_by(|a, b| {
            a.last_modified
                .cmp(&b.last_modified)
                .then_with(|| a.name.cmp(&b.name))
        })
    }

    async fn previous_snapshot(
        &self,
        current: &BlobLocation,
    ) -> Result<Option<(String, Vec<Record>)>, PipelineError> {
        let listed = self.blobs.list(&self.archive, &self.prefix).await?;
        let Some(previous) = self.pick_previous(listed, current) else {
            return Ok(None);
        };

        let location = BlobLocation::new(self.archive.clone(), previous.name);
        info!("comparing against previous snapshot {}", location);
        let bytes = self.blobs.read(&location).await?;
        let mut records = SnapshotFormat::for_name(&location.name, &self.codec)?.decode(&bytes)?;
        drop_columns(&mut records, &self.columns_drop);
        if self.drop_duplicates {
            records = drop_duplicates(records);
        }
        Ok(Some((location.name, records)))
    }

    /// Columns both snapshots are compared on, or the mismatch that stops the run.
    /// Only columns new in this delivery are checked against the allow-list; a
    /// column that disappeared is simply no longer compared.
    fn compared_columns(
        &self,
        new: BTreeSet<String>,
        previous: BTreeSet<String>,
    ) -> Result<BTreeSet<String>, PipelineError> {
        if new == previous {
            return Ok(new);
        }

        let added: Vec<String> = new.difference(&previous).cloned().collect();
        let removed: Vec<String> = previous.difference(&new).cloned().collect();
        if !added.iter().all(|column| self.columns_nonpii.contains(column)) {
            return Err(PipelineError::SchemaMismatch { added, removed });
        }

        info!(
            "schema changed within the allow-list (added {:?}, removed {:?})",
            added, removed
        );
        Ok(new.intersection(&previous).cloned().collect())
    }
}

#[async_trait]
impl StateProvider for SnapshotArchiveProvider {
    fn name(&self) -> &'static str {
        "snapshot_archive"
    }

    async fn diff(&self, input: SnapshotInput<'_>) -> Result<Delta, PipelineError> {
        if let Some(id_property) = &self.id_property {
            for record in &input.records {
                StateKey::from_record(record, id_property)?;
            }
        }

        let everything = |records| Delta {
            records,
            stage: RecordStage::Source,
        };

        if input.full_load {
            return Ok(everything(input.records));
        }

        let Some((name, previous)) = self.previous_snapshot(input.location).await? else {
            info!("no previous snapshot, {} is a full load", input.location);
            return Ok(everything(input.records));
        };
        if previous.is_empty() {
            info!("previous snapshot {} is empty, treating as full load", name);
            return Ok(everything(input.records));
        }

        let compared = self.compared_columns(columns(&input.records), columns(&previous))?;
        let known: HashSet<String> = previous
            .iter()
            .map(|record| fingerprint(record, Some(&compared)))
            .collect();

        Ok(everything(
            input
                .records
                .into_iter()
                .filter(|record| !known.contains(&fingerprint(record, Some(&compared))))
                .collect(),
        ))
    }

    /// The snapshot itself is the new state and is archived by the run.
    async fn persist(&self, _delta: &Delta) -> Result<(), PipelineError> {
        Ok(())
    }
}
