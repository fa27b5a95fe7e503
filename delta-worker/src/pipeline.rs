use std::sync::Arc;
use std::time::Instant;

use delta_common::blob::{BlobLocation, BlobStore};
use delta_common::bus::MessageBus;
use delta_common::codec::{content_type, SnapshotFormat};
use delta_common::metrics::{
    RECORDS_CHANGED_TOTAL, RECORDS_LOADED_TOTAL, RUNS_TOTAL, RUN_DURATION_SECONDS,
};
use delta_common::{transform, Record};
use metrics::{counter, histogram};
use tracing::{error, info, instrument, warn};

use crate::config::PipelineSettings;
use crate::diff::DiffEngine;
use crate::error::PipelineError;
use crate::publisher::{BatchPublisher, PublishSummary};
use crate::state::{RecordStage, StateProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// The delivery does not match the path prefix filter.
    Skipped,
    Loading,
    Diffing,
    Publishing,
    Persisting,
    Archiving,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Skipped => "skipped",
            RunState::Loading => "loading",
            RunState::Diffing => "diffing",
            RunState::Publishing => "publishing",
            RunState::Persisting => "persisting",
            RunState::Archiving => "archiving",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub state: RunState,
    pub changed: usize,
    pub published: PublishSummary,
}

impl RunReport {
    fn skipped() -> Self {
        Self {
            state: RunState::Skipped,
            changed: 0,
            published: PublishSummary::default(),
        }
    }
}

/// Drives one delivered snapshot through diff, publish, persist and archive.
///
/// A pipeline is built once per process and reused for every delivery; runs
/// share nothing but the collaborators.
pub struct Pipeline {
    settings: PipelineSettings,
    blobs: Arc<dyn BlobStore>,
    diff: DiffEngine,
    publisher: BatchPublisher,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        blobs: Arc<dyn BlobStore>,
        provider: Arc<dyn StateProvider>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            diff: DiffEngine::new(provider, &settings),
            publisher: BatchPublisher::new(bus, &settings),
            settings,
            blobs,
        }
    }

    pub fn inbox(&self) -> &str {
        &self.settings.inbox
    }

    /// Process the delivery at `location`. On failure the input is quarantined
    /// and cleaned up before the error is returned.
    #[instrument(skip_all, fields(source = %location, strategy = self.diff.provider_name()))]
    pub async fn run(&self, location: &BlobLocation) -> Result<RunReport, PipelineError> {
        if !self.diff.accepts(location) {
            info!(
                "skipping {} due to FILEPATH_PREFIX_FILTER {}",
                location.name,
                self.settings.path_prefix_filter.as_deref().unwrap_or_default()
            );
            counter!(RUNS_TOTAL, "outcome" => RunState::Skipped.as_str()).increment(1);
            return Ok(RunReport::skipped());
        }

        info!("run started");
        let started = Instant::now();
        let mut raw = None;

        let result = match self.execute(location, &mut raw).await {
            Ok(report) => {
                info!(
                    "run succeeded: {} changed records in {} messages",
                    report.changed, report.published.messages
                );
                counter!(RUNS_TOTAL, "outcome" => RunState::Succeeded.as_str()).increment(1);
                Ok(report)
            }
            Err(err) => {
                error!("processing failure: {}", err);
                self.clean_up_failed(location, raw.as_deref()).await;
                counter!(
                    RUNS_TOTAL,
                    "outcome" => RunState::Failed.as_str(),
                    "error" => err.kind()
                )
                .increment(1);
                Err(err)
            }
        };

        histogram!(RUN_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        info!("run done");
        result
    }

    async fn execute(
        &self,
        location: &BlobLocation,
        raw: &mut Option<Vec<u8>>,
    ) -> Result<RunReport, PipelineError> {
        enter(RunState::Loading);
        let bytes = raw.insert(self.blobs.read(location).await?);
        let records = SnapshotFormat::for_name(&location.name, &self.settings.codec)?
            .decode(bytes.as_slice())?;
        info!("read {} records from {}", records.len(), location);
        counter!(RECORDS_LOADED_TOTAL).increment(records.len() as u64);

        enter(RunState::Diffing);
        let delta = self.diff.diff(location, records).await?;
        counter!(RECORDS_CHANGED_TOTAL).increment(delta.len() as u64);

        let mut published = PublishSummary::default();
        if delta.is_empty() {
            info!("no new rows found");
        } else {
            info!("found {} new rows", delta.len());

            enter(RunState::Publishing);
            let output: Vec<Record> = match delta.stage {
                RecordStage::Output => delta.records.clone(),
                RecordStage::Source => delta
                    .records
                    .iter()
                    .map(|record| transform(record, self.settings.mapping.as_ref()))
                    .collect::<Result<_, _>>()?,
            };
            published = self.publisher.publish(location, output).await?;

            enter(RunState::Persisting);
            self.diff.persist(&delta).await?;
        }

        enter(RunState::Archiving);
        if !self.settings.archives_in_place() {
            let archived = location.in_bucket(&self.settings.archive);
            let bytes = raw.clone().unwrap_or_default();
            self.blobs
                .write(&archived, bytes, content_type(&location.name))
                .await?;
            info!("archived {} to {}", location, archived);
            self.blobs.delete(location).await?;
            info!("deleted {}", location);
        }

        Ok(RunReport {
            state: RunState::Succeeded,
            changed: delta.len(),
            published,
        })
    }

    /// Failures here are logged only; the run error is what gets reported.
    async fn clean_up_failed(&self, location: &BlobLocation, raw: Option<&[u8]>) {
        if let Some(error_bucket) = &self.settings.error {
            match raw {
                Some(bytes) => {
                    let quarantined = location.in_bucket(error_bucket);
                    match self
                        .blobs
                        .write(&quarantined, bytes.to_vec(), content_type(&location.name))
                        .await
                    {
                        Ok(()) => info!("quarantined {} to {}", location, quarantined),
                        Err(e) => error!("failed to quarantine {}: {}", location, e),
                    }
                }
                None => warn!("{} was never read, nothing to quarantine", location),
            }
        }

        if !self.settings.archives_in_place() {
            match self.blobs.delete(location).await {
                Ok(()) => info!("deleted {}", location),
                Err(e) => error!("failed to delete {}: {}", location, e),
            }
        }
    }
}

fn enter(state: RunState) {
    info!("run state {}", state.as_str());
}
