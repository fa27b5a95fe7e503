use delta_common::blob::BlobError;
use delta_common::bus::BusError;
use delta_common::codec::CodecError;
use delta_common::record::IdentityError;
use delta_common::store::StoreError;
use delta_common::ConversionError;
use thiserror::Error;

/// Everything that makes a run fail. None of these are retried by the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{}", schema_message(added, removed))]
    SchemaMismatch {
        added: Vec<String>,
        removed: Vec<String>,
    },
    #[error("conversion failed: {0}")]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
    #[error(transparent)]
    BusUnavailable(#[from] BusError),
    #[error("cannot load snapshot: {0}")]
    Load(#[from] CodecError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("record without identity: {0}")]
    MissingIdentity(#[from] IdentityError),
    #[error("cannot serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::SchemaMismatch { .. } => "schema_mismatch",
            PipelineError::Conversion(_) => "conversion",
            PipelineError::StoreUnavailable(_) => "store_unavailable",
            PipelineError::BusUnavailable(_) => "bus_unavailable",
            PipelineError::Load(_) => "load",
            PipelineError::Blob(_) => "blob",
            PipelineError::MissingIdentity(_) => "missing_identity",
            PipelineError::Serialization(_) => "serialization",
        }
    }
}

fn schema_message(added: &[String], removed: &[String]) -> String {
    let quoted = |columns: &[String]| format!("'{}'", columns.join("', '"));
    let plural = |columns: &[String]| if columns.len() == 1 { "column" } else { "columns" };

    let mut message = String::from("different schema:");
    if !added.is_empty() {
        message.push_str(&format!(
            " {} {} found in new delivery but not in previous delivery",
            plural(added),
            quoted(added)
        ));
    }
    if !removed.is_empty() {
        if !added.is_empty() {
            message.push(';');
        }
        message.push_str(&format!(
            " {} {} found in previous delivery but not in new delivery",
            plural(removed),
            quoted(removed)
        ));
    }
    message
}

/// Errors that stop the trigger consumer loop.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to store consumer offset: {0}")]
    Offset(String),
}
