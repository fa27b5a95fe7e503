use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use delta_common::blob::BlobLocation;
use delta_common::bus::{BusError, MessageBus};
use delta_common::metrics::{BATCH_SIZE, MESSAGES_PUBLISHED_TOTAL, RECORDS_PUBLISHED_TOTAL};
use delta_common::Record;
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, error, info_span, Instrument};

use crate::config::PipelineSettings;
use crate::error::PipelineError;

/// Provenance entry of the `gobits` header.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Gobits {
    pub processed_by: String,
    pub source: String,
    pub timestamp: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishSummary {
    pub messages: usize,
    pub records: usize,
}

/// Publishes mapped records one per message, or in batches of `batch_size`.
pub struct BatchPublisher {
    bus: Arc<dyn MessageBus>,
    topic: String,
    subject: Option<String>,
    batch_size: Option<NonZeroUsize>,
    processed_by: String,
}

struct Progress {
    rowcount: usize,
    rowmax: usize,
}

impl BatchPublisher {
    pub fn new(bus: Arc<dyn MessageBus>, settings: &PipelineSettings) -> Self {
        Self {
            bus,
            topic: settings.topic.clone(),
            subject: settings.subject.clone(),
            batch_size: settings.batch_size,
            processed_by: settings.processed_by.clone(),
        }
    }

    /// Publish `records` in order and wait for every acknowledgement. The first
    /// failed delivery fails the whole call.
    pub async fn publish(
        &self,
        source: &BlobLocation,
        records: Vec<Record>,
    ) -> Result<PublishSummary, PipelineError> {
        let header = Value::Array(vec![serde_json::to_value(Gobits {
            processed_by: self.processed_by.clone(),
            source: source.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        })?]);

        let rowmax = records.len();
        let mut acks = JoinSet::new();
        let mut summary = PublishSummary::default();

        match self.batch_size {
            None => {
                for (i, record) in records.into_iter().enumerate() {
                    let progress = Progress {
                        rowcount: i + 1,
                        rowmax,
                    };
                    self.send(&header, Value::Object(record), progress, &mut acks)
                        .await?;
                    summary.messages += 1;
                }
            }
            Some(batch_size) => {
                let mut buffer = Vec::with_capacity(batch_size.get());
                let mut rowcount = 0;
                for record in records {
                    buffer.push(Value::Object(record));
                    rowcount += 1;
                    if buffer.len() == batch_size.get() {
                        histogram!(BATCH_SIZE).record(buffer.len() as f64);
                        let batch = Value::Array(std::mem::take(&mut buffer));
                        self.send(&header, batch, Progress { rowcount, rowmax }, &mut acks)
                            .await?;
                        summary.messages += 1;
                    }
                }
                if !buffer.is_empty() {
                    histogram!(BATCH_SIZE).record(buffer.len() as f64);
                    let batch = Value::Array(buffer);
                    self.send(&header, batch, Progress { rowcount, rowmax }, &mut acks)
                        .await?;
                    summary.messages += 1;
                }
            }
        }

        // Await on all the delivery acks, fail on the first failure
        async move {
            while let Some(res) = acks.join_next().await {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        acks.abort_all();
                        return Err(err);
                    }
                    Err(err) => {
                        acks.abort_all();
                        error!("join error while waiting on delivery ack: {:?}", err);
                        return Err(BusError::Cancelled);
                    }
                }
            }
            Ok(())
        }
        .instrument(info_span!("ack_wait_many"))
        .await?;

        summary.records = rowmax;
        counter!(MESSAGES_PUBLISHED_TOTAL).increment(summary.messages as u64);
        counter!(RECORDS_PUBLISHED_TOTAL).increment(summary.records as u64);
        Ok(summary)
    }

    fn envelope(&self, header: &Value, payload: Value) -> Value {
        match &self.subject {
            None => payload,
            Some(subject) => {
                let mut message = Map::new();
                message.insert("gobits".to_owned(), header.clone());
                message.insert(subject.clone(), payload);
                Value::Object(message)
            }
        }
    }

    /// Enqueue one message, then wait for its ack in the background.
    async fn send(
        &self,
        header: &Value,
        payload: Value,
        progress: Progress,
        acks: &mut JoinSet<Result<(), BusError>>,
    ) -> Result<(), PipelineError> {
        let bytes = serde_json::to_vec(&self.envelope(header, payload))?;
        let pending = self.bus.publish(&self.topic, bytes).await?;
        acks.spawn(async move {
            let id = pending.await?;
            debug!(
                "published message with id {} ({}/{} rows)",
                id, progress.rowcount, progress.rowmax
            );
            Ok(())
        });
        Ok(())
    }
}
