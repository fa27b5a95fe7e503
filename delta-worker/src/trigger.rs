//! Storage notifications announcing a new delivery, read from Kafka.

use std::sync::{Arc, Weak};
use std::time::Duration;

use delta_common::blob::BlobLocation;
use delta_common::config::{ConsumerConfig, KafkaConfig};
use delta_common::health::HealthHandle;
use delta_common::metrics::TRIGGERS_TOTAL;
use metrics::counter;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, Message};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::error::WorkerError;
use crate::pipeline::{Pipeline, RunState};

/// Wake up this often while idle, to keep reporting liveness.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A new object landed in a bucket.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TriggerEvent {
    pub bucket: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Completed(RunState),
    /// The notification is for a bucket this worker does not read from.
    Ignored,
    Failed,
}

/// Run the pipeline for one notification. Failed runs are not retried: their
/// input was quarantined and removed, a replay would find nothing to load.
pub async fn handle(pipeline: &Pipeline, event: TriggerEvent) -> TriggerOutcome {
    if event.bucket != pipeline.inbox() {
        warn!(
            "ignoring {} in bucket {}, expecting bucket {}",
            event.name,
            event.bucket,
            pipeline.inbox()
        );
        counter!(TRIGGERS_TOTAL, "outcome" => "ignored").increment(1);
        return TriggerOutcome::Ignored;
    }

    let location = BlobLocation::new(event.bucket, event.name);
    match pipeline.run(&location).await {
        Ok(report) => {
            counter!(TRIGGERS_TOTAL, "outcome" => report.state.as_str()).increment(1);
            TriggerOutcome::Completed(report.state)
        }
        Err(_) => {
            // Already logged with its context by the run
            counter!(TRIGGERS_TOTAL, "outcome" => "failed").increment(1);
            TriggerOutcome::Failed
        }
    }
}

#[derive(Clone)]
pub struct TriggerConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RecvErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Received empty payload")]
    Empty,
}

impl TriggerConsumer {
    pub fn new(common: &KafkaConfig, consumer: &ConsumerConfig) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &common.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &consumer.kafka_consumer_group)
            .set("auto.offset.reset", &consumer.kafka_consumer_offset_reset)
            .set("enable.auto.offset.store", "false");

        if common.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let stream: StreamConsumer = client_config.create()?;
        stream.subscribe(&[consumer.kafka_consumer_topic.as_str()])?;
        info!("subscribed to {}", consumer.kafka_consumer_topic);

        Ok(Self {
            inner: Arc::new(Inner {
                consumer: stream,
                topic: consumer.kafka_consumer_topic.clone(),
            }),
        })
    }

    pub async fn json_recv<T>(&self) -> Result<(T, Offset), RecvErr>
    where
        T: DeserializeOwned,
    {
        let message = self.inner.consumer.recv().await?;

        let offset = Offset {
            handle: Arc::downgrade(&self.inner),
            partition: message.partition(),
            offset: message.offset(),
        };

        let Some(payload) = message.payload() else {
            // Poison pills are stored right away, they would never parse
            offset.store_or_log();
            return Err(RecvErr::Empty);
        };

        match serde_json::from_slice(payload) {
            Ok(parsed) => Ok((parsed, offset)),
            Err(e) => {
                offset.store_or_log();
                Err(RecvErr::Serde(e))
            }
        }
    }
}

pub struct Offset {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
}

impl Offset {
    pub fn store(self) -> Result<(), WorkerError> {
        let inner = self
            .handle
            .upgrade()
            .ok_or_else(|| WorkerError::Offset("consumer gone".to_owned()))?;
        inner
            .consumer
            .store_offset(&inner.topic, self.partition, self.offset)
            .map_err(|e| WorkerError::Offset(e.to_string()))
    }

    fn store_or_log(self) {
        if let Err(e) = self.store() {
            error!("failed to store offset of poison pill: {}", e);
        }
    }
}

/// Process notifications one at a time, until the consumer fails.
pub async fn consume(
    consumer: &TriggerConsumer,
    pipeline: &Pipeline,
    liveness: &HealthHandle,
) -> Result<(), WorkerError> {
    loop {
        liveness.report_healthy();

        let next = consumer.json_recv::<TriggerEvent>();
        let received = match tokio::time::timeout(RECV_TIMEOUT, next).await {
            Err(_elapsed) => continue,
            Ok(received) => received,
        };

        let (event, offset) = match received {
            Ok(received) => received,
            Err(RecvErr::Kafka(e)) => {
                error!("failed to receive notification: {}", e);
                counter!(TRIGGERS_TOTAL, "outcome" => "receive_error").increment(1);
                continue;
            }
            Err(e) => {
                warn!("dropping malformed notification: {}", e);
                counter!(TRIGGERS_TOTAL, "outcome" => "malformed").increment(1);
                continue;
            }
        };

        handle(pipeline, event).await;
        offset.store()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineSettings, StateSettings};
    use crate::state::SnapshotArchiveProvider;
    use delta_common::blob::MemoryBlobStore;
    use delta_common::bus::MemoryMessageBus;

    #[test]
    fn parses_storage_notifications() {
        let event: TriggerEvent = serde_json::from_str(
            r#"{"bucket": "inbox", "name": "exports/orders.json", "contentType": "application/json", "size": "512"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            TriggerEvent {
                bucket: "inbox".to_string(),
                name: "exports/orders.json".to_string()
            }
        );
        assert!(serde_json::from_str::<TriggerEvent>(r#"{"bucket": "inbox"}"#).is_err());
    }

    #[test]
    fn offset_of_a_dropped_consumer_cannot_be_stored() {
        let offset = Offset {
            handle: Weak::new(),
            partition: 0,
            offset: 42,
        };
        let err = offset.store().unwrap_err();
        assert!(matches!(err, WorkerError::Offset(_)));
        assert_eq!(err.to_string(), "failed to store consumer offset: consumer gone");
    }

    fn pipeline(blobs: &MemoryBlobStore) -> Pipeline {
        let settings = PipelineSettings::new(
            "inbox",
            "archive",
            StateSettings::SnapshotArchive {
                id_property: None,
                columns_nonpii: vec![],
            },
        );
        let provider = SnapshotArchiveProvider::new(Arc::new(blobs.clone()), &settings);
        Pipeline::new(
            settings,
            Arc::new(blobs.clone()),
            Arc::new(provider),
            Arc::new(MemoryMessageBus::new()),
        )
    }

    fn event(bucket: &str, name: &str) -> TriggerEvent {
        TriggerEvent {
            bucket: bucket.to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn handles_inbox_notifications_only() {
        let blobs = MemoryBlobStore::new();
        blobs.put("archive", "orders.json", "[]");
        blobs.put("inbox", "orders.json", r#"[{"id": 1}]"#);
        let pipeline = pipeline(&blobs);

        assert_eq!(
            handle(&pipeline, event("archive", "orders.json")).await,
            TriggerOutcome::Ignored
        );
        assert_eq!(
            handle(&pipeline, event("inbox", "orders.json")).await,
            TriggerOutcome::Completed(RunState::Succeeded)
        );
        assert!(blobs.names("inbox").is_empty());
    }

    #[tokio::test]
    async fn failed_runs_are_reported() {
        let blobs = MemoryBlobStore::new();
        let pipeline = pipeline(&blobs);
        // Nothing was delivered under this name
        assert_eq!(
            handle(&pipeline, event("inbox", "gone.json")).await,
            TriggerOutcome::Failed
        );
    }
}
