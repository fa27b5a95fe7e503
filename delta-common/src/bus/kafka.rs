use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, gauge};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::{debug, error, info};

use super::{BusError, MessageBus, PendingDelivery};
use crate::config::KafkaConfig;
use crate::health::HealthHandle;

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl KafkaContext {
    pub fn new(liveness: HealthHandle) -> Self {
        Self { liveness }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // The main rdkafka loop is running and calling us
        self.liveness.report_healthy();

        gauge!("delta_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("delta_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("delta_kafka_producer_queue_bytes").set(stats.msg_size as f64);
        gauge!("delta_kafka_producer_queue_bytes_limit").set(stats.msg_size_max as f64);
    }
}

/// Publishes deltas to Kafka topics.
pub struct KafkaBus {
    producer: FutureProducer<KafkaContext>,
}

impl KafkaBus {
    pub fn new(config: &KafkaConfig, liveness: HealthHandle) -> Result<Self, KafkaError> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", &config.kafka_compression_codec)
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            )
            .set(
                "queue.buffering.max.messages",
                config.kafka_producer_queue_messages.to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext::new(liveness))?;

        // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
        drop(producer.client().fetch_metadata(
            Some("__consumer_offsets"),
            Timeout::After(Duration::new(10, 0)),
        )?);
        info!("connected to Kafka brokers");

        Ok(Self { producer })
    }

    pub fn flush(&self) -> Result<(), KafkaError> {
        self.producer.flush(Duration::new(30, 0))
    }
}

#[async_trait]
impl MessageBus for KafkaBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<PendingDelivery, BusError> {
        let ack = match self
            .producer
            .send_result(FutureRecord::<(), [u8]>::to(topic).payload(&payload))
        {
            Ok(ack) => ack,
            Err((e, _)) => {
                counter!("delta_kafka_produce_errors_total").increment(1);
                return Err(match e.rdkafka_error_code() {
                    Some(RDKafkaErrorCode::MessageSizeTooLarge) => BusError::MessageTooLarge,
                    _ => {
                        error!("failed to produce to {}: {}", topic, e);
                        BusError::Unavailable(e.to_string())
                    }
                });
            }
        };

        Ok(async move {
            match ack.await {
                // Cancelled due to timeout while retrying
                Err(_) => {
                    counter!("delta_kafka_produce_errors_total").increment(1);
                    Err(BusError::Cancelled)
                }
                Ok(Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge), _))) => {
                    counter!("delta_kafka_produce_errors_total").increment(1);
                    Err(BusError::MessageTooLarge)
                }
                Ok(Err((err, _))) => {
                    counter!("delta_kafka_produce_errors_total").increment(1);
                    Err(BusError::DeliveryFailed(err.to_string()))
                }
                Ok(Ok((partition, offset))) => Ok(format!("{partition}:{offset}")),
            }
        }
        .boxed())
    }
}
