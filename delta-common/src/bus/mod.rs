//! Event bus the deltas are published on.
//!
//! Publishing is split in two steps: `publish` enqueues the message and returns
//! once the bus accepted it, the returned future resolves with the message id
//! when the broker acknowledged the write.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;

mod kafka;

pub use kafka::{KafkaBus, KafkaContext};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("message bus unavailable: {0}")]
    Unavailable(String),
    #[error("message too large for the bus")]
    MessageTooLarge,
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
    #[error("delivery cancelled before acknowledgement")]
    Cancelled,
}

/// Resolves with the message id once the write is acknowledged.
pub type PendingDelivery = BoxFuture<'static, Result<String, BusError>>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<PendingDelivery, BusError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub id: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

impl PublishedMessage {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap_or(Value::Null)
    }
}

#[derive(Default)]
struct MemoryBusState {
    messages: Vec<PublishedMessage>,
    attempts: usize,
}

/// In-memory bus recording every accepted message.
#[derive(Clone, Default)]
pub struct MemoryMessageBus {
    state: Arc<Mutex<MemoryBusState>>,
    publish_error: Option<BusError>,
    delivery_error: Option<BusError>,
    fail_after: Option<usize>,
}

impl MemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject messages at enqueue time.
    pub fn publish_error(mut self, err: BusError) -> Self {
        self.publish_error = Some(err);
        self
    }

    /// Accept messages but fail their acknowledgement.
    pub fn delivery_error(mut self, err: BusError) -> Self {
        self.delivery_error = Some(err);
        self
    }

    /// Only start failing once `messages` messages went through.
    pub fn fail_after(mut self, messages: usize) -> Self {
        self.fail_after = Some(messages);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryBusState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.lock().messages.clone()
    }

    pub fn json_messages(&self) -> Vec<Value> {
        self.lock().messages.iter().map(PublishedMessage::json).collect()
    }
}

#[async_trait]
impl MessageBus for MemoryMessageBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<PendingDelivery, BusError> {
        let mut state = self.lock();
        let attempt = state.attempts;
        state.attempts += 1;
        let failing = self.fail_after.map_or(true, |n| attempt >= n);

        if let (true, Some(err)) = (failing, &self.publish_error) {
            return Err(err.clone());
        }

        let id = format!("{topic}-{attempt}");
        state.messages.push(PublishedMessage {
            id: id.clone(),
            topic: topic.to_owned(),
            payload,
        });

        let outcome = match (failing, &self.delivery_error) {
            (true, Some(err)) => Err(err.clone()),
            _ => Ok(id),
        };
        Ok(futures::future::ready(outcome).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_messages_in_order() {
        let bus = MemoryMessageBus::new();
        let first = bus.publish("deltas", br#"{"n": 1}"#.to_vec()).await.unwrap();
        let second = bus.publish("deltas", br#"{"n": 2}"#.to_vec()).await.unwrap();
        assert_eq!(first.await.unwrap(), "deltas-0");
        assert_eq!(second.await.unwrap(), "deltas-1");
        assert_eq!(bus.json_messages(), vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[tokio::test]
    async fn injected_failures() {
        let bus = MemoryMessageBus::new()
            .publish_error(BusError::Unavailable("down".to_string()))
            .fail_after(1);
        assert!(bus.publish("deltas", vec![]).await.is_ok());
        assert!(matches!(
            bus.publish("deltas", vec![]).await,
            Err(BusError::Unavailable(_))
        ));

        let bus = MemoryMessageBus::new().delivery_error(BusError::Cancelled);
        let pending = bus.publish("deltas", vec![]).await.unwrap();
        assert_eq!(pending.await, Err(BusError::Cancelled));
        assert_eq!(bus.messages().len(), 1);
    }
}
