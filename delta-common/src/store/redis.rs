use async_trait::async_trait;
use ::redis::aio::MultiplexedConnection;
use ::redis::RedisError;

use super::{EntityStore, FetchResult, StoreError};
use crate::record::{Record, StateKey};

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Entities as JSON documents under `{collection}:{key}`.
pub struct RedisEntityStore {
    connection: MultiplexedConnection,
}

impl RedisEntityStore {
    pub async fn new(addr: String) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(addr)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self { connection })
    }

    fn entity_key(collection: &str, key: &StateKey) -> String {
        format!("{collection}:{key}")
    }
}

#[async_trait]
impl EntityStore for RedisEntityStore {
    async fn get_multi(
        &self,
        collection: &str,
        keys: &[StateKey],
    ) -> Result<FetchResult, StoreError> {
        let mut result = FetchResult::default();
        if keys.is_empty() {
            return Ok(result);
        }

        let mut conn = self.connection.clone();
        let mut cmd = ::redis::cmd("MGET");
        for key in keys {
            cmd.arg(Self::entity_key(collection, key));
        }
        let values: Vec<Option<Vec<u8>>> = cmd.query_async(&mut conn).await?;

        for (key, value) in keys.iter().zip(values) {
            match value {
                Some(bytes) => {
                    let entity: Record =
                        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                            key: Self::entity_key(collection, key),
                            reason: e.to_string(),
                        })?;
                    result.found.insert(key.clone(), entity);
                }
                None => result.missing.push(key.clone()),
            }
        }
        Ok(result)
    }

    async fn put_multi(
        &self,
        collection: &str,
        entities: Vec<(StateKey, Record)>,
    ) -> Result<(), StoreError> {
        if entities.is_empty() {
            return Ok(());
        }

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for (key, entity) in &entities {
            let payload = serde_json::to_vec(entity).map_err(|e| StoreError::Corrupt {
                key: Self::entity_key(collection, key),
                reason: e.to_string(),
            })?;
            pipe.cmd("SET")
                .arg(Self::entity_key(collection, key))
                .arg(payload)
                .ignore();
        }

        let mut conn = self.connection.clone();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }
}
