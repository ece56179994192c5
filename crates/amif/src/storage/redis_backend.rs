//! Redis storage backend.

use amif_common::AmifError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::{MessageStream, StorageBackend};

/// Redis-backed key-value store and pub/sub transport
pub struct RedisBackend {
    /// Used to open one dedicated pub/sub connection per subscription
    client: redis::Client,
    /// Shared, auto-reconnecting connection for GET/SET/PUBLISH
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connect to Redis with connection manager (handles reconnection)
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = ConnectionManager::new(client.clone())
            .await
            .context("Failed to connect to Redis")?;

        Ok(Self { client, conn })
    }
}

fn unavailable(err: redis::RedisError) -> AmifError {
    AmifError::BackendUnavailable(err.to_string())
}

#[async_trait]
impl StorageBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, AmifError> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<String>>(key)
            .await
            .map_err(unavailable)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AmifError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await.map_err(unavailable)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), AmifError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(topic, payload)
            .await
            .map_err(unavailable)
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream, AmifError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(unavailable)?;
        // Returns after Redis confirms the SUBSCRIBE
        pubsub.subscribe(topic).await.map_err(unavailable)?;

        tracing::debug!(topic = %topic, "Redis subscription active");

        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec());

        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> Result<(), AmifError> {
        let mut conn = self.conn.clone();
        let result: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        result.map(|_| ()).map_err(unavailable)
    }
}
