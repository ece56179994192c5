//! In-process storage backend.

use amif_common::AmifError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, broadcast};

use super::{MessageStream, StorageBackend};

/// Per-topic buffer; slow subscribers beyond this lose the oldest messages
const TOPIC_CAPACITY: usize = 1024;

/// HashMap + broadcast channels, with a switch to simulate an outage
pub struct MemoryBackend {
    data: RwLock<HashMap<String, String>>,
    topics: RwLock<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    available: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate losing (or regaining) the backend connection
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), AmifError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AmifError::BackendUnavailable("connection refused".to_string()))
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, AmifError> {
        self.check()?;
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AmifError> {
        self.check()?;
        self.data
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), AmifError> {
        self.check()?;
        if let Some(tx) = self.topics.read().await.get(topic) {
            // No receivers is not an error: at-most-once
            let _ = tx.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream, AmifError> {
        self.check()?;
        let rx = {
            let mut topics = self.topics.write().await;
            topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
                .subscribe()
        };

        let topic = topic.to_string();
        let stream = futures::stream::unfold(rx, move |mut rx| {
            let topic = topic.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(topic = %topic, skipped, "Subscriber lagged, messages lost");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> Result<(), AmifError> {
        self.check()
    }
}
