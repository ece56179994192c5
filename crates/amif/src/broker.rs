//! Topic broker and key-value façade over a [`StorageBackend`].
//!
//! Delivery is at-most-once and inherits the backend's per-connection FIFO.
//! Each subscription owns two execution paths:
//! - an intake task draining the backend stream into an unbounded queue
//! - a dedicated OS thread calling the handler one message at a time
//!
//! A slow handler therefore only delays its own queue. Delivery threads are
//! not taken from tokio's blocking pool, so the number of live subscriptions
//! is not capped by that pool's size.

use amif_common::{AmifError, Envelope, Payload};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::storage::StorageBackend;

/// One message handed to a subscription handler
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub topic: String,
    /// Publishing module, `None` for anonymous or foreign publishers
    pub sender: Option<String>,
    pub payload: Payload,
}

/// Runtime statistics
#[derive(Default)]
pub struct BrokerStats {
    pub published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub delivered: AtomicU64,
    /// Subscription payloads that were not JSON objects
    pub undecodable: AtomicU64,
}

/// Snapshot of broker statistics
#[derive(Clone, Debug, Serialize)]
pub struct BrokerStatsSnapshot {
    pub published: u64,
    pub publish_failures: u64,
    pub delivered: u64,
    pub undecodable: u64,
}

/// Cheap to clone; all clones share the backend connection and stats
#[derive(Clone)]
pub struct Broker {
    backend: Arc<dyn StorageBackend>,
    stats: Arc<BrokerStats>,
}

impl Broker {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            stats: Arc::new(BrokerStats::default()),
        }
    }

    /// Publish anonymously. Returns false (and logs) on backend failure.
    pub async fn publish(&self, topic: &str, message: &Payload) -> bool {
        self.send(topic, None, message).await
    }

    /// Publish on behalf of a module
    pub async fn publish_from(&self, sender: &str, topic: &str, message: &Payload) -> bool {
        self.send(topic, Some(sender), message).await
    }

    async fn send(&self, topic: &str, sender: Option<&str>, message: &Payload) -> bool {
        let envelope = Envelope::new(sender.map(str::to_string), message.clone());

        let bytes = match serde_json::to_vec(&envelope) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "Failed to serialize message");
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        match self.backend.publish(topic, bytes).await {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "Failed to publish message");
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Register `handler` for every message published on `topic` from now on.
    ///
    /// The backend subscription is confirmed before this returns. The handler
    /// runs on its own thread (`amif-sub-<topic>`), strictly one message at a
    /// time, so it may block.
    pub async fn subscribe<F>(&self, topic: &str, mut handler: F) -> Result<Subscription, AmifError>
    where
        F: FnMut(Delivery) + Send + 'static,
    {
        let mut stream = self.backend.subscribe(topic).await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();

        let delivery_stats = self.stats.clone();
        let delivery = thread::Builder::new()
            .name(format!("amif-sub-{}", topic))
            .spawn(move || {
                while let Some(message) = rx.blocking_recv() {
                    handler(message);
                    delivery_stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
            })
            .map_err(|e| {
                tracing::error!(topic = %topic, error = %e, "Failed to spawn delivery thread");
                AmifError::Transport(format!("delivery thread for {}: {}", topic, e))
            })?;

        let intake_topic = topic.to_string();
        let intake_stats = self.stats.clone();
        let intake = tokio::spawn(async move {
            while let Some(raw) = stream.next().await {
                match decode_delivery(&intake_topic, &raw) {
                    Ok(delivery) => {
                        if tx.send(delivery).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        intake_stats.undecodable.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(topic = %intake_topic, error = %e, "Dropping undecodable message");
                    }
                }
            }
            tracing::debug!(topic = %intake_topic, "Subscription intake finished");
        });

        tracing::info!(topic = %topic, "Subscribed");

        Ok(Subscription {
            topic: topic.to_string(),
            intake,
            delivery,
        })
    }

    /// Point lookup. `None` if the key is absent or the backend failed.
    pub async fn get(&self, key: &str) -> Option<String> {
        match self.backend.get(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Failed to get key");
                None
            }
        }
    }

    /// Write-through set. Returns false (and logs) on backend failure.
    pub async fn set(&self, key: &str, value: &str) -> bool {
        match self.backend.set(key, value).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Failed to set key");
                false
            }
        }
    }

    /// Backend readiness check
    pub async fn ping(&self) -> bool {
        self.backend.ping().await.is_ok()
    }

    pub fn stats(&self) -> BrokerStatsSnapshot {
        BrokerStatsSnapshot {
            published: self.stats.published.load(Ordering::Relaxed),
            publish_failures: self.stats.publish_failures.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            undecodable: self.stats.undecodable.load(Ordering::Relaxed),
        }
    }
}

/// Accepts our own envelopes and bare JSON objects from foreign publishers.
/// Anything that is not a tagged envelope is delivered whole, with no sender.
fn decode_delivery(topic: &str, raw: &[u8]) -> Result<Delivery, serde_json::Error> {
    let envelope = match serde_json::from_slice::<Envelope>(raw) {
        Ok(envelope) => envelope,
        Err(_) => Envelope::new(None, serde_json::from_slice::<Payload>(raw)?),
    };

    Ok(Delivery {
        topic: topic.to_string(),
        sender: envelope.sender,
        payload: envelope.payload,
    })
}

/// Handle to an active subscription.
///
/// Dropping it detaches the subscription; it keeps running.
pub struct Subscription {
    topic: String,
    intake: JoinHandle<()>,
    delivery: thread::JoinHandle<()>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop taking new messages. Already queued messages are still delivered.
    pub fn cancel(&self) {
        self.intake.abort();
    }

    /// Wait until intake has stopped and the queue is drained
    pub async fn closed(self) {
        let _ = self.intake.await;
        let delivery = self.delivery;
        let _ = tokio::task::spawn_blocking(move || delivery.join()).await;
    }
}
