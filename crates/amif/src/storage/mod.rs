//! Storage backends behind the broker.
//!
//! Any key-value store with pub/sub satisfies [`StorageBackend`]:
//! - `RedisBackend` - production, shared `ConnectionManager`
//! - `MemoryBackend` - in-process, used for tests and single-node development

mod memory;
mod redis_backend;

pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;

use amif_common::AmifError;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Raw messages delivered by a backend subscription, in backend order
pub type MessageStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Key-value + pub/sub primitives the broker delegates to.
///
/// Failures are reported as `AmifError::BackendUnavailable`; the broker turns
/// them into `false`/`None` for its callers.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Point lookup; `Ok(None)` means the key does not exist
    async fn get(&self, key: &str) -> Result<Option<String>, AmifError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), AmifError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), AmifError>;

    /// Resolves once the subscription is active, so anything published
    /// afterwards is part of the stream
    async fn subscribe(&self, topic: &str) -> Result<MessageStream, AmifError>;

    /// Connectivity check
    async fn ping(&self) -> Result<(), AmifError>;
}
