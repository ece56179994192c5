//! Wiring shared by the node binary and the admin routes.

use amif_common::constants::{redis_keys, topics};
use amif_common::MembershipEvent;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::broker::Broker;
use crate::config::AppConfig;
use crate::discovery::DiscoveryService;

/// Handles the admin HTTP surface needs
#[derive(Clone)]
pub struct NodeState {
    pub config: Arc<AppConfig>,
    pub broker: Broker,
    pub discovery: Arc<DiscoveryService>,
    pub started_at: Instant,
}

impl NodeState {
    pub fn new(config: AppConfig, broker: Broker, discovery: Arc<DiscoveryService>) -> Self {
        Self {
            config: Arc::new(config),
            broker,
            discovery,
            started_at: Instant::now(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.module.name
    }
}

/// Incarnation for this start of `name`: the stored value + 1, or 0 when
/// nothing is stored (or the stored value is unreadable).
///
/// The new value is written back so the next start moves past it.
pub async fn next_incarnation(broker: &Broker, name: &str) -> u64 {
    let key = format!("{}{}", redis_keys::INCARNATION_PREFIX, name);

    let incarnation = match broker.get(&key).await {
        Some(stored) => match stored.trim().parse::<u64>() {
            Ok(previous) => previous.saturating_add(1),
            Err(e) => {
                tracing::warn!(key = %key, value = %stored, error = %e, "Ignoring unreadable incarnation");
                0
            }
        },
        None => 0,
    };

    if !broker.set(&key, &incarnation.to_string()).await {
        tracing::warn!(key = %key, "Incarnation not persisted; a restart may reuse it");
    }

    incarnation
}

/// Republish membership changes on the membership topic.
///
/// Listeners run synchronously inside discovery, so events are handed to a
/// task that does the broker I/O.
pub fn forward_membership_events(discovery: &DiscoveryService, broker: Broker) {
    let (tx, mut rx) = mpsc::unbounded_channel::<MembershipEvent>();

    discovery.register_listener(move |event: &MembershipEvent| {
        let _ = tx.send(event.clone());
    });

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let message = match serde_json::to_value(&event) {
                Ok(serde_json::Value::Object(map)) => map,
                Ok(other) => {
                    tracing::error!(value = %other, "Membership event is not a JSON object");
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode membership event");
                    continue;
                }
            };
            broker.publish(topics::MEMBERSHIP, &message).await;
        }
    });
}
