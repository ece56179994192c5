//! Module lifecycle.
//!
//! A module is business logic behind the [`Module`] trait. Everything else it
//! needs (identity, status, publishing, peer lookups) lives in a
//! [`ModuleContext`] that is handed to it at construction.

mod monitor;

pub use monitor::MonitorModule;

use amif_common::constants::topics;
use amif_common::{AmifError, ModuleRecord, ModuleStatus, Payload};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::broker::{Broker, Delivery, Subscription};
use crate::config::{ModuleOptions, ModuleRegistration};
use crate::discovery::DiscoveryService;

/// Sender reported for messages published without one
pub const UNKNOWN_SENDER: &str = "unknown";

/// Business logic hosted by a node
pub trait Module: Send + Sync + 'static {
    /// Handle one message delivered on an attached topic.
    ///
    /// Runs on the subscription's delivery thread, one message at a time, so
    /// blocking is allowed. An error marks the module DEGRADED.
    fn on_message(&self, sender: &str, message: &Payload) -> anyhow::Result<()>;
}

struct ContextInner {
    name: String,
    options: ModuleOptions,
    status: AtomicU8,
    broker: Broker,
    discovery: Arc<DiscoveryService>,
    outbound: mpsc::UnboundedSender<(String, Payload)>,
    errors: AtomicU64,
}

/// Shared helper composed into every module. Clones share all state.
#[derive(Clone)]
pub struct ModuleContext {
    inner: Arc<ContextInner>,
}

impl ModuleContext {
    /// Must be called inside a tokio runtime: spawns the outbound publisher.
    pub fn new(registration: ModuleRegistration, broker: Broker, discovery: Arc<DiscoveryService>) -> Self {
        let (outbound, mut queue) = mpsc::unbounded_channel::<(String, Payload)>();

        let publisher = broker.clone();
        let sender = registration.name.clone();
        tokio::spawn(async move {
            while let Some((topic, message)) = queue.recv().await {
                publisher.publish_from(&sender, &topic, &message).await;
            }
            tracing::debug!(module = %sender, "Outbound queue closed");
        });

        Self {
            inner: Arc::new(ContextInner {
                name: registration.name,
                options: registration.options,
                status: AtomicU8::new(ModuleStatus::Initializing.to_u8()),
                broker,
                discovery,
                outbound,
                errors: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &ModuleOptions {
        &self.inner.options
    }

    pub fn status(&self) -> ModuleStatus {
        ModuleStatus::from_u8(self.inner.status.load(Ordering::SeqCst))
    }

    /// Handler errors seen so far
    pub fn error_count(&self) -> u64 {
        self.inner.errors.load(Ordering::Relaxed)
    }

    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    /// Queue `data` for publication on `topic` as this module.
    ///
    /// Messages leave in call order. Returns false only if the queue is gone;
    /// backend failures are logged by the broker.
    pub fn publish(&self, topic: &str, data: Payload) -> bool {
        self.inner.outbound.send((topic.to_string(), data)).is_ok()
    }

    /// Request a status change. Setting the current status is a no-op.
    pub fn set_status(&self, next: ModuleStatus) -> Result<(), AmifError> {
        let current = self.status();
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(AmifError::InvalidTransition { from: current, to: next });
        }

        self.inner
            .status
            .compare_exchange(current.to_u8(), next.to_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|actual| AmifError::InvalidTransition {
                from: ModuleStatus::from_u8(actual),
                to: next,
            })?;

        self.announce(current, next);
        Ok(())
    }

    pub fn mark_operational(&self) -> Result<(), AmifError> {
        self.set_status(ModuleStatus::Operational)
    }

    /// Record a handler failure: log it and degrade the module
    pub fn handle_error(&self, err: &anyhow::Error) {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
        tracing::error!(module = %self.inner.name, error = %format!("{:#}", err), "Message handler failed");

        let previous = ModuleStatus::from_u8(
            self.inner
                .status
                .swap(ModuleStatus::Degraded.to_u8(), Ordering::SeqCst),
        );
        if previous != ModuleStatus::Degraded {
            self.announce(previous, ModuleStatus::Degraded);
        }
    }

    fn announce(&self, from: ModuleStatus, to: ModuleStatus) {
        tracing::info!(module = %self.inner.name, from = %from, to = %to, "Status changed");

        let mut message = Payload::new();
        message.insert("module".to_string(), Value::from(self.inner.name.clone()));
        message.insert("previous".to_string(), Value::from(from.as_str()));
        message.insert("status".to_string(), Value::from(to.as_str()));
        self.publish(topics::STATUS, message);
    }

    /// ALIVE modules other than this one
    pub async fn peers(&self) -> Vec<ModuleRecord> {
        let mut members = self.inner.discovery.members().await;
        members.retain(|r| r.id != self.inner.name);
        members
    }

    pub async fn is_peer_alive(&self, id: &str) -> bool {
        self.inner
            .discovery
            .record(id)
            .await
            .is_some_and(|r| r.is_alive())
    }

    /// Route every message on `topic` to `module`; handler errors degrade
    /// the module but delivery continues.
    pub async fn attach<M: Module>(&self, module: Arc<M>, topic: &str) -> Result<Subscription, AmifError> {
        let ctx = self.clone();
        self.inner
            .broker
            .subscribe(topic, move |delivery: Delivery| {
                let sender = delivery.sender.as_deref().unwrap_or(UNKNOWN_SENDER);
                if let Err(e) = module.on_message(sender, &delivery.payload) {
                    ctx.handle_error(&e.context(format!("topic {}", delivery.topic)));
                }
            })
            .await
    }
}

impl fmt::Display for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Module {} (Status: {})", self.inner.name, self.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{MemoryNetwork, MemoryTransport};
    use crate::storage::MemoryBackend;
    use amif_common::MemberState;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    pub(crate) async fn context(name: &str) -> (ModuleContext, Broker, Arc<DiscoveryService>) {
        let broker = Broker::new(Arc::new(MemoryBackend::new()));
        let network = MemoryNetwork::new();
        let discovery = Arc::new(DiscoveryService::new(
            Default::default(),
            Arc::new(MemoryTransport::connect(&network, name)),
        ));
        discovery
            .register_local(ModuleRecord::alive(name, name, 0, 0))
            .await;

        let ctx = ModuleContext::new(ModuleRegistration::new(name), broker.clone(), discovery.clone());
        (ctx, broker, discovery)
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    async fn collect(broker: &Broker, topic: &str) -> (Subscription, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = broker
            .subscribe(topic, move |d: Delivery| {
                let _ = tx.send(d);
            })
            .await
            .unwrap();
        (sub, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    /// Fails on `{"fail": true}`, records everything else
    struct Flaky {
        seen: mpsc::UnboundedSender<String>,
    }

    impl Module for Flaky {
        fn on_message(&self, sender: &str, message: &Payload) -> anyhow::Result<()> {
            if message.get("fail").and_then(Value::as_bool) == Some(true) {
                anyhow::bail!("refusing message from {}", sender);
            }
            let _ = self.seen.send(sender.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let (ctx, _broker, _discovery) = context("m1").await;
        assert_eq!(ctx.status(), ModuleStatus::Initializing);

        tokio_test::assert_ok!(ctx.set_status(ModuleStatus::Initializing));
        tokio_test::assert_err!(ctx.set_status(ModuleStatus::Degraded));

        tokio_test::assert_ok!(ctx.mark_operational());
        tokio_test::assert_ok!(ctx.mark_operational());
        assert_eq!(ctx.status(), ModuleStatus::Operational);

        let err = ctx.set_status(ModuleStatus::Initializing).unwrap_err();
        assert!(matches!(
            err,
            AmifError::InvalidTransition {
                from: ModuleStatus::Operational,
                to: ModuleStatus::Initializing
            }
        ));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_error_degrades_and_sticks() {
        let (ctx, _broker, _discovery) = context("m1").await;
        ctx.mark_operational().unwrap();

        ctx.handle_error(&anyhow::anyhow!("boom"));
        assert_eq!(ctx.status(), ModuleStatus::Degraded);
        assert_eq!(ctx.error_count(), 1);

        tokio_test::assert_err!(ctx.mark_operational());
        assert_eq!(ctx.to_string(), "Module m1 (Status: DEGRADED)");
    }

    #[tokio::test]
    async fn test_status_changes_are_published() {
        let (ctx, broker, _discovery) = context("m1").await;
        let (_sub, mut rx) = collect(&broker, topics::STATUS).await;

        ctx.mark_operational().unwrap();
        ctx.handle_error(&anyhow::anyhow!("boom"));
        // Already DEGRADED: no second announcement
        ctx.handle_error(&anyhow::anyhow!("boom again"));

        let first = next(&mut rx).await;
        assert_eq!(first.sender.as_deref(), Some("m1"));
        assert_eq!(
            first.payload,
            payload(json!({"module": "m1", "previous": "INITIALIZING", "status": "OPERATIONAL"}))
        );

        let second = next(&mut rx).await;
        assert_eq!(second.payload["status"], "DEGRADED");

        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_keeps_call_order() {
        let (ctx, broker, _discovery) = context("m1").await;
        let (_sub, mut rx) = collect(&broker, "events").await;

        for n in 0..20 {
            assert!(ctx.publish("events", payload(json!({"n": n}))));
        }

        for n in 0..20 {
            let delivery = next(&mut rx).await;
            assert_eq!(delivery.sender.as_deref(), Some("m1"));
            assert_eq!(delivery.payload["n"], n);
        }
    }

    #[tokio::test]
    async fn test_attached_module_survives_handler_errors() {
        let (ctx, broker, _discovery) = context("m1").await;
        let (tx, mut seen) = mpsc::unbounded_channel();
        let _sub = ctx
            .attach(Arc::new(Flaky { seen: tx }), "work")
            .await
            .unwrap();
        ctx.mark_operational().unwrap();

        broker.publish("work", &payload(json!({"fail": true}))).await;
        broker
            .publish_from("m2", "work", &payload(json!({"ok": 1})))
            .await;
        broker.publish("work", &payload(json!({"ok": 2}))).await;

        let first = timeout(Duration::from_secs(2), seen.recv()).await.unwrap();
        let second = timeout(Duration::from_secs(2), seen.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("m2"));
        assert_eq!(second.as_deref(), Some(UNKNOWN_SENDER));

        assert_eq!(ctx.status(), ModuleStatus::Degraded);
        assert_eq!(ctx.error_count(), 1);
    }

    #[tokio::test]
    async fn test_peer_queries() {
        let (ctx, _broker, discovery) = context("m1").await;
        let gossip = serde_json::to_vec(&amif_common::GossipMessage::push(
            "m2",
            vec![
                ModuleRecord::alive("m2", "m2", 0, 1),
                ModuleRecord {
                    state: MemberState::Dead,
                    ..ModuleRecord::alive("m3", "m3", 0, 1)
                },
            ],
        ))
        .unwrap();
        discovery.on_gossip_received("m2", &gossip).await;

        let peers: Vec<String> = ctx.peers().await.into_iter().map(|r| r.id).collect();
        assert_eq!(peers, vec!["m2".to_string()]);
        assert!(ctx.is_peer_alive("m2").await);
        assert!(!ctx.is_peer_alive("m3").await);
        assert!(!ctx.is_peer_alive("m9").await);
    }

    #[tokio::test]
    async fn test_registration_options_are_exposed() {
        let broker = Broker::new(Arc::new(MemoryBackend::new()));
        let network = MemoryNetwork::new();
        let discovery = Arc::new(DiscoveryService::new(
            Default::default(),
            Arc::new(MemoryTransport::connect(&network, "m1")),
        ));
        let registration = ModuleRegistration::new("m1").with_option("region", "eu");

        let ctx = ModuleContext::new(registration, broker, discovery);
        assert_eq!(ctx.options()["region"], "eu");
        assert_eq!(ctx.to_string(), "Module m1 (Status: INITIALIZING)");
    }
}
