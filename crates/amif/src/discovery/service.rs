//! Gossip-driven discovery service.
//!
//! Two background loops per running service:
//! - the ticker: heartbeat, failure detection, garbage collection, then a
//!   digest pushed to `fanout` random ALIVE peers
//! - the receiver: merges inbound digests into the table and answers every
//!   push with its own digest, so freshness travels both ways each round
//!
//! The table lock is never held across network I/O, and listeners are called
//! after it is released.

use amif_common::{AmifError, GossipKind, GossipMessage, MemberState, MembershipEvent, ModuleRecord};
use rand::seq::IndexedRandom;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::time::MissedTickBehavior;

use super::clock::{Clock, SystemClock};
use super::membership::MembershipTable;
use super::transport::GossipTransport;
use crate::config::DiscoveryConfig;

/// Callback for membership changes
pub type Listener = Arc<dyn Fn(&MembershipEvent) + Send + Sync>;

/// Runtime statistics
#[derive(Default)]
pub struct GossipStats {
    pub rounds: AtomicU64,
    pub sent: AtomicU64,
    pub send_failures: AtomicU64,
    pub received: AtomicU64,
    pub malformed: AtomicU64,
    pub refutations: AtomicU64,
}

/// Snapshot of gossip statistics
#[derive(Clone, Debug, Serialize)]
pub struct GossipStatsSnapshot {
    pub rounds: u64,
    pub sent: u64,
    pub send_failures: u64,
    pub received: u64,
    pub malformed: u64,
    pub refutations: u64,
}

pub struct DiscoveryService {
    config: DiscoveryConfig,
    transport: Arc<dyn GossipTransport>,
    clock: Arc<dyn Clock>,
    table: Mutex<MembershipTable>,
    listeners: RwLock<Vec<Listener>>,
    running: AtomicBool,
    shutdown: broadcast::Sender<()>,
    stats: GossipStats,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig, transport: Arc<dyn GossipTransport>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            transport,
            clock: Arc::new(SystemClock),
            table: Mutex::new(MembershipTable::new()),
            listeners: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            shutdown,
            stats: GossipStats::default(),
        }
    }

    /// Replace the wall clock (tests drive time by hand)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Register `self_record` as ALIVE and start the tick and receive loops.
    ///
    /// An empty address is replaced by the transport's advertised address.
    /// Restarting after [`stop`](Self::stop) raises the local incarnation.
    pub async fn start(self: &Arc<Self>, self_record: ModuleRecord) -> Result<(), AmifError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AmifError::AlreadyRunning);
        }

        let local = self.register_local(self_record).await;

        let ticker = self.clone();
        let ticker_shutdown = self.shutdown.subscribe();
        tokio::spawn(async move { ticker.run_ticker(ticker_shutdown).await });

        let receiver = self.clone();
        let receiver_shutdown = self.shutdown.subscribe();
        tokio::spawn(async move { receiver.run_receiver(receiver_shutdown).await });

        tracing::info!(
            module = %local.id,
            address = %local.address,
            incarnation = local.incarnation,
            seeds = ?self.config.seeds,
            "Discovery started"
        );

        Ok(())
    }

    /// Signal both loops to exit. The membership table is kept.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.shutdown.send(());
            tracing::info!("Discovery stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Insert the local record without spawning loops
    pub(crate) async fn register_local(&self, mut record: ModuleRecord) -> ModuleRecord {
        if record.address.is_empty() {
            record.address = self.transport.local_address();
        }

        let now = self.clock.now_millis();
        let (event, local) = {
            let mut table = self.table.lock().await;
            let event = table.register_local(record.clone(), now);
            (event, table.local_record().unwrap_or(record))
        };

        if let Some(event) = event {
            self.emit(&[event]);
        }
        local
    }

    async fn run_ticker(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.gossip_interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = shutdown.recv() => {
                    tracing::debug!("Gossip ticker shutting down");
                    break;
                }
            }
        }
    }

    async fn run_receiver(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                result = self.transport.recv() => {
                    match result {
                        Ok((from, bytes)) => {
                            self.on_gossip_received(&from, &bytes).await;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Gossip receive error");
                            tokio::time::sleep(Duration::from_millis(self.config.gossip_interval_ms)).await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Gossip receiver shutting down");
                    break;
                }
            }
        }
    }

    /// One gossip round
    pub async fn tick(&self) {
        let now = self.clock.now_millis();

        let (events, removed, outbound) = {
            let mut table = self.table.lock().await;
            table.heartbeat(now);
            let suspect_timeout = self.config.suspect_timeout_for(table.len());
            let events = table.advance_timers(
                now,
                suspect_timeout,
                self.config.dead_timeout_ms,
            );
            let removed = table.collect_garbage(now, self.config.dead_retention_ms);

            let outbound = table.local_id().map(|id| {
                let message =
                    GossipMessage::push(id, table.digest(self.config.max_digest_entries));
                (self.choose_targets(&table), message)
            });

            (events, removed, outbound)
        };

        self.stats.rounds.fetch_add(1, Ordering::Relaxed);

        for id in &removed {
            tracing::debug!(module = %id, "Forgot dead module");
        }
        self.emit(&events);

        if let Some((targets, message)) = outbound {
            self.send_all(&targets, &message).await;
        }
    }

    /// Up to `fanout` random ALIVE peers, or seeds while none are known
    fn choose_targets(&self, table: &MembershipTable) -> Vec<String> {
        let peers: Vec<String> = table.alive_peers().into_iter().map(|r| r.address).collect();

        let candidates = if peers.is_empty() {
            let own = self.transport.local_address();
            let local = table.local_record().map(|r| r.address);
            self.config
                .seeds
                .iter()
                .filter(|s| **s != own && Some(*s) != local.as_ref())
                .cloned()
                .collect()
        } else {
            peers
        };

        let mut rng = rand::rng();
        candidates
            .choose_multiple(&mut rng, self.config.fanout)
            .cloned()
            .collect()
    }

    async fn send_all(&self, targets: &[String], message: &GossipMessage) {
        if targets.is_empty() {
            return;
        }

        let bytes = match serde_json::to_vec(message) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize gossip message");
                return;
            }
        };

        let sends = targets.iter().map(|target| self.send_one(target, &bytes));
        futures::future::join_all(sends).await;
    }

    async fn send_one(&self, target: &str, bytes: &[u8]) {
        let limit = Duration::from_millis(self.config.send_timeout_ms);

        match tokio::time::timeout(limit, self.transport.send(target, bytes)).await {
            Ok(Ok(())) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(peer = %target, error = %e, "Gossip send failed");
            }
            Err(_) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(peer = %target, timeout = ?limit, "Gossip send timed out");
            }
        }
    }

    /// Merge an inbound digest and answer it if it was a push.
    /// Returns the records that changed.
    pub async fn on_gossip_received(&self, from: &str, bytes: &[u8]) -> Vec<ModuleRecord> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let message = match decode_gossip(bytes) {
            Ok(m) => m,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(from = %from, error = %e, "Dropping gossip");
                return Vec::new();
            }
        };

        let now = self.clock.now_millis();
        let (outcome, reply, sender_in_doubt) = {
            let mut table = self.table.lock().await;
            if table.local_id() == Some(message.sender_id.as_str()) {
                return Vec::new();
            }

            let outcome = table.merge(&message.digest, now);

            let sender_in_doubt = table
                .get(&message.sender_id)
                .is_some_and(|r| r.state != MemberState::Alive);
            // Replies are the end of an exchange
            let reply = match (table.local_id(), message.kind) {
                (Some(id), GossipKind::Push) => Some(GossipMessage::reply(
                    id,
                    table.digest(self.config.max_digest_entries),
                )),
                _ => None,
            };

            (outcome, reply, sender_in_doubt)
        };

        if let Some(incarnation) = outcome.refuted {
            self.stats.refutations.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                from = %message.sender_id,
                incarnation,
                "Refuted peer claim about this module"
            );
        }

        self.emit(&outcome.events);

        if let Some(reply) = reply {
            if sender_in_doubt {
                tracing::debug!(peer = %message.sender_id, "Answering doubted sender so it can refute");
            }
            self.send_all(&[from.to_string()], &reply).await;
        }

        outcome.changed
    }

    /// Call `listener` for every externally visible membership change
    pub fn register_listener<F>(&self, listener: F)
    where
        F: Fn(&MembershipEvent) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(Arc::new(listener));
        }
    }

    fn emit(&self, events: &[MembershipEvent]) {
        if events.is_empty() {
            return;
        }

        for event in events {
            match (event.old_state, event.new_state) {
                (None, state) => {
                    tracing::info!(module = %event.module_id, state = %state, "Module discovered")
                }
                (Some(_), MemberState::Suspect) => {
                    tracing::warn!(module = %event.module_id, "Module suspected")
                }
                (Some(_), MemberState::Dead) => {
                    tracing::warn!(module = %event.module_id, "Module declared dead")
                }
                (Some(old), MemberState::Alive) => {
                    tracing::info!(module = %event.module_id, from = %old, "Module alive again")
                }
            }
        }

        // Listeners run outside the lock so they may call back into us
        let listeners: Vec<Listener> = match self.listeners.read() {
            Ok(l) => l.clone(),
            Err(_) => return,
        };
        for event in events {
            for listener in &listeners {
                listener(event);
            }
        }
    }

    /// ALIVE records, local included
    pub async fn members(&self) -> Vec<ModuleRecord> {
        self.table.lock().await.alive_members()
    }

    /// Every known record regardless of state
    pub async fn snapshot(&self) -> Vec<ModuleRecord> {
        self.table.lock().await.snapshot()
    }

    pub async fn record(&self, id: &str) -> Option<ModuleRecord> {
        self.table.lock().await.get(id)
    }

    pub async fn local_record(&self) -> Option<ModuleRecord> {
        self.table.lock().await.local_record()
    }

    pub fn stats(&self) -> GossipStatsSnapshot {
        GossipStatsSnapshot {
            rounds: self.stats.rounds.load(Ordering::Relaxed),
            sent: self.stats.sent.load(Ordering::Relaxed),
            send_failures: self.stats.send_failures.load(Ordering::Relaxed),
            received: self.stats.received.load(Ordering::Relaxed),
            malformed: self.stats.malformed.load(Ordering::Relaxed),
            refutations: self.stats.refutations.load(Ordering::Relaxed),
        }
    }
}

fn decode_gossip(bytes: &[u8]) -> Result<GossipMessage, AmifError> {
    let message: GossipMessage =
        serde_json::from_slice(bytes).map_err(|e| AmifError::MalformedGossip(e.to_string()))?;

    if message.sender_id.is_empty() {
        return Err(AmifError::MalformedGossip("empty sender id".to_string()));
    }
    if message.digest.iter().any(|r| r.id.is_empty()) {
        return Err(AmifError::MalformedGossip("record without id".to_string()));
    }

    Ok(message)
}
