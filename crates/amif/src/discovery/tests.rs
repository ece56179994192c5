//! Multi-node discovery scenarios over the in-memory network.
//!
//! Rounds are driven by hand: every node ticks, then datagrams are delivered
//! until the network is quiet. Time only moves through the `ManualClock`.

use super::*;
use amif_common::{AmifError, GossipKind, GossipMessage, MemberState, MembershipEvent, ModuleRecord};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::DiscoveryConfig;

const INTERVAL: u64 = 200;

struct Node {
    id: String,
    transport: Arc<MemoryTransport>,
    service: Arc<DiscoveryService>,
}

struct Cluster {
    network: MemoryNetwork,
    clock: Arc<ManualClock>,
    nodes: Vec<Node>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
            clock: Arc::new(ManualClock::new(1_000)),
            nodes: Vec::new(),
        }
    }

    async fn add(&mut self, id: &str, config: DiscoveryConfig) -> Arc<DiscoveryService> {
        let transport = Arc::new(MemoryTransport::connect(&self.network, id));
        let service = Arc::new(
            DiscoveryService::new(config, transport.clone()).with_clock(self.clock.clone()),
        );
        service
            .register_local(ModuleRecord::alive(id, id, 0, self.clock.now_millis()))
            .await;

        self.nodes.push(Node {
            id: id.to_string(),
            transport,
            service: service.clone(),
        });
        service
    }

    /// Deliver queued datagrams until nothing is in flight
    async fn deliver(&self) {
        loop {
            let mut delivered = 0;
            for node in &self.nodes {
                for (from, bytes) in node.transport.drain().await {
                    node.service.on_gossip_received(&from, &bytes).await;
                    delivered += 1;
                }
            }
            if delivered == 0 {
                break;
            }
        }
    }

    async fn round(&self) {
        self.clock.advance(INTERVAL);
        for node in &self.nodes {
            node.service.tick().await;
        }
        self.deliver().await;
    }

    async fn alive_ids(&self, node: usize) -> Vec<String> {
        self.nodes[node]
            .service
            .members()
            .await
            .into_iter()
            .map(|r| r.id)
            .collect()
    }

    async fn converged(&self) -> bool {
        let mut expected: Vec<String> = self.nodes.iter().map(|n| n.id.clone()).collect();
        expected.sort();
        for i in 0..self.nodes.len() {
            if self.alive_ids(i).await != expected {
                return false;
            }
        }
        true
    }
}

fn config(seeds: &[&str], fanout: usize) -> DiscoveryConfig {
    DiscoveryConfig {
        seeds: seeds.iter().map(|s| s.to_string()).collect(),
        fanout,
        ..DiscoveryConfig::default()
    }
}

fn recorder(service: &DiscoveryService) -> Arc<Mutex<Vec<MembershipEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    service.register_listener(move |e: &MembershipEvent| sink.lock().unwrap().push(e.clone()));
    events
}

#[tokio::test]
async fn test_three_modules_agree_within_three_ticks() {
    let mut cluster = Cluster::new();
    cluster.add("m1", config(&[], 2)).await;
    cluster.add("m2", config(&["m1", "m3"], 2)).await;
    cluster.add("m3", config(&[], 2)).await;

    for _ in 0..3 {
        cluster.round().await;
    }

    assert!(cluster.converged().await);
    for node in &cluster.nodes {
        for record in node.service.snapshot().await {
            assert_eq!(record.state, MemberState::Alive);
            assert_eq!(record.incarnation, 0);
        }
    }
}

async fn seeded_cluster(nodes: usize) -> Cluster {
    let mut cluster = Cluster::new();
    for i in 0..nodes {
        cluster.add(&format!("n{}", i), config(&["n0"], 3)).await;
    }
    cluster
}

#[tokio::test]
async fn test_convergence_is_logarithmic() {
    let cluster = seeded_cluster(32).await;

    let mut rounds = 0;
    while !cluster.converged().await {
        cluster.round().await;
        rounds += 1;
        assert!(rounds <= 20, "no convergence after {} rounds", rounds);
    }

    // ceil(log2(32)) = 5; allow a constant factor for random peer choice
    assert!(rounds <= 4 * 5);
}

#[tokio::test]
async fn test_large_healthy_cluster_stays_alive() {
    const NODES: usize = 32;

    let cluster = seeded_cluster(NODES).await;
    let recorders: Vec<_> = cluster.nodes.iter().map(|n| recorder(&n.service)).collect();

    let mut rounds = 0;
    while !cluster.converged().await {
        cluster.round().await;
        rounds += 1;
        assert!(rounds <= 20, "no convergence after {} rounds", rounds);
    }

    for _ in 0..100 {
        cluster.round().await;
    }

    let doubted: Vec<MembershipEvent> = recorders
        .iter()
        .flat_map(|events| events.lock().unwrap().clone())
        .filter(|e| e.new_state != MemberState::Alive)
        .collect();
    assert!(doubted.is_empty(), "live modules were doubted: {:?}", doubted);

    assert!(cluster.converged().await);
    for node in &cluster.nodes {
        assert_eq!(node.service.stats().refutations, 0);
        assert_eq!(node.service.local_record().await.unwrap().incarnation, 0);
    }
}

#[tokio::test]
async fn test_partition_suspect_dead_and_recovery() {
    let mut cluster = Cluster::new();
    let a = cluster.add("a", config(&["b"], 2)).await;
    cluster.add("b", config(&["a"], 2)).await;
    let events = recorder(&a);

    cluster.round().await;
    cluster.round().await;
    assert!(cluster.converged().await);

    cluster.network.set_reachable("b", false);

    // suspect_timeout = 1000ms = 5 rounds
    for _ in 0..5 {
        cluster.round().await;
    }
    assert_eq!(a.record("b").await.unwrap().state, MemberState::Suspect);

    // dead_timeout = 3000ms = 15 more rounds
    for _ in 0..15 {
        cluster.round().await;
    }
    assert_eq!(a.record("b").await.unwrap().state, MemberState::Dead);
    assert_eq!(a.members().await.len(), 1);

    cluster.network.set_reachable("b", true);
    for _ in 0..3 {
        cluster.round().await;
    }

    let b = a.record("b").await.unwrap();
    assert_eq!(b.state, MemberState::Alive);
    assert!(b.incarnation >= 1);
    assert!(cluster.converged().await);

    let states: Vec<MemberState> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.module_id == "b")
        .map(|e| e.new_state)
        .collect();
    assert_eq!(
        states,
        vec![
            MemberState::Alive,
            MemberState::Suspect,
            MemberState::Dead,
            MemberState::Alive
        ]
    );
}

#[tokio::test]
async fn test_refutes_suspicion() {
    let mut cluster = Cluster::new();
    let a = cluster.add("a", config(&[], 2)).await;

    let gossip = serde_json::to_vec(&GossipMessage::push(
        "x",
        vec![ModuleRecord {
            state: MemberState::Suspect,
            ..ModuleRecord::alive("a", "a", 0, 5_000)
        }],
    ))
    .unwrap();

    let changed = a.on_gossip_received("x", &gossip).await;
    assert_eq!(changed.len(), 1);

    let local = a.local_record().await.unwrap();
    assert_eq!(local.state, MemberState::Alive);
    assert_eq!(local.incarnation, 1);
    assert_eq!(a.stats().refutations, 1);
}

#[tokio::test]
async fn test_doubted_sender_gets_digest_back() {
    let mut cluster = Cluster::new();
    let a = cluster.add("a", config(&[], 2)).await;
    let x = MemoryTransport::connect(&cluster.network, "x");

    let suspect_x = ModuleRecord {
        state: MemberState::Suspect,
        ..ModuleRecord::alive("x", "x", 0, 1_000)
    };
    let gossip = |digest: Vec<ModuleRecord>| {
        serde_json::to_vec(&GossipMessage::push("x", digest)).unwrap()
    };

    a.on_gossip_received("y", &gossip(vec![suspect_x])).await;
    a.on_gossip_received("x", &gossip(vec![])).await;

    let replies = x.drain().await;
    assert_eq!(replies.len(), 1);
    let reply: GossipMessage = serde_json::from_slice(&replies[0].1).unwrap();
    assert_eq!(reply.sender_id, "a");
    assert_eq!(reply.kind, GossipKind::Reply);
    assert!(
        reply
            .digest
            .iter()
            .any(|r| r.id == "x" && r.state == MemberState::Suspect)
    );
}

#[tokio::test]
async fn test_push_is_answered_and_reply_is_not() {
    let mut cluster = Cluster::new();
    let a = cluster.add("a", config(&[], 2)).await;
    let x = MemoryTransport::connect(&cluster.network, "x");
    let fresh_x = vec![ModuleRecord::alive("x", "x", 0, 1_000)];

    let push = serde_json::to_vec(&GossipMessage::push("x", fresh_x.clone())).unwrap();
    a.on_gossip_received("x", &push).await;

    let answers = x.drain().await;
    assert_eq!(answers.len(), 1);
    let answer: GossipMessage = serde_json::from_slice(&answers[0].1).unwrap();
    assert_eq!(answer.kind, GossipKind::Reply);
    assert!(answer.digest.iter().any(|r| r.id == "a"));

    let reply = serde_json::to_vec(&GossipMessage::reply("x", fresh_x)).unwrap();
    a.on_gossip_received("x", &reply).await;
    assert!(x.drain().await.is_empty());
}

#[tokio::test]
async fn test_malformed_and_own_gossip_are_dropped() {
    let mut cluster = Cluster::new();
    let a = cluster.add("a", config(&[], 2)).await;
    let events = recorder(&a);

    assert!(a.on_gossip_received("x", b"{not json").await.is_empty());
    assert!(a.on_gossip_received("x", &[0xff, 0x00, 0x13]).await.is_empty());

    let own = serde_json::to_vec(&GossipMessage::push(
        "a",
        vec![ModuleRecord::alive("ghost", "ghost", 0, 1)],
    ))
    .unwrap();
    assert!(a.on_gossip_received("a", &own).await.is_empty());

    assert_eq!(a.stats().malformed, 2);
    assert_eq!(a.stats().received, 3);
    assert!(a.record("ghost").await.is_none());
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_listener_sees_new_members() {
    let mut cluster = Cluster::new();
    let a = cluster.add("a", config(&["b"], 2)).await;
    let events = recorder(&a);
    cluster.add("b", config(&[], 2)).await;

    cluster.round().await;
    cluster.round().await;

    let events = events.lock().unwrap();
    assert!(events.contains(&MembershipEvent {
        module_id: "b".to_string(),
        old_state: None,
        new_state: MemberState::Alive,
    }));
}

#[tokio::test]
async fn test_start_twice_fails_and_restart_bumps_incarnation() {
    let network = MemoryNetwork::new();
    let transport = Arc::new(MemoryTransport::connect(&network, "solo"));
    let service = Arc::new(DiscoveryService::new(config(&[], 2), transport));

    service
        .start(ModuleRecord::alive("solo", "", 0, 0))
        .await
        .unwrap();
    assert!(service.is_running());
    assert_eq!(service.local_record().await.unwrap().address, "solo");

    let err = service
        .start(ModuleRecord::alive("solo", "", 0, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, AmifError::AlreadyRunning));
    assert!(err.is_fatal());

    service.stop();
    assert!(!service.is_running());

    service
        .start(ModuleRecord::alive("solo", "", 0, 0))
        .await
        .unwrap();
    assert_eq!(service.local_record().await.unwrap().incarnation, 1);
    service.stop();
}

#[tokio::test]
async fn test_background_loops_converge() {
    let network = MemoryNetwork::new();
    let fast = DiscoveryConfig {
        gossip_interval_ms: 20,
        send_timeout_ms: 10,
        ..config(&["left"], 2)
    };

    let left = Arc::new(DiscoveryService::new(
        fast.clone(),
        Arc::new(MemoryTransport::connect(&network, "left")),
    ));
    let right = Arc::new(DiscoveryService::new(
        fast,
        Arc::new(MemoryTransport::connect(&network, "right")),
    ));

    left.start(ModuleRecord::alive("left", "left", 0, 0)).await.unwrap();
    right.start(ModuleRecord::alive("right", "right", 0, 0)).await.unwrap();

    let converged = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if left.members().await.len() == 2 && right.members().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    left.stop();
    right.stop();
    tokio_test::assert_ok!(converged);
    assert!(left.stats().rounds > 0);
}

/// Accepts sends and never completes them
struct StalledTransport;

#[async_trait]
impl GossipTransport for StalledTransport {
    fn local_address(&self) -> String {
        "stalled".to_string()
    }

    async fn send(&self, _address: &str, _payload: &[u8]) -> Result<(), AmifError> {
        futures::future::pending().await
    }

    async fn recv(&self) -> Result<(String, Vec<u8>), AmifError> {
        futures::future::pending().await
    }
}

#[tokio::test]
async fn test_stalled_sends_time_out() {
    let cfg = DiscoveryConfig {
        send_timeout_ms: 10,
        ..config(&["p1", "p2", "p3"], 3)
    };
    let service = DiscoveryService::new(cfg, Arc::new(StalledTransport));
    service
        .register_local(ModuleRecord::alive("s", "stalled", 0, 0))
        .await;

    tokio::time::timeout(Duration::from_secs(2), service.tick())
        .await
        .unwrap();

    let stats = service.stats();
    assert_eq!(stats.sent, 0);
    assert_eq!(stats.send_failures, 3);
}
