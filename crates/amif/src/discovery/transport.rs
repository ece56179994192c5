//! Datagram transports for gossip.
//!
//! `UdpTransport` is used by the node binary. `MemoryNetwork` connects any
//! number of in-process endpoints and can cut links to simulate partitions.

use amif_common::AmifError;
use amif_common::constants::MAX_GOSSIP_PACKET_BYTES;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Unreliable, unordered datagram delivery between gossip endpoints
#[async_trait]
pub trait GossipTransport: Send + Sync {
    /// Address peers should use to reach us
    fn local_address(&self) -> String;

    async fn send(&self, address: &str, payload: &[u8]) -> Result<(), AmifError>;

    /// Next inbound datagram as `(sender_address, bytes)`
    async fn recv(&self) -> Result<(String, Vec<u8>), AmifError>;
}

/// UDP socket transport
pub struct UdpTransport {
    socket: UdpSocket,
    advertise: String,
}

impl UdpTransport {
    /// Bind the gossip socket. Without `advertise`, the bound address is
    /// advertised (fine for loopback and explicit interface binds).
    pub async fn bind(bind_addr: &str, advertise: Option<String>) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind gossip socket on {}", bind_addr))?;

        let local = socket
            .local_addr()
            .context("Failed to read gossip socket address")?;

        let advertise = advertise.unwrap_or_else(|| local.to_string());

        tracing::info!(bind = %local, advertise = %advertise, "Gossip socket bound");

        Ok(Self { socket, advertise })
    }
}

#[async_trait]
impl GossipTransport for UdpTransport {
    fn local_address(&self) -> String {
        self.advertise.clone()
    }

    async fn send(&self, address: &str, payload: &[u8]) -> Result<(), AmifError> {
        if payload.len() > MAX_GOSSIP_PACKET_BYTES {
            return Err(AmifError::Transport(format!(
                "datagram of {} bytes exceeds limit",
                payload.len()
            )));
        }

        self.socket
            .send_to(payload, address)
            .await
            .map(|_| ())
            .map_err(|e| AmifError::PeerUnreachable(format!("{}: {}", address, e)))
    }

    async fn recv(&self) -> Result<(String, Vec<u8>), AmifError> {
        let mut buf = vec![0u8; MAX_GOSSIP_PACKET_BYTES];
        let (len, from) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| AmifError::Transport(e.to_string()))?;
        buf.truncate(len);
        Ok((from.to_string(), buf))
    }
}

type Datagram = (String, Vec<u8>);

#[derive(Default)]
struct NetworkInner {
    endpoints: HashMap<String, mpsc::UnboundedSender<Datagram>>,
    /// Addresses that can neither send nor receive
    isolated: HashSet<String>,
}

/// In-process "network" shared by [`MemoryTransport`] endpoints
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cut (`false`) or restore (`true`) every link of `address`
    pub fn set_reachable(&self, address: &str, reachable: bool) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if reachable {
            inner.isolated.remove(address);
        } else {
            inner.isolated.insert(address.to_string());
        }
    }

    fn deliver(&self, from: &str, to: &str, payload: &[u8]) -> Result<(), AmifError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| AmifError::Transport("memory network poisoned".to_string()))?;

        if inner.isolated.contains(from) || inner.isolated.contains(to) {
            return Err(AmifError::PeerUnreachable(to.to_string()));
        }

        let endpoint = inner
            .endpoints
            .get(to)
            .ok_or_else(|| AmifError::PeerUnreachable(to.to_string()))?;

        endpoint
            .send((from.to_string(), payload.to_vec()))
            .map_err(|_| AmifError::PeerUnreachable(to.to_string()))
    }
}

/// Endpoint on a [`MemoryNetwork`]
pub struct MemoryTransport {
    address: String,
    network: MemoryNetwork,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

impl MemoryTransport {
    /// Attach a new endpoint; an existing endpoint at `address` is replaced
    pub fn connect(network: &MemoryNetwork, address: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut inner) = network.inner.lock() {
            inner.endpoints.insert(address.to_string(), tx);
        }
        Self {
            address: address.to_string(),
            network: network.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    /// Everything queued right now, without waiting
    pub async fn drain(&self) -> Vec<Datagram> {
        let mut inbox = self.inbox.lock().await;
        let mut datagrams = Vec::new();
        while let Ok(datagram) = inbox.try_recv() {
            datagrams.push(datagram);
        }
        datagrams
    }
}

#[async_trait]
impl GossipTransport for MemoryTransport {
    fn local_address(&self) -> String {
        self.address.clone()
    }

    async fn send(&self, address: &str, payload: &[u8]) -> Result<(), AmifError> {
        self.network.deliver(&self.address, address, payload)
    }

    async fn recv(&self) -> Result<(String, Vec<u8>), AmifError> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| AmifError::Transport("memory endpoint closed".to_string()))
    }
}
