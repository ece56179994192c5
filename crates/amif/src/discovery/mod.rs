//! Cluster membership via gossip.
//!
//! [`DiscoveryService`] owns a [`MembershipTable`] and keeps it converging with
//! the rest of the cluster over a [`GossipTransport`].

mod clock;
mod membership;
mod service;
mod transport;

#[cfg(test)]
mod tests;

pub use clock::{Clock, ManualClock, SystemClock};
pub use membership::{MembershipTable, MergeOutcome};
pub use service::{DiscoveryService, GossipStats, GossipStatsSnapshot, Listener};
pub use transport::{GossipTransport, MemoryNetwork, MemoryTransport, UdpTransport};
