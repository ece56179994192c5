//! # AMIF - module interconnect fabric
//!
//! Hosts modules that talk through a topic [`broker::Broker`] and find each
//! other through gossip-based [`discovery::DiscoveryService`].
//!
//! ## Architecture
//! ```text
//! Module ──► ModuleContext ──► Broker ──► StorageBackend (Redis)
//!                 │
//!                 └──► DiscoveryService ◄──gossip──► peers
//! ```

pub mod broker;
pub mod config;
pub mod discovery;
pub mod module;
pub mod node;
pub mod routes;
pub mod storage;
