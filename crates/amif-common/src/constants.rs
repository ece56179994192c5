//! Shared constants for AMIF components.

/// Default Redis connection URL
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default admin HTTP listen address
pub const DEFAULT_ADMIN_ADDR: &str = "127.0.0.1:8890";

/// Default gossip bind address
pub const DEFAULT_GOSSIP_BIND_ADDR: &str = "0.0.0.0:7946";

/// Gossip round interval (milliseconds)
pub const DEFAULT_GOSSIP_INTERVAL_MS: u64 = 200;

/// Time without refresh before an ALIVE member becomes SUSPECT (milliseconds)
pub const DEFAULT_SUSPECT_TIMEOUT_MS: u64 = 1_000;

/// Time spent SUSPECT before a member is declared DEAD (milliseconds)
pub const DEFAULT_DEAD_TIMEOUT_MS: u64 = 3_000;

/// How long DEAD records are kept before removal (milliseconds)
pub const DEFAULT_DEAD_RETENTION_MS: u64 = 60_000;

/// Peers contacted per gossip round
pub const DEFAULT_FANOUT: usize = 3;

/// Upper bound on a single gossip send (milliseconds)
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 100;

/// Records carried by one gossip digest
pub const DEFAULT_MAX_DIGEST_ENTRIES: usize = 64;

/// Largest UDP datagram we try to receive
pub const MAX_GOSSIP_PACKET_BYTES: usize = 65_507;

/// Recognised module registration options
pub mod options {
    pub const GOSSIP_INTERVAL_MS: &str = "gossip_interval_ms";
    pub const SUSPECT_TIMEOUT_MS: &str = "suspect_timeout_ms";
    pub const DEAD_TIMEOUT_MS: &str = "dead_timeout_ms";
    pub const FANOUT: &str = "fanout";
    pub const SEND_TIMEOUT_MS: &str = "send_timeout_ms";
    pub const MAX_DIGEST_ENTRIES: &str = "max_digest_entries";
    pub const DEAD_RETENTION_MS: &str = "dead_retention_ms";
}

/// Redis key prefixes
pub mod redis_keys {
    /// Last incarnation used by a module: amif:incarnation:{name}
    pub const INCARNATION_PREFIX: &str = "amif:incarnation:";
}

/// Well-known broker topics
pub mod topics {
    /// Membership events emitted by the discovery service
    pub const MEMBERSHIP: &str = "amif.membership";

    /// Module status changes
    pub const STATUS: &str = "amif.status";

    /// Replies to ping messages
    pub const PONG: &str = "amif.pong";
}
