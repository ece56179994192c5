//! Core types shared across AMIF components.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Broker message body: a string-keyed JSON object.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Liveness state of a cluster member.
///
/// Declaration order is the state rank used by the merge rule:
/// ALIVE < SUSPECT < DEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
}

impl MemberState {
    pub fn rank(&self) -> u8 {
        match self {
            Self::Alive => 0,
            Self::Suspect => 1,
            Self::Dead => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alive => "ALIVE",
            Self::Suspect => "SUSPECT",
            Self::Dead => "DEAD",
        }
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one node knows about one module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleRecord {
    /// Module name, unique in the cluster
    pub id: String,

    /// Gossip endpoint (host:port)
    pub address: String,

    /// Bumped by the owner on every restart or refutation
    pub incarnation: u64,

    /// Current liveness state
    pub state: MemberState,

    /// Unix milliseconds of the last state change or owner heartbeat
    pub last_updated: u64,
}

impl ModuleRecord {
    /// A fresh ALIVE record
    pub fn alive(id: impl Into<String>, address: impl Into<String>, incarnation: u64, now: u64) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            incarnation,
            state: MemberState::Alive,
            last_updated: now,
        }
    }

    /// Merge precedence: (incarnation, state rank, last_updated)
    pub fn precedence(&self) -> (u64, u8, u64) {
        (self.incarnation, self.state.rank(), self.last_updated)
    }

    /// Total order over records for the same id. The address only breaks
    /// ties so that merges stay deterministic.
    pub fn compare(&self, other: &Self) -> Ordering {
        self.precedence()
            .cmp(&other.precedence())
            .then_with(|| self.address.cmp(&other.address))
    }

    /// True if `self` should replace `other` in a membership table.
    pub fn supersedes(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Greater
    }

    pub fn is_alive(&self) -> bool {
        self.state == MemberState::Alive
    }
}

/// Whether a gossip datagram expects the receiver's digest in return
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GossipKind {
    /// Round gossip; answered with a `Reply`
    #[default]
    Push,
    /// Answer to a push; never answered
    Reply,
}

/// Gossip datagram exchanged between discovery services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipMessage {
    /// Sending module id
    pub sender_id: String,

    #[serde(default)]
    pub kind: GossipKind,

    /// Delta or full snapshot of the sender's membership table
    pub digest: Vec<ModuleRecord>,
}

impl GossipMessage {
    pub fn push(sender_id: impl Into<String>, digest: Vec<ModuleRecord>) -> Self {
        Self {
            sender_id: sender_id.into(),
            kind: GossipKind::Push,
            digest,
        }
    }

    pub fn reply(sender_id: impl Into<String>, digest: Vec<ModuleRecord>) -> Self {
        Self {
            sender_id: sender_id.into(),
            kind: GossipKind::Reply,
            digest,
        }
    }
}

/// Externally visible membership change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub module_id: String,

    /// `None` when the module was not known before
    pub old_state: Option<MemberState>,

    pub new_state: MemberState,
}

impl MembershipEvent {
    /// A module entered the table, or came back to life
    pub fn is_join(&self) -> bool {
        self.new_state == MemberState::Alive && self.old_state != Some(MemberState::Alive)
    }

    /// A module was declared dead
    pub fn is_leave(&self) -> bool {
        self.new_state == MemberState::Dead
    }
}

/// Module lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleStatus {
    Initializing,
    Operational,
    Degraded,
}

impl ModuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Operational => "OPERATIONAL",
            Self::Degraded => "DEGRADED",
        }
    }

    /// Transitions a module may request for itself.
    ///
    /// DEGRADED is entered only through the error callback.
    pub fn can_transition_to(&self, next: ModuleStatus) -> bool {
        matches!(
            (self, next),
            (Self::Initializing, Self::Operational)
        )
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Initializing => 0,
            Self::Operational => 1,
            Self::Degraded => 2,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Initializing,
            1 => Self::Operational,
            _ => Self::Degraded,
        }
    }
}

impl Default for ModuleStatus {
    fn default() -> Self {
        Self::Initializing
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker wire format.
///
/// Tagged with `"amif": <version>` and strict about its fields, so a foreign
/// object that happens to carry a `payload` key is never mistaken for one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    #[serde(rename = "amif")]
    pub version: u32,

    /// Publishing module, if it identified itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    pub payload: Payload,
}

impl Envelope {
    pub const VERSION: u32 = 1;

    pub fn new(sender: Option<String>, payload: Payload) -> Self {
        Self {
            version: Self::VERSION,
            sender,
            payload,
        }
    }
}
