//! Common error types for AMIF components.

use thiserror::Error;

use crate::types::ModuleStatus;

/// Common errors across AMIF components
#[derive(Debug, Error)]
pub enum AmifError {
    /// Storage backend operation failed
    #[error("Storage backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Gossip payload could not be decoded or failed validation
    #[error("Malformed gossip: {0}")]
    MalformedGossip(String),

    /// `start` called on a discovery service that is already running
    #[error("Discovery service is already running")]
    AlreadyRunning,

    /// Peer could not be reached over the gossip transport
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    /// Requested module status change is not part of the lifecycle
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: ModuleStatus, to: ModuleStatus },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Gossip transport failure (bind, receive)
    #[error("Transport error: {0}")]
    Transport(String),
}

impl AmifError {
    /// Returns true for programmer-misuse errors that must reach the caller.
    ///
    /// Everything else has a local fallback (return false, drop, suspect).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning | Self::InvalidTransition { .. } | Self::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(AmifError::AlreadyRunning.is_fatal());
        assert!(AmifError::Config("fanout".into()).is_fatal());
        assert!(
            AmifError::InvalidTransition {
                from: ModuleStatus::Degraded,
                to: ModuleStatus::Operational,
            }
            .is_fatal()
        );

        assert!(!AmifError::BackendUnavailable("refused".into()).is_fatal());
        assert!(!AmifError::MalformedGossip("eof".into()).is_fatal());
        assert!(!AmifError::PeerUnreachable("10.0.0.1:7946".into()).is_fatal());
    }

    #[test]
    fn test_transition_message() {
        let err = AmifError::InvalidTransition {
            from: ModuleStatus::Degraded,
            to: ModuleStatus::Operational,
        };
        assert_eq!(
            err.to_string(),
            "Invalid status transition: DEGRADED -> OPERATIONAL"
        );
    }
}
