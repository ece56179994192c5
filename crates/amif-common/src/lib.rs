//! # AMIF Common
//!
//! Shared types, errors, and constants used across AMIF components.
//!
//! ## Modules
//! - `types` - Core data structures (ModuleRecord, GossipMessage, ModuleStatus, etc.)
//! - `error` - Common error taxonomy
//! - `constants` - Defaults, option names, Redis keys, and well-known topics

pub mod constants;
pub mod error;
pub mod types;

pub use error::AmifError;
pub use types::*;
