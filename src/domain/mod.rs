//! Domain layer - Core call-control model and rules
//!
//! This layer contains:
//! - Aggregates: call legs, transfer attempts, conferences
//! - Value Objects: identifiers, SIP URIs, leg and phase enums
//! - Capability model: intents, backend methods and their bindings
//! - Ports: signaling backend, audio route controller, call history sink

pub mod audio_route;
pub mod backend;
pub mod capability;
pub mod conference;
pub mod history;
pub mod leg;
pub mod shared;
pub mod transfer;

// Re-export commonly used types
pub use shared::{DomainError, Result};
