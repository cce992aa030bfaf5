//! Softphone engine - call transfer and conferencing core for a SIP softphone
//!
//! The engine orchestrates call legs on top of a signaling backend whose
//! method surface varies at runtime: attended and unattended transfer,
//! N-party conferences, hold/unhold and teardown, each realized through
//! whichever backend capability is available.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;

// Re-export commonly used types
pub use application::SoftphoneEngine;
pub use domain::shared::error::{DomainError, Result};
