//! Signaling backend adapters

pub mod simulated;

pub use simulated::{BackendCall, DialBehavior, SimulatedBackend};
