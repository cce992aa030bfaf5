//! Infrastructure layer - Adapters behind the domain ports
//!
//! This layer contains:
//! - Signaling backend adapters
//! - Call history sinks
//! - Audio route controllers

pub mod audio;
pub mod backend;
pub mod history;

pub use audio::LoggingAudioController;
pub use backend::{BackendCall, DialBehavior, SimulatedBackend};
pub use history::{InMemoryHistorySink, TracingHistorySink};
