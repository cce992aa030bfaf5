//! Interface layer - What the engine exposes to the UI and to operators

pub mod metrics;
pub mod status;

pub use status::{EngineNotice, EngineStatus, LegSummary, NoticeEnvelope, StatusBroadcaster};
