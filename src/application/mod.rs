//! Application layer - Orchestrators driving legs through the signaling backend
//!
//! Leg operations sit closest to the backend. The conference bridge and the
//! transfer state machine consume them; the engine wires everything together.

pub mod conference_bridge;
pub mod engine;
pub mod history_dispatcher;
pub mod leg_operations;
pub mod transfer_machine;

pub use conference_bridge::ConferenceBridge;
pub use engine::SoftphoneEngine;
pub use history_dispatcher::HistoryDispatcher;
pub use leg_operations::{Applied, LegOperations};
pub use transfer_machine::TransferStateMachine;
