//! Transfer bounded context

pub mod attempt;

pub use attempt::{ActiveSide, TransferAttempt, TransferKind, TransferPhase, TransferView};
