//! Call leg bounded context - one SIP dialog endpoint and the arena that owns it

pub mod aggregate;
pub mod arena;
pub mod event;
pub mod value_object;

pub use aggregate::CallLeg;
pub use arena::{LegArena, LegOwner, LegTransition};
pub use event::{SignalKind, SignalingEvent};
pub use value_object::{LegDirection, LegOutcome, LegState};
