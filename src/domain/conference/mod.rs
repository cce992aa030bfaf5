//! Conference bounded context

pub mod aggregate;

pub use aggregate::{
    BridgeMode, Conference, ConferenceParticipant, ConferencePhase, ConferenceView,
    ParticipantStatus,
};
