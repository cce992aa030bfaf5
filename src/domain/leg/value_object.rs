//! Call leg value objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Leg state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegState {
    /// Outbound INVITE sent, nothing heard back yet
    Dialing,
    /// Far end is being alerted
    Ringing,
    /// Dialog established and media flowing
    Connected,
    /// Dialog established, media held
    OnHold,
    /// Dialog terminated
    Disconnected,
}

impl LegState {
    /// Check if state transition is valid
    pub fn can_transition_to(&self, new_state: LegState) -> bool {
        use LegState::*;

        match (self, new_state) {
            (Dialing, Ringing) => true,
            (Dialing, Connected) => true,
            (Ringing, Connected) => true,

            (Connected, OnHold) => true,
            (OnHold, Connected) => true,

            (Disconnected, _) => false,
            (_, Disconnected) => true,

            _ => false,
        }
    }

    /// Dialog established (talking or held)
    pub fn is_established(&self) -> bool {
        matches!(self, LegState::Connected | LegState::OnHold)
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, LegState::Disconnected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LegState::Dialing => "dialing",
            LegState::Ringing => "ringing",
            LegState::Connected => "connected",
            LegState::OnHold => "on_hold",
            LegState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for LegState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Leg direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegDirection {
    Inbound,
    Outbound,
}

/// How a leg ended, as reported to call history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegOutcome {
    /// Normal hangup after the call was answered
    Completed,
    /// Handed off to another party by a transfer
    Transferred,
    /// Never reached CONNECTED
    Unanswered,
    /// Torn down because an add or transfer was cancelled
    Cancelled,
    /// Released after a failed orchestration step
    Failed,
}

impl LegOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegOutcome::Completed => "completed",
            LegOutcome::Transferred => "transferred",
            LegOutcome::Unanswered => "unanswered",
            LegOutcome::Cancelled => "cancelled",
            LegOutcome::Failed => "failed",
        }
    }
}
