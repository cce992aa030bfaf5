//! Call leg aggregate

use crate::domain::leg::event::SignalKind;
use crate::domain::leg::value_object::{LegDirection, LegOutcome, LegState};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::value_objects::LegId;
use crate::domain::shared::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One SIP dialog endpoint of a call
///
/// Mutated only by leg operations, either after a capability binding
/// succeeded or when a signaling event arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLeg {
    id: LegId,
    /// Far party, as dialed or as presented by the backend
    remote_address: String,
    state: LegState,
    direction: LegDirection,
    created_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    outcome: Option<LegOutcome>,
    /// Outcome to report if the leg ends while an operation is in flight
    #[serde(skip)]
    pending_outcome: Option<LegOutcome>,
    disconnect_reason: Option<String>,
    /// Last hold intent issued locally; used to drop stale acks
    #[serde(skip)]
    hold_intent: Option<bool>,
}

impl CallLeg {
    pub fn outbound(id: LegId, remote_address: impl Into<String>) -> Self {
        Self::new(id, remote_address.into(), LegDirection::Outbound, LegState::Dialing)
    }

    pub fn inbound(id: LegId, remote_address: impl Into<String>) -> Self {
        Self::new(id, remote_address.into(), LegDirection::Inbound, LegState::Ringing)
    }

    fn new(id: LegId, remote_address: String, direction: LegDirection, state: LegState) -> Self {
        Self {
            id,
            remote_address,
            state,
            direction,
            created_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            outcome: None,
            pending_outcome: None,
            disconnect_reason: None,
            hold_intent: None,
        }
    }

    /// Move to `new_state`; returns `false` when already there
    pub fn transition_to(&mut self, new_state: LegState) -> Result<bool> {
        if self.state == new_state {
            return Ok(false);
        }

        if !self.state.can_transition_to(new_state) {
            return Err(DomainError::InvalidStateTransition(format!(
                "leg {} cannot go from {} to {}",
                self.id, self.state, new_state
            )));
        }

        let now = Utc::now();
        match new_state {
            LegState::Connected if self.connected_at.is_none() => self.connected_at = Some(now),
            LegState::Disconnected => {
                self.ended_at = Some(now);
                if self.outcome.is_none() {
                    self.outcome = self.pending_outcome.take();
                }
            }
            _ => {}
        }

        self.state = new_state;
        Ok(true)
    }

    /// Apply a backend signal, reconciling it against local intent
    ///
    /// Returns the `(from, to)` pair when the state actually changed.
    pub fn apply_signal(&mut self, kind: &SignalKind) -> Option<(LegState, LegState)> {
        let from = self.state;
        let target = match kind {
            SignalKind::Incoming { .. } => return None,
            SignalKind::Ringing if from == LegState::Dialing => LegState::Ringing,
            SignalKind::Connected if matches!(from, LegState::Dialing | LegState::Ringing) => {
                LegState::Connected
            }
            // Ack for an intent we have since reversed
            SignalKind::HoldAck if self.hold_intent == Some(false) => return None,
            SignalKind::UnholdAck if self.hold_intent == Some(true) => return None,
            SignalKind::HoldAck | SignalKind::AutoHeld if from == LegState::Connected => {
                LegState::OnHold
            }
            SignalKind::UnholdAck if from == LegState::OnHold => LegState::Connected,
            SignalKind::Disconnected { reason } if from.is_live() => {
                self.disconnect_reason = reason.clone();
                LegState::Disconnected
            }
            _ => return None,
        };

        match self.transition_to(target) {
            Ok(true) => Some((from, target)),
            _ => None,
        }
    }

    pub fn set_hold_intent(&mut self, held: bool) {
        self.hold_intent = Some(held);
    }

    /// Record the outcome; the first decision wins
    pub fn set_outcome(&mut self, outcome: LegOutcome) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
    }

    /// Outcome that applies if the leg disconnects before `None` is set again
    pub fn expect_outcome(&mut self, outcome: Option<LegOutcome>) {
        self.pending_outcome = outcome;
    }

    /// Outcome reported to call history
    pub fn final_outcome(&self) -> LegOutcome {
        match self.outcome {
            Some(outcome) => outcome,
            None if self.connected_at.is_some() => LegOutcome::Completed,
            None => LegOutcome::Unanswered,
        }
    }

    // Getters
    pub fn id(&self) -> &LegId {
        &self.id
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn state(&self) -> LegState {
        self.state
    }

    pub fn direction(&self) -> LegDirection {
        self.direction
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn disconnect_reason(&self) -> Option<&str> {
        self.disconnect_reason.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_leg() -> CallLeg {
        let mut leg = CallLeg::outbound(LegId::from("sim-1"), "sip:1001@pbx.local");
        leg.transition_to(LegState::Connected).unwrap();
        leg
    }

    #[test]
    fn test_leg_lifecycle() {
        let mut leg = CallLeg::outbound(LegId::from("sim-1"), "sip:1001@pbx.local");
        assert_eq!(leg.state(), LegState::Dialing);
        assert_eq!(leg.direction(), LegDirection::Outbound);

        assert!(leg.transition_to(LegState::Ringing).unwrap());
        assert!(leg.transition_to(LegState::Connected).unwrap());
        assert!(leg.connected_at().is_some());
        assert!(!leg.transition_to(LegState::Connected).unwrap());

        assert!(leg.transition_to(LegState::OnHold).unwrap());
        assert!(leg.transition_to(LegState::Disconnected).unwrap());
        assert!(leg.ended_at().is_some());
        assert_eq!(leg.final_outcome(), LegOutcome::Completed);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut leg = CallLeg::inbound(LegId::from("sim-2"), "sip:2000@pbx.local");
        assert_eq!(leg.state(), LegState::Ringing);
        assert!(leg.transition_to(LegState::OnHold).is_err());
    }

    #[test]
    fn test_unanswered_outcome() {
        let mut leg = CallLeg::outbound(LegId::from("sim-3"), "sip:1003@pbx.local");
        leg.transition_to(LegState::Disconnected).unwrap();
        assert_eq!(leg.final_outcome(), LegOutcome::Unanswered);
    }

    #[test]
    fn test_first_outcome_wins() {
        let mut leg = connected_leg();
        leg.set_outcome(LegOutcome::Transferred);
        leg.set_outcome(LegOutcome::Failed);
        assert_eq!(leg.final_outcome(), LegOutcome::Transferred);
    }

    #[test]
    fn test_expected_outcome_applies_on_disconnect() {
        let mut leg = connected_leg();
        leg.expect_outcome(Some(LegOutcome::Transferred));
        leg.apply_signal(&SignalKind::Disconnected { reason: None });
        assert_eq!(leg.final_outcome(), LegOutcome::Transferred);

        let mut leg = connected_leg();
        leg.expect_outcome(Some(LegOutcome::Transferred));
        leg.expect_outcome(None);
        leg.transition_to(LegState::Disconnected).unwrap();
        assert_eq!(leg.final_outcome(), LegOutcome::Completed);
    }

    #[test]
    fn test_stale_hold_ack_is_dropped() {
        let mut leg = connected_leg();
        leg.set_hold_intent(true);
        leg.transition_to(LegState::OnHold).unwrap();
        leg.set_hold_intent(false);
        leg.transition_to(LegState::Connected).unwrap();

        // HoldAck for the first request arrives late
        assert_eq!(leg.apply_signal(&SignalKind::HoldAck), None);
        assert_eq!(leg.state(), LegState::Connected);

        // Backend-side auto hold still applies
        assert_eq!(
            leg.apply_signal(&SignalKind::AutoHeld),
            Some((LegState::Connected, LegState::OnHold))
        );
    }

    #[test]
    fn test_connected_signal_ignored_once_established() {
        let mut leg = connected_leg();
        leg.transition_to(LegState::OnHold).unwrap();
        assert_eq!(leg.apply_signal(&SignalKind::Connected), None);
        assert_eq!(leg.state(), LegState::OnHold);
    }

    #[test]
    fn test_disconnect_signal_records_reason() {
        let mut leg = connected_leg();
        let changed = leg.apply_signal(&SignalKind::Disconnected {
            reason: Some("BYE".to_string()),
        });
        assert_eq!(changed, Some((LegState::Connected, LegState::Disconnected)));
        assert_eq!(leg.disconnect_reason(), Some("BYE"));
        assert_eq!(
            leg.apply_signal(&SignalKind::Disconnected { reason: None }),
            None
        );
    }
}
