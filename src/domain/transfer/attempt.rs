//! Transfer attempt aggregate

use crate::domain::capability::BindingFailure;
use crate::domain::shared::error::DomainError;
use crate::domain::shared::value_objects::{ConferenceId, LegId, SipUri, TransferId};
use crate::domain::shared::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transfer kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Unattended,
    Attended,
}

/// Transfer phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    Idle,
    /// Talking to the target on the consult leg
    Consulting,
    /// Both legs mixed in a conference, waiting for the user to finish
    Ready,
    Completing,
    Completed,
    Cancelled,
    Failed,
}

impl TransferPhase {
    pub fn can_transition_to(&self, next: TransferPhase) -> bool {
        use TransferPhase::*;

        match (self, next) {
            (Idle, Consulting) | (Idle, Completing) => true,
            (Consulting, Ready) | (Consulting, Completing) => true,
            (Ready, Completing) => true,
            (Completing, Completed) => true,

            (from, Cancelled) | (from, Failed) => !from.is_terminal(),

            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferPhase::Completed | TransferPhase::Cancelled | TransferPhase::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferPhase::Idle => "idle",
            TransferPhase::Consulting => "consulting",
            TransferPhase::Ready => "ready",
            TransferPhase::Completing => "completing",
            TransferPhase::Completed => "completed",
            TransferPhase::Cancelled => "cancelled",
            TransferPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which leg of an attended transfer the user is talking on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveSide {
    Original,
    Consult,
}

impl ActiveSide {
    pub fn other(&self) -> ActiveSide {
        match self {
            ActiveSide::Original => ActiveSide::Consult,
            ActiveSide::Consult => ActiveSide::Original,
        }
    }
}

/// One transfer attempt, unattended or attended
#[derive(Debug, Clone)]
pub struct TransferAttempt {
    id: TransferId,
    kind: TransferKind,
    original_leg: LegId,
    consult_leg: Option<LegId>,
    target: SipUri,
    phase: TransferPhase,
    active_side: ActiveSide,
    /// Conference holding both legs while READY
    conference: Option<ConferenceId>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    /// Every failed binding attempt, including ones a later binding recovered from
    failures: Vec<String>,
    /// Cleanup problems that did not change the outcome
    warnings: Vec<String>,
}

impl TransferAttempt {
    pub fn new(kind: TransferKind, original_leg: LegId, target: SipUri) -> Self {
        Self {
            id: TransferId::new(),
            kind,
            original_leg,
            consult_leg: None,
            target,
            phase: TransferPhase::Idle,
            active_side: ActiveSide::Original,
            conference: None,
            started_at: Utc::now(),
            ended_at: None,
            last_error: None,
            failures: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn transition_to(&mut self, next: TransferPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(DomainError::InvalidStateTransition(format!(
                "transfer {} cannot go from {} to {}",
                self.id, self.phase, next
            )));
        }

        self.phase = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Check the attempt is in one of `allowed` before an operation starts
    pub fn ensure_phase(&self, operation: &str, allowed: &[TransferPhase]) -> Result<()> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(DomainError::InvalidStateTransition(format!(
                "{} is not valid for transfer {} in phase {}",
                operation, self.id, self.phase
            )))
        }
    }

    pub fn record_failures(&mut self, failures: &[BindingFailure]) {
        self.failures.extend(failures.iter().map(|f| f.to_string()));
        if let Some(last) = failures.last() {
            self.last_error = Some(last.to_string());
        }
    }

    /// Record an error; binding failures it carries are kept individually
    pub fn record_error(&mut self, error: &DomainError) {
        self.failures
            .extend(error.binding_failures().iter().map(|f| f.to_string()));
        self.last_error = Some(error.to_string());
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn set_consult_leg(&mut self, leg: LegId) {
        self.consult_leg = Some(leg);
        self.active_side = ActiveSide::Consult;
    }

    pub fn set_active_side(&mut self, side: ActiveSide) {
        self.active_side = side;
    }

    pub fn set_conference(&mut self, conference: Option<ConferenceId>) {
        self.conference = conference;
    }

    /// Leg the user is currently talking on
    pub fn active_leg(&self) -> &LegId {
        match (self.active_side, &self.consult_leg) {
            (ActiveSide::Consult, Some(consult)) => consult,
            _ => &self.original_leg,
        }
    }

    /// Leg the user is not talking on, if there are two
    pub fn inactive_leg(&self) -> Option<&LegId> {
        let consult = self.consult_leg.as_ref()?;
        match self.active_side {
            ActiveSide::Original => Some(consult),
            ActiveSide::Consult => Some(&self.original_leg),
        }
    }

    pub fn legs(&self) -> Vec<LegId> {
        let mut legs = vec![self.original_leg.clone()];
        legs.extend(self.consult_leg.clone());
        legs
    }

    // Getters
    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn original_leg(&self) -> &LegId {
        &self.original_leg
    }

    pub fn consult_leg(&self) -> Option<&LegId> {
        self.consult_leg.as_ref()
    }

    pub fn target(&self) -> &SipUri {
        &self.target
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn active_side(&self) -> ActiveSide {
        self.active_side
    }

    pub fn conference(&self) -> Option<ConferenceId> {
        self.conference
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn view(&self) -> TransferView {
        TransferView {
            id: self.id,
            kind: self.kind,
            original_leg: self.original_leg.clone(),
            consult_leg: self.consult_leg.clone(),
            target: self.target.to_string(),
            phase: self.phase,
            active_side: self.active_side,
            conference: self.conference,
            started_at: self.started_at,
            ended_at: self.ended_at,
            last_error: self.last_error.clone(),
            failures: self.failures.clone(),
            warnings: self.warnings.clone(),
        }
    }
}

/// Read-only projection of a transfer attempt for the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferView {
    pub id: TransferId,
    pub kind: TransferKind,
    pub original_leg: LegId,
    pub consult_leg: Option<LegId>,
    pub target: String,
    pub phase: TransferPhase,
    pub active_side: ActiveSide,
    pub conference: Option<ConferenceId>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub failures: Vec<String>,
    pub warnings: Vec<String>,
}

impl TransferView {
    /// A failed attempt whose caller can try again with a fresh attempt
    pub fn retry_possible(&self) -> bool {
        self.phase == TransferPhase::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::capability::CapabilityBinding;

    fn attempt(kind: TransferKind) -> TransferAttempt {
        TransferAttempt::new(
            kind,
            LegId::from("sim-1"),
            SipUri::parse("sip:1002@pbx.local").unwrap(),
        )
    }

    #[test]
    fn test_attended_phase_flow() {
        let mut transfer = attempt(TransferKind::Attended);
        assert_eq!(transfer.phase(), TransferPhase::Idle);

        transfer.transition_to(TransferPhase::Consulting).unwrap();
        transfer.transition_to(TransferPhase::Ready).unwrap();
        transfer.transition_to(TransferPhase::Completing).unwrap();
        transfer.transition_to(TransferPhase::Completed).unwrap();
        assert!(transfer.is_terminal());
        assert!(transfer.ended_at().is_some());

        // Terminal phases are final
        assert!(transfer.transition_to(TransferPhase::Cancelled).is_err());
        assert!(transfer.transition_to(TransferPhase::Failed).is_err());
    }

    #[test]
    fn test_cancel_and_fail_from_any_live_phase() {
        for phase in [
            TransferPhase::Idle,
            TransferPhase::Consulting,
            TransferPhase::Ready,
            TransferPhase::Completing,
        ] {
            assert!(phase.can_transition_to(TransferPhase::Cancelled));
            assert!(phase.can_transition_to(TransferPhase::Failed));
        }
        assert!(!TransferPhase::Idle.can_transition_to(TransferPhase::Ready));
        assert!(!TransferPhase::Ready.can_transition_to(TransferPhase::Consulting));
    }

    #[test]
    fn test_active_and_inactive_legs() {
        let mut transfer = attempt(TransferKind::Attended);
        assert_eq!(transfer.active_leg(), &LegId::from("sim-1"));
        assert!(transfer.inactive_leg().is_none());

        transfer.set_consult_leg(LegId::from("sim-2"));
        assert_eq!(transfer.active_leg(), &LegId::from("sim-2"));
        assert_eq!(transfer.inactive_leg(), Some(&LegId::from("sim-1")));

        transfer.set_active_side(transfer.active_side().other());
        assert_eq!(transfer.active_leg(), &LegId::from("sim-1"));
        assert_eq!(transfer.legs().len(), 2);
    }

    #[test]
    fn test_failures_kept_after_recovery() {
        let mut transfer = attempt(TransferKind::Unattended);
        transfer.record_failures(&[BindingFailure::new(
            CapabilityBinding::EndpointTransfer,
            "481 Call Does Not Exist".to_string(),
        )]);

        let view = transfer.view();
        assert_eq!(view.failures.len(), 1);
        assert!(!view.retry_possible());
        assert!(view.last_error.unwrap().contains("endpoint_transfer"));
    }

    #[test]
    fn test_ensure_phase() {
        let transfer = attempt(TransferKind::Attended);
        assert!(transfer
            .ensure_phase("cancel", &[TransferPhase::Consulting])
            .is_err());
        assert!(transfer.ensure_phase("begin", &[TransferPhase::Idle]).is_ok());
    }
}
