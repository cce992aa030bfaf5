//! Call history records and the sink port they are emitted to
//!
//! A record is emitted for every leg that reaches DISCONNECTED and for every
//! transfer attempt or conference that reaches a terminal phase.

use crate::domain::conference::{Conference, ConferencePhase};
use crate::domain::leg::{CallLeg, LegDirection, LegOutcome};
use crate::domain::shared::value_objects::{ConferenceId, LegId, TransferId};
use crate::domain::transfer::{TransferAttempt, TransferKind, TransferPhase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal notification for one leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegHistoryEntry {
    pub leg_id: LegId,
    pub remote_address: String,
    pub direction: LegDirection,
    pub outcome: LegOutcome,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl LegHistoryEntry {
    pub fn from_leg(leg: &CallLeg) -> Self {
        Self {
            leg_id: leg.id().clone(),
            remote_address: leg.remote_address().to_string(),
            direction: leg.direction(),
            outcome: leg.final_outcome(),
            started_at: leg.created_at(),
            ended_at: leg.ended_at().unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferHistoryEntry {
    pub transfer_id: TransferId,
    pub kind: TransferKind,
    pub original_leg: LegId,
    pub consult_leg: Option<LegId>,
    pub target: String,
    pub phase: TransferPhase,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl TransferHistoryEntry {
    pub fn from_attempt(attempt: &TransferAttempt) -> Self {
        Self {
            transfer_id: attempt.id(),
            kind: attempt.kind(),
            original_leg: attempt.original_leg().clone(),
            consult_leg: attempt.consult_leg().cloned(),
            target: attempt.target().to_string(),
            phase: attempt.phase(),
            last_error: attempt.last_error().map(str::to_string),
            started_at: attempt.started_at(),
            ended_at: attempt.ended_at().unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConferenceHistoryEntry {
    pub conference_id: ConferenceId,
    pub phase: ConferencePhase,
    /// Every address that was on the roster when the conference ended
    pub participants: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl ConferenceHistoryEntry {
    pub fn from_conference(conference: &Conference) -> Self {
        Self {
            conference_id: conference.id(),
            phase: conference.phase(),
            participants: conference
                .participants()
                .iter()
                .map(|p| p.address.clone())
                .collect(),
            started_at: conference.created_at(),
            ended_at: conference.ended_at().unwrap_or_else(Utc::now),
        }
    }
}

/// Terminal notification sent to the sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryRecord {
    Leg(LegHistoryEntry),
    Transfer(TransferHistoryEntry),
    Conference(ConferenceHistoryEntry),
}

impl HistoryRecord {
    pub fn record_type(&self) -> &'static str {
        match self {
            HistoryRecord::Leg(_) => "leg",
            HistoryRecord::Transfer(_) => "transfer",
            HistoryRecord::Conference(_) => "conference",
        }
    }
}

/// Call history sink
///
/// Implementations persist records wherever the application keeps history.
/// Failures are reported back but never affect call control.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait CallHistorySink: Send + Sync {
    async fn record(&self, record: HistoryRecord) -> Result<(), String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::leg::LegState;

    #[test]
    fn test_leg_entry_from_retired_leg() {
        let mut leg = CallLeg::outbound(LegId::from("sim-1"), "sip:1002@pbx.local");
        leg.transition_to(LegState::Connected).unwrap();
        leg.set_outcome(LegOutcome::Transferred);
        leg.transition_to(LegState::Disconnected).unwrap();

        let entry = LegHistoryEntry::from_leg(&leg);
        assert_eq!(entry.outcome, LegOutcome::Transferred);
        assert_eq!(entry.direction, LegDirection::Outbound);
        assert_eq!(Some(entry.ended_at), leg.ended_at());
    }

    #[test]
    fn test_record_serializes_with_type_tag() {
        let mut leg = CallLeg::inbound(LegId::from("in-1"), "sip:5000@pbx.local");
        leg.transition_to(LegState::Disconnected).unwrap();

        let record = HistoryRecord::Leg(LegHistoryEntry::from_leg(&leg));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "leg");
        assert_eq!(json["outcome"], "unanswered");
        assert_eq!(json["direction"], "inbound");
    }
}
