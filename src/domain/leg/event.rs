//! Signaling events emitted by the backend, keyed by leg id

use crate::domain::shared::events::DomainEvent;
use crate::domain::shared::value_objects::LegId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to a leg
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalKind {
    /// A new inbound dialog was offered
    Incoming { remote: String },
    Ringing,
    Connected,
    /// Acknowledgement of a locally requested hold
    HoldAck,
    /// Acknowledgement of a locally requested unhold
    UnholdAck,
    /// The backend put the leg on hold on its own
    AutoHeld,
    Disconnected { reason: Option<String> },
}

/// Leg state notification from the signaling event stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingEvent {
    pub leg_id: LegId,
    pub kind: SignalKind,
    pub occurred_at: DateTime<Utc>,
}

impl SignalingEvent {
    pub fn new(leg_id: LegId, kind: SignalKind) -> Self {
        Self {
            leg_id,
            kind,
            occurred_at: Utc::now(),
        }
    }
}

impl DomainEvent for SignalingEvent {
    fn event_type(&self) -> &'static str {
        match self.kind {
            SignalKind::Incoming { .. } => "leg.incoming",
            SignalKind::Ringing => "leg.ringing",
            SignalKind::Connected => "leg.connected",
            SignalKind::HoldAck => "leg.hold_ack",
            SignalKind::UnholdAck => "leg.unhold_ack",
            SignalKind::AutoHeld => "leg.auto_held",
            SignalKind::Disconnected { .. } => "leg.disconnected",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        let event = SignalingEvent::new(LegId::from("sim-1"), SignalKind::AutoHeld);
        assert_eq!(event.event_type(), "leg.auto_held");
        assert_eq!(event.occurred_at(), event.occurred_at);

        let json = serde_json::to_value(&SignalKind::Disconnected { reason: None }).unwrap();
        assert_eq!(json["kind"], "disconnected");
    }
}
