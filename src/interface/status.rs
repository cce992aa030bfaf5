//! UI status channel
//!
//! Two views of the same engine: a continuously replaced snapshot
//! (`watch`) for reactive display, and a stream of notices (`broadcast`) for
//! things the user should be told about once.

use crate::domain::conference::ConferenceView;
use crate::domain::leg::{CallLeg, LegDirection, LegState};
use crate::domain::shared::events::EventMetadata;
use crate::domain::shared::value_objects::{ConferenceId, LegId, TransferId};
use crate::domain::transfer::{TransferKind, TransferPhase, TransferView};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Display fields of a leg; the UI never mutates legs through this
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegSummary {
    pub id: LegId,
    pub remote_address: String,
    pub state: LegState,
    pub direction: LegDirection,
}

impl From<&CallLeg> for LegSummary {
    fn from(leg: &CallLeg) -> Self {
        Self {
            id: leg.id().clone(),
            remote_address: leg.remote_address().to_string(),
            state: leg.state(),
            direction: leg.direction(),
        }
    }
}

/// Snapshot of everything the UI displays
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub legs: Vec<LegSummary>,
    pub transfers: Vec<TransferView>,
    pub conferences: Vec<ConferenceView>,
    pub updated_at: DateTime<Utc>,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            legs: Vec::new(),
            transfers: Vec::new(),
            conferences: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

impl EngineStatus {
    pub fn transfer(&self, id: TransferId) -> Option<&TransferView> {
        self.transfers.iter().find(|t| t.id == id)
    }

    pub fn conference(&self, id: ConferenceId) -> Option<&ConferenceView> {
        self.conferences.iter().find(|c| c.id == id)
    }
}

/// One-shot notices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineNotice {
    IncomingCall {
        leg_id: LegId,
        remote_address: String,
    },
    TransferStarted {
        transfer_id: TransferId,
        kind: TransferKind,
        target: String,
    },
    TransferProgress {
        transfer_id: TransferId,
        phase: TransferPhase,
    },
    TransferCompleted {
        transfer_id: TransferId,
    },
    TransferCancelled {
        transfer_id: TransferId,
    },
    /// The user still has a usable leg and may retry with a fresh attempt
    TransferFailed {
        transfer_id: TransferId,
        error: String,
        retry_possible: bool,
    },
    ParticipantJoined {
        conference_id: ConferenceId,
        leg_id: LegId,
        address: String,
    },
    ParticipantJoinFailed {
        conference_id: ConferenceId,
        address: String,
        error: String,
    },
    ParticipantLeft {
        conference_id: ConferenceId,
        leg_id: LegId,
    },
    /// Hung up by the engine because it could no longer be mixed
    ParticipantDropped {
        conference_id: ConferenceId,
        leg_id: LegId,
        reason: String,
    },
    /// Secondary teardown failed; the primary outcome stands
    PartialCleanupFailure {
        leg_id: LegId,
        reason: String,
    },
    ConferenceTerminated {
        conference_id: ConferenceId,
        automatic: bool,
    },
}

impl EngineNotice {
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineNotice::IncomingCall { .. } => "leg.incoming",
            EngineNotice::TransferStarted { .. } => "transfer.started",
            EngineNotice::TransferProgress { .. } => "transfer.progress",
            EngineNotice::TransferCompleted { .. } => "transfer.completed",
            EngineNotice::TransferCancelled { .. } => "transfer.cancelled",
            EngineNotice::TransferFailed { .. } => "transfer.failed",
            EngineNotice::ParticipantJoined { .. } => "conference.participant_joined",
            EngineNotice::ParticipantJoinFailed { .. } => "conference.participant_join_failed",
            EngineNotice::ParticipantLeft { .. } => "conference.participant_left",
            EngineNotice::ParticipantDropped { .. } => "conference.participant_dropped",
            EngineNotice::PartialCleanupFailure { .. } => "cleanup.partial_failure",
            EngineNotice::ConferenceTerminated { .. } => "conference.terminated",
        }
    }
}

/// Notice plus event metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoticeEnvelope {
    pub metadata: EventMetadata,
    pub notice: EngineNotice,
}

/// Publishes engine status to any number of UI observers
pub struct StatusBroadcaster {
    status_tx: watch::Sender<EngineStatus>,
    notice_tx: broadcast::Sender<NoticeEnvelope>,
    sequence: AtomicU64,
}

impl StatusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (status_tx, _) = watch::channel(EngineStatus::default());
        let (notice_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            status_tx,
            notice_tx,
            sequence: AtomicU64::new(0),
        }
    }

    /// Receiver that always holds the latest snapshot
    pub fn watch(&self) -> watch::Receiver<EngineStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NoticeEnvelope> {
        self.notice_tx.subscribe()
    }

    pub fn snapshot(&self) -> EngineStatus {
        self.status_tx.borrow().clone()
    }

    pub fn notify(&self, notice: EngineNotice) {
        let envelope = NoticeEnvelope {
            metadata: EventMetadata::new(
                notice.event_type(),
                self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            ),
            notice,
        };
        // No receivers is normal when no UI is attached
        if self.notice_tx.send(envelope).is_err() {
            debug!("No notice subscribers");
        }
    }

    pub fn publish_transfer(&self, view: TransferView) {
        self.status_tx.send_modify(|status| {
            match status.transfers.iter_mut().find(|t| t.id == view.id) {
                Some(existing) => *existing = view,
                None => status.transfers.push(view),
            }
            status.updated_at = Utc::now();
        });
    }

    pub fn remove_transfers(&self, ids: &[TransferId]) {
        self.status_tx.send_modify(|status| {
            status.transfers.retain(|t| !ids.contains(&t.id));
            status.updated_at = Utc::now();
        });
    }

    pub fn publish_conference(&self, view: ConferenceView) {
        self.status_tx.send_modify(|status| {
            match status.conferences.iter_mut().find(|c| c.id == view.id) {
                Some(existing) => *existing = view,
                None => status.conferences.push(view),
            }
            status.updated_at = Utc::now();
        });
    }

    pub fn remove_conference(&self, id: ConferenceId) {
        self.status_tx.send_modify(|status| {
            status.conferences.retain(|c| c.id != id);
            status.updated_at = Utc::now();
        });
    }

    pub fn publish_legs(&self, legs: Vec<LegSummary>) {
        self.status_tx.send_modify(|status| {
            status.legs = legs;
            status.updated_at = Utc::now();
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.notice_tx.receiver_count()
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::shared::value_objects::SipUri;
    use crate::domain::transfer::TransferAttempt;

    #[tokio::test]
    async fn test_snapshot_replaces_transfer_view() {
        let broadcaster = StatusBroadcaster::default();
        let mut rx = broadcaster.watch();

        let mut attempt = TransferAttempt::new(
            TransferKind::Unattended,
            LegId::from("sim-1"),
            SipUri::parse("sip:1004@pbx.local").unwrap(),
        );
        broadcaster.publish_transfer(attempt.view());
        attempt.transition_to(TransferPhase::Completing).unwrap();
        broadcaster.publish_transfer(attempt.view());

        rx.changed().await.unwrap();
        let status = rx.borrow_and_update().clone();
        assert_eq!(status.transfers.len(), 1);
        assert_eq!(
            status.transfer(attempt.id()).unwrap().phase,
            TransferPhase::Completing
        );

        broadcaster.remove_transfers(&[attempt.id()]);
        assert!(broadcaster.snapshot().transfers.is_empty());
    }

    #[tokio::test]
    async fn test_notices_carry_metadata() {
        let broadcaster = StatusBroadcaster::default();
        let mut rx = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);

        let transfer_id = TransferId::new();
        broadcaster.notify(EngineNotice::TransferFailed {
            transfer_id,
            error: "no binding".to_string(),
            retry_possible: true,
        });

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.metadata.event_type, "transfer.failed");
        assert_eq!(envelope.metadata.sequence, 1);
        assert!(matches!(
            envelope.notice,
            EngineNotice::TransferFailed {
                retry_possible: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_notify_without_subscribers_still_counts() {
        let broadcaster = StatusBroadcaster::default();
        broadcaster.notify(EngineNotice::TransferCompleted {
            transfer_id: TransferId::new(),
        });

        let mut rx = broadcaster.subscribe();
        broadcaster.notify(EngineNotice::TransferCancelled {
            transfer_id: TransferId::new(),
        });
        assert_eq!(rx.recv().await.unwrap().metadata.sequence, 2);
    }
}
