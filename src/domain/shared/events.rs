//! Event naming and envelope metadata
//!
//! Signaling events and engine notices both carry a dotted type name such as
//! `leg.connected`. Notices published to observers are wrapped with metadata
//! whose sequence number lets a subscriber spot notices it lagged past.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub trait DomainEvent: Send + Sync {
    /// Dotted name, `<context>.<what happened>`
    fn event_type(&self) -> &'static str;

    fn occurred_at(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: Uuid,
    /// Monotonic per publisher, starting at 1
    pub sequence: u64,
    pub occurred_at: DateTime<Utc>,
    pub event_type: String,
}

impl EventMetadata {
    pub fn new(event_type: impl Into<String>, sequence: u64) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            sequence,
            occurred_at: Utc::now(),
            event_type: event_type.into(),
        }
    }

    /// Notices missed between `self` and a later envelope
    pub fn gap_to(&self, next: &EventMetadata) -> u64 {
        next.sequence.saturating_sub(self.sequence + 1)
    }
}
