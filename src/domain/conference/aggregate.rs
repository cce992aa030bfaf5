//! Conference aggregate

use crate::domain::leg::LegOwner;
use crate::domain::shared::error::DomainError;
use crate::domain::shared::value_objects::{ConferenceId, LegId};
use crate::domain::shared::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Conference phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConferencePhase {
    Forming,
    Active,
    Terminated,
}

impl ConferencePhase {
    pub fn can_transition_to(&self, next: ConferencePhase) -> bool {
        matches!(
            (self, next),
            (ConferencePhase::Forming, ConferencePhase::Active)
                | (ConferencePhase::Forming, ConferencePhase::Terminated)
                | (ConferencePhase::Active, ConferencePhase::Terminated)
        )
    }
}

impl fmt::Display for ConferencePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConferencePhase::Forming => "forming",
            ConferencePhase::Active => "active",
            ConferencePhase::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Participant status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    /// Dialed, not yet mixed
    Calling,
    Connected,
    Disconnected,
}

/// How the mix is anchored on the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeMode {
    /// Backend created an explicit conference object
    Native,
    /// No conference primitive; the anchor leg is the reference point
    SeedAnchored,
}

/// Conference participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConferenceParticipant {
    pub leg_id: LegId,
    pub address: String,
    pub status: ParticipantStatus,
    pub joined_at: DateTime<Utc>,
}

impl ConferenceParticipant {
    fn new(leg_id: LegId, address: String, status: ParticipantStatus) -> Self {
        Self {
            leg_id,
            address,
            status,
            joined_at: Utc::now(),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(
            self.status,
            ParticipantStatus::Calling | ParticipantStatus::Connected
        )
    }
}

/// N-party mix
#[derive(Debug, Clone)]
pub struct Conference {
    id: ConferenceId,
    phase: ConferencePhase,
    mode: BridgeMode,
    /// Leg new participants are bridged against
    anchor: LegId,
    /// Insertion order is display order
    participants: Vec<ConferenceParticipant>,
    /// Aggregate the legs were adopted from, told about departures and closure
    origin: Option<LegOwner>,
    created_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl Conference {
    /// New conference seeded with one connected leg
    pub fn new(id: ConferenceId, seed: LegId, address: impl Into<String>, mode: BridgeMode) -> Self {
        let participant =
            ConferenceParticipant::new(seed.clone(), address.into(), ParticipantStatus::Connected);

        Self {
            id,
            phase: ConferencePhase::Forming,
            mode,
            anchor: seed,
            participants: vec![participant],
            origin: None,
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn set_origin(&mut self, origin: LegOwner) {
        self.origin = Some(origin);
    }

    pub fn activate(&mut self) -> Result<()> {
        self.transition_to(ConferencePhase::Active)
    }

    fn transition_to(&mut self, next: ConferencePhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(DomainError::InvalidStateTransition(format!(
                "conference {} cannot go from {} to {}",
                self.id, self.phase, next
            )));
        }

        self.phase = next;
        if next == ConferencePhase::Terminated {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.phase == ConferencePhase::Terminated {
            return Err(DomainError::InvalidStateTransition(format!(
                "conference {} is terminated",
                self.id
            )));
        }
        Ok(())
    }

    /// Register a dialed leg at CALLING
    pub fn add_calling(&mut self, leg_id: LegId, address: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        if self.contains(&leg_id) {
            return Err(DomainError::AlreadyExists(format!(
                "leg {} in conference {}",
                leg_id, self.id
            )));
        }

        self.participants.push(ConferenceParticipant::new(
            leg_id,
            address.into(),
            ParticipantStatus::Calling,
        ));
        Ok(())
    }

    /// Add a leg that is already connected and mixed
    pub fn add_connected(&mut self, leg_id: LegId, address: impl Into<String>) -> Result<()> {
        self.add_calling(leg_id.clone(), address)?;
        self.mark_connected(&leg_id)
    }

    pub fn mark_connected(&mut self, leg_id: &LegId) -> Result<()> {
        self.ensure_open()?;
        let participant = self
            .participants
            .iter_mut()
            .find(|p| &p.leg_id == leg_id)
            .ok_or_else(|| DomainError::NotFound(format!("participant {}", leg_id)))?;

        participant.status = ParticipantStatus::Connected;
        Ok(())
    }

    /// Take a participant off the roster
    ///
    /// When the anchor leaves, the oldest remaining connected participant
    /// becomes the anchor.
    pub fn remove(&mut self, leg_id: &LegId) -> Option<ConferenceParticipant> {
        let index = self.participants.iter().position(|p| &p.leg_id == leg_id)?;
        let mut removed = self.participants.remove(index);
        removed.status = ParticipantStatus::Disconnected;

        if &self.anchor == leg_id {
            if let Some(next) = self
                .participants
                .iter()
                .find(|p| p.status == ParticipantStatus::Connected)
            {
                self.anchor = next.leg_id.clone();
            }
        }

        Some(removed)
    }

    /// Number of CALLING + CONNECTED participants
    pub fn live_count(&self) -> usize {
        self.participants.iter().filter(|p| p.is_live()).count()
    }

    /// Mark every participant disconnected and close the conference
    pub fn terminate(&mut self) -> Result<Vec<LegId>> {
        self.transition_to(ConferencePhase::Terminated)?;

        let mut legs = Vec::with_capacity(self.participants.len());
        for participant in self.participants.iter_mut() {
            if participant.is_live() {
                legs.push(participant.leg_id.clone());
            }
            participant.status = ParticipantStatus::Disconnected;
        }
        Ok(legs)
    }

    pub fn contains(&self, leg_id: &LegId) -> bool {
        self.participants.iter().any(|p| &p.leg_id == leg_id)
    }

    pub fn participant(&self, leg_id: &LegId) -> Option<&ConferenceParticipant> {
        self.participants.iter().find(|p| &p.leg_id == leg_id)
    }

    /// Legs currently connected to the mix
    pub fn connected_legs(&self) -> Vec<LegId> {
        self.participants
            .iter()
            .filter(|p| p.status == ParticipantStatus::Connected)
            .map(|p| p.leg_id.clone())
            .collect()
    }

    pub fn live_legs(&self) -> Vec<LegId> {
        self.participants
            .iter()
            .filter(|p| p.is_live())
            .map(|p| p.leg_id.clone())
            .collect()
    }

    // Getters
    pub fn id(&self) -> ConferenceId {
        self.id
    }

    pub fn phase(&self) -> ConferencePhase {
        self.phase
    }

    pub fn mode(&self) -> BridgeMode {
        self.mode
    }

    pub fn anchor(&self) -> &LegId {
        &self.anchor
    }

    pub fn origin(&self) -> Option<LegOwner> {
        self.origin
    }

    pub fn participants(&self) -> &[ConferenceParticipant] {
        &self.participants
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn view(&self) -> ConferenceView {
        ConferenceView {
            id: self.id,
            phase: self.phase,
            mode: self.mode,
            anchor: self.anchor.clone(),
            participants: self.participants.clone(),
            created_at: self.created_at,
            ended_at: self.ended_at,
        }
    }
}

/// Read-only roster projection for the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConferenceView {
    pub id: ConferenceId,
    pub phase: ConferencePhase,
    pub mode: BridgeMode,
    pub anchor: LegId,
    pub participants: Vec<ConferenceParticipant>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}
