//! Conference bridge
//!
//! Owns every conference and the legs claimed for it. Roster changes are made
//! under the conference lock; backend calls and waits happen outside it so a
//! slow add never blocks a remove or a terminate.

use crate::application::leg_operations::LegOperations;
use crate::config::Config;
use crate::domain::conference::{
    BridgeMode, Conference, ConferenceParticipant, ConferencePhase, ConferenceView,
    ParticipantStatus,
};
use crate::domain::history::{ConferenceHistoryEntry, HistoryRecord};
use crate::domain::leg::{LegOutcome, LegOwner, LegState};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::value_objects::{ConferenceId, LegId, SipUri};
use crate::domain::shared::Result;
use crate::interface::metrics;
use crate::interface::status::EngineNotice;
use futures::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A participant add that has dialed but not yet joined the mix
struct PendingAdd {
    conference: ConferenceId,
    cancel: CancellationToken,
}

/// What happened to a conference built from another aggregate's legs
#[derive(Debug, Clone, PartialEq)]
pub enum OriginEvent {
    /// A participant left the roster
    LegLeft(LegId),
    /// The conference closed and released its legs
    Closed,
}

/// Addressed to the aggregate a conference was adopted from
#[derive(Debug, Clone)]
pub struct OriginNotice {
    pub origin: LegOwner,
    pub conference: ConferenceId,
    pub event: OriginEvent,
}

pub struct ConferenceBridge {
    legs: Arc<LegOperations>,
    origin_tx: mpsc::UnboundedSender<OriginNotice>,
    conferences: RwLock<HashMap<ConferenceId, Arc<Mutex<Conference>>>>,
    pending: Mutex<HashMap<LegId, PendingAdd>>,
    archive: Mutex<VecDeque<ConferenceView>>,
    archive_capacity: usize,
    conference_speaker: bool,
}

impl ConferenceBridge {
    pub fn new(
        legs: Arc<LegOperations>,
        origin_tx: mpsc::UnboundedSender<OriginNotice>,
        config: &Config,
    ) -> Self {
        Self {
            legs,
            origin_tx,
            conferences: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            archive: Mutex::new(VecDeque::new()),
            archive_capacity: config.history.archived_aggregates.max(1),
            conference_speaker: config.audio.conference_speaker,
        }
    }

    async fn handle(&self, id: ConferenceId) -> Result<Arc<Mutex<Conference>>> {
        self.conferences
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| DomainError::NotFound(format!("conference {}", id)))
    }

    /// Conference view, active or archived
    pub async fn get(&self, id: ConferenceId) -> Option<ConferenceView> {
        if let Ok(handle) = self.handle(id).await {
            return Some(handle.lock().await.view());
        }
        self.archive
            .lock()
            .await
            .iter()
            .rev()
            .find(|view| view.id == id)
            .cloned()
    }

    pub async fn active(&self) -> Vec<ConferenceView> {
        let handles: Vec<_> = self.conferences.read().await.values().cloned().collect();
        let mut views = Vec::with_capacity(handles.len());
        for handle in handles {
            views.push(handle.lock().await.view());
        }
        views.sort_by_key(|view| view.created_at);
        views
    }

    /// Conference currently orchestrating `leg`
    pub async fn conference_of(&self, leg: &LegId) -> Option<ConferenceId> {
        match self.legs.arena().owner(leg).await {
            Some(LegOwner::Conference(id)) => Some(id),
            _ => None,
        }
    }

    /// Drop archived conferences; returns how many were dropped
    pub async fn clear_finished(&self) -> usize {
        let finished: Vec<ConferenceView> = self.archive.lock().await.drain(..).collect();
        for view in &finished {
            self.legs.status().remove_conference(view.id);
        }
        finished.len()
    }

    /// Ask for a native conference, falling back to anchoring on the seed
    async fn open(&self, seed: &LegId) -> Result<BridgeMode> {
        match self.legs.create_conference(seed).await {
            Ok(_) => Ok(BridgeMode::Native),
            Err(DomainError::CapabilityExhausted { failures, .. }) => {
                info!(
                    "No conference primitive available ({} attempts failed), anchoring on leg {}",
                    failures.len(),
                    seed
                );
                Ok(BridgeMode::SeedAnchored)
            }
            Err(e) => Err(e),
        }
    }

    async fn install(&self, conference: Conference) -> ConferenceView {
        let id = conference.id();
        let view = conference.view();

        let count = {
            let mut conferences = self.conferences.write().await;
            conferences.insert(id, Arc::new(Mutex::new(conference)));
            conferences.len()
        };
        metrics::update_active_conferences(count);

        info!("Conference {} active ({:?}, anchor {})", id, view.mode, view.anchor);
        self.legs.status().publish_conference(view.clone());
        view
    }

    fn tell_origin(&self, origin: Option<LegOwner>, conference: ConferenceId, event: OriginEvent) {
        let Some(origin) = origin else {
            return;
        };
        debug!("Telling {} about conference {}: {:?}", origin, conference, event);
        let notice = OriginNotice {
            origin,
            conference,
            event,
        };
        if self.origin_tx.send(notice).is_err() {
            debug!("Origin router is gone");
        }
    }

    async fn publish(&self, id: ConferenceId) {
        if let Ok(handle) = self.handle(id).await {
            let view = handle.lock().await.view();
            self.legs.status().publish_conference(view);
        }
    }

    /// Create a conference seeded with an established leg
    pub async fn create(&self, seed: &LegId) -> Result<ConferenceView> {
        let leg = self
            .legs
            .arena()
            .get(seed)
            .await
            .filter(|leg| leg.state().is_established())
            .ok_or_else(|| {
                DomainError::PreconditionViolation(format!(
                    "conference seed {} must be connected",
                    seed
                ))
            })?;

        let id = ConferenceId::new();
        let owner = LegOwner::Conference(id);
        self.legs.arena().claim(seed, owner).await?;

        let mode = match self.open(seed).await {
            Ok(mode) => mode,
            Err(e) => {
                self.legs.arena().release(seed, owner).await;
                return Err(e);
            }
        };

        let mut conference = Conference::new(id, seed.clone(), leg.remote_address(), mode);
        conference.activate()?;
        self.install(conference).await;
        self.sync_audio(id).await;

        self.get(id)
            .await
            .ok_or_else(|| DomainError::NotFound(format!("conference {}", id)))
    }

    /// Build a conference from legs another aggregate already holds
    ///
    /// Every leg is bridged against `seed`. On failure the claims go back to
    /// `from` and nothing is hung up.
    pub async fn adopt(&self, seed: &LegId, others: &[LegId], from: LegOwner) -> Result<ConferenceId> {
        let id = ConferenceId::new();
        let owner = LegOwner::Conference(id);
        let all: Vec<LegId> = std::iter::once(seed.clone()).chain(others.iter().cloned()).collect();

        let mut addresses = HashMap::new();
        for leg_id in &all {
            let leg = self
                .legs
                .arena()
                .get(leg_id)
                .await
                .filter(|leg| leg.state().is_established())
                .ok_or_else(|| DomainError::LegDisconnected(leg_id.clone()))?;
            addresses.insert(leg_id.clone(), leg.remote_address().to_string());
        }

        let mut moved: Vec<&LegId> = Vec::new();
        for leg in &all {
            if let Err(e) = self.legs.arena().handover(leg, from, owner).await {
                self.hand_back(&moved, owner, from).await;
                return Err(e);
            }
            moved.push(leg);
        }

        let mixed = async {
            let mode = self.open(seed).await?;
            for other in others {
                self.legs.bridge(seed, other).await?;
            }
            Ok::<_, DomainError>(mode)
        }
        .await;

        let mode = match mixed {
            Ok(mode) => mode,
            Err(e) => {
                warn!("Could not mix legs into a conference: {}", e);
                self.hand_back(&moved, owner, from).await;
                return Err(e);
            }
        };

        let seed_address = addresses.remove(seed).unwrap_or_default();
        let mut conference = Conference::new(id, seed.clone(), seed_address, mode);
        conference.set_origin(from);
        for other in others {
            let address = addresses.remove(other).unwrap_or_default();
            conference.add_connected(other.clone(), address)?;
        }
        conference.activate()?;

        self.install(conference).await;
        self.sync_audio(id).await;
        Ok(id)
    }

    async fn hand_back(&self, legs: &[&LegId], owner: LegOwner, to: LegOwner) {
        for leg in legs {
            if let Err(e) = self.legs.arena().handover(leg, owner, to).await {
                debug!("Leg {} not handed back to {}: {}", leg, to, e);
            }
        }
    }

    /// Dial `target` and mix it in once it answers
    ///
    /// On any failure after the dial the new leg is released and taken off
    /// the roster; a leg that answered is never left connected but unmixed.
    pub async fn add_participant(&self, id: ConferenceId, target: &SipUri) -> Result<LegId> {
        let handle = self.handle(id).await?;
        let address = target.to_string();

        let leg = match self.legs.dial(target).await {
            Ok(applied) => applied.value,
            Err(e) => {
                self.legs.status().notify(EngineNotice::ParticipantJoinFailed {
                    conference_id: id,
                    address,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        self.pending.lock().await.insert(
            leg.clone(),
            PendingAdd {
                conference: id,
                cancel: cancel.clone(),
            },
        );

        let registered = async {
            self.legs.arena().claim(&leg, LegOwner::Conference(id)).await?;
            handle.lock().await.add_calling(leg.clone(), address.clone())
        }
        .await;

        let joined = match registered {
            Ok(()) => {
                info!("Calling {} into conference {} on leg {}", address, id, leg);
                self.publish(id).await;
                self.join(id, &leg, &cancel).await
            }
            Err(e) => Err(e),
        };
        self.pending.lock().await.remove(&leg);

        match joined {
            Ok(()) => {
                info!("Leg {} joined conference {}", leg, id);
                self.legs.status().notify(EngineNotice::ParticipantJoined {
                    conference_id: id,
                    leg_id: leg.clone(),
                    address,
                });
                self.sync_audio(id).await;
                Ok(leg)
            }
            Err(e) => {
                let outcome = match e {
                    DomainError::Cancelled => Some(LegOutcome::Cancelled),
                    DomainError::TimeoutWaitingForState { .. } => None,
                    _ => Some(LegOutcome::Failed),
                };
                self.abandon_join(id, &leg, &address, &e, outcome).await;
                Err(e)
            }
        }
    }

    async fn join(&self, id: ConferenceId, leg: &LegId, cancel: &CancellationToken) -> Result<()> {
        self.legs
            .wait_for_state(leg, LegState::Connected, self.legs.timeouts().connect(), cancel)
            .await?;
        if cancel.is_cancelled() {
            return Err(DomainError::Cancelled);
        }

        let anchor = self.handle(id).await?.lock().await.anchor().clone();
        self.legs.bridge(&anchor, leg).await?;

        // The conference may have closed while the bridge was in flight
        self.handle(id).await?.lock().await.mark_connected(leg)?;
        self.publish(id).await;
        Ok(())
    }

    async fn abandon_join(
        &self,
        id: ConferenceId,
        leg: &LegId,
        address: &str,
        error: &DomainError,
        outcome: Option<LegOutcome>,
    ) {
        warn!("Adding {} to conference {} failed: {}", address, id, error);

        if let Err(e) = self.legs.hangup(leg, outcome).await {
            self.report_cleanup_failure(leg, &e);
        }
        self.legs.arena().release(leg, LegOwner::Conference(id)).await;
        self.drop_participant(id, leg).await;

        self.legs.status().notify(EngineNotice::ParticipantJoinFailed {
            conference_id: id,
            address: address.to_string(),
            error: error.to_string(),
        });
    }

    /// Abort an add that has not joined yet
    pub async fn cancel_participant(&self, id: ConferenceId, leg: &LegId) -> Result<()> {
        let pending = self.pending.lock().await;
        match pending.get(leg) {
            Some(add) if add.conference == id => {
                info!("Cancelling add of leg {} to conference {}", leg, id);
                add.cancel.cancel();
                Ok(())
            }
            _ => Err(DomainError::NotFound(format!(
                "pending participant {} in conference {}",
                leg, id
            ))),
        }
    }

    /// Take a participant out: best-effort unbridge, then hangup
    ///
    /// The roster drops the participant whatever the backend says; cleanup
    /// failures are reported as notices.
    pub async fn remove_participant(&self, id: ConferenceId, leg: &LegId) -> Result<ConferenceView> {
        let handle = self.handle(id).await?;
        let status = handle
            .lock()
            .await
            .participant(leg)
            .map(|p| p.status)
            .ok_or_else(|| DomainError::NotFound(format!("participant {} in conference {}", leg, id)))?;

        let outcome = match status {
            ParticipantStatus::Calling => {
                if let Some(add) = self.pending.lock().await.get(leg) {
                    add.cancel.cancel();
                }
                LegOutcome::Cancelled
            }
            _ => {
                match self.legs.unbridge(leg).await {
                    Err(e) if !e.binding_failures().is_empty() => self.report_cleanup_failure(leg, &e),
                    Err(e) => debug!("No unbridge before removing {}: {}", leg, e),
                    Ok(_) => {}
                }
                LegOutcome::Completed
            }
        };

        if let Err(e) = self.legs.hangup(leg, Some(outcome)).await {
            self.report_cleanup_failure(leg, &e);
        }
        self.legs.arena().release(leg, LegOwner::Conference(id)).await;

        info!("Removed leg {} from conference {}", leg, id);
        self.legs.status().notify(EngineNotice::ParticipantLeft {
            conference_id: id,
            leg_id: leg.clone(),
        });
        self.drop_participant(id, leg).await;

        self.get(id)
            .await
            .ok_or_else(|| DomainError::NotFound(format!("conference {}", id)))
    }

    /// Roster removal plus the reactions to it
    async fn drop_participant(&self, id: ConferenceId, leg: &LegId) -> Option<ConferenceParticipant> {
        let (removed, reanchor) = self.take_off_roster(id, leg).await?;

        if let Some(anchor) = reanchor {
            for (other, error) in self.reanchor(id, &anchor).await {
                if self.take_off_roster(id, &other).await.is_some() {
                    self.release_unmixed(id, &other, &error).await;
                }
            }
        }
        self.sync_audio(id).await;
        Some(removed)
    }

    /// Remove one participant; closes the conference once nobody is left
    ///
    /// Returns the new anchor when a seed-anchored mix lost its anchor.
    async fn take_off_roster(
        &self,
        id: ConferenceId,
        leg: &LegId,
    ) -> Option<(ConferenceParticipant, Option<LegId>)> {
        let handle = self.handle(id).await.ok()?;

        let (removed, live, reanchor, view, origin) = {
            let mut conference = handle.lock().await;
            if conference.phase() == ConferencePhase::Terminated {
                return None;
            }
            let old_anchor = conference.anchor().clone();
            let removed = conference.remove(leg)?;
            let reanchor = (conference.anchor() != &old_anchor
                && conference.mode() == BridgeMode::SeedAnchored)
                .then(|| conference.anchor().clone());
            (
                removed,
                conference.live_count(),
                reanchor,
                conference.view(),
                conference.origin(),
            )
        };
        self.legs.status().publish_conference(view);
        self.tell_origin(origin, id, OriginEvent::LegLeft(leg.clone()));

        if live == 0 {
            info!("Conference {} has no participants left", id);
            if let Err(e) = self.close(id, true, None).await {
                debug!("Conference {} already closed: {}", id, e);
            }
            return Some((removed, None));
        }
        Some((removed, reanchor))
    }

    /// Re-mix everyone against a new anchor after the old one left
    ///
    /// Returns the legs that could not be re-mixed, with the bridge error.
    async fn reanchor(&self, id: ConferenceId, anchor: &LegId) -> Vec<(LegId, DomainError)> {
        let others: Vec<LegId> = match self.handle(id).await {
            Ok(handle) => handle
                .lock()
                .await
                .connected_legs()
                .into_iter()
                .filter(|leg| leg != anchor)
                .collect(),
            Err(_) => return Vec::new(),
        };

        info!("Conference {} re-anchored on leg {}", id, anchor);
        let mut unmixed = Vec::new();
        for other in others {
            if let Err(e) = self.legs.bridge(anchor, &other).await {
                warn!("Could not re-mix leg {} against {}: {}", other, anchor, e);
                unmixed.push((other, e));
            }
        }
        unmixed
    }

    /// A connected leg that lost the mix is hung up rather than left silent
    async fn release_unmixed(&self, id: ConferenceId, leg: &LegId, error: &DomainError) {
        if let Err(e) = self.legs.hangup(leg, Some(LegOutcome::Failed)).await {
            self.report_cleanup_failure(leg, &e);
        }
        self.legs.arena().release(leg, LegOwner::Conference(id)).await;
        self.legs.status().notify(EngineNotice::ParticipantDropped {
            conference_id: id,
            leg_id: leg.clone(),
            reason: error.to_string(),
        });
    }

    /// Hang up every remaining participant and close the conference
    pub async fn terminate(&self, id: ConferenceId) -> Result<ConferenceView> {
        self.close(id, false, None).await
    }

    /// Close the conference without hanging up `keep`, whose claims move to `to`
    ///
    /// Any other participant is hung up.
    pub async fn dissolve(&self, id: ConferenceId, keep: &[LegId], to: LegOwner) -> Result<ConferenceView> {
        self.close(id, false, Some((keep, to))).await
    }

    async fn close(
        &self,
        id: ConferenceId,
        automatic: bool,
        handover: Option<(&[LegId], LegOwner)>,
    ) -> Result<ConferenceView> {
        let handle = self.handle(id).await?;
        let (legs, snapshot) = {
            let mut conference = handle.lock().await;
            let legs = conference.terminate()?;
            (legs, conference.clone())
        };

        let remaining = {
            let mut conferences = self.conferences.write().await;
            conferences.remove(&id);
            conferences.len()
        };
        metrics::update_active_conferences(remaining);

        self.pending.lock().await.retain(|_, add| {
            if add.conference == id {
                add.cancel.cancel();
                false
            } else {
                true
            }
        });

        let owner = LegOwner::Conference(id);
        let (kept, released): (Vec<LegId>, Vec<LegId>) = match handover {
            Some((keep, _)) => legs.into_iter().partition(|leg| keep.contains(leg)),
            None => (Vec::new(), legs),
        };

        if let Some((_, to)) = handover {
            for leg in &kept {
                if let Err(e) = self.legs.arena().handover(leg, owner, to).await {
                    warn!("Leg {} could not be handed to {}: {}", leg, to, e);
                }
            }
        }

        // Each teardown is isolated from the others
        let results = join_all(released.iter().map(|leg| self.legs.hangup(leg, None))).await;
        for (leg, result) in released.iter().zip(results) {
            if let Err(e) = result {
                self.report_cleanup_failure(leg, &e);
            }
            self.legs.arena().release(leg, owner).await;
        }

        let view = snapshot.view();
        info!(
            "Conference {} terminated ({} legs released, {} handed over)",
            id,
            released.len(),
            kept.len()
        );

        self.legs
            .history()
            .dispatch(HistoryRecord::Conference(ConferenceHistoryEntry::from_conference(&snapshot)));
        self.archive_view(view.clone()).await;
        self.legs.status().publish_conference(view.clone());
        self.legs.status().notify(EngineNotice::ConferenceTerminated {
            conference_id: id,
            automatic,
        });
        if handover.is_none() {
            self.tell_origin(snapshot.origin(), id, OriginEvent::Closed);
        }

        if handover.is_none() && self.legs.arena().live_count().await == 0 {
            self.legs.audio().reset().await;
        }

        Ok(view)
    }

    async fn archive_view(&self, view: ConferenceView) {
        let mut archive = self.archive.lock().await;
        archive.push_back(view);
        while archive.len() > self.archive_capacity {
            if let Some(evicted) = archive.pop_front() {
                self.legs.status().remove_conference(evicted.id);
            }
        }
    }

    /// A participant leg disconnected on its own
    pub async fn on_leg_disconnected(&self, id: ConferenceId, leg: &LegId) {
        let status = match self.handle(id).await {
            Ok(handle) => handle.lock().await.participant(leg).map(|p| p.status),
            Err(_) => return,
        };

        let adding = self.pending.lock().await.contains_key(leg);

        match status {
            // The pending add observes this and cleans up itself
            Some(ParticipantStatus::Calling) if adding => {}
            Some(_) => {
                info!("Leg {} left conference {}", leg, id);
                self.legs.status().notify(EngineNotice::ParticipantLeft {
                    conference_id: id,
                    leg_id: leg.clone(),
                });
                self.drop_participant(id, leg).await;
            }
            None => {}
        }
    }

    /// A participant leg went on hold; undo it
    pub async fn on_leg_held(&self, id: ConferenceId, leg: &LegId) {
        debug!("Participant {} of conference {} went on hold", leg, id);
        self.sync_audio(id).await;
    }

    /// Re-assert the conference audio route and unhold held participants
    pub async fn sync_audio(&self, id: ConferenceId) {
        let legs = match self.handle(id).await {
            Ok(handle) => {
                let conference = handle.lock().await;
                if conference.phase() == ConferencePhase::Terminated {
                    return;
                }
                conference.connected_legs()
            }
            Err(_) => return,
        };

        self.legs.audio().set_speaker(self.conference_speaker).await;

        for leg in legs {
            if self.legs.arena().state(&leg).await != Some(LegState::OnHold) {
                continue;
            }
            match self.legs.unhold(&leg).await {
                Ok(_) => info!("Took participant {} of conference {} off hold", leg, id),
                Err(e) => warn!("Participant {} of conference {} is still held: {}", leg, id, e),
            }
        }
    }

    fn report_cleanup_failure(&self, leg: &LegId, error: &DomainError) {
        warn!(
            "{}",
            DomainError::PartialCleanupFailure {
                leg: leg.clone(),
                reason: error.to_string(),
            }
        );
        metrics::record_cleanup_failure();
        self.legs.status().notify(EngineNotice::PartialCleanupFailure {
            leg_id: leg.clone(),
            reason: error.to_string(),
        });
    }
}
