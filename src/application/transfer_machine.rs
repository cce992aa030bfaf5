//! Transfer state machine
//!
//! One `TransferAttempt` per transfer intent. Operations on an attempt are
//! serialized by its operation lock; `cancel` fires the attempt's token first
//! so an in-flight wait gives the lock up promptly.
//!
//! Public calls return `Err` only when they changed nothing. Once an attempt
//! has started, operational failures land in the FAILED phase and the view
//! is returned.

use crate::application::conference_bridge::{ConferenceBridge, OriginEvent};
use crate::application::leg_operations::LegOperations;
use crate::config::Config;
use crate::domain::history::{HistoryRecord, TransferHistoryEntry};
use crate::domain::leg::{LegOutcome, LegOwner, LegState};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::value_objects::{ConferenceId, LegId, SipUri, TransferId};
use crate::domain::shared::Result;
use crate::domain::transfer::{ActiveSide, TransferAttempt, TransferKind, TransferPhase, TransferView};
use crate::interface::metrics;
use crate::interface::status::EngineNotice;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct AttemptHandle {
    attempt: Mutex<TransferAttempt>,
    /// Serializes operations on this attempt
    op: Mutex<()>,
    cancel: CancellationToken,
}

pub struct TransferStateMachine {
    legs: Arc<LegOperations>,
    conferences: Arc<ConferenceBridge>,
    attempts: RwLock<HashMap<TransferId, Arc<AttemptHandle>>>,
    /// Terminal attempts, oldest first
    finished: Mutex<VecDeque<TransferId>>,
    archive_capacity: usize,
    sip_domain: String,
}

impl TransferStateMachine {
    pub fn new(legs: Arc<LegOperations>, conferences: Arc<ConferenceBridge>, config: &Config) -> Self {
        Self {
            legs,
            conferences,
            attempts: RwLock::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            archive_capacity: config.history.archived_aggregates.max(1),
            sip_domain: config.sip.domain.clone(),
        }
    }

    async fn handle(&self, id: TransferId) -> Result<Arc<AttemptHandle>> {
        self.attempts
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| DomainError::NotFound(format!("transfer {}", id)))
    }

    pub async fn get(&self, id: TransferId) -> Option<TransferView> {
        let handle = self.handle(id).await.ok()?;
        let view = handle.attempt.lock().await.view();
        Some(view)
    }

    /// Attempts that have not reached a terminal phase
    pub async fn active(&self) -> Vec<TransferView> {
        let handles: Vec<_> = self.attempts.read().await.values().cloned().collect();
        let mut views = Vec::new();
        for handle in handles {
            let attempt = handle.attempt.lock().await;
            if !attempt.is_terminal() {
                views.push(attempt.view());
            }
        }
        views.sort_by_key(|view| view.started_at);
        views
    }

    /// Drop terminal attempts; returns how many were dropped
    pub async fn clear_finished(&self) -> usize {
        let ids: Vec<TransferId> = self.finished.lock().await.drain(..).collect();
        {
            let mut attempts = self.attempts.write().await;
            for id in &ids {
                attempts.remove(id);
            }
        }
        self.legs.status().remove_transfers(&ids);
        ids.len()
    }

    fn parse_target(&self, target: &str) -> Result<SipUri> {
        SipUri::from_dial_string(target, &self.sip_domain).map_err(|e| {
            DomainError::PreconditionViolation(format!("invalid transfer target {:?}: {}", target, e))
        })
    }

    async fn require_connected(&self, leg: &LegId) -> Result<()> {
        match self.legs.arena().state(leg).await {
            Some(LegState::Connected) => Ok(()),
            Some(state) => Err(DomainError::PreconditionViolation(format!(
                "transfer requires leg {} to be connected, it is {}",
                leg, state
            ))),
            None => Err(DomainError::NotFound(format!("leg {}", leg))),
        }
    }

    /// Validate, claim the original leg and register the attempt
    async fn start(&self, kind: TransferKind, original: &LegId, target: &str) -> Result<Arc<AttemptHandle>> {
        let target = self.parse_target(target)?;
        self.require_connected(original).await?;

        let attempt = TransferAttempt::new(kind, original.clone(), target);
        let id = attempt.id();
        self.legs
            .arena()
            .claim(original, LegOwner::Transfer(id))
            .await?;

        let view = attempt.view();
        let handle = Arc::new(AttemptHandle {
            attempt: Mutex::new(attempt),
            op: Mutex::new(()),
            cancel: CancellationToken::new(),
        });
        self.attempts.write().await.insert(id, handle.clone());

        info!("Transfer {} started: {:?} {} -> {}", id, kind, original, view.target);
        self.legs.status().publish_transfer(view.clone());
        self.legs.status().notify(EngineNotice::TransferStarted {
            transfer_id: id,
            kind,
            target: view.target,
        });
        Ok(handle)
    }

    async fn view(&self, handle: &AttemptHandle) -> TransferView {
        handle.attempt.lock().await.view()
    }

    async fn publish(&self, handle: &AttemptHandle) {
        let view = self.view(handle).await;
        self.legs.status().publish_transfer(view);
    }

    async fn set_phase(&self, handle: &AttemptHandle, phase: TransferPhase) -> Result<()> {
        let view = {
            let mut attempt = handle.attempt.lock().await;
            attempt.transition_to(phase)?;
            attempt.view()
        };
        info!("Transfer {} -> {}", view.id, phase);
        self.legs.status().publish_transfer(view.clone());

        if phase.is_terminal() {
            self.finish(handle, view).await;
        } else {
            self.legs.status().notify(EngineNotice::TransferProgress {
                transfer_id: view.id,
                phase,
            });
        }
        Ok(())
    }

    /// Bookkeeping once an attempt reaches a terminal phase
    async fn finish(&self, handle: &AttemptHandle, view: TransferView) {
        let (entry, legs) = {
            let attempt = handle.attempt.lock().await;
            (TransferHistoryEntry::from_attempt(&attempt), attempt.legs())
        };

        let owner = LegOwner::Transfer(view.id);
        let mut reachable = false;
        for leg in &legs {
            self.legs.arena().release(leg, owner).await;
            reachable |= self.legs.arena().is_live(leg).await;
        }

        self.legs.history().dispatch(HistoryRecord::Transfer(entry));
        metrics::record_transfer_finished(view.kind, view.phase);

        let notice = match view.phase {
            TransferPhase::Completed => EngineNotice::TransferCompleted {
                transfer_id: view.id,
            },
            TransferPhase::Cancelled => EngineNotice::TransferCancelled {
                transfer_id: view.id,
            },
            _ => EngineNotice::TransferFailed {
                transfer_id: view.id,
                error: view
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "transfer failed".to_string()),
                retry_possible: reachable,
            },
        };
        self.legs.status().notify(notice);

        if self.legs.arena().live_count().await == 0 {
            self.legs.audio().reset().await;
        }

        let evicted: Vec<TransferId> = {
            let mut finished = self.finished.lock().await;
            finished.push_back(view.id);
            let excess = finished.len().saturating_sub(self.archive_capacity);
            finished.drain(..excess).collect()
        };
        if !evicted.is_empty() {
            let mut attempts = self.attempts.write().await;
            for id in &evicted {
                attempts.remove(id);
            }
            drop(attempts);
            self.legs.status().remove_transfers(&evicted);
        }
    }

    async fn fail(&self, handle: &AttemptHandle, error: &DomainError) -> Result<()> {
        warn!("Transfer failed: {}", error);
        handle.attempt.lock().await.record_error(error);
        self.set_phase(handle, TransferPhase::Failed).await
    }

    async fn warn_cleanup(&self, handle: &AttemptHandle, leg: &LegId, error: &DomainError) {
        let failure = DomainError::PartialCleanupFailure {
            leg: leg.clone(),
            reason: error.to_string(),
        };
        warn!("{}", failure);
        metrics::record_cleanup_failure();
        handle.attempt.lock().await.add_warning(failure.to_string());
        self.legs.status().notify(EngineNotice::PartialCleanupFailure {
            leg_id: leg.clone(),
            reason: error.to_string(),
        });
    }

    /// Blind transfer of a connected leg
    ///
    /// If every binding fails the original leg is left exactly as it was.
    pub async fn begin_unattended(&self, original: &LegId, target: &str) -> Result<TransferView> {
        let handle = self.start(TransferKind::Unattended, original, target).await?;
        let _op = handle.op.lock().await;

        self.set_phase(&handle, TransferPhase::Completing).await?;
        let target = handle.attempt.lock().await.target().clone();

        match self.legs.transfer(original, &target).await {
            Ok(applied) => {
                handle.attempt.lock().await.record_failures(&applied.failures);
                self.set_phase(&handle, TransferPhase::Completed).await?;
            }
            Err(e) => self.fail(&handle, &e).await?,
        }

        Ok(self.view(&handle).await)
    }

    /// Hold the original leg, then dial the target on a consult leg
    pub async fn begin_attended(&self, original: &LegId, target: &str) -> Result<TransferView> {
        let handle = self.start(TransferKind::Attended, original, target).await?;
        let _op = handle.op.lock().await;
        let id = handle.attempt.lock().await.id();

        // Nothing is dialed unless the hold succeeded
        match self.legs.hold(original).await {
            Ok(applied) => {
                handle.attempt.lock().await.record_failures(&applied.failures);
                self.publish(&handle).await;
            }
            Err(e) => {
                self.fail(&handle, &e).await?;
                return Ok(self.view(&handle).await);
            }
        }

        let target = handle.attempt.lock().await.target().clone();
        let dialed = match self.legs.dial(&target).await {
            Ok(applied) => {
                handle.attempt.lock().await.record_failures(&applied.failures);
                let consult = applied.value;
                match self.legs.arena().claim(&consult, LegOwner::Transfer(id)).await {
                    Ok(()) => Ok(consult),
                    Err(e) => {
                        // Already gone or taken; make sure it is not left behind
                        if let Err(hangup) = self.legs.hangup(&consult, Some(LegOutcome::Failed)).await {
                            self.warn_cleanup(&handle, &consult, &hangup).await;
                        }
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        };

        match dialed {
            Ok(consult) => {
                info!("Transfer {} consulting on leg {}", id, consult);
                handle.attempt.lock().await.set_consult_leg(consult);
                self.set_phase(&handle, TransferPhase::Consulting).await?;
            }
            Err(e) => {
                if let Err(unhold) = self.legs.unhold(original).await {
                    self.warn_cleanup(&handle, original, &unhold).await;
                }
                self.fail(&handle, &e).await?;
            }
        }

        Ok(self.view(&handle).await)
    }

    /// Swap which leg is held: hold the active one, then unhold the other
    pub async fn switch_active(&self, id: TransferId) -> Result<TransferView> {
        let handle = self.handle(id).await?;
        let _op = handle.op.lock().await;

        let (active, inactive, side) = {
            let attempt = handle.attempt.lock().await;
            attempt.ensure_phase("switch_active", &[TransferPhase::Consulting])?;
            let inactive = attempt
                .inactive_leg()
                .cloned()
                .ok_or_else(|| DomainError::Internal(format!("transfer {} has no consult leg", id)))?;
            (attempt.active_leg().clone(), inactive, attempt.active_side())
        };

        for leg in [&active, &inactive] {
            let established = self
                .legs
                .arena()
                .state(leg)
                .await
                .map_or(false, |state| state.is_established());
            if !established {
                return Err(DomainError::PreconditionViolation(format!(
                    "switch_active requires leg {} to be answered",
                    leg
                )));
            }
        }

        if let Err(e) = self.legs.hold(&active).await {
            handle.attempt.lock().await.record_error(&e);
            self.publish(&handle).await;
            return Err(e);
        }

        if let Err(e) = self.legs.unhold(&inactive).await {
            // Back to talking on the leg we just held
            if let Err(rollback) = self.legs.unhold(&active).await {
                self.warn_cleanup(&handle, &active, &rollback).await;
            }
            handle.attempt.lock().await.record_error(&e);
            self.publish(&handle).await;
            return Err(e);
        }

        handle.attempt.lock().await.set_active_side(side.other());
        debug!("Transfer {} now talking on {}", id, inactive);
        self.publish(&handle).await;
        Ok(self.view(&handle).await)
    }

    /// Unhold both legs and mix them in a new conference
    pub async fn promote_to_conference(&self, id: TransferId) -> Result<TransferView> {
        let handle = self.handle(id).await?;
        let _op = handle.op.lock().await;

        let (original, consult) = {
            let attempt = handle.attempt.lock().await;
            attempt.ensure_phase("promote_to_conference", &[TransferPhase::Consulting])?;
            let consult = attempt
                .consult_leg()
                .cloned()
                .ok_or_else(|| DomainError::Internal(format!("transfer {} has no consult leg", id)))?;
            (attempt.original_leg().clone(), consult)
        };

        let result = self.mix(&handle, &original, &consult).await;
        match result {
            Ok(conference) => {
                info!("Transfer {} promoted to conference {}", id, conference);
                handle.attempt.lock().await.set_conference(Some(conference));
                self.set_phase(&handle, TransferPhase::Ready).await?;
                Ok(self.view(&handle).await)
            }
            Err(e) => {
                handle.attempt.lock().await.record_error(&e);
                self.publish(&handle).await;
                Err(e)
            }
        }
    }

    async fn mix(&self, handle: &AttemptHandle, original: &LegId, consult: &LegId) -> Result<ConferenceId> {
        let id = handle.attempt.lock().await.id();
        self.legs
            .wait_for_state(consult, LegState::Connected, self.legs.timeouts().connect(), &handle.cancel)
            .await?;

        let mut unheld = Vec::new();
        for leg in [original, consult] {
            if self.legs.arena().state(leg).await == Some(LegState::OnHold) {
                if let Err(e) = self.legs.unhold(leg).await {
                    self.rehold(handle, &unheld).await;
                    return Err(e);
                }
                unheld.push(leg.clone());
            }
        }

        match self
            .conferences
            .adopt(original, std::slice::from_ref(consult), LegOwner::Transfer(id))
            .await
        {
            Ok(conference) => Ok(conference),
            Err(e) => {
                self.rehold(handle, &unheld).await;
                Err(e)
            }
        }
    }

    async fn rehold(&self, handle: &AttemptHandle, legs: &[LegId]) {
        for leg in legs {
            if let Err(e) = self.legs.hold(leg).await {
                self.warn_cleanup(handle, leg, &e).await;
            }
        }
    }

    /// Hand the original leg to the target
    ///
    /// Tries a transfer-with-consultation binding first. Without one, the two
    /// legs are bridged and the consult leg is released only after the bridge
    /// is confirmed.
    pub async fn complete(&self, id: TransferId) -> Result<TransferView> {
        let handle = self.handle(id).await?;
        let _op = handle.op.lock().await;

        let (original, consult, conference) = {
            let attempt = handle.attempt.lock().await;
            attempt.ensure_phase("complete", &[TransferPhase::Consulting, TransferPhase::Ready])?;
            let consult = attempt
                .consult_leg()
                .cloned()
                .ok_or_else(|| DomainError::Internal(format!("transfer {} has no consult leg", id)))?;
            (attempt.original_leg().clone(), consult, attempt.conference())
        };

        if conference.is_some() {
            self.reclaim_from_conference(&handle, &[original.clone(), consult.clone()])
                .await;
        }

        self.set_phase(&handle, TransferPhase::Completing).await?;

        match self
            .legs
            .wait_for_state(&consult, LegState::Connected, self.legs.timeouts().connect(), &handle.cancel)
            .await
        {
            Ok(_) => {}
            // cancel() finishes the attempt once we let go of the lock
            Err(DomainError::Cancelled) => return Err(DomainError::Cancelled),
            Err(e) => {
                self.fail_attended(&handle, &original, &consult, &e).await?;
                return Ok(self.view(&handle).await);
            }
        }

        match self.legs.consult_transfer(&original, &consult).await {
            Ok(applied) => {
                handle.attempt.lock().await.record_failures(&applied.failures);
                self.set_phase(&handle, TransferPhase::Completed).await?;
                return Ok(self.view(&handle).await);
            }
            Err(e @ DomainError::CapabilityExhausted { .. }) => {
                debug!("No consultation transfer for {}, bridging instead", id);
                handle.attempt.lock().await.record_error(&e);
            }
            Err(e) => {
                self.fail_attended(&handle, &original, &consult, &e).await?;
                return Ok(self.view(&handle).await);
            }
        }

        match self.legs.bridge(&original, &consult).await {
            Ok(applied) => {
                handle.attempt.lock().await.record_failures(&applied.failures);
                // Bridge confirmed; only now may the consult leg go
                self.legs
                    .arena()
                    .set_outcome(&original, LegOutcome::Transferred)
                    .await;
                if let Err(e) = self.legs.hangup(&consult, Some(LegOutcome::Transferred)).await {
                    self.warn_cleanup(&handle, &consult, &e).await;
                }
                self.set_phase(&handle, TransferPhase::Completed).await?;
            }
            Err(e) => self.fail_attended(&handle, &original, &consult, &e).await?,
        }

        Ok(self.view(&handle).await)
    }

    /// Leave the user on the consult leg with the original held
    ///
    /// If one of the legs is gone, the survivor is taken off hold.
    async fn fail_attended(
        &self,
        handle: &AttemptHandle,
        original: &LegId,
        consult: &LegId,
        error: &DomainError,
    ) -> Result<()> {
        let original_live = self.legs.arena().is_live(original).await;
        let consult_live = self.legs.arena().is_live(consult).await;
        let consult_answered = self
            .legs
            .arena()
            .state(consult)
            .await
            .map_or(false, |state| state.is_established());

        if original_live && consult_answered {
            if let Err(e) = self.legs.hold(original).await {
                self.warn_cleanup(handle, original, &e).await;
            }
            if let Err(e) = self.legs.unhold(consult).await {
                self.warn_cleanup(handle, consult, &e).await;
            }
            handle.attempt.lock().await.set_active_side(ActiveSide::Consult);
        } else if original_live {
            if consult_live {
                if let Err(e) = self.legs.hangup(consult, Some(LegOutcome::Failed)).await {
                    self.warn_cleanup(handle, consult, &e).await;
                }
            }
            if let Err(e) = self.legs.unhold(original).await {
                self.warn_cleanup(handle, original, &e).await;
            }
            handle.attempt.lock().await.set_active_side(ActiveSide::Original);
        } else if consult_answered {
            if let Err(e) = self.legs.unhold(consult).await {
                self.warn_cleanup(handle, consult, &e).await;
            }
        }

        self.fail(handle, error).await
    }

    /// Abandon the consultation: hang up the consult leg, unhold the original
    ///
    /// Unattended attempts go straight to COMPLETING and cannot be cancelled.
    pub async fn cancel(&self, id: TransferId) -> Result<TransferView> {
        let handle = self.handle(id).await?;
        {
            let attempt = handle.attempt.lock().await;
            if attempt.is_terminal() {
                return Err(DomainError::InvalidStateTransition(format!(
                    "transfer {} already finished",
                    id
                )));
            }
            if attempt.kind() == TransferKind::Unattended {
                return Err(DomainError::InvalidStateTransition(format!(
                    "unattended transfer {} cannot be cancelled",
                    id
                )));
            }
        }

        handle.cancel.cancel();
        let _op = handle.op.lock().await;
        self.finish_cancel(&handle).await?;
        Ok(self.view(&handle).await)
    }

    async fn finish_cancel(&self, handle: &AttemptHandle) -> Result<()> {
        let (id, original, consult, phase) = {
            let attempt = handle.attempt.lock().await;
            (
                attempt.id(),
                attempt.original_leg().clone(),
                attempt.consult_leg().cloned(),
                attempt.phase(),
            )
        };
        if phase.is_terminal() {
            return Err(DomainError::InvalidStateTransition(format!(
                "transfer {} already finished as {}",
                id, phase
            )));
        }

        let keep: Vec<LegId> = std::iter::once(original.clone()).chain(consult.clone()).collect();
        self.reclaim_from_conference(handle, &keep).await;

        // Best-effort; the cancellation stands either way
        if let Some(consult) = &consult {
            if let Err(e) = self.legs.hangup(consult, Some(LegOutcome::Cancelled)).await {
                self.warn_cleanup(handle, consult, &e).await;
            }
        }

        if self.legs.arena().is_live(&original).await {
            if let Err(e) = self.legs.unhold(&original).await {
                self.warn_cleanup(handle, &original, &e).await;
            }
        }
        handle.attempt.lock().await.set_active_side(ActiveSide::Original);

        self.legs.mute(false).await;
        self.set_phase(handle, TransferPhase::Cancelled).await
    }

    /// Close the attempt's conference, taking `keep` back under the attempt
    async fn reclaim_from_conference(&self, handle: &AttemptHandle, keep: &[LegId]) {
        let (id, conference) = {
            let attempt = handle.attempt.lock().await;
            (attempt.id(), attempt.conference())
        };
        let Some(conference) = conference else {
            return;
        };

        if let Err(e) = self
            .conferences
            .dissolve(conference, keep, LegOwner::Transfer(id))
            .await
        {
            debug!("Conference {} was already gone: {}", conference, e);
        }
        handle.attempt.lock().await.set_conference(None);
    }

    /// A leg of this attempt disconnected on its own
    pub async fn on_leg_disconnected(&self, id: TransferId, leg: &LegId) {
        let Ok(handle) = self.handle(id).await else {
            return;
        };
        let _op = handle.op.lock().await;
        self.react_to_departure(&handle, leg).await;
    }

    /// The conference this attempt was promoted into lost a leg or closed
    pub async fn on_conference_event(&self, id: TransferId, conference: ConferenceId, event: OriginEvent) {
        let Ok(handle) = self.handle(id).await else {
            return;
        };
        let _op = handle.op.lock().await;

        {
            let attempt = handle.attempt.lock().await;
            if attempt.is_terminal() || attempt.conference() != Some(conference) {
                return;
            }
        }

        match event {
            OriginEvent::LegLeft(leg) => self.react_to_departure(&handle, &leg).await,
            OriginEvent::Closed => {
                info!("Conference {} of transfer {} closed", conference, id);
                handle.attempt.lock().await.set_conference(None);
                if let Err(e) = self.finish_cancel(&handle).await {
                    debug!("Transfer {} not cancelled: {}", id, e);
                }
            }
        }
    }

    /// Consult gone cancels the attempt; original gone fails it
    ///
    /// Callers hold the attempt's operation lock.
    async fn react_to_departure(&self, handle: &AttemptHandle, leg: &LegId) {
        let (id, phase, original, consult) = {
            let attempt = handle.attempt.lock().await;
            (
                attempt.id(),
                attempt.phase(),
                attempt.original_leg().clone(),
                attempt.consult_leg().cloned(),
            )
        };
        if phase.is_terminal() {
            return;
        }

        if consult.as_ref() == Some(leg) {
            info!("Consult leg {} of transfer {} hung up", leg, id);
            if let Err(e) = self.finish_cancel(handle).await {
                debug!("Transfer {} not cancelled: {}", id, e);
            }
        } else if leg == &original {
            info!("Original leg {} of transfer {} hung up", leg, id);
            let keep: Vec<LegId> = consult.iter().cloned().collect();
            self.reclaim_from_conference(handle, &keep).await;

            if let Some(consult) = &consult {
                if self.legs.arena().state(consult).await == Some(LegState::OnHold) {
                    if let Err(e) = self.legs.unhold(consult).await {
                        self.warn_cleanup(handle, consult, &e).await;
                    }
                }
                handle.attempt.lock().await.set_active_side(ActiveSide::Consult);
            }
            let error = DomainError::LegDisconnected(leg.clone());
            if let Err(e) = self.fail(handle, &error).await {
                debug!("Transfer {} not failed: {}", id, e);
            }
        }
    }
}
