//! Leg operations
//!
//! Idempotent wrappers around the signaling backend. Each call probes the
//! backend for the intent, then walks the ranked bindings once each, stopping
//! at the first success. Walking the list is the only retry mechanism.
//!
//! Operations on the same leg are serialized through the leg's gate in the
//! arena. Two-leg operations take both gates in id order.

use crate::config::{PollingConfig, TimeoutConfig};
use crate::domain::audio_route::{AudioRoute, AudioRouteState};
use crate::domain::backend::{BackendError, BackendResult, MediaDirection, SignalingBackend};
use crate::domain::capability::{BindingFailure, CapabilityBinding, CapabilityProber, Intent};
use crate::domain::history::{HistoryRecord, LegHistoryEntry};
use crate::domain::leg::{
    CallLeg, LegArena, LegOutcome, LegOwner, LegState, LegTransition, SignalKind,
    SignalingEvent,
};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::value_objects::{LegId, SipUri};
use crate::domain::shared::Result;
use crate::application::history_dispatcher::HistoryDispatcher;
use crate::interface::metrics;
use crate::interface::status::{EngineNotice, LegSummary, StatusBroadcaster};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of a capability-bound operation
#[derive(Debug, Clone)]
pub struct Applied<T> {
    pub value: T,
    /// Binding that succeeded; `None` when nothing had to be done
    pub binding: Option<CapabilityBinding>,
    /// Bindings tried and failed before the successful one
    pub failures: Vec<BindingFailure>,
}

impl<T> Applied<T> {
    fn noop(value: T) -> Self {
        Self {
            value,
            binding: None,
            failures: Vec::new(),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Applied<U> {
        Applied {
            value: f(self.value),
            binding: self.binding,
            failures: self.failures,
        }
    }
}

/// Backend request, independent of the binding that carries it
enum LegAction<'a> {
    Dial(&'a SipUri),
    Hold(&'a LegId),
    Unhold(&'a LegId),
    Transfer(&'a LegId, &'a SipUri),
    ConsultTransfer(&'a LegId, &'a LegId),
    Bridge(&'a LegId, &'a LegId),
    Unbridge(&'a LegId),
    Hangup(&'a LegId),
    CreateConference(&'a LegId),
}

enum Reply {
    Done,
    Leg(LegId),
    /// Mixing confirmation from the backend
    Mixed(bool),
}

pub struct LegOperations {
    backend: Arc<dyn SignalingBackend>,
    arena: Arc<LegArena>,
    audio: Arc<AudioRoute>,
    history: HistoryDispatcher,
    status: Arc<StatusBroadcaster>,
    routed_tx: mpsc::UnboundedSender<LegTransition>,
    timeouts: TimeoutConfig,
    polling: PollingConfig,
}

impl LegOperations {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn SignalingBackend>,
        arena: Arc<LegArena>,
        audio: Arc<AudioRoute>,
        history: HistoryDispatcher,
        status: Arc<StatusBroadcaster>,
        routed_tx: mpsc::UnboundedSender<LegTransition>,
        timeouts: TimeoutConfig,
        polling: PollingConfig,
    ) -> Self {
        Self {
            backend,
            arena,
            audio,
            history,
            status,
            routed_tx,
            timeouts,
            polling,
        }
    }

    pub fn arena(&self) -> &Arc<LegArena> {
        &self.arena
    }

    pub fn audio(&self) -> &Arc<AudioRoute> {
        &self.audio
    }

    pub fn status(&self) -> &Arc<StatusBroadcaster> {
        &self.status
    }

    pub fn history(&self) -> &HistoryDispatcher {
        &self.history
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    /// Walk the bindings for `intent` until one succeeds
    async fn run(&self, intent: Intent, action: LegAction<'_>) -> Result<Applied<Reply>> {
        let bindings = CapabilityProber::probe(self.backend.as_ref(), intent);
        let mut failures = Vec::new();

        for binding in bindings {
            debug!("Trying {} for {}", binding, intent);
            let started = Instant::now();

            let outcome = match tokio::time::timeout(
                self.timeouts.operation(),
                self.invoke(binding, &action),
            )
            .await
            {
                Ok(Ok(Reply::Mixed(false))) => {
                    Err("backend did not confirm mixing".to_string())
                }
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!(
                    "no answer within {}ms",
                    self.timeouts.operation_ms
                )),
            };

            metrics::record_binding_attempt(intent, binding, outcome.is_ok(), started.elapsed());

            match outcome {
                Ok(value) => {
                    debug!("{} realized through {}", intent, binding);
                    return Ok(Applied {
                        value,
                        binding: Some(binding),
                        failures,
                    });
                }
                Err(reason) => {
                    warn!("Binding {} failed for {}: {}", binding, intent, reason);
                    failures.push(BindingFailure::new(binding, reason));
                }
            }
        }

        metrics::record_capability_exhausted(intent);
        Err(DomainError::CapabilityExhausted { intent, failures })
    }

    async fn invoke(&self, binding: CapabilityBinding, action: &LegAction<'_>) -> BackendResult<Reply> {
        use CapabilityBinding as B;
        let backend = self.backend.as_ref();

        match (binding, action) {
            (B::MakeCall, LegAction::Dial(target)) => backend.make_call(target).await.map(Reply::Leg),

            (B::EndpointHold, LegAction::Hold(leg)) => backend.hold_call(leg).await.map(|_| Reply::Done),
            (B::ReinviteHold, LegAction::Hold(leg)) => backend
                .reinvite(leg, MediaDirection::SendOnly)
                .await
                .map(|_| Reply::Done),

            (B::EndpointUnhold, LegAction::Unhold(leg)) => {
                backend.unhold_call(leg).await.map(|_| Reply::Done)
            }
            (B::ReinviteUnhold, LegAction::Unhold(leg)) => backend
                .reinvite(leg, MediaDirection::SendRecv)
                .await
                .map(|_| Reply::Done),

            (B::EndpointTransfer, LegAction::Transfer(leg, target)) => {
                backend.xfer_call(leg, target).await.map(|_| Reply::Done)
            }
            (B::DialogRefer, LegAction::Transfer(leg, target)) => {
                backend.refer(leg, target).await.map(|_| Reply::Done)
            }

            (B::AttendedTransfer, LegAction::ConsultTransfer(original, consult)) => backend
                .attended_transfer(original, consult)
                .await
                .map(|_| Reply::Done),
            (B::TransferWithConsultation, LegAction::ConsultTransfer(original, consult)) => backend
                .transfer_with_consultation(original, consult)
                .await
                .map(|_| Reply::Done),

            (B::ConferenceConnect, LegAction::Bridge(a, b)) => {
                backend.conference_connect(a, b).await.map(Reply::Mixed)
            }
            (B::JoinConference, LegAction::Bridge(a, b)) => backend
                .join_conference(&[(*a).clone(), (*b).clone()])
                .await
                .map(Reply::Mixed),
            (B::MediaBridge, LegAction::Bridge(a, b)) => {
                backend.media_bridge(a, b).await.map(Reply::Mixed)
            }
            (B::ManualMix, LegAction::Bridge(a, b)) => {
                // Unholding alone proves nothing; the mixing status decides
                backend.unhold_call(a).await?;
                backend.unhold_call(b).await?;
                backend.mixing_status(a, b).await.map(Reply::Mixed)
            }

            (B::ConferenceDisconnect, LegAction::Unbridge(leg)) => {
                backend.conference_disconnect(leg).await.map(|_| Reply::Done)
            }

            (B::EndpointHangup, LegAction::Hangup(leg)) => {
                backend.hangup_call(leg).await.map(|_| Reply::Done)
            }
            (B::DialogTerminate, LegAction::Hangup(leg)) => {
                backend.terminate_dialog(leg).await.map(|_| Reply::Done)
            }

            (B::NativeConference, LegAction::CreateConference(seed)) => {
                backend.create_conference(seed).await.map(|_| Reply::Done)
            }

            (binding, _) => Err(BackendError::Rejected(format!(
                "binding {} does not apply to this request",
                binding
            ))),
        }
    }

    async fn lock(&self, leg: &LegId) -> Result<OwnedMutexGuard<()>> {
        let gate = self.arena.gate(leg).await?;
        Ok(gate.lock_owned().await)
    }

    /// Lock two legs in id order
    async fn lock_pair(
        &self,
        a: &LegId,
        b: &LegId,
    ) -> Result<(OwnedMutexGuard<()>, OwnedMutexGuard<()>)> {
        if a == b {
            return Err(DomainError::PreconditionViolation(format!(
                "leg {} cannot be paired with itself",
                a
            )));
        }

        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let gate_first: Arc<Mutex<()>> = self.arena.gate(first).await?;
        let gate_second: Arc<Mutex<()>> = self.arena.gate(second).await?;
        let guard_first = gate_first.lock_owned().await;
        let guard_second = gate_second.lock_owned().await;
        Ok((guard_first, guard_second))
    }

    async fn require_state(&self, leg: &LegId, allowed: &[LegState], operation: &str) -> Result<LegState> {
        let state = self
            .arena
            .state(leg)
            .await
            .ok_or_else(|| DomainError::NotFound(format!("leg {}", leg)))?;

        if state == LegState::Disconnected {
            return Err(DomainError::LegDisconnected(leg.clone()));
        }
        if !allowed.contains(&state) {
            return Err(DomainError::PreconditionViolation(format!(
                "{} requires leg {} to be {:?}, it is {}",
                operation, leg, allowed, state
            )));
        }
        Ok(state)
    }

    /// Apply a locally decided state after a binding succeeded
    async fn apply_local(&self, leg: &LegId, state: LegState) {
        match self.arena.transition(leg, state).await {
            Ok(Some(transition)) => self.after_transition(transition).await,
            Ok(None) => {}
            // A signal got there first
            Err(e) => debug!("Local transition of {} to {} skipped: {}", leg, state, e),
        }
    }

    /// Bookkeeping for every applied transition
    async fn after_transition(&self, transition: LegTransition) {
        info!(
            "Leg {} {} -> {}",
            transition.leg.id(),
            transition.from,
            transition.to
        );

        if transition.is_retirement() {
            self.history
                .dispatch(HistoryRecord::Leg(LegHistoryEntry::from_leg(&transition.leg)));
        }

        // Owners react to retirements; conferences also repair held legs
        let routed = transition.is_retirement()
            || (transition.to == LegState::OnHold
                && matches!(transition.owner, Some(LegOwner::Conference(_))));
        if routed && self.routed_tx.send(transition).is_err() {
            debug!("Transition router is gone");
        }

        self.publish_legs().await;
    }

    pub async fn publish_legs(&self) {
        let mut legs = self.arena.live_legs().await;
        legs.sort_by_key(|leg| leg.created_at());
        metrics::update_live_legs(legs.len());
        self.status
            .publish_legs(legs.iter().map(LegSummary::from).collect());
    }

    /// Apply one event from the signaling stream
    pub async fn apply_event(&self, event: &SignalingEvent) -> Result<()> {
        let transition = self.arena.apply_signal(event).await?;

        if let SignalKind::Incoming { remote } = &event.kind {
            if self.arena.is_live(&event.leg_id).await {
                info!("Incoming call {} from {}", event.leg_id, remote);
                self.status.notify(EngineNotice::IncomingCall {
                    leg_id: event.leg_id.clone(),
                    remote_address: remote.clone(),
                });
                self.publish_legs().await;
            }
        }

        if let Some(transition) = transition {
            self.after_transition(transition).await;
        }
        Ok(())
    }

    /// Dial `target`, registering the new leg
    pub async fn dial(&self, target: &SipUri) -> Result<Applied<LegId>> {
        let applied = self.run(Intent::Dial, LegAction::Dial(target)).await?;
        let leg_id = match &applied.value {
            Reply::Leg(id) => id.clone(),
            _ => return Err(DomainError::Internal("dial returned no leg".to_string())),
        };

        info!("Dialed {} as leg {}", target, leg_id);
        let replayed = self
            .arena
            .register(CallLeg::outbound(leg_id.clone(), target.to_string()))
            .await?;
        for transition in replayed {
            self.after_transition(transition).await;
        }
        self.publish_legs().await;

        Ok(applied.map(|_| leg_id))
    }

    /// Put a connected leg on hold; holding a held leg is a no-op
    pub async fn hold(&self, leg: &LegId) -> Result<Applied<()>> {
        let _gate = self.lock(leg).await?;
        let state = self
            .require_state(leg, &[LegState::Connected, LegState::OnHold], "hold")
            .await?;
        if state == LegState::OnHold {
            return Ok(Applied::noop(()));
        }

        self.arena.set_hold_intent(leg, true).await;
        match self.run(Intent::Hold, LegAction::Hold(leg)).await {
            Ok(applied) => {
                self.apply_local(leg, LegState::OnHold).await;
                Ok(applied.map(|_| ()))
            }
            Err(e) => {
                self.arena.set_hold_intent(leg, false).await;
                Err(e)
            }
        }
    }

    /// Take a held leg off hold; unholding a connected leg is a no-op
    pub async fn unhold(&self, leg: &LegId) -> Result<Applied<()>> {
        let _gate = self.lock(leg).await?;
        let state = self
            .require_state(leg, &[LegState::Connected, LegState::OnHold], "unhold")
            .await?;
        if state == LegState::Connected {
            return Ok(Applied::noop(()));
        }

        self.arena.set_hold_intent(leg, false).await;
        match self.run(Intent::Unhold, LegAction::Unhold(leg)).await {
            Ok(applied) => {
                self.apply_local(leg, LegState::Connected).await;
                Ok(applied.map(|_| ()))
            }
            Err(e) => {
                self.arena.set_hold_intent(leg, true).await;
                Err(e)
            }
        }
    }

    /// Hang up a leg; a leg that is already gone is a no-op
    ///
    /// `outcome` is what call history reports for the leg.
    pub async fn hangup(&self, leg: &LegId, outcome: Option<LegOutcome>) -> Result<Applied<()>> {
        let _gate = match self.lock(leg).await {
            Ok(gate) => gate,
            Err(DomainError::LegDisconnected(_)) => return Ok(Applied::noop(())),
            Err(e) => return Err(e),
        };
        if !self.arena.is_live(leg).await {
            return Ok(Applied::noop(()));
        }

        // The backend may signal the disconnect before the call returns
        self.arena.expect_outcome(leg, outcome).await;
        let applied = match self.run(Intent::Hangup, LegAction::Hangup(leg)).await {
            Ok(applied) => applied,
            Err(e) => {
                self.arena.expect_outcome(leg, None).await;
                return Err(e);
            }
        };
        self.apply_local(leg, LegState::Disconnected).await;
        Ok(applied.map(|_| ()))
    }

    /// Unattended transfer; the backend releases the leg on success
    pub async fn transfer(&self, leg: &LegId, target: &SipUri) -> Result<Applied<()>> {
        let _gate = self.lock(leg).await?;
        self.require_state(leg, &[LegState::Connected], "transfer")
            .await?;

        self.arena
            .expect_outcome(leg, Some(LegOutcome::Transferred))
            .await;
        let applied = match self
            .run(Intent::Transfer, LegAction::Transfer(leg, target))
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                self.arena.expect_outcome(leg, None).await;
                return Err(e);
            }
        };
        self.apply_local(leg, LegState::Disconnected).await;
        Ok(applied.map(|_| ()))
    }

    /// Replace `consult` with `original` at the far end
    pub async fn consult_transfer(&self, original: &LegId, consult: &LegId) -> Result<Applied<()>> {
        let _gates = self.lock_pair(original, consult).await?;
        let established = [LegState::Connected, LegState::OnHold];
        self.require_state(original, &established, "consult transfer")
            .await?;
        self.require_state(consult, &established, "consult transfer")
            .await?;

        for leg in [original, consult] {
            self.arena
                .expect_outcome(leg, Some(LegOutcome::Transferred))
                .await;
        }
        let applied = match self
            .run(
                Intent::ConsultTransfer,
                LegAction::ConsultTransfer(original, consult),
            )
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                for leg in [original, consult] {
                    self.arena.expect_outcome(leg, None).await;
                }
                return Err(e);
            }
        };

        for leg in [original, consult] {
            self.apply_local(leg, LegState::Disconnected).await;
        }
        Ok(applied.map(|_| ()))
    }

    /// Mix two established legs
    ///
    /// Succeeds only on a positive mixing confirmation. Both legs end up
    /// CONNECTED since a held leg is inaudible to the mix.
    pub async fn bridge(&self, a: &LegId, b: &LegId) -> Result<Applied<()>> {
        let _gates = self.lock_pair(a, b).await?;
        let established = [LegState::Connected, LegState::OnHold];
        self.require_state(a, &established, "bridge").await?;
        self.require_state(b, &established, "bridge").await?;

        let applied = self.run(Intent::Bridge, LegAction::Bridge(a, b)).await?;
        for leg in [a, b] {
            self.arena.set_hold_intent(leg, false).await;
            self.apply_local(leg, LegState::Connected).await;
        }
        Ok(applied.map(|_| ()))
    }

    /// Take a leg out of the mix
    pub async fn unbridge(&self, leg: &LegId) -> Result<Applied<()>> {
        let _gate = self.lock(leg).await?;
        self.run(Intent::Unbridge, LegAction::Unbridge(leg))
            .await
            .map(|applied| applied.map(|_| ()))
    }

    /// Ask the backend for an explicit conference seeded with `seed`
    pub async fn create_conference(&self, seed: &LegId) -> Result<Applied<()>> {
        let _gate = self.lock(seed).await?;
        self.run(Intent::CreateConference, LegAction::CreateConference(seed))
            .await
            .map(|applied| applied.map(|_| ()))
    }

    /// Mute or unmute the microphone against the last desired route
    pub async fn mute(&self, muted: bool) -> AudioRouteState {
        self.audio.set_microphone_muted(muted).await
    }

    /// Wait until `leg` reaches `expected`
    ///
    /// Waiting for CONNECTED is also satisfied by ON_HOLD (the far end
    /// answered). Event-driven through the arena's state watch; polls the
    /// backend only when it cannot emit state events.
    pub async fn wait_for_state(
        &self,
        leg: &LegId,
        expected: LegState,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LegState> {
        let observe = CapabilityProber::probe(self.backend.as_ref(), Intent::ObserveState);
        let started = Instant::now();

        if !observe.contains(&CapabilityBinding::EventStream)
            && observe.contains(&CapabilityBinding::StatePolling)
        {
            return self
                .poll_for_state(leg, expected, timeout, cancel, started)
                .await;
        }

        let mut rx = match self.arena.subscribe(leg).await {
            Some(rx) => rx,
            None => return self.settled_state(leg, expected).await,
        };
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            let state = *rx.borrow_and_update();
            if reaches(state, expected) {
                return Ok(state);
            }
            if state == LegState::Disconnected {
                return Err(DomainError::LegDisconnected(leg.clone()));
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return self.settled_state(leg, expected).await;
                    }
                }
                _ = &mut deadline => {
                    return Err(DomainError::TimeoutWaitingForState {
                        leg: leg.clone(),
                        expected,
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
                _ = cancel.cancelled() => return Err(DomainError::Cancelled),
            }
        }
    }

    async fn poll_for_state(
        &self,
        leg: &LegId,
        expected: LegState,
        timeout: Duration,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<LegState> {
        for attempt in 0..self.polling.max_attempts {
            if cancel.is_cancelled() {
                return Err(DomainError::Cancelled);
            }
            if started.elapsed() >= timeout {
                break;
            }

            match self.arena.state(leg).await {
                Some(state) if reaches(state, expected) => return Ok(state),
                Some(LegState::Disconnected) | None => {
                    return Err(DomainError::LegDisconnected(leg.clone()))
                }
                Some(_) => {}
            }

            match tokio::time::timeout(self.timeouts.operation(), self.backend.query_state(leg)).await {
                Ok(Ok(state)) => {
                    self.apply_polled(leg, state).await;
                    if reaches(state, expected) {
                        return Ok(state);
                    }
                }
                Ok(Err(e)) => debug!("State query {} for {} failed: {}", attempt, leg, e),
                Err(_) => debug!("State query {} for {} timed out", attempt, leg),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.polling.interval()) => {}
                _ = cancel.cancelled() => return Err(DomainError::Cancelled),
            }
        }

        Err(DomainError::TimeoutWaitingForState {
            leg: leg.clone(),
            expected,
            waited_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Feed a polled state into the arena as if it had been signaled
    async fn apply_polled(&self, leg: &LegId, state: LegState) {
        let kind = match state {
            LegState::Ringing => SignalKind::Ringing,
            LegState::Connected => SignalKind::Connected,
            LegState::Disconnected => SignalKind::Disconnected {
                reason: Some("observed by state query".to_string()),
            },
            LegState::Dialing | LegState::OnHold => return,
        };
        if let Err(e) = self
            .apply_event(&SignalingEvent::new(leg.clone(), kind))
            .await
        {
            debug!("Polled state for {} not applied: {}", leg, e);
        }
    }

    async fn settled_state(&self, leg: &LegId, expected: LegState) -> Result<LegState> {
        match self.arena.state(leg).await {
            Some(state) if reaches(state, expected) => Ok(state),
            _ => Err(DomainError::LegDisconnected(leg.clone())),
        }
    }
}

fn reaches(state: LegState, expected: LegState) -> bool {
    state == expected || (expected == LegState::Connected && state == LegState::OnHold)
}
