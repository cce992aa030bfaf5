//! Scriptable in-process signaling backend
//!
//! Used by the demo binary and the integration tests. The method surface,
//! per-method failures, mixing confirmations and how each dialed target
//! answers can all be changed at runtime. Every call is appended to an
//! ordered log so tests can check sequencing.

use crate::domain::backend::{BackendError, BackendResult, MediaDirection, SignalingBackend};
use crate::domain::capability::BackendMethod;
use crate::domain::leg::{LegState, SignalKind, SignalingEvent};
use crate::domain::shared::value_objects::{LegId, SipUri};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CAPACITY: usize = 1024;

/// How a dialed target reacts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialBehavior {
    /// Ring, then answer after the delay
    Answer { after: Duration },
    /// Ring, then decline with 486
    Reject,
    /// Ring forever
    NeverAnswer,
}

impl Default for DialBehavior {
    fn default() -> Self {
        DialBehavior::Answer {
            after: Duration::from_millis(10),
        }
    }
}

/// One entry of the call log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCall {
    pub method: BackendMethod,
    pub legs: Vec<LegId>,
    pub target: Option<String>,
}

#[derive(Default)]
struct SimState {
    supported: HashSet<BackendMethod>,
    failing: HashSet<BackendMethod>,
    /// Mixing methods that answer `false`
    unconfirmed: HashSet<BackendMethod>,
    latency: HashMap<BackendMethod, Duration>,
    dial_behavior: HashMap<String, DialBehavior>,
    default_dial: DialBehavior,
    legs: HashMap<LegId, LegState>,
    mixed: HashSet<(LegId, LegId)>,
    log: Vec<BackendCall>,
}

pub struct SimulatedBackend {
    state: Arc<Mutex<SimState>>,
    events: broadcast::Sender<SignalingEvent>,
    next_id: AtomicU64,
}

impl SimulatedBackend {
    /// Backend exposing every method
    pub fn new() -> Self {
        Self::with_methods(BackendMethod::ALL)
    }

    pub fn with_methods(methods: impl IntoIterator<Item = BackendMethod>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = SimState {
            supported: methods.into_iter().collect(),
            ..SimState::default()
        };

        Self {
            state: Arc::new(Mutex::new(state)),
            events,
            next_id: AtomicU64::new(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }

    pub fn set_supported(&self, method: BackendMethod, supported: bool) {
        let mut state = self.state();
        if supported {
            state.supported.insert(method);
        } else {
            state.supported.remove(&method);
        }
    }

    /// Make `method` reject every call until `recover`
    pub fn fail(&self, method: BackendMethod) {
        self.state().failing.insert(method);
    }

    pub fn recover(&self, method: BackendMethod) {
        self.state().failing.remove(&method);
    }

    /// Make a mixing method report that nothing was mixed
    pub fn withhold_mixing(&self, method: BackendMethod) {
        self.state().unconfirmed.insert(method);
    }

    pub fn set_latency(&self, method: BackendMethod, latency: Duration) {
        self.state().latency.insert(method, latency);
    }

    pub fn set_dial_behavior(&self, target: &str, behavior: DialBehavior) {
        self.state()
            .dial_behavior
            .insert(target.to_string(), behavior);
    }

    pub fn set_default_dial_behavior(&self, behavior: DialBehavior) {
        self.state().default_dial = behavior;
    }

    /// Offer an inbound call from `remote`
    pub fn inject_incoming(&self, remote: &str) -> LegId {
        let leg = self.allocate();
        self.state().legs.insert(leg.clone(), LegState::Ringing);
        self.emit(
            &leg,
            SignalKind::Incoming {
                remote: remote.to_string(),
            },
        );
        leg
    }

    /// Far end answers (or the local user accepts an inbound call)
    pub fn connect(&self, leg: &LegId) {
        self.set_leg(leg, LegState::Connected);
        self.emit(leg, SignalKind::Connected);
    }

    pub fn remote_hangup(&self, leg: &LegId) {
        self.set_leg(leg, LegState::Disconnected);
        self.emit(
            leg,
            SignalKind::Disconnected {
                reason: Some("remote hangup".to_string()),
            },
        );
    }

    /// The backend holds a leg on its own, as some builds do when another
    /// call is taken off hold
    pub fn auto_hold(&self, leg: &LegId) {
        self.set_leg(leg, LegState::OnHold);
        self.emit(leg, SignalKind::AutoHeld);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state().log.clone()
    }

    pub fn calls_to(&self, method: BackendMethod) -> Vec<BackendCall> {
        self.state()
            .log
            .iter()
            .filter(|call| call.method == method)
            .cloned()
            .collect()
    }

    /// Backend-side state of a leg
    pub fn leg_state(&self, leg: &LegId) -> Option<LegState> {
        self.state().legs.get(leg).copied()
    }

    pub fn is_mixed(&self, a: &LegId, b: &LegId) -> bool {
        let state = self.state();
        state.mixed.contains(&(a.clone(), b.clone())) || state.mixed.contains(&(b.clone(), a.clone()))
    }

    fn allocate(&self) -> LegId {
        LegId::new(format!("sim-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    fn set_leg(&self, leg: &LegId, to: LegState) {
        let mut state = self.state();
        state.legs.insert(leg.clone(), to);
        if to == LegState::Disconnected {
            state.mixed.retain(|(a, b)| a != leg && b != leg);
        }
    }

    fn emit(&self, leg: &LegId, kind: SignalKind) {
        emit(&self.state, &self.events, leg, kind);
    }

    /// Log the call, then apply the scripted surface, failure and latency
    async fn enter(&self, method: BackendMethod, legs: &[&LegId], target: Option<&SipUri>) -> BackendResult<()> {
        let latency = {
            let mut state = self.state();
            state.log.push(BackendCall {
                method,
                legs: legs.iter().map(|leg| (*leg).clone()).collect(),
                target: target.map(|t| t.to_string()),
            });

            if !state.supported.contains(&method) {
                return Err(BackendError::Unsupported(method));
            }
            if state.failing.contains(&method) {
                return Err(BackendError::Rejected(format!("{} failed (scripted)", method)));
            }
            state.latency.get(&method).copied()
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn require(&self, leg: &LegId, allowed: &[LegState]) -> BackendResult<LegState> {
        match self.state().legs.get(leg) {
            Some(state) if allowed.contains(state) => Ok(*state),
            Some(state) => Err(BackendError::Rejected(format!("leg {} is {}", leg, state))),
            None => Err(BackendError::Rejected(format!("481 no dialog for leg {}", leg))),
        }
    }

    fn release(&self, leg: &LegId, reason: &str) {
        self.set_leg(leg, LegState::Disconnected);
        self.emit(
            leg,
            SignalKind::Disconnected {
                reason: Some(reason.to_string()),
            },
        );
    }

    fn hold_leg(&self, leg: &LegId) -> BackendResult<()> {
        if self.require(leg, &[LegState::Connected, LegState::OnHold])? == LegState::Connected {
            self.set_leg(leg, LegState::OnHold);
            self.emit(leg, SignalKind::HoldAck);
        }
        Ok(())
    }

    fn unhold_leg(&self, leg: &LegId) -> BackendResult<()> {
        if self.require(leg, &[LegState::Connected, LegState::OnHold])? == LegState::OnHold {
            self.set_leg(leg, LegState::Connected);
            self.emit(leg, SignalKind::UnholdAck);
        }
        Ok(())
    }

    fn mix(&self, method: BackendMethod, a: &LegId, b: &LegId) -> BackendResult<bool> {
        let established = [LegState::Connected, LegState::OnHold];
        self.require(a, &established)?;
        self.require(b, &established)?;

        let mut state = self.state();
        if state.unconfirmed.contains(&method) {
            return Ok(false);
        }
        state.mixed.insert((a.clone(), b.clone()));
        Ok(true)
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Push an event unless the backend is scripted without a state stream
fn emit(state: &Mutex<SimState>, events: &broadcast::Sender<SignalingEvent>, leg: &LegId, kind: SignalKind) {
    if !lock(state).supported.contains(&BackendMethod::StateEvents) {
        return;
    }
    debug!("Simulated backend emits {:?} for {}", kind, leg);
    // No subscriber yet is fine
    let _ = events.send(SignalingEvent::new(leg.clone(), kind));
}

#[async_trait]
impl SignalingBackend for SimulatedBackend {
    fn supports(&self, method: BackendMethod) -> bool {
        self.state().supported.contains(&method)
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.events.subscribe()
    }

    async fn make_call(&self, target: &SipUri) -> BackendResult<LegId> {
        self.enter(BackendMethod::MakeCall, &[], Some(target)).await?;

        let leg = self.allocate();
        let behavior = {
            let mut state = self.state();
            state.legs.insert(leg.clone(), LegState::Dialing);
            state
                .dial_behavior
                .get(&target.to_string())
                .or_else(|| state.dial_behavior.get(target.user()))
                .copied()
                .unwrap_or(state.default_dial)
        };

        let state = self.state.clone();
        let events = self.events.clone();
        let id = leg.clone();
        tokio::spawn(async move {
            let dialing = {
                let mut guard = lock(&state);
                let dialing = guard.legs.get(&id) == Some(&LegState::Dialing);
                if dialing {
                    guard.legs.insert(id.clone(), LegState::Ringing);
                }
                dialing
            };
            if !dialing {
                return;
            }
            emit(&state, &events, &id, SignalKind::Ringing);

            match behavior {
                DialBehavior::Answer { after } => {
                    tokio::time::sleep(after).await;
                    let ringing = {
                        let mut guard = lock(&state);
                        let ringing = guard.legs.get(&id) == Some(&LegState::Ringing);
                        if ringing {
                            guard.legs.insert(id.clone(), LegState::Connected);
                        }
                        ringing
                    };
                    if ringing {
                        emit(&state, &events, &id, SignalKind::Connected);
                    }
                }
                DialBehavior::Reject => {
                    lock(&state).legs.insert(id.clone(), LegState::Disconnected);
                    emit(
                        &state,
                        &events,
                        &id,
                        SignalKind::Disconnected {
                            reason: Some("486 Busy Here".to_string()),
                        },
                    );
                }
                DialBehavior::NeverAnswer => {}
            }
        });

        Ok(leg)
    }

    async fn hold_call(&self, leg: &LegId) -> BackendResult<()> {
        self.enter(BackendMethod::HoldCall, &[leg], None).await?;
        self.hold_leg(leg)
    }

    async fn unhold_call(&self, leg: &LegId) -> BackendResult<()> {
        self.enter(BackendMethod::UnholdCall, &[leg], None).await?;
        self.unhold_leg(leg)
    }

    async fn reinvite(&self, leg: &LegId, direction: MediaDirection) -> BackendResult<()> {
        self.enter(BackendMethod::Reinvite, &[leg], None).await?;
        match direction {
            MediaDirection::SendOnly => self.hold_leg(leg),
            MediaDirection::SendRecv => self.unhold_leg(leg),
        }
    }

    async fn xfer_call(&self, leg: &LegId, target: &SipUri) -> BackendResult<()> {
        self.enter(BackendMethod::XferCall, &[leg], Some(target)).await?;
        self.require(leg, &[LegState::Connected])?;
        self.release(leg, "transferred");
        Ok(())
    }

    async fn refer(&self, leg: &LegId, target: &SipUri) -> BackendResult<()> {
        self.enter(BackendMethod::Refer, &[leg], Some(target)).await?;
        self.require(leg, &[LegState::Connected])?;
        self.release(leg, "referred");
        Ok(())
    }

    async fn attended_transfer(&self, original: &LegId, consult: &LegId) -> BackendResult<()> {
        self.enter(BackendMethod::AttendedTransfer, &[original, consult], None)
            .await?;
        let established = [LegState::Connected, LegState::OnHold];
        self.require(original, &established)?;
        self.require(consult, &established)?;
        self.release(original, "transferred");
        self.release(consult, "replaced");
        Ok(())
    }

    async fn transfer_with_consultation(&self, original: &LegId, consult: &LegId) -> BackendResult<()> {
        self.enter(
            BackendMethod::TransferWithConsultation,
            &[original, consult],
            None,
        )
        .await?;
        let established = [LegState::Connected, LegState::OnHold];
        self.require(original, &established)?;
        self.require(consult, &established)?;
        self.release(original, "transferred");
        self.release(consult, "replaced");
        Ok(())
    }

    async fn conference_connect(&self, a: &LegId, b: &LegId) -> BackendResult<bool> {
        self.enter(BackendMethod::ConferenceConnect, &[a, b], None).await?;
        self.mix(BackendMethod::ConferenceConnect, a, b)
    }

    async fn join_conference(&self, legs: &[LegId]) -> BackendResult<bool> {
        let refs: Vec<&LegId> = legs.iter().collect();
        self.enter(BackendMethod::JoinConference, &refs, None).await?;
        match legs {
            [a, b, ..] => self.mix(BackendMethod::JoinConference, a, b),
            _ => Err(BackendError::Rejected("join needs two legs".to_string())),
        }
    }

    async fn media_bridge(&self, a: &LegId, b: &LegId) -> BackendResult<bool> {
        self.enter(BackendMethod::MediaBridge, &[a, b], None).await?;
        self.mix(BackendMethod::MediaBridge, a, b)
    }

    async fn mixing_status(&self, a: &LegId, b: &LegId) -> BackendResult<bool> {
        self.enter(BackendMethod::MixingStatus, &[a, b], None).await?;
        // Two unheld legs on this backend share the local mix
        let both_connected = self.require(a, &[LegState::Connected]).is_ok()
            && self.require(b, &[LegState::Connected]).is_ok();
        if !both_connected {
            return Ok(false);
        }
        self.mix(BackendMethod::MixingStatus, a, b)
    }

    async fn conference_disconnect(&self, leg: &LegId) -> BackendResult<()> {
        self.enter(BackendMethod::ConferenceDisconnect, &[leg], None)
            .await?;
        self.state().mixed.retain(|(a, b)| a != leg && b != leg);
        Ok(())
    }

    async fn hangup_call(&self, leg: &LegId) -> BackendResult<()> {
        self.enter(BackendMethod::HangupCall, &[leg], None).await?;
        self.require(
            leg,
            &[LegState::Dialing, LegState::Ringing, LegState::Connected, LegState::OnHold],
        )?;
        self.release(leg, "local hangup");
        Ok(())
    }

    async fn terminate_dialog(&self, leg: &LegId) -> BackendResult<()> {
        self.enter(BackendMethod::TerminateDialog, &[leg], None).await?;
        self.require(
            leg,
            &[LegState::Dialing, LegState::Ringing, LegState::Connected, LegState::OnHold],
        )?;
        self.release(leg, "dialog terminated");
        Ok(())
    }

    async fn create_conference(&self, seed: &LegId) -> BackendResult<()> {
        self.enter(BackendMethod::CreateConference, &[seed], None).await?;
        self.require(seed, &[LegState::Connected, LegState::OnHold])?;
        Ok(())
    }

    async fn query_state(&self, leg: &LegId) -> BackendResult<LegState> {
        self.enter(BackendMethod::StateQuery, &[leg], None).await?;
        self.state()
            .legs
            .get(leg)
            .copied()
            .ok_or_else(|| BackendError::Rejected(format!("481 no dialog for leg {}", leg)))
    }
}
