//! Arena of live call legs keyed by backend leg id
//!
//! Aggregates hold leg ids, never leg references. The arena owns the leg
//! records, a per-leg serialization gate, a per-leg state watch used for
//! event-driven waits, and the owner claim that keeps a leg inside at most
//! one transfer attempt or conference at a time.

use crate::domain::leg::aggregate::CallLeg;
use crate::domain::leg::event::{SignalKind, SignalingEvent};
use crate::domain::leg::value_object::{LegOutcome, LegState};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::value_objects::{ConferenceId, LegId, TransferId};
use crate::domain::shared::Result;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info};

/// Events buffered for legs the arena has not seen yet
const PENDING_LEG_LIMIT: usize = 64;

/// Aggregate currently orchestrating a leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LegOwner {
    Transfer(TransferId),
    Conference(ConferenceId),
}

impl fmt::Display for LegOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegOwner::Transfer(id) => write!(f, "transfer {}", id),
            LegOwner::Conference(id) => write!(f, "conference {}", id),
        }
    }
}

/// A state change applied to a leg
#[derive(Debug, Clone)]
pub struct LegTransition {
    /// Leg snapshot after the change
    pub leg: CallLeg,
    pub from: LegState,
    pub to: LegState,
    /// Owner at the time of the change
    pub owner: Option<LegOwner>,
}

impl LegTransition {
    pub fn is_retirement(&self) -> bool {
        self.to == LegState::Disconnected
    }
}

struct LegSlot {
    leg: CallLeg,
    state_tx: watch::Sender<LegState>,
    gate: Arc<Mutex<()>>,
    owner: Option<LegOwner>,
}

impl LegSlot {
    fn new(leg: CallLeg) -> Self {
        let (state_tx, _) = watch::channel(leg.state());
        Self {
            leg,
            state_tx,
            gate: Arc::new(Mutex::new(())),
            owner: None,
        }
    }
}

#[derive(Default)]
struct ArenaInner {
    live: HashMap<LegId, LegSlot>,
    retired: VecDeque<CallLeg>,
    pending: HashMap<LegId, Vec<SignalKind>>,
    pending_order: VecDeque<LegId>,
}

impl ArenaInner {
    fn is_retired(&self, id: &LegId) -> bool {
        self.retired.iter().any(|leg| leg.id() == id)
    }

    fn buffer(&mut self, id: LegId, kind: SignalKind) {
        if !self.pending.contains_key(&id) {
            if self.pending_order.len() >= PENDING_LEG_LIMIT {
                if let Some(oldest) = self.pending_order.pop_front() {
                    self.pending.remove(&oldest);
                }
            }
            self.pending_order.push_back(id.clone());
        }
        self.pending.entry(id).or_default().push(kind);
    }

    /// Publish the new state and retire the slot on disconnect
    fn settle(&mut self, id: &LegId, from: LegState, retired_capacity: usize) -> Option<LegTransition> {
        let slot = self.live.get(id)?;
        let to = slot.leg.state();
        slot.state_tx.send_replace(to);

        let transition = LegTransition {
            leg: slot.leg.clone(),
            from,
            to,
            owner: slot.owner,
        };

        if to == LegState::Disconnected {
            if let Some(slot) = self.live.remove(id) {
                self.retired.push_back(slot.leg);
                while self.retired.len() > retired_capacity {
                    self.retired.pop_front();
                }
            }
        }

        Some(transition)
    }
}

/// Arena of call legs
pub struct LegArena {
    inner: RwLock<ArenaInner>,
    retired_capacity: usize,
}

impl LegArena {
    pub fn new(retired_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(ArenaInner::default()),
            retired_capacity: retired_capacity.max(1),
        }
    }

    /// Register a leg the backend just created
    ///
    /// Signals that arrived before registration are replayed in order.
    pub async fn register(&self, leg: CallLeg) -> Result<Vec<LegTransition>> {
        let mut inner = self.inner.write().await;
        let id = leg.id().clone();

        if inner.live.contains_key(&id) {
            return Err(DomainError::AlreadyExists(format!("leg {}", id)));
        }

        info!("Registered {:?} leg {} ({})", leg.direction(), id, leg.remote_address());
        inner.live.insert(id.clone(), LegSlot::new(leg));

        let mut transitions = Vec::new();
        if let Some(buffered) = inner.pending.remove(&id) {
            inner.pending_order.retain(|pending| pending != &id);
            for kind in buffered {
                let changed = match inner.live.get_mut(&id) {
                    Some(slot) => slot.leg.apply_signal(&kind),
                    None => break,
                };
                if let Some((from, _)) = changed {
                    if let Some(transition) = inner.settle(&id, from, self.retired_capacity) {
                        transitions.push(transition);
                    }
                }
            }
        }

        Ok(transitions)
    }

    /// Apply a signaling event; unknown legs are buffered until registered
    pub async fn apply_signal(&self, event: &SignalingEvent) -> Result<Option<LegTransition>> {
        let mut inner = self.inner.write().await;
        let id = &event.leg_id;

        if let SignalKind::Incoming { remote } = &event.kind {
            if inner.live.contains_key(id) || inner.is_retired(id) {
                return Ok(None);
            }
            drop(inner);
            self.register(CallLeg::inbound(id.clone(), remote.clone())).await?;
            return Ok(None);
        }

        let changed = match inner.live.get_mut(id) {
            Some(slot) => slot.leg.apply_signal(&event.kind),
            None => {
                if !inner.is_retired(id) {
                    debug!("Buffering {:?} for unregistered leg {}", event.kind, id);
                    inner.buffer(id.clone(), event.kind.clone());
                }
                return Ok(None);
            }
        };

        Ok(changed.and_then(|(from, _)| inner.settle(id, from, self.retired_capacity)))
    }

    /// Apply a locally decided state change (after a binding succeeded)
    pub async fn transition(&self, id: &LegId, to: LegState) -> Result<Option<LegTransition>> {
        let mut inner = self.inner.write().await;
        let retired = inner.is_retired(id);

        let from = match inner.live.get_mut(id) {
            Some(slot) => {
                let from = slot.leg.state();
                if !slot.leg.transition_to(to)? {
                    return Ok(None);
                }
                from
            }
            None if to == LegState::Disconnected && retired => return Ok(None),
            None => return Err(DomainError::NotFound(format!("leg {}", id))),
        };

        Ok(inner.settle(id, from, self.retired_capacity))
    }

    pub async fn set_hold_intent(&self, id: &LegId, held: bool) {
        if let Some(slot) = self.inner.write().await.live.get_mut(id) {
            slot.leg.set_hold_intent(held);
        }
    }

    pub async fn set_outcome(&self, id: &LegId, outcome: LegOutcome) {
        if let Some(slot) = self.inner.write().await.live.get_mut(id) {
            slot.leg.set_outcome(outcome);
        }
    }

    pub async fn expect_outcome(&self, id: &LegId, outcome: Option<LegOutcome>) {
        if let Some(slot) = self.inner.write().await.live.get_mut(id) {
            slot.leg.expect_outcome(outcome);
        }
    }

    /// Leg snapshot, live or recently retired
    pub async fn get(&self, id: &LegId) -> Option<CallLeg> {
        let inner = self.inner.read().await;
        inner
            .live
            .get(id)
            .map(|slot| slot.leg.clone())
            .or_else(|| inner.retired.iter().rev().find(|leg| leg.id() == id).cloned())
    }

    pub async fn state(&self, id: &LegId) -> Option<LegState> {
        self.get(id).await.map(|leg| leg.state())
    }

    pub async fn is_live(&self, id: &LegId) -> bool {
        self.inner.read().await.live.contains_key(id)
    }

    /// Serialization gate for operations against one leg
    pub async fn gate(&self, id: &LegId) -> Result<Arc<Mutex<()>>> {
        self.inner
            .read()
            .await
            .live
            .get(id)
            .map(|slot| slot.gate.clone())
            .ok_or_else(|| DomainError::LegDisconnected(id.clone()))
    }

    /// Subscribe to state changes of a live leg
    pub async fn subscribe(&self, id: &LegId) -> Option<watch::Receiver<LegState>> {
        self.inner
            .read()
            .await
            .live
            .get(id)
            .map(|slot| slot.state_tx.subscribe())
    }

    /// Claim a leg for an aggregate
    pub async fn claim(&self, id: &LegId, owner: LegOwner) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.is_retired(id) {
            return Err(DomainError::LegDisconnected(id.clone()));
        }
        let slot = inner
            .live
            .get_mut(id)
            .ok_or_else(|| DomainError::NotFound(format!("leg {}", id)))?;

        match slot.owner {
            Some(current) if current != owner => Err(DomainError::Conflict(format!(
                "leg {} is already orchestrated by {}",
                id, current
            ))),
            _ => {
                slot.owner = Some(owner);
                Ok(())
            }
        }
    }

    /// Drop a claim held by `owner`; claims held by others are left alone
    pub async fn release(&self, id: &LegId, owner: LegOwner) {
        if let Some(slot) = self.inner.write().await.live.get_mut(id) {
            if slot.owner == Some(owner) {
                slot.owner = None;
            }
        }
    }

    /// Move a claim from one aggregate to another
    pub async fn handover(&self, id: &LegId, from: LegOwner, to: LegOwner) -> Result<()> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .live
            .get_mut(id)
            .ok_or_else(|| DomainError::LegDisconnected(id.clone()))?;

        match slot.owner {
            Some(current) if current != from && current != to => Err(DomainError::Conflict(
                format!("leg {} is orchestrated by {}", id, current),
            )),
            _ => {
                slot.owner = Some(to);
                Ok(())
            }
        }
    }

    pub async fn owner(&self, id: &LegId) -> Option<LegOwner> {
        self.inner.read().await.live.get(id).and_then(|slot| slot.owner)
    }

    pub async fn live_legs(&self) -> Vec<CallLeg> {
        self.inner
            .read()
            .await
            .live
            .values()
            .map(|slot| slot.leg.clone())
            .collect()
    }

    pub async fn live_count(&self) -> usize {
        self.inner.read().await.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(id: &str, kind: SignalKind) -> SignalingEvent {
        SignalingEvent::new(LegId::from(id), kind)
    }

    #[tokio::test]
    async fn test_register_and_transition() {
        let arena = LegArena::new(8);
        let id = LegId::from("sim-1");
        arena.register(CallLeg::outbound(id.clone(), "sip:1001@pbx.local")).await.unwrap();

        let transition = arena.transition(&id, LegState::Connected).await.unwrap().unwrap();
        assert_eq!(transition.from, LegState::Dialing);
        assert_eq!(transition.to, LegState::Connected);

        // Same state is a no-op
        assert!(arena.transition(&id, LegState::Connected).await.unwrap().is_none());
        assert!(arena.register(CallLeg::outbound(id.clone(), "x")).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_retires_leg() {
        let arena = LegArena::new(8);
        let id = LegId::from("sim-1");
        arena.register(CallLeg::outbound(id.clone(), "sip:1001@pbx.local")).await.unwrap();
        let mut rx = arena.subscribe(&id).await.unwrap();

        let transition = arena
            .apply_signal(&signal("sim-1", SignalKind::Disconnected { reason: None }))
            .await
            .unwrap()
            .unwrap();
        assert!(transition.is_retirement());

        assert!(!arena.is_live(&id).await);
        assert_eq!(arena.state(&id).await, Some(LegState::Disconnected));
        assert_eq!(*rx.borrow_and_update(), LegState::Disconnected);
        assert!(arena.gate(&id).await.is_err());

        // Late duplicate for a retired leg is ignored, not buffered
        assert!(arena
            .apply_signal(&signal("sim-1", SignalKind::Disconnected { reason: None }))
            .await
            .unwrap()
            .is_none());
        assert!(arena.transition(&id, LegState::Disconnected).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_transition_of_unknown_leg() {
        let arena = LegArena::new(8);
        let id = LegId::from("sim-9");

        assert!(matches!(
            arena.transition(&id, LegState::Disconnected).await,
            Err(DomainError::NotFound(_))
        ));

        arena.register(CallLeg::outbound(id.clone(), "sip:1009@pbx.local")).await.unwrap();
        arena.transition(&id, LegState::Disconnected).await.unwrap();
        assert!(arena.transition(&id, LegState::Disconnected).await.unwrap().is_none());
        assert!(matches!(
            arena.transition(&id, LegState::Connected).await,
            Err(DomainError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_early_signals_replayed_on_register() {
        let arena = LegArena::new(8);
        arena.apply_signal(&signal("sim-7", SignalKind::Ringing)).await.unwrap();
        arena.apply_signal(&signal("sim-7", SignalKind::Connected)).await.unwrap();

        let transitions = arena
            .register(CallLeg::outbound(LegId::from("sim-7"), "sip:1007@pbx.local"))
            .await
            .unwrap();
        assert_eq!(transitions.len(), 2);
        assert_eq!(arena.state(&LegId::from("sim-7")).await, Some(LegState::Connected));
    }

    #[tokio::test]
    async fn test_incoming_registers_inbound_leg() {
        let arena = LegArena::new(8);
        arena
            .apply_signal(&signal(
                "in-1",
                SignalKind::Incoming {
                    remote: "sip:5000@pbx.local".to_string(),
                },
            ))
            .await
            .unwrap();

        let leg = arena.get(&LegId::from("in-1")).await.unwrap();
        assert_eq!(leg.state(), LegState::Ringing);
        assert_eq!(leg.remote_address(), "sip:5000@pbx.local");
    }

    #[tokio::test]
    async fn test_claims_are_exclusive() {
        let arena = LegArena::new(8);
        let id = LegId::from("sim-1");
        arena.register(CallLeg::outbound(id.clone(), "sip:1001@pbx.local")).await.unwrap();

        let transfer = LegOwner::Transfer(TransferId::new());
        let conference = LegOwner::Conference(ConferenceId::new());

        arena.claim(&id, transfer).await.unwrap();
        arena.claim(&id, transfer).await.unwrap();
        assert!(matches!(
            arena.claim(&id, conference).await,
            Err(DomainError::Conflict(_))
        ));

        arena.handover(&id, transfer, conference).await.unwrap();
        assert_eq!(arena.owner(&id).await, Some(conference));

        // A stale owner cannot release someone else's claim
        arena.release(&id, transfer).await;
        assert_eq!(arena.owner(&id).await, Some(conference));
        arena.release(&id, conference).await;
        assert_eq!(arena.owner(&id).await, None);
    }

    #[tokio::test]
    async fn test_retired_list_is_bounded() {
        let arena = LegArena::new(2);
        for n in 0..3 {
            let id = LegId::new(format!("sim-{}", n));
            arena.register(CallLeg::outbound(id.clone(), "x")).await.unwrap();
            arena.transition(&id, LegState::Disconnected).await.unwrap();
        }
        assert!(arena.get(&LegId::from("sim-0")).await.is_none());
        assert!(arena.get(&LegId::from("sim-2")).await.is_some());
    }
}
