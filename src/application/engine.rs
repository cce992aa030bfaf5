//! Softphone engine
//!
//! Wires the orchestrators to one signaling backend and runs the two
//! background tasks: the signaling event pump and the transition router that
//! hands leg disconnections to whichever aggregate owns the leg.

use crate::application::conference_bridge::{ConferenceBridge, OriginNotice};
use crate::application::history_dispatcher::HistoryDispatcher;
use crate::application::leg_operations::LegOperations;
use crate::application::transfer_machine::TransferStateMachine;
use crate::config::Config;
use crate::domain::audio_route::{AudioRoute, AudioRouteController, AudioRouteState};
use crate::domain::backend::SignalingBackend;
use crate::domain::history::CallHistorySink;
use crate::domain::leg::{CallLeg, LegArena, LegOwner, LegState, LegTransition, SignalingEvent};
use crate::domain::shared::events::DomainEvent;
use crate::domain::shared::error::DomainError;
use crate::domain::shared::value_objects::{ConferenceId, LegId, SipUri};
use crate::domain::shared::Result;
use crate::interface::metrics;
use crate::interface::status::{EngineStatus, NoticeEnvelope, StatusBroadcaster};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Notices kept for slow UI subscribers
const NOTICE_CAPACITY: usize = 256;

pub struct SoftphoneEngine {
    config: Config,
    legs: Arc<LegOperations>,
    conferences: Arc<ConferenceBridge>,
    transfers: Arc<TransferStateMachine>,
    status: Arc<StatusBroadcaster>,
    shutdown: CancellationToken,
}

impl SoftphoneEngine {
    /// Build the engine and start its background tasks
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: Config,
        backend: Arc<dyn SignalingBackend>,
        audio: Arc<dyn AudioRouteController>,
        history: Arc<dyn CallHistorySink>,
    ) -> Self {
        metrics::describe_metrics();

        let arena = Arc::new(LegArena::new(config.history.retired_legs));
        let status = Arc::new(StatusBroadcaster::new(NOTICE_CAPACITY));
        let (routed_tx, routed_rx) = mpsc::unbounded_channel();
        let (origin_tx, origin_rx) = mpsc::unbounded_channel();

        let legs = Arc::new(LegOperations::new(
            backend.clone(),
            arena,
            Arc::new(AudioRoute::new(audio)),
            HistoryDispatcher::spawn(history),
            status.clone(),
            routed_tx,
            config.timeouts.clone(),
            config.polling.clone(),
        ));
        let conferences = Arc::new(ConferenceBridge::new(legs.clone(), origin_tx, &config));
        let transfers = Arc::new(TransferStateMachine::new(
            legs.clone(),
            conferences.clone(),
            &config,
        ));

        let shutdown = CancellationToken::new();
        spawn_event_pump(backend.subscribe(), legs.clone(), shutdown.clone());
        spawn_router(
            routed_rx,
            origin_rx,
            transfers.clone(),
            conferences.clone(),
            shutdown.clone(),
        );

        info!("Softphone engine started (domain {})", config.sip.domain);

        Self {
            config,
            legs,
            conferences,
            transfers,
            status,
            shutdown,
        }
    }

    fn target(&self, target: &str) -> Result<SipUri> {
        SipUri::from_dial_string(target, &self.config.sip.domain).map_err(|e| {
            DomainError::PreconditionViolation(format!("invalid target {:?}: {}", target, e))
        })
    }

    /// Legs inside a transfer or conference are driven by their owner only
    async fn ensure_unowned(&self, leg: &LegId) -> Result<()> {
        match self.legs.arena().owner(leg).await {
            Some(owner) => Err(DomainError::Conflict(format!(
                "leg {} is orchestrated by {}",
                leg, owner
            ))),
            None => Ok(()),
        }
    }

    /// Dial a target; bare numbers get the configured SIP domain
    pub async fn place_call(&self, target: &str) -> Result<LegId> {
        let uri = self.target(target)?;
        let applied = self.legs.dial(&uri).await?;
        Ok(applied.value)
    }

    /// Hang up a leg, taking it out of its conference first
    pub async fn hang_up(&self, leg: &LegId) -> Result<()> {
        if let Some(LegOwner::Conference(id)) = self.legs.arena().owner(leg).await {
            self.conferences.remove_participant(id, leg).await?;
            return Ok(());
        }
        self.legs.hangup(leg, None).await?;
        Ok(())
    }

    pub async fn hold(&self, leg: &LegId) -> Result<()> {
        self.ensure_unowned(leg).await?;
        self.legs.hold(leg).await?;
        Ok(())
    }

    pub async fn unhold(&self, leg: &LegId) -> Result<()> {
        self.ensure_unowned(leg).await?;
        self.legs.unhold(leg).await?;
        Ok(())
    }

    pub async fn set_microphone_muted(&self, muted: bool) -> AudioRouteState {
        self.legs.mute(muted).await
    }

    pub async fn set_speaker(&self, enabled: bool) -> AudioRouteState {
        self.legs.audio().set_speaker(enabled).await
    }

    /// Start a conference from a connected leg
    pub async fn start_conference(&self, seed: &LegId) -> Result<ConferenceId> {
        Ok(self.conferences.create(seed).await?.id)
    }

    /// Dial a target into a conference
    pub async fn add_participant(&self, conference: ConferenceId, target: &str) -> Result<LegId> {
        let uri = self.target(target)?;
        self.conferences.add_participant(conference, &uri).await
    }

    /// Leg snapshot, live or recently retired
    pub async fn leg(&self, id: &LegId) -> Option<CallLeg> {
        self.legs.arena().get(id).await
    }

    pub async fn leg_state(&self, id: &LegId) -> Option<LegState> {
        self.legs.arena().state(id).await
    }

    /// Wait for a leg to reach `expected`; CONNECTED is also met by ON_HOLD
    pub async fn wait_for_state(&self, leg: &LegId, expected: LegState, timeout: Duration) -> Result<LegState> {
        self.legs
            .wait_for_state(leg, expected, timeout, &self.shutdown)
            .await
    }

    pub fn transfers(&self) -> &Arc<TransferStateMachine> {
        &self.transfers
    }

    pub fn conferences(&self) -> &Arc<ConferenceBridge> {
        &self.conferences
    }

    pub fn status(&self) -> watch::Receiver<EngineStatus> {
        self.status.watch()
    }

    pub fn notices(&self) -> broadcast::Receiver<NoticeEnvelope> {
        self.status.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop the background tasks; live legs are left to the backend
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Softphone engine shutting down");
            self.shutdown.cancel();
        }
    }
}

impl Drop for SoftphoneEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_event_pump(
    mut events: broadcast::Receiver<SignalingEvent>,
    legs: Arc<LegOperations>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Signaling stream lagged, {} events lost", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Signaling stream closed");
                        break;
                    }
                },
            };

            debug!("Signal {} for leg {}", event.event_type(), event.leg_id);
            if let Err(e) = legs.apply_event(&event).await {
                debug!("Signal for leg {} not applied: {}", event.leg_id, e);
            }
        }
        debug!("Event pump stopped");
    });
}

/// Route owned-leg transitions and adopted-conference events without
/// blocking the event pump
fn spawn_router(
    mut routed: mpsc::UnboundedReceiver<LegTransition>,
    mut origins: mpsc::UnboundedReceiver<OriginNotice>,
    transfers: Arc<TransferStateMachine>,
    conferences: Arc<ConferenceBridge>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let transition = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(notice) = origins.recv() => {
                    if let LegOwner::Transfer(id) = notice.origin {
                        let transfers = transfers.clone();
                        tokio::spawn(async move {
                            transfers
                                .on_conference_event(id, notice.conference, notice.event)
                                .await
                        });
                    }
                    continue;
                }
                next = routed.recv() => match next {
                    Some(transition) => transition,
                    None => break,
                },
            };

            let leg = transition.leg.id().clone();
            match (transition.owner, transition.to) {
                (Some(LegOwner::Transfer(id)), LegState::Disconnected) => {
                    let transfers = transfers.clone();
                    tokio::spawn(async move { transfers.on_leg_disconnected(id, &leg).await });
                }
                (Some(LegOwner::Conference(id)), LegState::Disconnected) => {
                    let conferences = conferences.clone();
                    tokio::spawn(async move { conferences.on_leg_disconnected(id, &leg).await });
                }
                (Some(LegOwner::Conference(id)), LegState::OnHold) => {
                    let conferences = conferences.clone();
                    tokio::spawn(async move { conferences.on_leg_held(id, &leg).await });
                }
                _ => {}
            }
        }
        debug!("Transition router stopped");
    });
}
