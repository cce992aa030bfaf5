//! Signaling backend port
//!
//! The backend performs SIP signaling, media and NAT handling. Its method
//! surface varies by build and can change across reconnects, so every method
//! defaults to `Unsupported` and the capability prober is the only component
//! that asks `supports`.

use crate::domain::capability::BackendMethod;
use crate::domain::leg::{LegState, SignalingEvent};
use crate::domain::shared::value_objects::{LegId, SipUri};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend method {0} is not available")]
    Unsupported(BackendMethod),

    #[error("Backend rejected request: {0}")]
    Rejected(String),

    #[error("Transport failure: {0}")]
    Transport(String),
}

/// Media direction requested in a re-INVITE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaDirection {
    /// Normal two-way media
    SendRecv,
    /// Local hold
    SendOnly,
}

#[async_trait]
pub trait SignalingBackend: Send + Sync {
    /// Whether `method` is currently available on this handle
    fn supports(&self, method: BackendMethod) -> bool;

    /// Leg state notifications for every leg on this handle
    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent>;

    async fn make_call(&self, target: &SipUri) -> BackendResult<LegId> {
        let _ = target;
        Err(BackendError::Unsupported(BackendMethod::MakeCall))
    }

    async fn hold_call(&self, leg: &LegId) -> BackendResult<()> {
        let _ = leg;
        Err(BackendError::Unsupported(BackendMethod::HoldCall))
    }

    async fn unhold_call(&self, leg: &LegId) -> BackendResult<()> {
        let _ = leg;
        Err(BackendError::Unsupported(BackendMethod::UnholdCall))
    }

    async fn reinvite(&self, leg: &LegId, direction: MediaDirection) -> BackendResult<()> {
        let _ = (leg, direction);
        Err(BackendError::Unsupported(BackendMethod::Reinvite))
    }

    async fn xfer_call(&self, leg: &LegId, target: &SipUri) -> BackendResult<()> {
        let _ = (leg, target);
        Err(BackendError::Unsupported(BackendMethod::XferCall))
    }

    async fn refer(&self, leg: &LegId, target: &SipUri) -> BackendResult<()> {
        let _ = (leg, target);
        Err(BackendError::Unsupported(BackendMethod::Refer))
    }

    async fn attended_transfer(&self, original: &LegId, consult: &LegId) -> BackendResult<()> {
        let _ = (original, consult);
        Err(BackendError::Unsupported(BackendMethod::AttendedTransfer))
    }

    async fn transfer_with_consultation(
        &self,
        original: &LegId,
        consult: &LegId,
    ) -> BackendResult<()> {
        let _ = (original, consult);
        Err(BackendError::Unsupported(BackendMethod::TransferWithConsultation))
    }

    /// Returns `true` only when the backend confirms the legs are mixed
    async fn conference_connect(&self, a: &LegId, b: &LegId) -> BackendResult<bool> {
        let _ = (a, b);
        Err(BackendError::Unsupported(BackendMethod::ConferenceConnect))
    }

    async fn join_conference(&self, legs: &[LegId]) -> BackendResult<bool> {
        let _ = legs;
        Err(BackendError::Unsupported(BackendMethod::JoinConference))
    }

    async fn media_bridge(&self, a: &LegId, b: &LegId) -> BackendResult<bool> {
        let _ = (a, b);
        Err(BackendError::Unsupported(BackendMethod::MediaBridge))
    }

    async fn mixing_status(&self, a: &LegId, b: &LegId) -> BackendResult<bool> {
        let _ = (a, b);
        Err(BackendError::Unsupported(BackendMethod::MixingStatus))
    }

    async fn conference_disconnect(&self, leg: &LegId) -> BackendResult<()> {
        let _ = leg;
        Err(BackendError::Unsupported(BackendMethod::ConferenceDisconnect))
    }

    async fn hangup_call(&self, leg: &LegId) -> BackendResult<()> {
        let _ = leg;
        Err(BackendError::Unsupported(BackendMethod::HangupCall))
    }

    async fn terminate_dialog(&self, leg: &LegId) -> BackendResult<()> {
        let _ = leg;
        Err(BackendError::Unsupported(BackendMethod::TerminateDialog))
    }

    async fn create_conference(&self, seed: &LegId) -> BackendResult<()> {
        let _ = seed;
        Err(BackendError::Unsupported(BackendMethod::CreateConference))
    }

    async fn query_state(&self, leg: &LegId) -> BackendResult<LegState> {
        let _ = leg;
        Err(BackendError::Unsupported(BackendMethod::StateQuery))
    }
}
