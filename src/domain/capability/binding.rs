//! Intents, backend methods and the bindings that connect them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Abstract operation the engine wants performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Hold,
    Unhold,
    /// Unattended (blind) transfer to an address
    Transfer,
    /// Transfer that replaces the consult leg with the original leg
    ConsultTransfer,
    /// Mix two legs
    Bridge,
    /// Take a leg out of the mix
    Unbridge,
    Dial,
    Hangup,
    /// Explicit conference-creation primitive
    CreateConference,
    /// Learn about leg state changes
    ObserveState,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Hold => "hold",
            Intent::Unhold => "unhold",
            Intent::Transfer => "transfer",
            Intent::ConsultTransfer => "consult_transfer",
            Intent::Bridge => "bridge",
            Intent::Unbridge => "unbridge",
            Intent::Dial => "dial",
            Intent::Hangup => "hangup",
            Intent::CreateConference => "create_conference",
            Intent::ObserveState => "observe_state",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete method a signaling backend may or may not expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMethod {
    MakeCall,
    HoldCall,
    UnholdCall,
    /// re-INVITE with an explicit media direction
    Reinvite,
    XferCall,
    Refer,
    AttendedTransfer,
    TransferWithConsultation,
    ConferenceConnect,
    JoinConference,
    MediaBridge,
    MixingStatus,
    ConferenceDisconnect,
    HangupCall,
    TerminateDialog,
    CreateConference,
    /// The backend pushes leg state changes on its event stream
    StateEvents,
    /// The backend answers point-in-time state queries
    StateQuery,
}

impl BackendMethod {
    pub const ALL: [BackendMethod; 18] = [
        BackendMethod::MakeCall,
        BackendMethod::HoldCall,
        BackendMethod::UnholdCall,
        BackendMethod::Reinvite,
        BackendMethod::XferCall,
        BackendMethod::Refer,
        BackendMethod::AttendedTransfer,
        BackendMethod::TransferWithConsultation,
        BackendMethod::ConferenceConnect,
        BackendMethod::JoinConference,
        BackendMethod::MediaBridge,
        BackendMethod::MixingStatus,
        BackendMethod::ConferenceDisconnect,
        BackendMethod::HangupCall,
        BackendMethod::TerminateDialog,
        BackendMethod::CreateConference,
        BackendMethod::StateEvents,
        BackendMethod::StateQuery,
    ];
}

impl fmt::Display for BackendMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A way of realizing an intent with backend methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityBinding {
    EndpointHold,
    ReinviteHold,
    EndpointUnhold,
    ReinviteUnhold,
    EndpointTransfer,
    DialogRefer,
    AttendedTransfer,
    TransferWithConsultation,
    ConferenceConnect,
    JoinConference,
    MediaBridge,
    /// Unhold both legs and ask the backend whether they are mixed
    ManualMix,
    ConferenceDisconnect,
    MakeCall,
    EndpointHangup,
    DialogTerminate,
    NativeConference,
    EventStream,
    StatePolling,
}

use CapabilityBinding::*;

const HOLD: &[CapabilityBinding] = &[EndpointHold, ReinviteHold];
const UNHOLD: &[CapabilityBinding] = &[EndpointUnhold, ReinviteUnhold];
const TRANSFER: &[CapabilityBinding] = &[EndpointTransfer, DialogRefer];
const CONSULT_TRANSFER: &[CapabilityBinding] = &[AttendedTransfer, TransferWithConsultation];
const BRIDGE: &[CapabilityBinding] = &[ConferenceConnect, JoinConference, MediaBridge, ManualMix];
const UNBRIDGE: &[CapabilityBinding] = &[ConferenceDisconnect];
const DIAL: &[CapabilityBinding] = &[MakeCall];
const HANGUP: &[CapabilityBinding] = &[EndpointHangup, DialogTerminate];
const CREATE_CONFERENCE: &[CapabilityBinding] = &[NativeConference];
const OBSERVE_STATE: &[CapabilityBinding] = &[EventStream, StatePolling];

impl CapabilityBinding {
    /// Every known binding for `intent`, most specific first
    pub fn ranked(intent: Intent) -> &'static [CapabilityBinding] {
        match intent {
            Intent::Hold => HOLD,
            Intent::Unhold => UNHOLD,
            Intent::Transfer => TRANSFER,
            Intent::ConsultTransfer => CONSULT_TRANSFER,
            Intent::Bridge => BRIDGE,
            Intent::Unbridge => UNBRIDGE,
            Intent::Dial => DIAL,
            Intent::Hangup => HANGUP,
            Intent::CreateConference => CREATE_CONFERENCE,
            Intent::ObserveState => OBSERVE_STATE,
        }
    }

    /// Backend methods that must all be present for this binding
    pub fn required_methods(&self) -> &'static [BackendMethod] {
        match self {
            EndpointHold => &[BackendMethod::HoldCall],
            ReinviteHold | ReinviteUnhold => &[BackendMethod::Reinvite],
            EndpointUnhold => &[BackendMethod::UnholdCall],
            EndpointTransfer => &[BackendMethod::XferCall],
            DialogRefer => &[BackendMethod::Refer],
            AttendedTransfer => &[BackendMethod::AttendedTransfer],
            TransferWithConsultation => &[BackendMethod::TransferWithConsultation],
            ConferenceConnect => &[BackendMethod::ConferenceConnect],
            JoinConference => &[BackendMethod::JoinConference],
            MediaBridge => &[BackendMethod::MediaBridge],
            ManualMix => &[BackendMethod::UnholdCall, BackendMethod::MixingStatus],
            ConferenceDisconnect => &[BackendMethod::ConferenceDisconnect],
            MakeCall => &[BackendMethod::MakeCall],
            EndpointHangup => &[BackendMethod::HangupCall],
            DialogTerminate => &[BackendMethod::TerminateDialog],
            NativeConference => &[BackendMethod::CreateConference],
            EventStream => &[BackendMethod::StateEvents],
            StatePolling => &[BackendMethod::StateQuery],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointHold => "endpoint_hold",
            ReinviteHold => "reinvite_hold",
            EndpointUnhold => "endpoint_unhold",
            ReinviteUnhold => "reinvite_unhold",
            EndpointTransfer => "endpoint_transfer",
            DialogRefer => "dialog_refer",
            AttendedTransfer => "attended_transfer",
            TransferWithConsultation => "transfer_with_consultation",
            ConferenceConnect => "conference_connect",
            JoinConference => "join_conference",
            MediaBridge => "media_bridge",
            ManualMix => "manual_mix",
            ConferenceDisconnect => "conference_disconnect",
            MakeCall => "make_call",
            EndpointHangup => "endpoint_hangup",
            DialogTerminate => "dialog_terminate",
            NativeConference => "native_conference",
            EventStream => "event_stream",
            StatePolling => "state_polling",
        }
    }
}

impl fmt::Display for CapabilityBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One binding that was tried and did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingFailure {
    pub binding: CapabilityBinding,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl BindingFailure {
    pub fn new(binding: CapabilityBinding, reason: String) -> Self {
        Self {
            binding,
            reason,
            at: Utc::now(),
        }
    }
}

impl fmt::Display for BindingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.binding, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_INTENTS: [Intent; 10] = [
        Intent::Hold,
        Intent::Unhold,
        Intent::Transfer,
        Intent::ConsultTransfer,
        Intent::Bridge,
        Intent::Unbridge,
        Intent::Dial,
        Intent::Hangup,
        Intent::CreateConference,
        Intent::ObserveState,
    ];

    #[test]
    fn test_every_intent_has_bindings() {
        for intent in ALL_INTENTS {
            let ranked = CapabilityBinding::ranked(intent);
            assert!(!ranked.is_empty(), "{} has no bindings", intent);
            for binding in ranked {
                assert!(!binding.required_methods().is_empty());
            }
        }
    }

    #[test]
    fn test_bindings_belong_to_one_intent() {
        let mut seen = std::collections::HashSet::new();
        for intent in ALL_INTENTS {
            for binding in CapabilityBinding::ranked(intent) {
                assert!(seen.insert(*binding), "{} listed twice", binding);
            }
        }
    }

    #[test]
    fn test_manual_mix_is_last_resort() {
        assert_eq!(CapabilityBinding::ranked(Intent::Bridge).last(), Some(&ManualMix));
        assert_eq!(CapabilityBinding::ranked(Intent::Bridge).first(), Some(&ConferenceConnect));
    }
}
