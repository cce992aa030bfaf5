//! Transfer state machine integration tests

mod common;

use common::{drain, harness, wait_until, Harness};
use softphone_engine::domain::capability::BackendMethod;
use softphone_engine::domain::conference::ConferencePhase;
use softphone_engine::domain::history::HistoryRecord;
use softphone_engine::domain::leg::{LegOutcome, LegState};
use softphone_engine::domain::shared::value_objects::{LegId, TransferId};
use softphone_engine::domain::transfer::{ActiveSide, TransferPhase, TransferView};
use softphone_engine::infrastructure::DialBehavior;
use softphone_engine::interface::EngineNotice;
use softphone_engine::DomainError;

/// Caller on the line, consultation with 1002 answered
async fn consulting(h: &Harness) -> (LegId, LegId, TransferView) {
    let caller = h.connected_inbound("sip:2000@pbx.local").await;
    let view = h
        .engine
        .transfers()
        .begin_attended(&caller, "1002")
        .await
        .unwrap();
    assert_eq!(view.phase, TransferPhase::Consulting);

    let consult = view.consult_leg.clone().unwrap();
    h.wait_for(&consult, LegState::Connected).await;
    (caller, consult, view)
}

/// Consultation promoted to a two-party conference
async fn promoted(h: &Harness) -> (LegId, LegId, TransferView) {
    let (caller, consult, view) = consulting(h).await;
    let ready = h
        .engine
        .transfers()
        .promote_to_conference(view.id)
        .await
        .unwrap();
    assert_eq!(ready.phase, TransferPhase::Ready);
    (caller, consult, ready)
}

/// Phase once the attempt is terminal and its history record is out
async fn settled(h: &Harness, id: TransferId) -> TransferPhase {
    let history = h.history.clone();
    let recorded = wait_until(|| {
        let history = history.clone();
        async move {
            history.records().await.iter().any(|record| {
                matches!(record, HistoryRecord::Transfer(entry) if entry.transfer_id == id)
            })
        }
    })
    .await;
    assert!(recorded, "transfer {} wrote no history", id);

    let phase = h.engine.transfers().get(id).await.unwrap().phase;
    assert!(phase.is_terminal());
    assert!(h.engine.transfers().active().await.is_empty());
    assert_eq!(
        h.engine.status().borrow().transfer(id).map(|t| t.phase),
        Some(phase)
    );
    phase
}

fn position(h: &Harness, method: BackendMethod, leg: &LegId) -> Option<usize> {
    h.backend
        .calls()
        .iter()
        .position(|call| call.method == method && call.legs.contains(leg))
}

#[tokio::test]
async fn test_unattended_transfer_completes() {
    let h = harness();
    let caller = h.connected_inbound("sip:2000@pbx.local").await;

    let view = h
        .engine
        .transfers()
        .begin_unattended(&caller, "1004")
        .await
        .unwrap();

    assert_eq!(view.phase, TransferPhase::Completed);
    assert_eq!(h.state(&caller).await, Some(LegState::Disconnected));

    let xfer = h.backend.calls_to(BackendMethod::XferCall);
    assert_eq!(xfer.len(), 1);
    assert_eq!(xfer[0].target.as_deref(), Some("sip:1004@pbx.local"));

    let history = h.leg_history(&caller).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, LegOutcome::Transferred);
}

#[tokio::test]
async fn test_unattended_transfer_falls_back_to_refer() {
    let h = harness();
    h.backend.fail(BackendMethod::XferCall);
    let caller = h.connected_inbound("sip:2000@pbx.local").await;

    let view = h
        .engine
        .transfers()
        .begin_unattended(&caller, "1004")
        .await
        .unwrap();

    assert_eq!(view.phase, TransferPhase::Completed);
    assert_eq!(h.backend.calls_to(BackendMethod::Refer).len(), 1);
    // The failed first binding is still on record
    assert_eq!(view.failures.len(), 1);
    assert!(view.failures[0].contains("endpoint_transfer"));
}

#[tokio::test]
async fn test_slow_binding_times_out_and_falls_through() {
    let h = harness();
    h.backend
        .set_latency(BackendMethod::XferCall, std::time::Duration::from_secs(5));
    let caller = h.connected_inbound("sip:2000@pbx.local").await;

    let view = h
        .engine
        .transfers()
        .begin_unattended(&caller, "1004")
        .await
        .unwrap();

    assert_eq!(view.phase, TransferPhase::Completed);
    assert_eq!(view.failures.len(), 1);
    assert!(view.failures[0].contains("no answer within 500ms"));
    assert_eq!(h.backend.calls_to(BackendMethod::Refer).len(), 1);
}

#[tokio::test]
async fn test_exhausted_unattended_transfer_leaves_caller_connected() {
    let h = harness();
    h.backend.fail(BackendMethod::XferCall);
    h.backend.fail(BackendMethod::Refer);
    let caller = h.connected_inbound("sip:2000@pbx.local").await;
    let mut notices = h.engine.notices();

    let view = h
        .engine
        .transfers()
        .begin_unattended(&caller, "1004")
        .await
        .unwrap();

    assert_eq!(view.phase, TransferPhase::Failed);
    assert!(view.retry_possible());
    assert_eq!(view.failures.len(), 2);
    assert_eq!(h.state(&caller).await, Some(LegState::Connected));

    let failed = drain(&mut notices).into_iter().find_map(|notice| match notice {
        EngineNotice::TransferFailed { retry_possible, .. } => Some(retry_possible),
        _ => None,
    });
    assert_eq!(failed, Some(true));

    // A fresh attempt can take the same leg once the backend recovers
    h.backend.recover(BackendMethod::Refer);
    let retry = h
        .engine
        .transfers()
        .begin_unattended(&caller, "1004")
        .await
        .unwrap();
    assert_eq!(retry.phase, TransferPhase::Completed);
}

#[tokio::test]
async fn test_transfer_requires_connected_leg() {
    let h = harness();
    let caller = h.connected_inbound("sip:2000@pbx.local").await;
    h.engine.hold(&caller).await.unwrap();

    let result = h.engine.transfers().begin_unattended(&caller, "1004").await;
    assert!(matches!(result, Err(DomainError::PreconditionViolation(_))));
    assert!(h.engine.transfers().active().await.is_empty());
    assert_eq!(h.state(&caller).await, Some(LegState::OnHold));
    assert!(h.backend.calls_to(BackendMethod::XferCall).is_empty());
}

#[tokio::test]
async fn test_leg_in_conference_cannot_be_transferred() {
    let h = harness();
    let caller = h.connected_inbound("sip:2000@pbx.local").await;
    h.engine.start_conference(&caller).await.unwrap();

    let result = h.engine.transfers().begin_attended(&caller, "1002").await;
    assert!(matches!(result, Err(DomainError::Conflict(_))));
    assert!(h.backend.calls_to(BackendMethod::MakeCall).is_empty());
}

#[tokio::test]
async fn test_attended_transfer_through_consultation_binding() {
    let h = harness();
    let (caller, consult, view) = consulting(&h).await;

    // The consult leg is dialed only after the caller is held
    let held = position(&h, BackendMethod::HoldCall, &caller).unwrap();
    let dialed = h
        .backend
        .calls()
        .iter()
        .position(|call| call.method == BackendMethod::MakeCall)
        .unwrap();
    assert!(held < dialed);

    let done = h.engine.transfers().complete(view.id).await.unwrap();
    assert_eq!(done.phase, TransferPhase::Completed);
    assert_eq!(h.state(&caller).await, Some(LegState::Disconnected));
    assert_eq!(h.state(&consult).await, Some(LegState::Disconnected));
    assert_eq!(h.backend.calls_to(BackendMethod::AttendedTransfer).len(), 1);

    let history = h.leg_history(&caller).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, LegOutcome::Transferred);
}

#[tokio::test]
async fn test_consult_never_dialed_when_hold_fails() {
    let h = harness();
    h.backend.fail(BackendMethod::HoldCall);
    h.backend.fail(BackendMethod::Reinvite);
    let caller = h.connected_inbound("sip:2000@pbx.local").await;

    let view = h
        .engine
        .transfers()
        .begin_attended(&caller, "1002")
        .await
        .unwrap();

    assert_eq!(view.phase, TransferPhase::Failed);
    assert!(view.consult_leg.is_none());
    assert!(h.backend.calls_to(BackendMethod::MakeCall).is_empty());
    assert_eq!(h.state(&caller).await, Some(LegState::Connected));
}

#[tokio::test]
async fn test_dial_failure_unholds_original() {
    let h = harness();
    h.backend.fail(BackendMethod::MakeCall);
    let caller = h.connected_inbound("sip:2000@pbx.local").await;

    let view = h
        .engine
        .transfers()
        .begin_attended(&caller, "1002")
        .await
        .unwrap();

    assert_eq!(view.phase, TransferPhase::Failed);
    assert_eq!(h.state(&caller).await, Some(LegState::Connected));
    assert!(view.last_error.unwrap().contains("dial"));
}

#[tokio::test]
async fn test_switch_active_twice_restores_active_leg() {
    let h = harness();
    let (caller, consult, view) = consulting(&h).await;
    assert_eq!(view.active_side, ActiveSide::Consult);

    let switched = h.engine.transfers().switch_active(view.id).await.unwrap();
    assert_eq!(switched.active_side, ActiveSide::Original);
    assert_eq!(h.state(&caller).await, Some(LegState::Connected));
    assert_eq!(h.state(&consult).await, Some(LegState::OnHold));

    // Hold came before unhold
    let hold = position(&h, BackendMethod::HoldCall, &consult).unwrap();
    let unhold = position(&h, BackendMethod::UnholdCall, &caller).unwrap();
    assert!(hold < unhold);

    let back = h.engine.transfers().switch_active(view.id).await.unwrap();
    assert_eq!(back.active_side, ActiveSide::Consult);
    assert_eq!(h.state(&caller).await, Some(LegState::OnHold));
    assert_eq!(h.state(&consult).await, Some(LegState::Connected));
}

#[tokio::test]
async fn test_switch_active_rolls_back_when_unhold_fails() {
    let h = harness();
    let (caller, consult, view) = consulting(&h).await;
    h.backend.fail(BackendMethod::UnholdCall);
    h.backend.fail(BackendMethod::Reinvite);

    let result = h.engine.transfers().switch_active(view.id).await;
    assert!(matches!(result, Err(DomainError::CapabilityExhausted { .. })));

    let view = h.engine.transfers().get(view.id).await.unwrap();
    assert_eq!(view.phase, TransferPhase::Consulting);
    assert_eq!(view.active_side, ActiveSide::Consult);
    assert_eq!(h.state(&caller).await, Some(LegState::OnHold));
    // Held by the switch, rollback could not unhold it either
    assert_eq!(h.state(&consult).await, Some(LegState::OnHold));
    assert!(!view.warnings.is_empty());
}

#[tokio::test]
async fn test_bridge_fallback_releases_consult_after_confirmation() {
    let h = harness();
    h.backend.set_supported(BackendMethod::AttendedTransfer, false);
    h.backend.set_supported(BackendMethod::TransferWithConsultation, false);
    let (caller, consult, view) = consulting(&h).await;

    let done = h.engine.transfers().complete(view.id).await.unwrap();
    assert_eq!(done.phase, TransferPhase::Completed);

    let bridged = position(&h, BackendMethod::ConferenceConnect, &consult).unwrap();
    let released = position(&h, BackendMethod::HangupCall, &consult).unwrap();
    assert!(bridged < released);

    assert_eq!(h.state(&consult).await, Some(LegState::Disconnected));
    assert_eq!(h.state(&caller).await, Some(LegState::Connected));
    let history = h.leg_history(&consult).await;
    assert_eq!(history[0].outcome, LegOutcome::Transferred);
}

#[tokio::test]
async fn test_failed_completion_keeps_user_on_consult_leg() {
    let h = harness();
    h.backend.set_supported(BackendMethod::AttendedTransfer, false);
    h.backend.set_supported(BackendMethod::TransferWithConsultation, false);
    h.backend.set_supported(BackendMethod::MixingStatus, false);
    for method in [
        BackendMethod::ConferenceConnect,
        BackendMethod::JoinConference,
        BackendMethod::MediaBridge,
    ] {
        h.backend.fail(method);
    }
    let (caller, consult, view) = consulting(&h).await;

    let done = h.engine.transfers().complete(view.id).await.unwrap();
    assert_eq!(done.phase, TransferPhase::Failed);
    assert_eq!(done.active_side, ActiveSide::Consult);
    assert_eq!(h.state(&caller).await, Some(LegState::OnHold));
    assert_eq!(h.state(&consult).await, Some(LegState::Connected));
    assert!(h.backend.calls_to(BackendMethod::HangupCall).is_empty());
}

#[tokio::test]
async fn test_unconfirmed_mix_is_not_a_bridge() {
    let h = harness();
    h.backend.set_supported(BackendMethod::AttendedTransfer, false);
    h.backend.set_supported(BackendMethod::TransferWithConsultation, false);
    h.backend.set_supported(BackendMethod::MixingStatus, false);
    for method in [
        BackendMethod::ConferenceConnect,
        BackendMethod::JoinConference,
        BackendMethod::MediaBridge,
    ] {
        h.backend.withhold_mixing(method);
    }
    let (_, consult, view) = consulting(&h).await;

    let done = h.engine.transfers().complete(view.id).await.unwrap();
    assert_eq!(done.phase, TransferPhase::Failed);
    assert_eq!(h.state(&consult).await, Some(LegState::Connected));
    assert!(done
        .failures
        .iter()
        .any(|failure| failure.contains("did not confirm mixing")));
}

#[tokio::test]
async fn test_promote_to_conference_then_complete() {
    let h = harness();
    let (caller, consult, view) = consulting(&h).await;

    let ready = h
        .engine
        .transfers()
        .promote_to_conference(view.id)
        .await
        .unwrap();
    assert_eq!(ready.phase, TransferPhase::Ready);
    let conference_id = ready.conference.unwrap();

    let conference = h.engine.conferences().get(conference_id).await.unwrap();
    assert_eq!(conference.participants.len(), 2);
    assert_eq!(h.state(&caller).await, Some(LegState::Connected));
    assert_eq!(h.state(&consult).await, Some(LegState::Connected));
    assert!(h.backend.is_mixed(&caller, &consult));

    let done = h.engine.transfers().complete(view.id).await.unwrap();
    assert_eq!(done.phase, TransferPhase::Completed);
    assert_eq!(h.state(&caller).await, Some(LegState::Disconnected));

    let closed = h.engine.conferences().get(conference_id).await.unwrap();
    assert_eq!(
        closed.phase,
        softphone_engine::domain::conference::ConferencePhase::Terminated
    );
}

#[tokio::test]
async fn test_cancel_hangs_up_consult_and_unholds_original() {
    let h = harness();
    let (caller, consult, view) = consulting(&h).await;
    h.engine.set_microphone_muted(true).await;

    let cancelled = h.engine.transfers().cancel(view.id).await.unwrap();
    assert_eq!(cancelled.phase, TransferPhase::Cancelled);
    assert_eq!(h.state(&consult).await, Some(LegState::Disconnected));
    assert_eq!(h.state(&caller).await, Some(LegState::Connected));
    assert!(!h.audio.applied().await.microphone_muted);

    let history = h.leg_history(&consult).await;
    assert_eq!(history[0].outcome, LegOutcome::Cancelled);

    // Terminal attempts reject further operations
    assert!(matches!(
        h.engine.transfers().cancel(view.id).await,
        Err(DomainError::InvalidStateTransition(_))
    ));
    assert!(matches!(
        h.engine.transfers().complete(view.id).await,
        Err(DomainError::InvalidStateTransition(_))
    ));
}

#[tokio::test]
async fn test_cancel_while_consult_is_ringing() {
    let h = harness();
    h.backend.set_dial_behavior("1002", DialBehavior::NeverAnswer);
    let caller = h.connected_inbound("sip:2000@pbx.local").await;

    let view = h
        .engine
        .transfers()
        .begin_attended(&caller, "1002")
        .await
        .unwrap();
    let consult = view.consult_leg.clone().unwrap();
    h.wait_for(&consult, LegState::Ringing).await;

    let cancelled = h.engine.transfers().cancel(view.id).await.unwrap();
    assert_eq!(cancelled.phase, TransferPhase::Cancelled);
    assert_eq!(h.state(&consult).await, Some(LegState::Disconnected));
    assert_eq!(h.state(&caller).await, Some(LegState::Connected));
}

#[tokio::test]
async fn test_cancel_interrupts_pending_completion() {
    let h = harness();
    h.backend.set_dial_behavior("1002", DialBehavior::NeverAnswer);
    let caller = h.connected_inbound("sip:2000@pbx.local").await;
    let view = h
        .engine
        .transfers()
        .begin_attended(&caller, "1002")
        .await
        .unwrap();

    let transfers = h.engine.transfers().clone();
    let id = view.id;
    let completing = tokio::spawn(async move { transfers.complete(id).await });

    let transfers = h.engine.transfers().clone();
    assert!(
        wait_until(|| {
            let transfers = transfers.clone();
            async move {
                transfers.get(id).await.map(|v| v.phase) == Some(TransferPhase::Completing)
            }
        })
        .await
    );

    let cancelled = h.engine.transfers().cancel(id).await.unwrap();
    assert_eq!(cancelled.phase, TransferPhase::Cancelled);
    assert!(matches!(
        completing.await.unwrap(),
        Err(DomainError::Cancelled)
    ));
    assert_eq!(h.state(&caller).await, Some(LegState::Connected));
}

#[tokio::test]
async fn test_completion_times_out_when_consult_never_answers() {
    let h = harness();
    h.backend.set_dial_behavior("1002", DialBehavior::NeverAnswer);
    let caller = h.connected_inbound("sip:2000@pbx.local").await;
    let view = h
        .engine
        .transfers()
        .begin_attended(&caller, "1002")
        .await
        .unwrap();
    let consult = view.consult_leg.clone().unwrap();

    let done = h.engine.transfers().complete(view.id).await.unwrap();
    assert_eq!(done.phase, TransferPhase::Failed);
    assert!(done.last_error.unwrap().contains("Timed out"));
    assert_eq!(h.state(&caller).await, Some(LegState::Connected));
    assert_eq!(h.state(&consult).await, Some(LegState::Disconnected));
}

#[tokio::test]
async fn test_consult_hangup_cancels_attempt() {
    let h = harness();
    let (caller, consult, view) = consulting(&h).await;

    h.backend.remote_hangup(&consult);

    let transfers = h.engine.transfers().clone();
    let id = view.id;
    assert!(
        wait_until(|| {
            let transfers = transfers.clone();
            async move { transfers.get(id).await.map(|v| v.phase) == Some(TransferPhase::Cancelled) }
        })
        .await
    );
    h.wait_for(&caller, LegState::Connected).await;
}

#[tokio::test]
async fn test_original_hangup_fails_attempt() {
    let h = harness();
    let (caller, consult, view) = consulting(&h).await;

    h.backend.remote_hangup(&caller);

    let transfers = h.engine.transfers().clone();
    let id = view.id;
    assert!(
        wait_until(|| {
            let transfers = transfers.clone();
            async move { transfers.get(id).await.map(|v| v.phase) == Some(TransferPhase::Failed) }
        })
        .await
    );
    assert_eq!(h.state(&consult).await, Some(LegState::Connected));
}

#[tokio::test]
async fn test_clear_finished_drops_terminal_attempts() {
    let h = harness();
    let caller = h.connected_inbound("sip:2000@pbx.local").await;
    let view = h
        .engine
        .transfers()
        .begin_unattended(&caller, "1004")
        .await
        .unwrap();

    assert!(h.engine.status().borrow().transfer(view.id).is_some());
    assert_eq!(h.engine.transfers().clear_finished().await, 1);
    assert!(h.engine.transfers().get(view.id).await.is_none());
    assert!(h.engine.status().borrow().transfer(view.id).is_none());
}

#[tokio::test]
async fn test_unattended_transfer_cannot_be_cancelled() {
    let h = harness();
    h.backend
        .set_latency(BackendMethod::XferCall, std::time::Duration::from_millis(200));
    let caller = h.connected_inbound("sip:2000@pbx.local").await;

    let transfers = h.engine.transfers().clone();
    let target = caller.clone();
    let completing = tokio::spawn(async move { transfers.begin_unattended(&target, "1004").await });

    let transfers = h.engine.transfers().clone();
    assert!(
        wait_until(|| {
            let transfers = transfers.clone();
            async move { !transfers.active().await.is_empty() }
        })
        .await
    );
    let id = transfers.active().await[0].id;

    assert!(matches!(
        transfers.cancel(id).await,
        Err(DomainError::InvalidStateTransition(_))
    ));
    let done = completing.await.unwrap().unwrap();
    assert_eq!(done.phase, TransferPhase::Completed);
    assert_eq!(h.state(&caller).await, Some(LegState::Disconnected));
}

#[tokio::test]
async fn test_promoted_transfer_fails_when_caller_hangs_up() {
    let h = harness();
    let (caller, consult, ready) = promoted(&h).await;
    let conference_id = ready.conference.unwrap();

    h.backend.remote_hangup(&caller);

    assert_eq!(settled(&h, ready.id).await, TransferPhase::Failed);
    assert_eq!(h.state(&consult).await, Some(LegState::Connected));

    let conference = h.engine.conferences().get(conference_id).await.unwrap();
    assert_eq!(conference.phase, ConferencePhase::Terminated);

    // The survivor is an ordinary call again
    h.engine.hold(&consult).await.unwrap();
    assert_eq!(h.state(&consult).await, Some(LegState::OnHold));
}

#[tokio::test]
async fn test_promoted_transfer_cancelled_when_consult_hangs_up() {
    let h = harness();
    let (caller, consult, ready) = promoted(&h).await;
    let conference_id = ready.conference.unwrap();

    h.backend.remote_hangup(&consult);

    assert_eq!(settled(&h, ready.id).await, TransferPhase::Cancelled);
    assert_eq!(h.state(&caller).await, Some(LegState::Connected));
    let conference = h.engine.conferences().get(conference_id).await.unwrap();
    assert_eq!(conference.phase, ConferencePhase::Terminated);
    h.engine.hold(&caller).await.unwrap();
}

#[tokio::test]
async fn test_promoted_transfer_ends_when_both_parties_leave() {
    let h = harness();
    let (caller, consult, ready) = promoted(&h).await;

    h.backend.remote_hangup(&caller);
    h.backend.remote_hangup(&consult);

    let phase = settled(&h, ready.id).await;
    assert!(matches!(phase, TransferPhase::Failed | TransferPhase::Cancelled));
    h.wait_for(&consult, LegState::Disconnected).await;
}

#[tokio::test]
async fn test_terminating_promoted_conference_cancels_transfer() {
    let h = harness();
    let (caller, consult, ready) = promoted(&h).await;
    let conference_id = ready.conference.unwrap();

    h.engine.conferences().terminate(conference_id).await.unwrap();

    assert_eq!(settled(&h, ready.id).await, TransferPhase::Cancelled);
    assert_eq!(h.state(&caller).await, Some(LegState::Disconnected));
    assert_eq!(h.state(&consult).await, Some(LegState::Disconnected));
}
