//! Shared harness for engine integration tests

#![allow(dead_code)]

use softphone_engine::config::Config;
use softphone_engine::domain::history::{HistoryRecord, LegHistoryEntry};
use softphone_engine::domain::leg::LegState;
use softphone_engine::domain::shared::value_objects::LegId;
use softphone_engine::infrastructure::{InMemoryHistorySink, LoggingAudioController, SimulatedBackend};
use softphone_engine::interface::{EngineNotice, NoticeEnvelope};
use softphone_engine::SoftphoneEngine;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub struct Harness {
    pub engine: SoftphoneEngine,
    pub backend: Arc<SimulatedBackend>,
    pub history: Arc<InMemoryHistorySink>,
    pub audio: Arc<LoggingAudioController>,
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.sip.domain = "pbx.local".to_string();
    config.timeouts.operation_ms = 500;
    config.timeouts.connect_ms = 400;
    config.polling.interval_ms = 10;
    config.polling.max_attempts = 100;
    config
}

pub fn harness() -> Harness {
    harness_with(SimulatedBackend::new())
}

pub fn harness_with(backend: SimulatedBackend) -> Harness {
    let backend = Arc::new(backend);
    let history = Arc::new(InMemoryHistorySink::new());
    let audio = Arc::new(LoggingAudioController::new());
    let engine = SoftphoneEngine::new(
        test_config(),
        backend.clone(),
        audio.clone(),
        history.clone(),
    );

    Harness {
        engine,
        backend,
        history,
        audio,
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

impl Harness {
    pub async fn state(&self, leg: &LegId) -> Option<LegState> {
        self.engine.leg_state(leg).await
    }

    pub async fn wait_for(&self, leg: &LegId, expected: LegState) {
        let reached = wait_until(|| async move { self.state(leg).await == Some(expected) }).await;
        assert!(reached, "leg {} never reached {}, it is {:?}", leg, expected, self.state(leg).await);
    }

    /// Inbound call answered by the user
    pub async fn connected_inbound(&self, remote: &str) -> LegId {
        let leg = self.backend.inject_incoming(remote);
        self.wait_for(&leg, LegState::Ringing).await;
        self.backend.connect(&leg);
        self.wait_for(&leg, LegState::Connected).await;
        leg
    }

    /// Outbound call that the far end answered
    pub async fn connected_outbound(&self, target: &str) -> LegId {
        let leg = self.engine.place_call(target).await.unwrap();
        self.wait_for(&leg, LegState::Connected).await;
        leg
    }

    /// History entries for one leg, once delivered
    pub async fn leg_history(&self, leg: &LegId) -> Vec<LegHistoryEntry> {
        wait_until(|| async move { !self.collect_leg_history(leg).await.is_empty() }).await;
        self.collect_leg_history(leg).await
    }

    async fn collect_leg_history(&self, leg: &LegId) -> Vec<LegHistoryEntry> {
        self.history
            .records()
            .await
            .into_iter()
            .filter_map(|record| match record {
                HistoryRecord::Leg(entry) if &entry.leg_id == leg => Some(entry),
                _ => None,
            })
            .collect()
    }
}

/// Everything received so far
pub fn drain(rx: &mut broadcast::Receiver<NoticeEnvelope>) -> Vec<EngineNotice> {
    let mut notices = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        notices.push(envelope.notice);
    }
    notices
}
