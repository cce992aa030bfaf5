//! Audio route controllers

use crate::domain::audio_route::{AudioRouteController, AudioRouteState};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

/// Controller for hosts without audio hardware: records and logs the route
#[derive(Default)]
pub struct LoggingAudioController {
    applied: RwLock<AudioRouteState>,
}

impl LoggingAudioController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route as last applied
    pub async fn applied(&self) -> AudioRouteState {
        *self.applied.read().await
    }
}

#[async_trait]
impl AudioRouteController for LoggingAudioController {
    async fn set_speaker(&self, enabled: bool) -> Result<(), String> {
        info!("Audio route: speaker {}", if enabled { "on" } else { "off" });
        self.applied.write().await.speaker = enabled;
        Ok(())
    }

    async fn set_microphone_muted(&self, muted: bool) -> Result<(), String> {
        info!("Audio route: microphone {}", if muted { "muted" } else { "live" });
        self.applied.write().await.microphone_muted = muted;
        Ok(())
    }

    async fn reset_to_default(&self) -> Result<(), String> {
        info!("Audio route reset");
        *self.applied.write().await = AudioRouteState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_clears_applied_route() {
        let controller = LoggingAudioController::new();

        let applied = tokio_test::block_on(async {
            controller.set_speaker(true).await.unwrap();
            controller.set_microphone_muted(true).await.unwrap();
            controller.applied().await
        });
        assert!(applied.speaker);
        assert!(applied.microphone_muted);

        let applied = tokio_test::block_on(async {
            controller.reset_to_default().await.unwrap();
            controller.applied().await
        });
        assert_eq!(applied, AudioRouteState::default());
    }
}
