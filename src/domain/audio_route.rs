//! Audio route controller port and the desired-state holder in front of it
//!
//! Speaker routing and microphone mute are process-wide. Transfer and
//! conference logic both change them, so every change is applied to the last
//! desired state and the whole state is pushed to the controller.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Platform audio routing
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait AudioRouteController: Send + Sync {
    async fn set_speaker(&self, enabled: bool) -> Result<(), String>;

    async fn set_microphone_muted(&self, muted: bool) -> Result<(), String>;

    async fn reset_to_default(&self) -> Result<(), String>;
}

/// Desired audio routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioRouteState {
    pub speaker: bool,
    pub microphone_muted: bool,
}

/// Shared audio route with explicit desired state
pub struct AudioRoute {
    controller: Arc<dyn AudioRouteController>,
    desired: Mutex<AudioRouteState>,
}

impl AudioRoute {
    pub fn new(controller: Arc<dyn AudioRouteController>) -> Self {
        Self {
            controller,
            desired: Mutex::new(AudioRouteState::default()),
        }
    }

    /// Read-modify-write the desired state and push it
    ///
    /// Controller failures are logged; they never fail call control.
    pub async fn update<F>(&self, change: F) -> AudioRouteState
    where
        F: FnOnce(&mut AudioRouteState),
    {
        let mut desired = self.desired.lock().await;
        change(&mut desired);
        let state = *desired;

        debug!("Asserting audio route {:?}", state);
        if let Err(e) = self.controller.set_speaker(state.speaker).await {
            warn!("Failed to set speaker={}: {}", state.speaker, e);
        }
        if let Err(e) = self.controller.set_microphone_muted(state.microphone_muted).await {
            warn!("Failed to set microphone_muted={}: {}", state.microphone_muted, e);
        }

        state
    }

    pub async fn set_speaker(&self, enabled: bool) -> AudioRouteState {
        self.update(|route| route.speaker = enabled).await
    }

    pub async fn set_microphone_muted(&self, muted: bool) -> AudioRouteState {
        self.update(|route| route.microphone_muted = muted).await
    }

    /// Back to the platform default route, mic live
    pub async fn reset(&self) {
        let mut desired = self.desired.lock().await;
        *desired = AudioRouteState::default();

        if let Err(e) = self.controller.reset_to_default().await {
            warn!("Failed to reset audio route: {}", e);
        }
    }

    pub async fn desired(&self) -> AudioRouteState {
        *self.desired.lock().await
    }
}
