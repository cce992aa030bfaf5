//! Capability prober

use crate::domain::backend::SignalingBackend;
use crate::domain::capability::binding::{CapabilityBinding, Intent};
use tracing::debug;

/// Resolves the bindings a backend handle can currently serve
///
/// Probing is done per call because a handle's surface can change across
/// reconnects. An empty result means the intent cannot be realized at all.
pub struct CapabilityProber;

impl CapabilityProber {
    pub fn probe(backend: &dyn SignalingBackend, intent: Intent) -> Vec<CapabilityBinding> {
        let bindings: Vec<CapabilityBinding> = CapabilityBinding::ranked(intent)
            .iter()
            .copied()
            .filter(|binding| {
                binding
                    .required_methods()
                    .iter()
                    .all(|method| backend.supports(*method))
            })
            .collect();

        debug!("Probed {}: {:?}", intent, bindings);
        bindings
    }
}
