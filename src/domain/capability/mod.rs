//! Capability bindings and runtime probing of the backend surface

pub mod binding;
pub mod prober;

pub use binding::{BackendMethod, BindingFailure, CapabilityBinding, Intent};
pub use prober::CapabilityProber;
