//! Capability decorators applied around step callbacks.
//!
//! Capabilities are composed once into a [`CapabilityChain`] and apply to
//! every step kind alike, without altering the step's protocol.

mod chain;
mod policy;
mod rollback_info;
pub mod security;

pub use chain::{CallContext, Capability, CapabilityChain};
pub use policy::{PolicyEvaluator, PolicyValidationCapability};
pub use rollback_info::RollbackInfoCapability;
pub use security::{current_principal, Principal, SecurityContextCapability};
