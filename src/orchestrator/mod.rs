//! Session orchestration modules.
//!
//! Covers VM provisioning, readiness gating, the per-session login
//! pipeline, credential handoff, and grace-period VM teardown.

pub mod agent_client;
pub mod cleanup;
pub mod display;
mod pipeline;
pub mod readiness;
pub mod service;
pub mod session_cache;
pub mod vm_provider;

pub use service::AuthService;
