#![forbid(unsafe_code)]

//! VM-isolated OAuth login automation for CLI coding assistants.
//!
//! The orchestrator provisions a throwaway browser VM per login, drives the
//! provider's CLI inside it through the in-VM agent, stores the resulting
//! credentials encrypted, and injects them into the user's worker VM.

pub mod agent;
pub mod api;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod protocol;

pub use config::{AgentConfig, GlobalConfig};
pub use errors::{AppError, Result};
