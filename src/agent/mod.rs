//! In-VM OAuth agent.
//!
//! Runs inside every browser VM. Drives a provider's login CLI on a
//! pseudo-terminal, learns the authorization URL, opens it in the VM's
//! browser, and hands the resulting credential file to the orchestrator.

pub mod automaton;
pub mod browser;
pub mod launcher;
pub mod registry;
pub mod server;
pub mod url_capture;

pub use server::{router, serve, AgentState};
