//! VM readiness gate.
//!
//! Guest services need time to bind their port after boot, so the first
//! probe is deferred by a warm-up delay. Probes then run on a fixed
//! interval until one answers HTTP 200 or the budget is spent.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use super::agent_client::AgentClient;
use crate::config::TimeoutConfig;
use crate::{AppError, Result};

/// Timing of the readiness gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Delay before the first probe.
    pub warmup: Duration,
    /// Delay between probes.
    pub interval: Duration,
    /// Budget measured from the first probe.
    pub budget: Duration,
    /// Timeout of a single probe.
    pub probe_timeout: Duration,
}

impl From<&TimeoutConfig> for ReadinessPolicy {
    fn from(t: &TimeoutConfig) -> Self {
        Self {
            warmup: Duration::from_millis(t.health_warmup_ms),
            interval: Duration::from_millis(t.health_interval_ms),
            budget: Duration::from_millis(t.health_budget_ms),
            probe_timeout: Duration::from_millis(t.health_probe_timeout_ms),
        }
    }
}

/// Wait until the agent at `vm_ip` answers its health check.
///
/// # Errors
///
/// Returns `AppError::Timeout` if no probe succeeds within the budget.
pub async fn wait_until_ready(
    agent: &AgentClient,
    vm_ip: &str,
    policy: ReadinessPolicy,
) -> Result<()> {
    debug!(vm_ip, warmup_ms = policy.warmup.as_millis(), "readiness warm-up");
    tokio::time::sleep(policy.warmup).await;

    let deadline = Instant::now() + policy.budget;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if agent.is_healthy(vm_ip, policy.probe_timeout).await {
            info!(vm_ip, attempts, "vm ready");
            return Ok(());
        }
        if Instant::now() + policy.interval > deadline {
            return Err(AppError::Timeout(format!(
                "vm {vm_ip} not ready after {attempts} probes"
            )));
        }
        tokio::time::sleep(policy.interval).await;
    }
}
