//! Per-session provisioning and login pipeline.
//!
//! ```text
//! started ─► vm_created ─► ready ─► awaiting_user_auth ─► completed
//!    └──────────┴────────────┴───────────┴──► failed | timeout | cancelled
//! ```
//!
//! The pipeline runs in its own task. Provisioning calls, the readiness gate,
//! and every agent round-trip race the session's cancellation token. Storing
//! and transferring credentials does not: once the payload is fetched those
//! steps run to completion so a mount is never abandoned.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::display::display_url;
use super::readiness::{wait_until_ready, ReadinessPolicy};
use super::service::AuthService;
use crate::credentials::fanout::is_empty_payload;
use crate::models::provider::Provider;
use crate::models::session::{Session, SessionStatus};
use crate::models::vm::{VmHandle, VmKind};
use crate::persistence::session_repo::SessionUpdate;
use crate::protocol::DebugOptions;
use crate::AppError;

/// Why a pipeline stopped early.
#[derive(Debug)]
enum Halt {
    /// The session's token was cancelled.
    Cancelled,
    /// A step failed.
    Failed(AppError),
}

impl From<AppError> for Halt {
    fn from(err: AppError) -> Self {
        Self::Failed(err)
    }
}

type Flow<T> = std::result::Result<T, Halt>;

/// VM bookkeeping carried through one pipeline run.
#[derive(Debug, Default)]
struct FlowState {
    vm_id: Option<String>,
    vm_recorded: bool,
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    step: impl Future<Output = crate::Result<T>>,
) -> Flow<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Halt::Cancelled),
        result = step => result.map_err(Halt::Failed),
    }
}

impl AuthService {
    /// Drive one session from `started` to a terminal status.
    pub(super) async fn run_pipeline(&self, session: Session, cancel: CancellationToken) {
        let mut state = FlowState::default();
        let outcome = self.provision_and_authenticate(&session, &cancel, &mut state).await;

        self.tasks.lock().await.remove(&session.id);

        let outcome = match outcome {
            Err(Halt::Failed(_)) if cancel.is_cancelled() => Err(Halt::Cancelled),
            other => other,
        };

        match outcome {
            Ok(()) => {
                self.finish(&session.id, SessionStatus::Completed, SessionUpdate::default(), &state)
                    .await;
            }
            Err(Halt::Cancelled) => {
                info!("pipeline stopped by cancellation");
                self.cache.remove(&session.id).await;
                if let (Some(vm_id), false) = (state.vm_id.as_deref(), state.vm_recorded) {
                    self.teardown_now(&session.id, vm_id).await;
                }
            }
            Err(Halt::Failed(err)) => {
                let status = if err.is_timeout() {
                    SessionStatus::Timeout
                } else {
                    SessionStatus::Failed
                };
                error!(%err, status = status.as_str(), "authentication pipeline failed");
                self.finish(&session.id, status, SessionUpdate::error(err.to_string()), &state)
                    .await;
            }
        }
    }

    async fn finish(
        &self,
        session_id: &str,
        status: SessionStatus,
        update: SessionUpdate,
        state: &FlowState,
    ) {
        match self.sessions.transition(session_id, status, update).await {
            Ok(session) => self.cache.upsert(&session).await,
            Err(err) => {
                // Whoever set the terminal status first owns the VM teardown.
                warn!(%err, status = status.as_str(), "terminal status not recorded");
                self.cache.remove(session_id).await;
                return;
            }
        }

        if let Some(vm_id) = state.vm_id.as_deref() {
            self.schedule_cleanup(session_id, vm_id, status).await;
        }
    }

    async fn provision_and_authenticate(
        &self,
        session: &Session,
        cancel: &CancellationToken,
        state: &mut FlowState,
    ) -> Flow<()> {
        let vm = self.provision(session, cancel, state).await?;
        let credentials = self
            .execute_oauth_flow(&session.id, session.provider, &vm.ip_address, cancel)
            .await?;

        self.store_credentials(&session.user_id, session.provider, &credentials)
            .await?;
        self.transfer_credentials_to_worker(&session.user_id, session.provider, &credentials)
            .await?;
        Ok(())
    }

    async fn provision(
        &self,
        session: &Session,
        cancel: &CancellationToken,
        state: &mut FlowState,
    ) -> Flow<VmHandle> {
        let user_id = session.user_id.as_str();

        let worker = until_cancelled(cancel, self.vms.find_worker_vm(user_id)).await?;
        match worker {
            Some(worker) => debug!(vm_id = %worker.vm_id, "reusing worker vm"),
            None => {
                let worker = until_cancelled(cancel, async {
                    self.vms
                        .provision_worker_vm(user_id)
                        .await
                        .map_err(as_provisioning)
                })
                .await?;
                info!(vm_id = %worker.vm_id, "worker vm provisioned");
            }
        }

        let vm = until_cancelled(cancel, async {
            self.vms
                .create_vm(user_id, VmKind::Browser, Some(&session.id))
                .await
                .map_err(as_provisioning)
        })
        .await?;
        state.vm_id = Some(vm.vm_id.clone());
        info!(vm_id = %vm.vm_id, vm_ip = %vm.ip_address, "ephemeral vm created");

        until_cancelled(cancel, async {
            self.vms
                .associate_session(&session.id, &vm.vm_id, &vm.ip_address)
                .await
                .map_err(as_provisioning)
        })
        .await?;

        let display = display_url(
            self.config.display_url_template.as_deref(),
            &self.config.public_base_url,
            &session.id,
            &vm.ip_address,
        );
        let updated = self
            .sessions
            .transition(
                &session.id,
                SessionStatus::VmCreated,
                SessionUpdate {
                    ephemeral_vm_id: Some(vm.vm_id.clone()),
                    vm_ip: Some(vm.ip_address.clone()),
                    display_url: Some(display),
                    ..SessionUpdate::default()
                },
            )
            .await?;
        state.vm_recorded = true;
        self.cache.upsert(&updated).await;

        let policy = ReadinessPolicy::from(&self.config.timeouts);
        until_cancelled(cancel, async {
            wait_until_ready(&self.agent, &vm.ip_address, policy)
                .await
                .map_err(as_provisioning)
        })
        .await?;

        let updated = self
            .sessions
            .transition(&session.id, SessionStatus::Ready, SessionUpdate::default())
            .await?;
        self.cache.upsert(&updated).await;
        Ok(vm)
    }

    /// Start the CLI login in the VM, wait for the user, and fetch the payload.
    async fn execute_oauth_flow(
        &self,
        session_id: &str,
        provider: Provider,
        vm_ip: &str,
        cancel: &CancellationToken,
    ) -> Flow<Value> {
        let debug = &self.config.debug;
        let debug_opts = debug.forwards_to_agent().then_some(DebugOptions {
            run_strace: debug.run_strace,
            skip_connectivity_checks: debug.skip_connectivity_checks,
        });

        let started = until_cancelled(
            cancel,
            self.agent.start_auth(vm_ip, provider, session_id, debug_opts),
        )
        .await?;
        if !started.success {
            return Err(AppError::Agent(format!("start-auth refused: {}", started.message)).into());
        }

        let mut url_known = false;
        if let Some(url) = started.oauth_url {
            self.surface_auth_url(session_id, url).await?;
            url_known = true;
        } else {
            debug!(
                cli_output = started.cli_output.as_deref().unwrap_or_default(),
                "cli started without oauth url"
            );
        }

        let budget = Duration::from_millis(self.config.timeouts.oauth_budget_ms);
        let interval = Duration::from_millis(self.config.timeouts.oauth_poll_interval_ms);
        if let Ok(span) = chrono::Duration::from_std(budget) {
            if let Err(err) = self.sessions.set_timeout_at(session_id, Utc::now() + span).await {
                warn!(%err, "timeout_at not recorded");
            }
        }

        let deadline = Instant::now() + budget;
        loop {
            if Instant::now() >= deadline {
                return Err(AppError::Timeout("OAuth timeout".into()).into());
            }
            until_cancelled(cancel, async {
                tokio::time::sleep(interval).await;
                Ok(())
            })
            .await?;

            if !url_known {
                url_known = self.try_surface_late_url(session_id, vm_ip).await?;
            }

            match until_cancelled(cancel, self.agent.credential_status(vm_ip, session_id)).await {
                Ok(status) if status.authenticated => break,
                Ok(_) => {}
                Err(Halt::Failed(err)) => debug!(%err, "credential status poll failed"),
                Err(Halt::Cancelled) => return Err(Halt::Cancelled),
            }
        }
        info!("user completed provider login");

        let fetched = until_cancelled(cancel, self.agent.get_credentials(vm_ip, session_id)).await?;
        if !fetched.success || is_empty_payload(&fetched.credentials) {
            return Err(AppError::Agent("agent returned no credentials".into()).into());
        }
        Ok(fetched.credentials)
    }

    async fn surface_auth_url(&self, session_id: &str, url: String) -> Flow<()> {
        info!(auth_url = %url, "oauth url captured");
        let updated = self
            .sessions
            .transition(
                session_id,
                SessionStatus::AwaitingUserAuth,
                SessionUpdate {
                    auth_url: Some(url),
                    ..SessionUpdate::default()
                },
            )
            .await?;
        self.cache.upsert(&updated).await;
        Ok(())
    }

    /// Ask the agent for a URL captured after `start-auth` returned.
    async fn try_surface_late_url(&self, session_id: &str, vm_ip: &str) -> Flow<bool> {
        let Ok((status, body)) = self.agent.oauth_url(vm_ip, session_id).await else {
            return Ok(false);
        };
        if status != reqwest::StatusCode::OK {
            return Ok(false);
        }
        match body.get("oauthUrl").and_then(Value::as_str) {
            Some(url) => {
                self.surface_auth_url(session_id, url.to_owned()).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn as_provisioning(err: AppError) -> AppError {
    match err {
        AppError::Provisioning(_) => err,
        other => AppError::Provisioning(other.to_string()),
    }
}
