//! Session orchestrator: the entry points behind the HTTP API.
//!
//! [`AuthService::start_authentication`] persists a session and hands the
//! provisioning and login pipeline (see [`super::pipeline`]) to a detached
//! task carrying its own [`CancellationToken`]. Everything else here reads
//! or nudges that state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use super::agent_client::AgentClient;
use super::cleanup::CleanupScheduler;
use super::session_cache::SessionCache;
use super::vm_provider::VmProvider;
use crate::config::GlobalConfig;
use crate::credentials::cipher::CredentialCipher;
use crate::credentials::store::CredentialStore;
use crate::credentials::transfer::{CredentialInjector, ImageMounter};
use crate::models::credential::{CredentialSlot, CredentialSummary, StoredCredential, ValidationReport};
use crate::models::provider::Provider;
use crate::models::session::{Session, SessionStatus};
use crate::models::vm::VmState;
use crate::persistence::cleanup_repo::CleanupRepo;
use crate::persistence::credential_repo::CredentialRepo;
use crate::persistence::db::Database;
use crate::persistence::handshake_repo::HandshakeRepo;
use crate::persistence::session_repo::{SessionRepo, SessionUpdate};
use crate::{AppError, Result};

/// Orchestrates login sessions end to end.
pub struct AuthService {
    pub(super) config: Arc<GlobalConfig>,
    pub(super) sessions: SessionRepo,
    pub(super) handshakes: HandshakeRepo,
    pub(super) credentials: CredentialStore,
    pub(super) cache: SessionCache,
    pub(super) vms: Arc<dyn VmProvider>,
    pub(super) agent: AgentClient,
    pub(super) injector: CredentialInjector,
    pub(super) cleanup: Arc<CleanupScheduler>,
    pub(super) tasks: Mutex<HashMap<String, CancellationToken>>,
    pub(super) shutdown: CancellationToken,
}

impl AuthService {
    /// Wire the orchestrator together.
    ///
    /// `config.master_key` must already be loaded.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the master key or HTTP client setup is invalid.
    pub fn new(
        config: Arc<GlobalConfig>,
        db: Arc<Database>,
        vms: Arc<dyn VmProvider>,
        mounter: Arc<dyn ImageMounter>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        let cipher = Arc::new(CredentialCipher::from_hex(&config.master_key)?);
        let agent = AgentClient::new(
            config.agent_port,
            Duration::from_millis(config.timeouts.agent_request_ms),
        )?;
        let injector = CredentialInjector::new(
            mounter,
            config.users_dir.clone(),
            config.mount_root.clone(),
        );
        let cleanup = Arc::new(CleanupScheduler::new(
            CleanupRepo::new(Arc::clone(&db)),
            Arc::clone(&vms),
            shutdown.clone(),
        ));

        Ok(Arc::new(Self {
            sessions: SessionRepo::new(Arc::clone(&db)),
            handshakes: HandshakeRepo::new(Arc::clone(&db)),
            credentials: CredentialStore::new(CredentialRepo::new(db), cipher),
            cache: SessionCache::new(),
            vms,
            agent,
            injector,
            cleanup,
            tasks: Mutex::new(HashMap::new()),
            shutdown,
            config,
        }))
    }

    /// The teardown scheduler, for spawning its sweeper.
    #[must_use]
    pub fn cleanup(&self) -> &Arc<CleanupScheduler> {
        &self.cleanup
    }

    /// Create a session and start provisioning in the background.
    ///
    /// Returns as soon as the session is persisted; no VM exists yet. A
    /// supplied display handshake is stored before the pipeline starts.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for an empty user id, `AppError::Db`
    /// if the session cannot be persisted.
    pub async fn start_authentication(
        self: &Arc<Self>,
        user_id: &str,
        provider: Provider,
        display_handshake: Option<Value>,
    ) -> Result<Session> {
        if user_id.trim().is_empty() {
            return Err(AppError::Validation("userId is required".into()));
        }

        let session = self.sessions.create(&Session::new(user_id.to_owned(), provider)).await?;
        self.cache.upsert(&session).await;
        info!(session_id = %session.id, user_id, %provider, "authentication session started");

        if let Some(handshake) = display_handshake {
            if let Err(err) = self.handshakes.put(&session.id, &handshake).await {
                warn!(session_id = %session.id, %err, "display handshake not stored");
            }
        }

        let token = self.shutdown.child_token();
        self.tasks
            .lock()
            .await
            .insert(session.id.clone(), token.clone());

        let service = Arc::clone(self);
        let pipeline_session = session.clone();
        tokio::spawn(
            async move { service.run_pipeline(pipeline_session, token).await }
                .instrument(info_span!("auth_pipeline", session_id = %session.id)),
        );

        Ok(session)
    }

    /// Current view of a session: cache first, durable store second.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session.
    pub async fn get_session_status(&self, session_id: &str) -> Result<Session> {
        if let Some(session) = self.cache.get(session_id).await {
            return Ok(session);
        }
        self.sessions
            .get_by_id(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))
    }

    /// Cancel a live session and tear its VM down immediately.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session and
    /// `AppError::Validation` if the session already finished.
    pub async fn cancel_session(&self, session_id: &str) -> Result<Session> {
        if let Some(token) = self.tasks.lock().await.remove(session_id) {
            token.cancel();
        }

        let session = self
            .sessions
            .transition(session_id, SessionStatus::Cancelled, SessionUpdate::default())
            .await?;
        self.cache.remove(session_id).await;
        info!(session_id, "session cancelled");

        if let Some(vm_id) = session.ephemeral_vm_id.as_deref() {
            self.teardown_now(session_id, vm_id).await;
        }
        Ok(session)
    }

    /// Best-effort immediate teardown; failures are logged only.
    pub(super) async fn teardown_now(&self, session_id: &str, vm_id: &str) {
        if let Err(err) = self.vms.destroy_vm(vm_id).await {
            warn!(session_id, vm_id, %err, "vm teardown failed");
        }
        if let Err(err) = self.vms.remove_session_mapping(session_id).await {
            warn!(session_id, %err, "session mapping not removed");
        }
    }

    /// Start a fresh login to replace a user's credentials.
    ///
    /// # Errors
    ///
    /// Same as [`start_authentication`](Self::start_authentication).
    pub async fn rotate_credentials(self: &Arc<Self>, user_id: &str, provider: Provider) -> Result<Session> {
        info!(user_id, %provider, "rotating credentials");
        self.start_authentication(user_id, provider, None).await
    }

    /// Encrypt and persist credentials under every qualifying slot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Encryption` or `AppError::Db`.
    pub async fn store_credentials(
        &self,
        user_id: &str,
        provider: Provider,
        credentials: &Value,
    ) -> Result<Vec<StoredCredential>> {
        self.credentials.store(user_id, provider, credentials).await
    }

    /// Install credentials into the user's worker VM image.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CredentialTransfer` if the worker VM does not
    /// exist or the image write fails; `AppError::Provisioning` if it
    /// cannot be resumed.
    pub async fn transfer_credentials_to_worker(
        &self,
        user_id: &str,
        provider: Provider,
        credentials: &Value,
    ) -> Result<PathBuf> {
        let worker = self.vms.find_worker_vm(user_id).await?.ok_or_else(|| {
            AppError::CredentialTransfer(format!("no worker vm for user {user_id}"))
        })?;
        if worker.needs_resume() {
            info!(vm_id = %worker.vm_id, "resuming worker vm");
            self.vms.resume_vm(&worker.vm_id).await?;
        }
        self.injector
            .inject(&worker.vm_id, provider, credentials)
            .await
    }

    /// Credential listing without secret material.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_credentials(&self, user_id: &str) -> Result<Vec<CredentialSummary>> {
        let records = self.credentials.list(user_id).await?;
        Ok(records.iter().map(CredentialSummary::from).collect())
    }

    /// Check a stored credential: decrypt, check expiry, then probe the worker VM.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for an unknown slot name and
    /// `AppError::Db` if the lookup fails. Every other failure is folded
    /// into the returned report.
    pub async fn validate_credentials(&self, user_id: &str, slot: &str) -> Result<ValidationReport> {
        let slot: CredentialSlot = slot.parse()?;
        let Some(record) = self.credentials.find(user_id, slot).await? else {
            return Ok(ValidationReport::invalid("not_found"));
        };

        if let Err(err) = self.credentials.decrypt(&record) {
            warn!(user_id, %slot, %err, "stored credential does not decrypt");
            return Ok(ValidationReport::invalid("validation_error"));
        }

        if record.expires_at.is_some_and(|at| at <= chrono::Utc::now()) {
            self.credentials.update_validation(&record.id, false).await?;
            return Ok(ValidationReport::invalid("expired"));
        }

        if !self.config.validate_probe {
            return Ok(ValidationReport::untested("probe_disabled"));
        }

        let worker = match self.vms.find_worker_vm(user_id).await {
            Ok(Some(worker)) if worker.status == VmState::Running => worker,
            Ok(_) => return Ok(ValidationReport::untested("worker_unavailable")),
            Err(err) => {
                warn!(user_id, %err, "worker lookup failed during validation");
                return Ok(ValidationReport::untested("worker_unavailable"));
            }
        };

        match self.agent.test_auth(&worker.ip_address, slot.provider()).await {
            Ok(valid) => {
                self.credentials.update_validation(&record.id, valid).await?;
                Ok(if valid {
                    ValidationReport::valid()
                } else {
                    ValidationReport::invalid("rejected")
                })
            }
            Err(err) => {
                warn!(user_id, %slot, %err, "credential probe failed");
                Ok(ValidationReport::invalid("validation_error"))
            }
        }
    }

    /// Stored display handshake of a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if none was supplied.
    pub async fn display_handshake(&self, session_id: &str) -> Result<Value> {
        self.handshakes
            .get(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no display handshake for {session_id}")))
    }

    /// Relay the agent's `oauth-url` answer for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session has no VM yet.
    pub async fn relay_oauth_url(&self, session_id: &str) -> Result<(StatusCode, Value)> {
        let vm_ip = self.session_vm_ip(session_id).await?;
        self.agent.oauth_url(&vm_ip, session_id).await
    }

    /// Relay an explicit navigation request to the session's agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session has no VM yet.
    pub async fn relay_open_url(&self, session_id: &str, url: &str) -> Result<(StatusCode, Value)> {
        let vm_ip = self.session_vm_ip(session_id).await?;
        self.agent.open_url(&vm_ip, url, session_id).await
    }

    async fn session_vm_ip(&self, session_id: &str) -> Result<String> {
        self.get_session_status(session_id)
            .await?
            .vm_ip
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} has no vm yet")))
    }

    /// Fail sessions a previous process left mid-flight and requeue cleanup.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store cannot be read.
    pub async fn recover_on_startup(&self) -> Result<usize> {
        self.cleanup.recover().await?;

        let stranded = self.sessions.list_non_terminal().await?;
        if stranded.is_empty() {
            info!("no interrupted sessions found on startup");
            return Ok(0);
        }
        info!(count = stranded.len(), "failing sessions interrupted by restart");

        for session in &stranded {
            let failed = self
                .sessions
                .transition(
                    &session.id,
                    SessionStatus::Failed,
                    SessionUpdate::error("orchestrator restarted"),
                )
                .await;
            if let Err(err) = failed {
                warn!(session_id = %session.id, %err, "could not fail interrupted session");
                continue;
            }
            if let Some(vm_id) = session.ephemeral_vm_id.as_deref() {
                self.schedule_cleanup(&session.id, vm_id, SessionStatus::Failed).await;
            }
        }
        Ok(stranded.len())
    }

    /// Schedule grace-period teardown for a session that ended with `status`.
    pub(super) async fn schedule_cleanup(&self, session_id: &str, vm_id: &str, status: SessionStatus) {
        let cleanup = &self.config.cleanup;
        let grace_ms = if status == SessionStatus::Completed {
            cleanup.completed_grace_ms
        } else {
            if self.config.debug.keep_failed_vms {
                info!(session_id, vm_id, "keeping vm of unsuccessful session for debugging");
                return;
            }
            cleanup.failed_grace_ms
        };

        if let Err(err) = self
            .cleanup
            .schedule(vm_id, session_id, Duration::from_millis(grace_ms))
            .await
        {
            warn!(session_id, vm_id, %err, "vm cleanup could not be scheduled");
        }
    }
}
