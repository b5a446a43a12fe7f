//! Grace-period teardown of ephemeral VMs.
//!
//! Every scheduled teardown is written to `vm_cleanup_task` first and then
//! armed as an in-process timer. A periodic sweeper picks up due tasks the
//! timer missed, including tasks left behind by a previous process. Both
//! paths claim a task atomically before acting, so each VM is destroyed
//! at most once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::vm_provider::VmProvider;
use crate::models::cleanup::{CleanupStatus, CleanupTask};
use crate::persistence::cleanup_repo::CleanupRepo;
use crate::{AppError, Result};

/// Schedules and executes VM teardown.
pub struct CleanupScheduler {
    repo: CleanupRepo,
    vms: Arc<dyn VmProvider>,
    cancel: CancellationToken,
}

impl CleanupScheduler {
    /// Create a scheduler whose timers stop when `cancel` fires.
    #[must_use]
    pub fn new(repo: CleanupRepo, vms: Arc<dyn VmProvider>, cancel: CancellationToken) -> Self {
        Self { repo, vms, cancel }
    }

    /// Persist a teardown of `vm_id` due after `grace`, and arm its timer.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the task cannot be persisted.
    pub async fn schedule(
        self: &Arc<Self>,
        vm_id: &str,
        session_id: &str,
        grace: Duration,
    ) -> Result<CleanupTask> {
        let grace_chrono = chrono::Duration::from_std(grace)
            .map_err(|err| AppError::Config(format!("grace period out of range: {err}")))?;
        let task = CleanupTask::new(vm_id.to_owned(), session_id.to_owned(), Utc::now() + grace_chrono);
        self.repo.create(&task).await?;
        info!(vm_id, session_id, grace_ms = grace.as_millis(), "vm cleanup scheduled");

        let scheduler = Arc::clone(self);
        let timer_task = task.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    () = scheduler.cancel.cancelled() => {
                        debug!("cleanup timer abandoned; sweeper will pick the task up");
                    }
                    () = tokio::time::sleep(grace) => {
                        scheduler.process(&timer_task).await;
                    }
                }
            }
            .instrument(info_span!("cleanup_timer", vm_id = %task.vm_id)),
        );

        Ok(task)
    }

    /// Claim and execute one task. Errors are logged, never returned.
    pub async fn process(&self, task: &CleanupTask) {
        match self.repo.claim(&task.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id = %task.id, "cleanup task already claimed");
                return;
            }
            Err(err) => {
                error!(task_id = %task.id, %err, "cannot claim cleanup task");
                return;
            }
        }

        let outcome = match self.vms.destroy_vm(&task.vm_id).await {
            Ok(()) => {
                if let Err(err) = self.vms.remove_session_mapping(&task.session_id).await {
                    warn!(session_id = %task.session_id, %err, "session mapping not removed");
                }
                info!(vm_id = %task.vm_id, session_id = %task.session_id, "ephemeral vm destroyed");
                self.repo.finish(&task.id, CleanupStatus::Completed, None).await
            }
            Err(err) => {
                warn!(vm_id = %task.vm_id, %err, "vm destroy failed");
                self.repo
                    .finish(&task.id, CleanupStatus::Failed, Some(&err.to_string()))
                    .await
            }
        };
        if let Err(err) = outcome {
            error!(task_id = %task.id, %err, "cannot record cleanup outcome");
        }
    }

    /// Process every pending task that is due now.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if due tasks cannot be listed.
    pub async fn sweep_once(&self) -> Result<usize> {
        let due = self.repo.list_due(Utc::now()).await?;
        let count = due.len();
        for task in &due {
            self.process(task).await;
        }
        if count > 0 {
            debug!(count, "cleanup sweep processed tasks");
        }
        Ok(count)
    }

    /// Requeue tasks a crashed process left in `processing`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn recover(&self) -> Result<u64> {
        let requeued = self.repo.requeue_processing().await?;
        if requeued > 0 {
            info!(requeued, "requeued interrupted cleanup tasks");
        }
        Ok(requeued)
    }

    /// Spawn the periodic sweeper.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        () = scheduler.cancel.cancelled() => {
                            info!("cleanup sweeper shutting down");
                            break;
                        }
                        _ = ticker.tick() => {
                            if let Err(err) = scheduler.sweep_once().await {
                                error!(%err, "cleanup sweep failed");
                            }
                        }
                    }
                }
            }
            .instrument(info_span!("cleanup_sweeper")),
        )
    }
}
