//! VM provider seam and its REST implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::config::VmProviderConfig;
use crate::models::vm::{VmHandle, VmKind};
use crate::{AppError, Result};

/// Create, destroy, and route VMs.
#[async_trait]
pub trait VmProvider: Send + Sync {
    /// Create a VM of `kind` for `user_id`, optionally scoped to a session.
    async fn create_vm(
        &self,
        user_id: &str,
        kind: VmKind,
        session_id: Option<&str>,
    ) -> Result<VmHandle>;

    /// Destroy a VM.
    async fn destroy_vm(&self, vm_id: &str) -> Result<()>;

    /// Resume a hibernated VM.
    async fn resume_vm(&self, vm_id: &str) -> Result<()>;

    /// The user's durable worker VM, if one exists.
    async fn find_worker_vm(&self, user_id: &str) -> Result<Option<VmHandle>>;

    /// Provision the user's durable worker VM.
    async fn provision_worker_vm(&self, user_id: &str) -> Result<VmHandle> {
        self.create_vm(user_id, VmKind::Worker, None).await
    }

    /// Route a session to a VM.
    async fn associate_session(&self, session_id: &str, vm_id: &str, vm_ip: &str) -> Result<()>;

    /// Drop a session's routing association.
    async fn remove_session_mapping(&self, session_id: &str) -> Result<()>;
}

/// [`VmProvider`] talking JSON over HTTP to the VM management service.
#[derive(Debug, Clone)]
pub struct HttpVmProvider {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateVmBody<'a> {
    user_id: &'a str,
    vm_type: VmKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

impl HttpVmProvider {
    /// Build a client for the configured service.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(config: &VmProviderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|err| AppError::Config(format!("cannot build vm provider client: {err}")))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn ensure_success(status: StatusCode, what: &str) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(AppError::Provisioning(format!("{what} returned {status}")))
    }
}

#[async_trait]
impl VmProvider for HttpVmProvider {
    async fn create_vm(
        &self,
        user_id: &str,
        kind: VmKind,
        session_id: Option<&str>,
    ) -> Result<VmHandle> {
        let resp = self
            .http
            .post(self.url("/vms"))
            .json(&CreateVmBody {
                user_id,
                vm_type: kind,
                session_id,
            })
            .send()
            .await
            .map_err(|err| AppError::Provisioning(format!("create vm: {err}")))?;
        ensure_success(resp.status(), "create vm")?;
        let vm: VmHandle = resp
            .json()
            .await
            .map_err(|err| AppError::Provisioning(format!("create vm response: {err}")))?;
        debug!(vm_id = %vm.vm_id, ?kind, "vm created");
        Ok(vm)
    }

    async fn destroy_vm(&self, vm_id: &str) -> Result<()> {
        let resp = self.http.delete(self.url(&format!("/vms/{vm_id}"))).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(AppError::NetworkTransient(format!(
                "destroy vm {vm_id} returned {}",
                resp.status()
            )))
        }
    }

    async fn resume_vm(&self, vm_id: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/vms/{vm_id}/resume")))
            .send()
            .await
            .map_err(|err| AppError::Provisioning(format!("resume vm: {err}")))?;
        ensure_success(resp.status(), "resume vm")
    }

    async fn find_worker_vm(&self, user_id: &str) -> Result<Option<VmHandle>> {
        let resp = self
            .http
            .get(self.url(&format!("/users/{user_id}/worker-vm")))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        ensure_success(resp.status(), "find worker vm")?;
        Ok(Some(resp.json().await?))
    }

    async fn associate_session(&self, session_id: &str, vm_id: &str, vm_ip: &str) -> Result<()> {
        let resp = self
            .http
            .put(self.url(&format!("/sessions/{session_id}/vm")))
            .json(&json!({ "vmId": vm_id, "vmIp": vm_ip }))
            .send()
            .await
            .map_err(|err| AppError::Provisioning(format!("associate session: {err}")))?;
        ensure_success(resp.status(), "associate session")
    }

    async fn remove_session_mapping(&self, session_id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/sessions/{session_id}/vm")))
            .send()
            .await?;
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(AppError::NetworkTransient(format!(
                "remove session mapping returned {}",
                resp.status()
            )))
        }
    }
}
