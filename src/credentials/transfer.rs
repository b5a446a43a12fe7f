//! Out-of-band credential injection into a worker VM's disk image.
//!
//! The image at `{users_dir}/{vm_id}/rootfs.ext4` is loop-mounted at
//! `{mount_root}/vm-mount-{vm_id}`, the credential file is written at the
//! provider's fixed in-guest path, and the image is unmounted again on
//! every exit path. Transfers for the same VM are serialized.

use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::models::provider::Provider;
use crate::{AppError, Result};

/// Attaches and detaches a filesystem image at a directory.
#[async_trait]
pub trait ImageMounter: Send + Sync {
    /// Mount `image` at the existing directory `mount_point`.
    async fn mount(&self, image: &Path, mount_point: &Path) -> Result<()>;
    /// Unmount whatever is mounted at `mount_point`.
    async fn unmount(&self, mount_point: &Path) -> Result<()>;
}

/// [`ImageMounter`] backed by `mount -o loop` and `umount`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopMounter;

#[async_trait]
impl ImageMounter for LoopMounter {
    async fn mount(&self, image: &Path, mount_point: &Path) -> Result<()> {
        run_checked(
            Command::new("mount")
                .arg("-o")
                .arg("loop")
                .arg(image)
                .arg(mount_point),
            "mount",
        )
        .await
    }

    async fn unmount(&self, mount_point: &Path) -> Result<()> {
        run_checked(Command::new("umount").arg(mount_point), "umount").await
    }
}

async fn run_checked(cmd: &mut Command, what: &str) -> Result<()> {
    let output = cmd
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| AppError::CredentialTransfer(format!("{what} failed to start: {err}")))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(AppError::CredentialTransfer(format!(
            "{what} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Mount `image` at `mount_point`, run `body`, then always unmount.
///
/// The mount point directory is created beforehand and removed (only if
/// empty) afterwards. If `body` fails its error wins; an unmount failure is
/// reported only when `body` succeeded.
///
/// # Errors
///
/// Returns `AppError::CredentialTransfer` for mount or unmount failures,
/// or whatever `body` returns.
pub async fn with_mounted_image<F, Fut, T>(
    mounter: &dyn ImageMounter,
    image: &Path,
    mount_point: &Path,
    body: F,
) -> Result<T>
where
    F: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    tokio::fs::create_dir_all(mount_point).await.map_err(|err| {
        AppError::CredentialTransfer(format!(
            "cannot create mount point {}: {err}",
            mount_point.display()
        ))
    })?;

    if let Err(err) = mounter.mount(image, mount_point).await {
        remove_mount_point(mount_point).await;
        return Err(err);
    }

    let outcome = body(mount_point.to_path_buf()).await;

    let unmounted = mounter.unmount(mount_point).await;
    if let Err(ref err) = unmounted {
        error!(mount_point = %mount_point.display(), %err, "unmount failed");
    }
    remove_mount_point(mount_point).await;

    match (outcome, unmounted) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) | (Err(err), _) => Err(err),
    }
}

async fn remove_mount_point(mount_point: &Path) {
    // Never recursive: a still-mounted image must not lose its contents.
    if let Err(err) = tokio::fs::remove_dir(mount_point).await {
        warn!(mount_point = %mount_point.display(), %err, "could not remove mount point");
    }
}

/// Writes credential files into worker VM images.
pub struct CredentialInjector {
    mounter: Arc<dyn ImageMounter>,
    users_dir: PathBuf,
    mount_root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialInjector {
    /// Create an injector.
    #[must_use]
    pub fn new(mounter: Arc<dyn ImageMounter>, users_dir: PathBuf, mount_root: PathBuf) -> Self {
        Self {
            mounter,
            users_dir,
            mount_root,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Disk image path of a VM.
    #[must_use]
    pub fn image_path(&self, vm_id: &str) -> PathBuf {
        self.users_dir.join(vm_id).join("rootfs.ext4")
    }

    /// Scoped mount point of a VM.
    #[must_use]
    pub fn mount_point(&self, vm_id: &str) -> PathBuf {
        self.mount_root.join(format!("vm-mount-{vm_id}"))
    }

    /// Write `credentials` to the provider's credential path inside the VM image.
    ///
    /// Returns the in-guest path written.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CredentialTransfer` if mounting, writing, or
    /// unmounting fails. The image is unmounted in every case.
    pub async fn inject(&self, vm_id: &str, provider: Provider, credentials: &Value) -> Result<PathBuf> {
        if vm_id.is_empty() || vm_id.contains('/') || vm_id.contains("..") {
            return Err(AppError::CredentialTransfer(format!("invalid vm id: {vm_id}")));
        }

        let lock = self.lock_for(vm_id).await;
        let guard = lock.lock().await;
        let written = self.write_into_image(vm_id, provider, credentials).await;
        drop(guard);
        self.release_lock(vm_id, &lock).await;
        written
    }

    async fn write_into_image(&self, vm_id: &str, provider: Provider, credentials: &Value) -> Result<PathBuf> {
        let contents = serde_json::to_string_pretty(credentials).map_err(|err| {
            AppError::CredentialTransfer(format!("cannot serialize credentials: {err}"))
        })?;
        let guest_path = provider.guest_credential_path();
        let image = self.image_path(vm_id);
        let mount_point = self.mount_point(vm_id);

        let relative = guest_path
            .strip_prefix("/")
            .map_or_else(|_| guest_path.clone(), Path::to_path_buf);

        with_mounted_image(self.mounter.as_ref(), &image, &mount_point, move |root| async move {
            let target = root.join(relative);
            tokio::task::spawn_blocking(move || write_credential_file(&target, &contents))
                .await
                .map_err(|err| AppError::CredentialTransfer(format!("write task panicked: {err}")))?
        })
        .await?;

        info!(vm_id, provider = %provider, path = %guest_path.display(), "credentials injected");
        Ok(guest_path)
    }

    async fn lock_for(&self, vm_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(vm_id.to_owned()).or_default())
    }

    /// Forget the per-VM lock once no other transfer holds or awaits it.
    async fn release_lock(&self, vm_id: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        let idle = locks
            .get(vm_id)
            .is_some_and(|held| Arc::ptr_eq(held, lock) && Arc::strong_count(lock) == 2);
        if idle {
            locks.remove(vm_id);
        }
    }

    /// Number of VMs with a transfer lock currently tracked.
    pub async fn tracked_locks(&self) -> usize {
        self.locks.lock().await.len()
    }
}

/// Atomically write `contents` to `target` with owner-only permissions.
fn write_credential_file(target: &Path, contents: &str) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| AppError::CredentialTransfer("credential path has no parent".into()))?;
    std::fs::create_dir_all(parent).map_err(|err| {
        AppError::CredentialTransfer(format!("cannot create {}: {err}", parent.display()))
    })?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| AppError::CredentialTransfer(format!("cannot create temp file: {err}")))?;
    tmp.write_all(contents.as_bytes())
        .map_err(|err| AppError::CredentialTransfer(format!("cannot write temp file: {err}")))?;
    set_owner_only(tmp.path())?;
    tmp.persist(target).map_err(|err| {
        AppError::CredentialTransfer(format!("cannot persist {}: {err}", target.display()))
    })?;
    Ok(())
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|err| AppError::CredentialTransfer(format!("chmod failed: {err}")))?;

    if nix::unistd::geteuid().is_root() {
        nix::unistd::chown(path, Some(nix::unistd::Uid::from_raw(0)), Some(nix::unistd::Gid::from_raw(0)))
            .map_err(|err| AppError::CredentialTransfer(format!("chown failed: {err}")))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> Result<()> {
    Ok(())
}
