//! Unit tests for credential injection into a worker VM image.
//!
//! `DirMounter` stands in for a loop mount: mounting moves the contents
//! of a backing directory into the mount point and unmounting moves them
//! back, so the mount point is empty again after a clean unmount.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use authbridge::credentials::transfer::{with_mounted_image, CredentialInjector, ImageMounter};
use authbridge::models::provider::Provider;
use authbridge::{AppError, Result};
use serde_json::json;

struct DirMounter {
    backing: PathBuf,
    mounts: AtomicUsize,
    unmounts: AtomicUsize,
    fail_mount: bool,
    block_codex_path: bool,
}

impl DirMounter {
    fn new(backing: PathBuf) -> Self {
        Self {
            backing,
            mounts: AtomicUsize::new(0),
            unmounts: AtomicUsize::new(0),
            fail_mount: false,
            block_codex_path: false,
        }
    }
}

fn move_entries(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        std::fs::rename(entry.path(), to.join(entry.file_name()))?;
    }
    Ok(())
}

#[async_trait]
impl ImageMounter for DirMounter {
    async fn mount(&self, _image: &Path, mount_point: &Path) -> Result<()> {
        self.mounts.fetch_add(1, Ordering::SeqCst);
        if self.fail_mount {
            return Err(AppError::CredentialTransfer("mount refused".into()));
        }
        move_entries(&self.backing, mount_point)?;
        if self.block_codex_path {
            std::fs::create_dir_all(mount_point.join("root/.codex/auth.json"))?;
        }
        Ok(())
    }

    async fn unmount(&self, mount_point: &Path) -> Result<()> {
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        move_entries(mount_point, &self.backing)
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    backing: PathBuf,
    mount_root: PathBuf,
    users_dir: PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let backing = dir.path().join("image");
    let mount_root = dir.path().join("mnt");
    let users_dir = dir.path().join("users");
    std::fs::create_dir_all(&backing).expect("backing dir");
    std::fs::create_dir_all(&mount_root).expect("mount root");
    Fixture {
        backing,
        mount_root,
        users_dir,
        _dir: dir,
    }
}

#[tokio::test]
async fn credentials_land_at_the_guest_path() {
    let fx = fixture();
    let mounter = Arc::new(DirMounter::new(fx.backing.clone()));
    let injector = CredentialInjector::new(mounter.clone(), fx.users_dir.clone(), fx.mount_root.clone());

    let payload = json!({"tokens": {"access_token": "a"}});
    let guest = injector
        .inject("vm-7", Provider::Codex, &payload)
        .await
        .expect("inject");
    assert_eq!(guest, PathBuf::from("/root/.codex/auth.json"));

    let written = std::fs::read_to_string(fx.backing.join("root/.codex/auth.json")).expect("file in image");
    let parsed: serde_json::Value = serde_json::from_str(&written).expect("json");
    assert_eq!(parsed, payload);

    assert_eq!(mounter.mounts.load(Ordering::SeqCst), 1);
    assert_eq!(mounter.unmounts.load(Ordering::SeqCst), 1);
    assert!(!injector.mount_point("vm-7").exists(), "mount point removed");
}

#[cfg(unix)]
#[tokio::test]
async fn credential_file_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let fx = fixture();
    let mounter = Arc::new(DirMounter::new(fx.backing.clone()));
    let injector = CredentialInjector::new(mounter, fx.users_dir.clone(), fx.mount_root.clone());
    injector
        .inject("vm-7", Provider::GeminiCli, &json!({"access_token": "a"}))
        .await
        .expect("inject");

    let meta = std::fs::metadata(fx.backing.join("root/.gemini/oauth_creds.json")).expect("metadata");
    assert_eq!(meta.permissions().mode() & 0o777, 0o600);
}

#[tokio::test]
async fn existing_credentials_are_replaced() {
    let fx = fixture();
    let mounter = Arc::new(DirMounter::new(fx.backing.clone()));
    let injector = CredentialInjector::new(mounter.clone(), fx.users_dir.clone(), fx.mount_root.clone());

    injector
        .inject("vm-7", Provider::ClaudeCode, &json!({"v": 1}))
        .await
        .expect("first inject");
    injector
        .inject("vm-7", Provider::ClaudeCode, &json!({"v": 2}))
        .await
        .expect("second inject");

    let written = std::fs::read_to_string(fx.backing.join("root/.claude/.credentials.json")).expect("file");
    assert!(written.contains('2'));
    assert_eq!(mounter.unmounts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_write_still_unmounts() {
    let fx = fixture();
    let mut mounter = DirMounter::new(fx.backing.clone());
    mounter.block_codex_path = true;
    let mounter = Arc::new(mounter);
    let injector = CredentialInjector::new(mounter.clone(), fx.users_dir.clone(), fx.mount_root.clone());

    let err = injector
        .inject("vm-7", Provider::Codex, &json!({"t": 1}))
        .await
        .expect_err("write blocked by directory");
    assert!(matches!(err, AppError::CredentialTransfer(_)), "{err}");
    assert_eq!(mounter.unmounts.load(Ordering::SeqCst), 1);
    assert!(!injector.mount_point("vm-7").exists());
}

#[tokio::test]
async fn transfer_locks_are_released_after_use() {
    let fx = fixture();
    let mounter = Arc::new(DirMounter::new(fx.backing.clone()));
    let injector = CredentialInjector::new(mounter.clone(), fx.users_dir.clone(), fx.mount_root.clone());

    let v1 = json!({"v": 1});
    let v2 = json!({"v": 2});
    let (first, second) = tokio::join!(
        injector.inject("vm-7", Provider::Codex, &v1),
        injector.inject("vm-7", Provider::Codex, &v2),
    );
    first.expect("first inject");
    second.expect("second inject");
    assert_eq!(mounter.unmounts.load(Ordering::SeqCst), 2);
    assert_eq!(injector.tracked_locks().await, 0);

    let mut refusing = DirMounter::new(fx.backing.clone());
    refusing.fail_mount = true;
    let injector = CredentialInjector::new(Arc::new(refusing), fx.users_dir.clone(), fx.mount_root.clone());
    assert!(injector.inject("vm-8", Provider::Codex, &json!({"v": 1})).await.is_err());
    assert_eq!(injector.tracked_locks().await, 0);
}

#[tokio::test]
async fn failed_mount_skips_body_and_unmount() {
    let fx = fixture();
    let mut mounter = DirMounter::new(fx.backing.clone());
    mounter.fail_mount = true;

    let mount_point = fx.mount_root.join("vm-mount-x");
    let mut ran = false;
    let result = with_mounted_image(&mounter, Path::new("/nonexistent.ext4"), &mount_point, |_| {
        ran = true;
        async { Ok(()) }
    })
    .await;

    assert!(result.is_err());
    assert!(!ran);
    assert_eq!(mounter.unmounts.load(Ordering::SeqCst), 0);
    assert!(!mount_point.exists());
}

#[tokio::test]
async fn path_like_vm_ids_are_rejected() {
    let fx = fixture();
    let mounter = Arc::new(DirMounter::new(fx.backing.clone()));
    let injector = CredentialInjector::new(mounter.clone(), fx.users_dir.clone(), fx.mount_root.clone());

    assert!(injector.inject("../etc", Provider::Codex, &json!({"t": 1})).await.is_err());
    assert_eq!(mounter.mounts.load(Ordering::SeqCst), 0);
}

#[test]
fn image_and_mount_paths_follow_layout() {
    let injector = CredentialInjector::new(
        Arc::new(DirMounter::new(PathBuf::from("/unused"))),
        PathBuf::from("/var/lib/users"),
        PathBuf::from("/tmp"),
    );
    assert_eq!(injector.image_path("vm-1"), PathBuf::from("/var/lib/users/vm-1/rootfs.ext4"));
    assert_eq!(injector.mount_point("vm-1"), PathBuf::from("/tmp/vm-mount-vm-1"));
}
