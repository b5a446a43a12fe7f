//! Integration tests for grace-period VM teardown.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use authbridge::models::cleanup::{CleanupStatus, CleanupTask};
use authbridge::models::provider::Provider;
use authbridge::models::session::SessionStatus;
use authbridge::orchestrator::cleanup::CleanupScheduler;
use authbridge::orchestrator::vm_provider::VmProvider;
use authbridge::persistence::cleanup_repo::CleanupRepo;
use authbridge::persistence::db;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::test_helpers::{
    eventually, harness, harness_with, wait_for_terminal, FakeVmProvider, MockAgent,
};

async fn standalone_scheduler(
    vms: Arc<FakeVmProvider>,
) -> (Arc<CleanupScheduler>, CleanupRepo, CancellationToken) {
    let db = Arc::new(db::connect_memory().await.expect("db"));
    let ct = CancellationToken::new();
    let provider: Arc<dyn VmProvider> = vms;
    let scheduler = Arc::new(CleanupScheduler::new(
        CleanupRepo::new(Arc::clone(&db)),
        provider,
        ct.clone(),
    ));
    (scheduler, CleanupRepo::new(db), ct)
}

#[tokio::test]
async fn completed_session_vm_destroyed_once_after_grace() {
    let h = harness().await;
    let _sweeper = h.service.cleanup().spawn_sweeper(Duration::from_millis(10));

    let session = h
        .service
        .start_authentication("user-1", Provider::Codex, None)
        .await
        .expect("start");
    let done = wait_for_terminal(&h.service, &session.id).await;
    assert_eq!(done.status, SessionStatus::Completed);
    let vm_id = done.ephemeral_vm_id.expect("vm recorded");
    assert!(h.vms.destroyed().is_empty(), "grace period not yet over");

    let vms = Arc::clone(&h.vms);
    assert!(eventually(Duration::from_secs(3), || !vms.destroyed().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.vms.destroyed(), vec![vm_id], "timer and sweeper destroy once");
    assert!(h
        .vms
        .removed_mappings
        .lock()
        .expect("lock")
        .contains(&session.id));
    h.ct.cancel();
}

#[tokio::test]
async fn failed_session_vm_is_destroyed() {
    let agent = MockAgent::default();
    agent.never_healthy.store(true, Ordering::SeqCst);
    let h = harness_with(agent, FakeVmProvider::default(), |c| {
        c.timeouts.health_budget_ms = 100;
    })
    .await;

    let session = h
        .service
        .start_authentication("user-1", Provider::Codex, None)
        .await
        .expect("start");
    let done = wait_for_terminal(&h.service, &session.id).await;
    assert_eq!(done.status, SessionStatus::Failed);

    let vms = Arc::clone(&h.vms);
    assert!(eventually(Duration::from_secs(3), || vms.destroyed().len() == 1).await);
}

#[tokio::test]
async fn keep_failed_vms_skips_teardown() {
    let agent = MockAgent::default();
    agent.never_healthy.store(true, Ordering::SeqCst);
    let h = harness_with(agent, FakeVmProvider::default(), |c| {
        c.timeouts.health_budget_ms = 100;
        c.debug.keep_failed_vms = true;
    })
    .await;

    let session = h
        .service
        .start_authentication("user-1", Provider::Codex, None)
        .await
        .expect("start");
    let done = wait_for_terminal(&h.service, &session.id).await;
    assert_eq!(done.status, SessionStatus::Failed);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(h.vms.destroyed().is_empty());
}

#[tokio::test]
async fn failed_destroy_is_recorded_on_the_task() {
    let vms = Arc::new(FakeVmProvider::default());
    vms.fail_destroy.store(true, Ordering::SeqCst);
    let (scheduler, repo, _ct) = standalone_scheduler(Arc::clone(&vms)).await;

    let task = scheduler
        .schedule("vm-1", "s-1", Duration::from_millis(20))
        .await
        .expect("schedule");

    let mut status = CleanupStatus::Pending;
    for _ in 0..100 {
        status = repo.get_by_id(&task.id).await.expect("get").expect("exists").status;
        if status == CleanupStatus::Failed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, CleanupStatus::Failed);
    let stored = repo.get_by_id(&task.id).await.expect("get").expect("exists");
    assert!(stored.error.is_some_and(|e| e.contains("unreachable")));
}

#[tokio::test]
async fn sweeper_processes_overdue_persisted_task() {
    let vms = Arc::new(FakeVmProvider::default());
    let (scheduler, repo, ct) = standalone_scheduler(Arc::clone(&vms)).await;

    let overdue = CleanupTask::new(
        "vm-old".into(),
        "s-old".into(),
        Utc::now() - chrono::Duration::seconds(30),
    );
    repo.create(&overdue).await.expect("create");

    let _sweeper = scheduler.spawn_sweeper(Duration::from_millis(20));
    let probe = Arc::clone(&vms);
    let swept = eventually(Duration::from_secs(2), || {
        probe.destroyed() == vec!["vm-old".to_owned()]
    })
    .await;
    assert!(swept);
    let stored = repo.get_by_id(&overdue.id).await.expect("get").expect("exists");
    assert_eq!(stored.status, CleanupStatus::Completed);
    ct.cancel();
}

#[tokio::test]
async fn sweep_ignores_tasks_not_yet_due() {
    let vms = Arc::new(FakeVmProvider::default());
    let (scheduler, repo, _ct) = standalone_scheduler(Arc::clone(&vms)).await;

    let later = CleanupTask::new(
        "vm-later".into(),
        "s-later".into(),
        Utc::now() + chrono::Duration::minutes(10),
    );
    repo.create(&later).await.expect("create");

    assert_eq!(scheduler.sweep_once().await.expect("sweep"), 0);
    assert!(vms.destroyed().is_empty());
}

#[tokio::test]
async fn concurrent_processing_destroys_once() {
    let vms = Arc::new(FakeVmProvider::default());
    let (scheduler, repo, _ct) = standalone_scheduler(Arc::clone(&vms)).await;

    let task = CleanupTask::new("vm-race".into(), "s-race".into(), Utc::now());
    repo.create(&task).await.expect("create");

    tokio::join!(scheduler.process(&task), scheduler.process(&task));
    assert_eq!(vms.destroyed(), vec!["vm-race".to_owned()]);
}
