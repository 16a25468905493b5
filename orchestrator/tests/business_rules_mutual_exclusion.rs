//! Business Rule Tests: Mutual Exclusion
//!
//! These tests verify that at most one maintenance run per job name can be
//! live at any instant, and that locks left by dead processes are reclaimed
//! rather than blocking forever.

mod common;

use common::fixtures::*;
use orchestrator::database::records::{RunStatus, Trigger};
use orchestrator::errors::LockError;
use orchestrator::lock_manager::{JobLock, JobLockManager};
use tempfile::TempDir;

#[tokio::test]
async fn test_second_acquire_is_rejected_while_owner_lives() {
    let dir = TempDir::new().unwrap();
    let manager = JobLockManager::new(dir.path().join("locks"));

    let handle = manager
        .acquire(profiles::STANDARD)
        .await
        .expect("first acquire should succeed");

    let result = manager.acquire(profiles::STANDARD).await;
    assert!(
        matches!(result, Err(LockError::Busy { owner_pid, .. }) if owner_pid == std::process::id()),
        "second acquire must report busy with the live owner"
    );

    // Different job names are independent
    let other = manager
        .acquire(profiles::DEEP)
        .await
        .expect("a different job name must not be blocked");

    manager.release(handle).await.unwrap();
    manager.release(other).await.unwrap();
}

#[tokio::test]
async fn test_release_then_reacquire() {
    let dir = TempDir::new().unwrap();
    let manager = JobLockManager::new(dir.path().join("locks"));

    let handle = manager.acquire(profiles::STANDARD).await.unwrap();
    manager.release(handle).await.unwrap();

    let handle = manager
        .acquire(profiles::STANDARD)
        .await
        .expect("released lock must be acquirable again");
    manager.release(handle).await.unwrap();
}

#[tokio::test]
async fn test_stale_lock_of_dead_owner_is_reclaimed() {
    let dir = TempDir::new().unwrap();
    let locks_dir = dir.path().join("locks");
    tokio::fs::create_dir_all(&locks_dir).await.unwrap();

    // Plant a lock whose recorded owner cannot be alive (pid above pid_max)
    let stale = JobLock {
        job_name: profiles::STANDARD.to_string(),
        owner_pid: u32::MAX - 1,
        acquired_at: chrono::Utc::now(),
    };
    tokio::fs::write(
        locks_dir.join(format!("{}.lock", profiles::STANDARD)),
        serde_json::to_vec_pretty(&stale).unwrap(),
    )
    .await
    .unwrap();

    let manager = JobLockManager::new(locks_dir);
    let handle = manager
        .acquire(profiles::STANDARD)
        .await
        .expect("stale lock must be reclaimed, not reported busy");
    assert_eq!(handle.job_name(), profiles::STANDARD);
    manager.release(handle).await.unwrap();
}

#[tokio::test]
async fn test_sweep_collects_dead_and_corrupt_locks() {
    let dir = TempDir::new().unwrap();
    let locks_dir = dir.path().join("locks");
    tokio::fs::create_dir_all(&locks_dir).await.unwrap();

    let stale = JobLock {
        job_name: profiles::DEEP.to_string(),
        owner_pid: u32::MAX - 1,
        acquired_at: chrono::Utc::now(),
    };
    tokio::fs::write(
        locks_dir.join(format!("{}.lock", profiles::DEEP)),
        serde_json::to_vec_pretty(&stale).unwrap(),
    )
    .await
    .unwrap();
    tokio::fs::write(locks_dir.join("broken.lock"), b"{not json")
        .await
        .unwrap();

    let manager = JobLockManager::new(locks_dir.clone());
    // A lock held by this live process must survive the sweep
    let held = manager.acquire(profiles::STANDARD).await.unwrap();

    let reclaimed = manager.sweep().await.unwrap();
    assert_eq!(reclaimed, 2);
    assert!(locks_dir
        .join(format!("{}.lock", profiles::STANDARD))
        .exists());

    manager.release(held).await.unwrap();
}

#[tokio::test]
async fn test_facade_run_skips_while_job_is_locked() {
    let stack = TestStack::new().await;
    let profile = passing_profile(profiles::STANDARD);
    stack.save_profile(&profile).await;

    // Hold the lock the way a concurrent run would
    let lock_manager = JobLockManager::new(stack.dir.path().join("locks"));
    let handle = lock_manager.acquire(profiles::STANDARD).await.unwrap();

    let outcome = stack
        .facade
        .run(profiles::STANDARD, Trigger::Scheduled, false)
        .await
        .unwrap();

    // A busy lock is a legitimate no-op for an unattended trigger
    assert_eq!(outcome.run_status, RunStatus::Skipped);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(stack.snapshot_count(), 0, "no snapshot for a skipped run");

    lock_manager.release(handle).await.unwrap();

    let outcome = stack
        .facade
        .run(profiles::STANDARD, Trigger::Scheduled, false)
        .await
        .unwrap();
    assert_eq!(outcome.run_status, RunStatus::Success);
}
