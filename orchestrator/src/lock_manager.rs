//! Per-job mutual exclusion backed by lock files.
//!
//! Each job name owns at most one lock record `{job_name, owner_pid,
//! acquired_at}`. Acquisition publishes the complete record atomically (the
//! record is written to a private temp file and hard-linked into place, so no
//! reader ever observes a partial write and concurrent acquirers race on a
//! single exclusive link). Owner liveness is checked with signal 0; a lock
//! whose owner is gone is reclaimed by the next acquirer. A crashed holder
//! therefore leaves a detectable stale lock rather than a deadlock.

use crate::constants::locks;
use crate::errors::LockError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLock {
    pub job_name: String,
    pub owner_pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Proof of acquisition, consumed by `release`. Dropping a handle does not
/// release the lock; only an explicit release (or a later reclaim of the
/// stale file) removes it.
#[derive(Debug)]
pub struct LockHandle {
    lock: JobLock,
    path: PathBuf,
}

impl LockHandle {
    pub fn job_name(&self) -> &str {
        &self.lock.job_name
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.lock.acquired_at
    }
}

pub struct JobLockManager {
    locks_dir: PathBuf,
}

impl JobLockManager {
    pub fn new(locks_dir: PathBuf) -> Self {
        Self { locks_dir }
    }

    fn lock_path(&self, job_name: &str) -> PathBuf {
        self.locks_dir
            .join(format!("{}.{}", job_name, locks::LOCK_FILE_EXTENSION))
    }

    /// Acquires the lock for `job_name`, reclaiming it first if the recorded
    /// owner is no longer alive. Non-blocking: a live owner means `Busy`.
    pub async fn acquire(&self, job_name: &str) -> Result<LockHandle, LockError> {
        let io_err = |reason: String| LockError::Io {
            job_name: job_name.to_string(),
            reason,
        };

        fs::create_dir_all(&self.locks_dir)
            .await
            .map_err(|e| io_err(e.to_string()))?;

        let path = self.lock_path(job_name);

        match read_lock_file(&path).await {
            LockFileState::Held(existing) if is_process_alive(existing.owner_pid) => {
                debug!(
                    "Lock for '{}' held by live process {}",
                    job_name, existing.owner_pid
                );
                return Err(LockError::Busy {
                    job_name: job_name.to_string(),
                    owner_pid: existing.owner_pid,
                });
            }
            LockFileState::Held(existing) => {
                warn!(
                    "Reclaiming stale lock for '{}' (owner {} is dead, acquired {})",
                    job_name, existing.owner_pid, existing.acquired_at
                );
                remove_if_present(&path)
                    .await
                    .map_err(|e| io_err(e.to_string()))?;
            }
            LockFileState::Unreadable(reason) => {
                warn!(
                    "Reclaiming unreadable lock for '{}': {}",
                    job_name, reason
                );
                remove_if_present(&path)
                    .await
                    .map_err(|e| io_err(e.to_string()))?;
            }
            LockFileState::Absent => {}
        }

        let lock = JobLock {
            job_name: job_name.to_string(),
            owner_pid: std::process::id(),
            acquired_at: Utc::now(),
        };

        let rendered =
            serde_json::to_vec_pretty(&lock).map_err(|e| io_err(e.to_string()))?;
        let tmp_path = self
            .locks_dir
            .join(format!("{}.{}.tmp", job_name, lock.owner_pid));
        fs::write(&tmp_path, rendered)
            .await
            .map_err(|e| io_err(e.to_string()))?;

        let link_result = fs::hard_link(&tmp_path, &path).await;
        let _ = fs::remove_file(&tmp_path).await;

        match link_result {
            Ok(()) => {
                info!("Acquired lock for '{}' (pid {})", job_name, lock.owner_pid);
                Ok(LockHandle { lock, path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Another acquirer published between our check and the link
                let owner_pid = match read_lock_file(&path).await {
                    LockFileState::Held(current) => current.owner_pid,
                    _ => 0,
                };
                debug!("Lost lock race for '{}' to pid {}", job_name, owner_pid);
                Err(LockError::Busy {
                    job_name: job_name.to_string(),
                    owner_pid,
                })
            }
            Err(e) => Err(io_err(e.to_string())),
        }
    }

    /// Releases a held lock, but only while this process is still the
    /// recorded owner. A lock that was reclaimed and re-acquired by someone
    /// else in the meantime is left untouched.
    pub async fn release(&self, handle: LockHandle) -> Result<(), LockError> {
        let job_name = handle.lock.job_name.clone();

        match read_lock_file(&handle.path).await {
            LockFileState::Held(current) if current.owner_pid == std::process::id() => {
                fs::remove_file(&handle.path)
                    .await
                    .map_err(|e| LockError::Io {
                        job_name: job_name.clone(),
                        reason: e.to_string(),
                    })?;
                info!("Released lock for '{}'", job_name);
                Ok(())
            }
            LockFileState::Held(current) => Err(LockError::NotOwner {
                job_name,
                owner_pid: current.owner_pid,
            }),
            LockFileState::Absent => {
                warn!("Lock for '{}' already gone at release", job_name);
                Ok(())
            }
            LockFileState::Unreadable(reason) => Err(LockError::Corrupted { job_name, reason }),
        }
    }

    /// Reads the current lock for a job without acquiring it.
    pub async fn inspect(&self, job_name: &str) -> Result<Option<JobLock>, LockError> {
        match read_lock_file(&self.lock_path(job_name)).await {
            LockFileState::Held(lock) => Ok(Some(lock)),
            LockFileState::Absent => Ok(None),
            LockFileState::Unreadable(reason) => Err(LockError::Corrupted {
                job_name: job_name.to_string(),
                reason,
            }),
        }
    }

    /// Scans all lock files and garbage-collects those whose owner is dead
    /// or whose record is unreadable. Returns the number reclaimed.
    pub async fn sweep(&self) -> Result<u32, LockError> {
        let io_err = |reason: String| LockError::Io {
            job_name: "*".to_string(),
            reason,
        };

        let mut reclaimed = 0u32;
        let mut entries = match fs::read_dir(&self.locks_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_err(e.to_string())),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_err(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(locks::LOCK_FILE_EXTENSION) {
                continue;
            }

            let should_remove = match read_lock_file(&path).await {
                LockFileState::Held(lock) => {
                    if is_process_alive(lock.owner_pid) {
                        false
                    } else {
                        warn!(
                            "Sweep reclaiming stale lock '{}' (dead owner {})",
                            lock.job_name, lock.owner_pid
                        );
                        true
                    }
                }
                LockFileState::Unreadable(reason) => {
                    warn!("Sweep removing unreadable lock {}: {}", path.display(), reason);
                    true
                }
                LockFileState::Absent => false,
            };

            if should_remove {
                remove_if_present(&path)
                    .await
                    .map_err(|e| io_err(e.to_string()))?;
                reclaimed += 1;
            }
        }

        if reclaimed > 0 {
            info!("Lock sweep reclaimed {} stale locks", reclaimed);
        }
        Ok(reclaimed)
    }
}

enum LockFileState {
    Held(JobLock),
    Absent,
    Unreadable(String),
}

async fn read_lock_file(path: &Path) -> LockFileState {
    match fs::read_to_string(path).await {
        Ok(content) => match serde_json::from_str::<JobLock>(&content) {
            Ok(lock) => LockFileState::Held(lock),
            Err(e) => LockFileState::Unreadable(e.to_string()),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => LockFileState::Absent,
        Err(e) => LockFileState::Unreadable(e.to_string()),
    }
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Check whether a process with the given PID is alive.
///
/// Uses kill(pid, 0) — signal 0 checks existence without sending a signal.
pub fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}
