//! Background job execution.
//!
//! Composes the lock manager, precondition evaluator, and resource limiter
//! around a spawned shell command. A run is a session: `begin` acquires the
//! job lock and gates on preconditions (fail-fast, non-blocking), then each
//! operation executes under the lock via `run_operation`, and `finish`
//! releases it. The lock is held for the whole session, so per job name
//! executions are strictly non-overlapping; a crash mid-session leaves a
//! stale lock that the next `begin` reclaims.
//!
//! While a command runs, a sampling task records peak resident memory; it is
//! joined, not abandoned, before the outcome is returned.

use crate::constants::execution;
use crate::database::records::RunStatus;
use crate::errors::{ExecutionError, LockError};
use crate::lock_manager::{is_process_alive, JobLockManager, LockHandle};
use crate::preconditions::{PreconditionEvaluator, PreconditionVerdict, SystemSnapshot};
use crate::profiles::ResourceLimits;
use crate::resource_limits::ResourceLimiter;
use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid as SysPid, ProcessRefreshKind, System};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as AsyncCommand;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Outcome of starting a session
pub enum JobStart {
    Ready(JobSession),
    /// Lock held by a live owner
    Busy { owner_pid: u32 },
    /// A precondition failed; nothing was mutated
    Skipped {
        predicate: &'static str,
        reason: String,
    },
}

/// A held job lock plus the system snapshot taken at start
pub struct JobSession {
    job_name: String,
    handle: LockHandle,
    snapshot: SystemSnapshot,
}

impl JobSession {
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn snapshot(&self) -> &SystemSnapshot {
        &self.snapshot
    }
}

/// Result of one operation command
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub operation: String,
    pub operation_type: String,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub duration_seconds: i64,
    pub log_path: PathBuf,
    pub peak_memory_bytes: u64,
    pub detail: Option<String>,
}

impl OperationOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }
}

pub struct BackgroundJobExecutor {
    lock_manager: Arc<JobLockManager>,
    evaluator: Arc<PreconditionEvaluator>,
    limiter: ResourceLimiter,
    run_logs_dir: PathBuf,
}

impl BackgroundJobExecutor {
    pub fn new(
        lock_manager: Arc<JobLockManager>,
        evaluator: Arc<PreconditionEvaluator>,
        run_logs_dir: PathBuf,
    ) -> Self {
        Self {
            lock_manager,
            evaluator,
            limiter: ResourceLimiter::new(),
            run_logs_dir,
        }
    }

    /// Acquires the job lock and evaluates preconditions. `force` bypasses
    /// precondition evaluation but never the lock.
    pub async fn begin(
        &self,
        job_name: &str,
        preconditions: &crate::profiles::Preconditions,
        force: bool,
    ) -> Result<JobStart, ExecutionError> {
        let handle = match self.lock_manager.acquire(job_name).await {
            Ok(handle) => handle,
            Err(LockError::Busy { owner_pid, .. }) => {
                info!("Job '{}' is busy (lock held by pid {})", job_name, owner_pid);
                return Ok(JobStart::Busy { owner_pid });
            }
            Err(e) => {
                return Err(ExecutionError::SpawnFailed {
                    operation: job_name.to_string(),
                    reason: format!("lock acquisition failed: {}", e),
                })
            }
        };

        let snapshot = self.evaluator.probe().await;

        if !force {
            if let PreconditionVerdict::Fail { predicate, reason } =
                self.evaluator.evaluate(preconditions, &snapshot)
            {
                info!(
                    "Job '{}' skipped: precondition '{}' not met ({})",
                    job_name, predicate, reason
                );
                if let Err(e) = self.lock_manager.release(handle).await {
                    warn!("Failed to release lock after skip: {}", e);
                }
                return Ok(JobStart::Skipped { predicate, reason });
            }
        } else {
            debug!("Job '{}' forced: preconditions bypassed", job_name);
        }

        Ok(JobStart::Ready(JobSession {
            job_name: job_name.to_string(),
            handle,
            snapshot,
        }))
    }

    /// Releases the session's lock.
    pub async fn finish(&self, session: JobSession) -> Result<(), ExecutionError> {
        self.lock_manager
            .release(session.handle)
            .await
            .map_err(|e| ExecutionError::SpawnFailed {
                operation: session.job_name,
                reason: format!("lock release failed: {}", e),
            })
    }

    /// Runs one opaque shell command under the session's lock with resource
    /// limits and a hard wall-clock timeout. Captured output goes to a
    /// per-run log file; the exit code is the only contract.
    pub async fn run_operation(
        &self,
        session: &JobSession,
        operation_name: &str,
        operation_type: &str,
        command: &str,
        limits: &ResourceLimits,
        timeout_seconds: u64,
    ) -> Result<OperationOutcome, ExecutionError> {
        let started = Instant::now();
        let log_path = self.run_logs_dir.join(format!(
            "{}-{}-{}.log",
            session.job_name,
            operation_name,
            Utc::now().format("%Y%m%d_%H%M%S")
        ));

        info!(
            "Running operation '{}' for job '{}': {}",
            operation_name, session.job_name, command
        );

        let mut child = AsyncCommand::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0)
            .spawn()
            .map_err(|e| ExecutionError::SpawnFailed {
                operation: operation_name.to_string(),
                reason: e.to_string(),
            })?;

        let pid = child.id().ok_or_else(|| ExecutionError::SpawnFailed {
            operation: operation_name.to_string(),
            reason: "child exited before pid was known".to_string(),
        })?;

        let applied = self.limiter.apply(pid, limits);
        debug!("Applied {} resource limits to pid {}", applied, pid);

        // Drain both streams continuously so the child never blocks on a
        // full pipe; lines are collected for the per-run log.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_handle = tokio::spawn(drain_lines(stdout, "stdout"));
        let stderr_handle = tokio::spawn(drain_lines(stderr, "stderr"));

        // Detached sampler with its own lifecycle, joined before return
        let (stop_tx, stop_rx) = watch::channel(false);
        let sampler_handle = tokio::spawn(sample_peak_memory(pid, stop_rx));

        let (status, exit_status) = wait_with_timeout(
            &mut child,
            pid,
            Duration::from_secs(timeout_seconds),
            operation_name,
        )
        .await;

        let stdout_lines = stdout_handle.await.unwrap_or_default();
        let stderr_lines = stderr_handle.await.unwrap_or_default();

        let _ = stop_tx.send(true);
        let peak_memory_bytes =
            match tokio::time::timeout(execution::SAMPLER_JOIN_TIMEOUT, sampler_handle).await {
                Ok(Ok(peak)) => peak,
                _ => {
                    warn!("Resource sampler did not join in time");
                    0
                }
            };

        let duration_seconds = started.elapsed().as_secs() as i64;
        let exit_code = exit_status.and_then(|s| s.code());

        let detail = match status {
            RunStatus::Success => None,
            RunStatus::Failed if exit_code.is_some() => Some(format!(
                "exit code {}: {}",
                exit_code.unwrap_or(-1),
                last_line(&stderr_lines).unwrap_or("no stderr output")
            )),
            RunStatus::Failed => Some(format!("timed out after {}s", timeout_seconds)),
            RunStatus::Stopped => Some("stopped by operator request".to_string()),
            _ => None,
        };

        write_run_log(
            &log_path,
            command,
            status,
            exit_code,
            duration_seconds,
            &stdout_lines,
            &stderr_lines,
        )
        .await;

        info!(
            "Operation '{}' finished: {} in {}s (log: {})",
            operation_name,
            status,
            duration_seconds,
            log_path.display()
        );

        Ok(OperationOutcome {
            operation: operation_name.to_string(),
            operation_type: operation_type.to_string(),
            status,
            exit_code,
            duration_seconds,
            log_path,
            peak_memory_bytes,
            detail,
        })
    }

    /// Delivers a stop request to the live owner of a job's lock: SIGTERM,
    /// a grace period, then SIGKILL. A stale lock is simply reclaimed by the
    /// next acquirer, so stopping it is a no-op.
    pub async fn stop_job(&self, job_name: &str) -> Result<bool, ExecutionError> {
        let lock = self
            .lock_manager
            .inspect(job_name)
            .await
            .map_err(|e| ExecutionError::StopFailed {
                job_name: job_name.to_string(),
                reason: e.to_string(),
            })?;

        let Some(lock) = lock else {
            info!("No lock held for '{}', nothing to stop", job_name);
            return Ok(false);
        };

        if !is_process_alive(lock.owner_pid) {
            info!(
                "Lock for '{}' is stale (owner {} dead), nothing to stop",
                job_name, lock.owner_pid
            );
            return Ok(false);
        }

        let owner = Pid::from_raw(lock.owner_pid as i32);
        info!(
            "Stopping job '{}': sending SIGTERM to pid {}",
            job_name, lock.owner_pid
        );
        kill(owner, Signal::SIGTERM).map_err(|e| ExecutionError::StopFailed {
            job_name: job_name.to_string(),
            reason: format!("SIGTERM to {} failed: {}", lock.owner_pid, e),
        })?;

        let deadline = Instant::now() + execution::KILL_GRACE_PERIOD;
        while Instant::now() < deadline {
            if !is_process_alive(lock.owner_pid) {
                info!("Job '{}' stopped gracefully", job_name);
                return Ok(true);
            }
            tokio::time::sleep(execution::TERMINATION_POLL_INTERVAL).await;
        }

        warn!(
            "Job '{}' did not stop within grace period, sending SIGKILL to {}",
            job_name, lock.owner_pid
        );
        kill(owner, Signal::SIGKILL).map_err(|e| ExecutionError::StopFailed {
            job_name: job_name.to_string(),
            reason: format!("SIGKILL to {} failed: {}", lock.owner_pid, e),
        })?;

        Ok(true)
    }
}

/// Waits for the child, enforcing the timeout and honoring an operator
/// SIGTERM to this process: both paths signal the child, wait the grace
/// period, then force-kill.
async fn wait_with_timeout(
    child: &mut tokio::process::Child,
    pid: u32,
    timeout: Duration,
    operation_name: &str,
) -> (RunStatus, Option<std::process::ExitStatus>) {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();

    let stop_requested = async {
        match sigterm.as_mut() {
            Some(stream) => {
                stream.recv().await;
            }
            // Signal stream unavailable; only the timeout can interrupt
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = child.wait() => match result {
            Ok(status) => {
                use std::os::unix::process::ExitStatusExt;
                if status.success() {
                    (RunStatus::Success, Some(status))
                } else if status.signal().is_some() {
                    // Killed from outside the orchestrator
                    (RunStatus::Stopped, Some(status))
                } else {
                    (RunStatus::Failed, Some(status))
                }
            }
            Err(e) => {
                warn!("Waiting on '{}' failed: {}", operation_name, e);
                (RunStatus::Failed, None)
            }
        },
        _ = tokio::time::sleep(timeout) => {
            warn!(
                "Operation '{}' exceeded {}s timeout, terminating pid {}",
                operation_name, timeout.as_secs(), pid
            );
            let status = terminate_child(child, pid).await;
            (RunStatus::Failed, status)
        }
        _ = stop_requested => {
            info!(
                "Stop requested while '{}' was running, terminating pid {}",
                operation_name, pid
            );
            let status = terminate_child(child, pid).await;
            (RunStatus::Stopped, status)
        }
    }
}

/// SIGTERM, grace period, then SIGKILL.
///
/// Signals the whole process group so commands the shell forked off die
/// with it, not just the direct `sh -c` child.
async fn terminate_child(
    child: &mut tokio::process::Child,
    pid: u32,
) -> Option<std::process::ExitStatus> {
    let pgid = Pid::from_raw(-(pid as i32));
    let _ = kill(pgid, Signal::SIGTERM);

    match tokio::time::timeout(execution::KILL_GRACE_PERIOD, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        _ => {
            warn!("Pid {} survived SIGTERM grace period, killing group", pid);
            let _ = kill(pgid, Signal::SIGKILL);
            child.wait().await.ok()
        }
    }
}

async fn drain_lines(
    stream: Option<impl tokio::io::AsyncRead + Unpin>,
    label: &'static str,
) -> Vec<String> {
    let Some(stream) = stream else {
        return Vec::new();
    };

    let mut collected = Vec::new();
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    while let Ok(bytes_read) = reader.read_line(&mut line).await {
        if bytes_read == 0 {
            break;
        }
        debug!("job {}: {}", label, line.trim_end());
        collected.push(line.trim_end().to_string());
        line.clear();
    }
    collected
}

/// Samples the child's resident memory until told to stop; returns the peak.
async fn sample_peak_memory(pid: u32, mut stop: watch::Receiver<bool>) -> u64 {
    let mut system = System::new();
    let sys_pid = SysPid::from_u32(pid);
    let mut peak = 0u64;
    let mut interval = tokio::time::interval(execution::USAGE_SAMPLE_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if system.refresh_process_specifics(sys_pid, ProcessRefreshKind::new().with_memory()) {
                    if let Some(process) = system.process(sys_pid) {
                        peak = peak.max(process.memory());
                    }
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }

    peak
}

fn last_line(lines: &[String]) -> Option<&str> {
    lines.iter().rev().find(|l| !l.is_empty()).map(|s| s.as_str())
}

async fn write_run_log(
    log_path: &PathBuf,
    command: &str,
    status: RunStatus,
    exit_code: Option<i32>,
    duration_seconds: i64,
    stdout_lines: &[String],
    stderr_lines: &[String],
) {
    let mut content = String::new();
    content.push_str(&format!("command: {}\n", command));
    content.push_str(&format!("status: {}\n", status));
    content.push_str(&format!(
        "exit_code: {}\n",
        exit_code.map_or("none".to_string(), |c| c.to_string())
    ));
    content.push_str(&format!("duration_seconds: {}\n", duration_seconds));
    content.push_str("--- stdout ---\n");
    for line in stdout_lines {
        content.push_str(line);
        content.push('\n');
    }
    content.push_str("--- stderr ---\n");
    for line in stderr_lines {
        content.push_str(line);
        content.push('\n');
    }

    if let Some(parent) = log_path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    if let Err(e) = tokio::fs::write(log_path, content).await {
        warn!("Could not write run log {}: {}", log_path.display(), e);
    }
}
