// File: orchestrator/src/safety/guard.rs
use crate::backup::BackupManager;
use crate::database::records::{ExecutionRecord, NotificationLevel, RunStatus, Trigger};
use crate::database::Database;
use crate::errors::{GuardError, OrchestratorError};
use crate::profiles::Profile;
use crate::safety::integrity::IntegrityChecker;
use crate::services::job_executor::{BackgroundJobExecutor, JobSession, JobStart, OperationOutcome};
use crate::services::notification_service::NotificationDispatcher;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Phases of one enveloped run. The final phase of a run, together with its
/// status, determines the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardPhase {
    Idle,
    PreChecking,
    Snapshotting,
    Running,
    PostVerifying,
    Committed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

/// Where a run ended up, for the caller and the exit code.
#[derive(Debug)]
pub struct GuardOutcome {
    pub phase: GuardPhase,
    pub run_status: RunStatus,
    pub record_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub operations: Vec<OperationOutcome>,
    pub detail: Option<String>,
}

impl GuardOutcome {
    /// Exit-code policy: a skip (precondition not met, lock busy) is a
    /// legitimate no-op and exits zero. Operation failures, aborted runs and
    /// rollbacks exit one. A failed rollback exits two.
    pub fn exit_code(&self) -> i32 {
        match self.phase {
            GuardPhase::RollbackFailed => 2,
            GuardPhase::Committed => match self.run_status {
                RunStatus::Success | RunStatus::Skipped => 0,
                _ => 1,
            },
            GuardPhase::Idle if self.run_status == RunStatus::Skipped => 0,
            _ => 1,
        }
    }

    fn skipped(reason: String) -> Self {
        Self {
            phase: GuardPhase::Idle,
            run_status: RunStatus::Skipped,
            record_id: None,
            snapshot_id: None,
            operations: Vec::new(),
            detail: Some(reason),
        }
    }
}

/// Wraps every maintenance run in the safety envelope: integrity pre-checks,
/// a rollback snapshot, the profile's operations, post-run verification, and
/// rollback when verification fails.
pub struct SafetyGuard {
    executor: Arc<BackgroundJobExecutor>,
    backups: Arc<BackupManager>,
    database: Arc<Database>,
    notifier: NotificationDispatcher,
    integrity: IntegrityChecker,
}

impl SafetyGuard {
    pub fn new(
        executor: Arc<BackgroundJobExecutor>,
        backups: Arc<BackupManager>,
        database: Arc<Database>,
        notifier: NotificationDispatcher,
        integrity: IntegrityChecker,
    ) -> Self {
        Self {
            executor,
            backups,
            database,
            notifier,
            integrity,
        }
    }

    /// Runs one profile end to end. Always releases the job lock, whatever
    /// phase the run ends in.
    pub async fn execute(
        &self,
        profile: &Profile,
        trigger: Trigger,
        force: bool,
    ) -> Result<GuardOutcome, OrchestratorError> {
        let session = match self
            .executor
            .begin(&profile.name, &profile.preconditions, force)
            .await?
        {
            JobStart::Ready(session) => session,
            JobStart::Busy { owner_pid } => {
                let reason = format!("already running (pid {})", owner_pid);
                return Ok(self.record_skip(profile, trigger, &reason).await?);
            }
            JobStart::Skipped { predicate, reason } => {
                let reason = format!("precondition '{}' not met: {}", predicate, reason);
                return Ok(self.record_skip(profile, trigger, &reason).await?);
            }
        };

        let result = self.run_enveloped(profile, trigger, &session).await;
        self.executor.finish(session).await?;
        result
    }

    async fn run_enveloped(
        &self,
        profile: &Profile,
        trigger: Trigger,
        session: &JobSession,
    ) -> Result<GuardOutcome, OrchestratorError> {
        let snapshot = session.snapshot();
        let mut record = ExecutionRecord::begin_run(
            &profile.name,
            trigger,
            snapshot.load_avg_one.unwrap_or(0.0),
            snapshot.memory_used_bytes.unwrap_or(0) as i64,
        );

        // PreChecking: any failure aborts before anything is touched
        let guard_user_data = profile.operations.iter().any(|op| op.touches_user_data);
        if let Err(e) = self.integrity.pre_check(guard_user_data).await {
            let detail = e.to_string();
            error!("Pre-run integrity check failed for '{}': {}", profile.name, detail);
            record.status = RunStatus::Failed;
            record.completed_at = Some(Utc::now());
            record.details = Some(detail.clone());
            self.database.insert_execution_record(&record).await?;
            self.notifier
                .send(
                    NotificationLevel::Error,
                    "Maintenance aborted",
                    &format!("'{}' aborted before any change: {}", profile.name, detail),
                    Some(&profile.name),
                )
                .await;
            return Ok(GuardOutcome {
                phase: GuardPhase::PreChecking,
                run_status: RunStatus::Failed,
                record_id: Some(record.id),
                snapshot_id: None,
                operations: Vec::new(),
                detail: Some(detail),
            });
        }

        self.database.insert_execution_record(&record).await?;

        // Snapshotting: a failed snapshot is a hard abort unless the profile
        // opted out of backups
        let snapshot_id = if profile.skip_backup {
            info!("Profile '{}' skips the rollback snapshot", profile.name);
            None
        } else {
            match self
                .backups
                .snapshot(&profile.name, &format!("before '{}' run", profile.name))
                .await
            {
                Ok(point) => Some(point.id),
                Err(e) => {
                    let detail = format!("snapshot failed: {}", e);
                    error!("{}", detail);
                    self.finalize_run(&mut record, RunStatus::Failed, 0, Some(detail.clone()))
                        .await?;
                    self.notifier
                        .send(
                            NotificationLevel::Error,
                            "Maintenance aborted",
                            &format!("'{}' aborted before any change: {}", profile.name, detail),
                            Some(&profile.name),
                        )
                        .await;
                    return Ok(GuardOutcome {
                        phase: GuardPhase::Snapshotting,
                        run_status: RunStatus::Failed,
                        record_id: Some(record.id),
                        snapshot_id: None,
                        operations: Vec::new(),
                        detail: Some(detail),
                    });
                }
            }
        };

        // Running: operations in profile order under the held lock
        let mut operations = Vec::new();
        let mut error_count: i64 = 0;
        let mut stopped = false;
        for op in &profile.operations {
            let op_started = Utc::now();
            let outcome = self
                .executor
                .run_operation(
                    session,
                    &op.name,
                    op.kind.as_str(),
                    &op.command,
                    &profile.resource_limits,
                    profile.timeout_for(op),
                )
                .await?;

            self.database
                .insert_execution_record(&ExecutionRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    operation_type: outcome.operation_type.clone(),
                    profile: profile.name.clone(),
                    status: outcome.status,
                    started_at: op_started,
                    completed_at: Some(Utc::now()),
                    duration_seconds: outcome.duration_seconds,
                    space_freed_bytes: 0,
                    files_processed: 0,
                    error_count: if outcome.succeeded() { 0 } else { 1 },
                    system_load_at_start: snapshot.load_avg_one.unwrap_or(0.0),
                    memory_usage_at_start: snapshot.memory_used_bytes.unwrap_or(0) as i64,
                    trigger,
                    details: outcome.detail.clone(),
                })
                .await?;

            if outcome.status == RunStatus::Stopped {
                warn!("Run of '{}' stopped during '{}'", profile.name, op.name);
                stopped = true;
                operations.push(outcome);
                break;
            }
            if !outcome.succeeded() {
                error_count += 1;
                if !profile.continue_on_error {
                    warn!(
                        "Operation '{}' failed and '{}' does not continue on error",
                        op.name, profile.name
                    );
                    operations.push(outcome);
                    break;
                }
            }
            operations.push(outcome);
        }

        // PostVerifying
        if let Err(verify_err) = self.integrity.post_check().await {
            return self
                .roll_back(profile, &mut record, snapshot_id, operations, verify_err)
                .await;
        }

        let run_status = if stopped {
            RunStatus::Stopped
        } else if error_count > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };
        let detail = (error_count > 0).then(|| format!("{} operations failed", error_count));
        self.finalize_run(&mut record, run_status, error_count, detail.clone())
            .await?;

        match run_status {
            RunStatus::Success => {
                info!("Maintenance run '{}' committed", profile.name);
                self.notifier
                    .send(
                        NotificationLevel::Info,
                        "Maintenance completed",
                        &format!("'{}' completed: {} operations", profile.name, operations.len()),
                        Some(&profile.name),
                    )
                    .await;
            }
            RunStatus::Stopped => {
                self.notifier
                    .send(
                        NotificationLevel::Warn,
                        "Maintenance stopped",
                        &format!("'{}' was stopped by request", profile.name),
                        Some(&profile.name),
                    )
                    .await;
            }
            _ => {
                self.notifier
                    .send(
                        NotificationLevel::Error,
                        "Maintenance completed with errors",
                        &format!(
                            "'{}' finished but {} operations failed",
                            profile.name, error_count
                        ),
                        Some(&profile.name),
                    )
                    .await;
            }
        }

        Ok(GuardOutcome {
            phase: GuardPhase::Committed,
            run_status,
            record_id: Some(record.id),
            snapshot_id,
            operations,
            detail,
        })
    }

    /// Post-run verification failed: restore the snapshot, or escalate when
    /// there is nothing to restore or the restore itself fails.
    async fn roll_back(
        &self,
        profile: &Profile,
        record: &mut ExecutionRecord,
        snapshot_id: Option<String>,
        operations: Vec<OperationOutcome>,
        verify_err: GuardError,
    ) -> Result<GuardOutcome, OrchestratorError> {
        error!(
            "Post-run verification failed for '{}': {}",
            profile.name, verify_err
        );

        let Some(snapshot_id) = snapshot_id else {
            return self
                .rollback_failed(
                    profile,
                    record,
                    None,
                    operations,
                    format!(
                        "{}; no snapshot to restore (backups were skipped)",
                        verify_err
                    ),
                )
                .await;
        };

        // The restore overwrites the state under inspection, so preserve it
        // first for post-mortem. Failure to do so must not block the rollback.
        match self
            .backups
            .emergency_snapshot(&format!("before rollback of '{}'", profile.name))
            .await
        {
            Ok(point) => info!("Pre-rollback snapshot '{}' captured", point.id),
            Err(e) => warn!("Pre-rollback snapshot failed: {}", e),
        }

        match self.backups.restore(&snapshot_id).await {
            Ok(report) => {
                let manual = report.manual_steps().count();
                let detail = format!(
                    "verification failed ({}); snapshot {} restored, {} subsystems need manual follow-up",
                    verify_err, snapshot_id, manual
                );
                warn!("{}", detail);
                self.finalize_run(record, RunStatus::Failed, 1, Some(detail.clone()))
                    .await?;
                self.notifier
                    .send(
                        NotificationLevel::Error,
                        "Maintenance rolled back",
                        &format!("'{}': {}", profile.name, detail),
                        Some(&profile.name),
                    )
                    .await;
                Ok(GuardOutcome {
                    phase: GuardPhase::RolledBack,
                    run_status: RunStatus::Failed,
                    record_id: Some(record.id.clone()),
                    snapshot_id: Some(snapshot_id),
                    operations,
                    detail: Some(detail),
                })
            }
            Err(restore_err) => {
                self.rollback_failed(
                    profile,
                    record,
                    Some(snapshot_id.clone()),
                    operations,
                    format!(
                        "{}; restore of snapshot {} failed: {}",
                        verify_err, snapshot_id, restore_err
                    ),
                )
                .await
            }
        }
    }

    /// The one path that never suppresses a user-facing alert: capture an
    /// emergency snapshot of the now-unknown state and raise CRITICAL.
    async fn rollback_failed(
        &self,
        profile: &Profile,
        record: &mut ExecutionRecord,
        snapshot_id: Option<String>,
        operations: Vec<OperationOutcome>,
        detail: String,
    ) -> Result<GuardOutcome, OrchestratorError> {
        error!("Rollback failed for '{}': {}", profile.name, detail);

        match self
            .backups
            .emergency_snapshot(&format!("after failed rollback of '{}'", profile.name))
            .await
        {
            Ok(point) => info!("Emergency snapshot '{}' captured", point.id),
            Err(e) => error!("Emergency snapshot also failed: {}", e),
        }

        self.finalize_run(record, RunStatus::Failed, 1, Some(detail.clone()))
            .await?;
        self.notifier
            .send(
                NotificationLevel::Critical,
                "Maintenance rollback failed",
                &format!(
                    "'{}' left the system in an unverified state, manual intervention required: {}",
                    profile.name, detail
                ),
                Some(&profile.name),
            )
            .await;

        Ok(GuardOutcome {
            phase: GuardPhase::RollbackFailed,
            run_status: RunStatus::Failed,
            record_id: Some(record.id.clone()),
            snapshot_id,
            operations,
            detail: Some(detail),
        })
    }

    async fn finalize_run(
        &self,
        record: &mut ExecutionRecord,
        status: RunStatus,
        error_count: i64,
        details: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let completed = Utc::now();
        record.status = status;
        record.completed_at = Some(completed);
        record.duration_seconds = (completed - record.started_at).num_seconds();
        record.error_count = error_count;
        record.details = details;
        self.database.complete_execution_record(record).await?;
        Ok(())
    }

    /// Records a skipped run (precondition not met or lock busy) without
    /// entering the envelope. Skips surface at INFO only.
    async fn record_skip(
        &self,
        profile: &Profile,
        trigger: Trigger,
        reason: &str,
    ) -> Result<GuardOutcome, OrchestratorError> {
        info!("Skipping run of '{}': {}", profile.name, reason);

        let now = Utc::now();
        let mut record = ExecutionRecord::begin_run(&profile.name, trigger, 0.0, 0);
        record.status = RunStatus::Skipped;
        record.completed_at = Some(now);
        record.details = Some(reason.to_string());
        self.database.insert_execution_record(&record).await?;

        self.notifier
            .send(
                NotificationLevel::Info,
                "Maintenance skipped",
                &format!("'{}' skipped: {}", profile.name, reason),
                Some(&profile.name),
            )
            .await;

        let mut outcome = GuardOutcome::skipped(reason.to_string());
        outcome.record_id = Some(record.id);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupManager, BackupSources};
    use crate::config::NotificationConfig;
    use crate::lock_manager::JobLockManager;
    use crate::preconditions::PreconditionEvaluator;
    use crate::profiles::{OperationKind, OperationSpec, Preconditions, Profile, ResourceLimits};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn quiet_notifications() -> NotificationConfig {
        NotificationConfig {
            level: "DEBUG".to_string(),
            desktop_enabled: false,
            email_enabled: false,
            email_to: None,
            webhook_url: None,
        }
    }

    fn passing_checker() -> IntegrityChecker {
        IntegrityChecker::new(Vec::new(), Vec::new(), Vec::new(), None)
    }

    fn failing_post_checker(dir: &Path) -> IntegrityChecker {
        // Present at pre-check time; the test removes it mid-run to force a
        // post-verification failure
        IntegrityChecker::new(vec![dir.to_path_buf()], Vec::new(), Vec::new(), None)
    }

    fn test_profile(name: &str, commands: &[(&str, &str)]) -> Profile {
        Profile {
            name: name.to_string(),
            description: String::new(),
            schedule: "daily".to_string(),
            operations: commands
                .iter()
                .map(|(op_name, command)| OperationSpec {
                    name: op_name.to_string(),
                    kind: OperationKind::Custom,
                    command: command.to_string(),
                    timeout_seconds: Some(30),
                    touches_user_data: false,
                })
                .collect(),
            resource_limits: ResourceLimits::default(),
            preconditions: Preconditions::default(),
            notify_threshold: NotificationLevel::Info,
            log_level: "info".to_string(),
            continue_on_error: false,
            skip_backup: false,
            operation_timeout_seconds: 60,
        }
    }

    struct Harness {
        _dir: TempDir,
        guard: SafetyGuard,
        database: Arc<Database>,
        config_root: PathBuf,
        sentinel: PathBuf,
    }

    async fn harness(checker_from_sentinel: bool) -> Harness {
        let dir = TempDir::new().unwrap();
        let config_root = dir.path().join("etc");
        tokio::fs::create_dir_all(&config_root).await.unwrap();
        tokio::fs::write(config_root.join("main.toml"), "retention = 5\n")
            .await
            .unwrap();
        let sentinel = dir.path().join("sentinel");
        tokio::fs::create_dir_all(&sentinel).await.unwrap();

        let database = Arc::new(
            Database::new(dir.path().join("history.db").to_str().unwrap(), 90)
                .await
                .unwrap(),
        );
        let lock_manager = Arc::new(JobLockManager::new(dir.path().join("locks")));
        let executor = Arc::new(BackgroundJobExecutor::new(
            lock_manager,
            Arc::new(PreconditionEvaluator::new()),
            dir.path().join("logs"),
        ));
        let backups = Arc::new(BackupManager::new(
            dir.path().join("snapshots"),
            5,
            BackupSources {
                config_paths: vec![config_root.clone()],
                user_data_paths: Vec::new(),
                capture_package_state: false,
                capture_service_state: false,
            },
        ));
        let notifier = NotificationDispatcher::new(quiet_notifications(), database.clone());
        let integrity = if checker_from_sentinel {
            failing_post_checker(&sentinel)
        } else {
            passing_checker()
        };

        Harness {
            guard: SafetyGuard::new(executor, backups, database.clone(), notifier, integrity),
            database,
            config_root,
            sentinel,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_successful_run_commits() {
        let h = harness(false).await;
        let profile = test_profile("standard", &[("touch", "true")]);

        let outcome = h.guard.execute(&profile, Trigger::Manual, false).await.unwrap();

        assert_eq!(outcome.phase, GuardPhase::Committed);
        assert_eq!(outcome.run_status, RunStatus::Success);
        assert_eq!(outcome.exit_code(), 0);
        assert!(outcome.snapshot_id.is_some());

        let record = h
            .database
            .get_execution_record(outcome.record_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RunStatus::Success);
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_operation_stops_run_without_continue_on_error() {
        let h = harness(false).await;
        let profile = test_profile("standard", &[("boom", "exit 3"), ("never", "true")]);

        let outcome = h.guard.execute(&profile, Trigger::Manual, false).await.unwrap();

        assert_eq!(outcome.phase, GuardPhase::Committed);
        assert_eq!(outcome.run_status, RunStatus::Failed);
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(outcome.operations.len(), 1, "second operation must not run");
    }

    #[tokio::test]
    async fn test_continue_on_error_runs_remaining_operations() {
        let h = harness(false).await;
        let mut profile = test_profile("standard", &[("boom", "exit 3"), ("after", "true")]);
        profile.continue_on_error = true;

        let outcome = h.guard.execute(&profile, Trigger::Manual, false).await.unwrap();

        assert_eq!(outcome.operations.len(), 2);
        assert_eq!(outcome.run_status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_precondition_skip_takes_no_snapshot() {
        let h = harness(false).await;
        let mut profile = test_profile("standard", &[("noop", "true")]);
        // Unsatisfiable free-disk bound forces a skip
        profile.preconditions.min_free_disk_gb = Some(u64::MAX);

        let outcome = h.guard.execute(&profile, Trigger::Scheduled, false).await.unwrap();

        assert_eq!(outcome.run_status, RunStatus::Skipped);
        assert_eq!(outcome.exit_code(), 0);
        assert!(outcome.snapshot_id.is_none());
        // Nothing staged, nothing sealed
        assert!(!h._dir.path().join("snapshots").exists()
            || std::fs::read_dir(h._dir.path().join("snapshots")).unwrap().count() == 0);

        let record = h
            .database
            .get_execution_record(outcome.record_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RunStatus::Skipped);
    }

    #[tokio::test]
    async fn test_post_verification_failure_rolls_back() {
        let h = harness(true).await;
        // The operation corrupts the config and removes the sentinel the
        // post-check depends on
        let command = format!(
            "echo broken > '{}' && rmdir '{}'",
            h.config_root.join("main.toml").display(),
            h.sentinel.display()
        );
        let profile = test_profile("standard", &[("corrupt", &command)]);

        let outcome = h.guard.execute(&profile, Trigger::Manual, false).await.unwrap();

        assert_eq!(outcome.phase, GuardPhase::RolledBack);
        assert_eq!(outcome.exit_code(), 1);
        // The snapshot restored the original config
        let restored = tokio::fs::read_to_string(h.config_root.join("main.toml"))
            .await
            .unwrap();
        assert_eq!(restored, "retention = 5\n");

        // The corrupted state was preserved before the restore: the pre-run
        // snapshot plus an emergency one taken ahead of the rollback
        let archives = std::fs::read_dir(h._dir.path().join("snapshots"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tar.gz"))
            .count();
        assert!(archives >= 2, "expected pre-run and pre-rollback archives");
    }

    #[tokio::test]
    async fn test_post_verification_failure_without_snapshot_is_critical() {
        let h = harness(true).await;
        let command = format!("rmdir '{}'", h.sentinel.display());
        let mut profile = test_profile("standard", &[("corrupt", &command)]);
        profile.skip_backup = true;

        let outcome = h.guard.execute(&profile, Trigger::Manual, false).await.unwrap();

        assert_eq!(outcome.phase, GuardPhase::RollbackFailed);
        assert_eq!(outcome.exit_code(), 2);

        let events = h.database.recent_notification_events(10).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.level == NotificationLevel::Critical));
    }

    #[tokio::test]
    async fn test_guard_releases_lock_after_run() {
        let h = harness(false).await;
        let profile = test_profile("standard", &[("noop", "true")]);

        h.guard.execute(&profile, Trigger::Manual, false).await.unwrap();
        // A second run acquires the lock again rather than reporting busy
        let outcome = h.guard.execute(&profile, Trigger::Manual, false).await.unwrap();
        assert_eq!(outcome.run_status, RunStatus::Success);
    }
}
