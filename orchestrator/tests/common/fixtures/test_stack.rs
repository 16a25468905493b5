//! A complete orchestrator stack wired into a temporary directory, so
//! integration tests can drive the facade the way the CLI does.

use orchestrator::backup::{BackupManager, BackupSources};
use orchestrator::config::NotificationConfig;
use orchestrator::database::Database;
use orchestrator::lock_manager::JobLockManager;
use orchestrator::preconditions::PreconditionEvaluator;
use orchestrator::profiles::{Profile, ProfileRegistry, ProfileTier};
use orchestrator::safety::{IntegrityChecker, SafetyGuard};
use orchestrator::scheduler::{SchedulerFacade, StateStore};
use orchestrator::services::{BackgroundJobExecutor, NotificationDispatcher};
use orchestrator::timer::TimerBinder;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub struct StackOptions {
    pub webhook_url: Option<String>,
    /// When set, a sentinel directory is created and wired into the post-run
    /// integrity check; an operation that removes it forces a rollback.
    pub sentinel_post_check: bool,
    pub snapshot_retention: usize,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            webhook_url: None,
            sentinel_post_check: false,
            snapshot_retention: 5,
        }
    }
}

pub struct TestStack {
    pub dir: TempDir,
    pub facade: SchedulerFacade,
    pub database: Arc<Database>,
    pub registry_user_dir: PathBuf,
    /// The directory the backup manager snapshots
    pub config_root: PathBuf,
    pub sentinel: PathBuf,
    pub state_file: PathBuf,
    pub snapshots_dir: PathBuf,
}

impl TestStack {
    pub async fn new() -> Self {
        Self::with_options(StackOptions::default()).await
    }

    pub async fn with_options(options: StackOptions) -> Self {
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
            lock_manager.clone(),
            Arc::new(PreconditionEvaluator::new()),
            dir.path().join("logs"),
        ));
        let snapshots_dir = dir.path().join("snapshots");
        let backups = Arc::new(BackupManager::new(
            snapshots_dir.clone(),
            options.snapshot_retention,
            BackupSources {
                config_paths: vec![config_root.clone()],
                user_data_paths: Vec::new(),
                capture_package_state: false,
                capture_service_state: false,
            },
        ));

        let notifier = NotificationDispatcher::new(
            NotificationConfig {
                level: "DEBUG".to_string(),
                desktop_enabled: false,
                email_enabled: false,
                email_to: None,
                webhook_url: options.webhook_url,
            },
            database.clone(),
        );

        let integrity = if options.sentinel_post_check {
            IntegrityChecker::new(vec![sentinel.clone()], Vec::new(), Vec::new(), None)
        } else {
            IntegrityChecker::new(Vec::new(), Vec::new(), Vec::new(), None)
        };

        let guard = SafetyGuard::new(
            executor.clone(),
            backups,
            database.clone(),
            notifier.clone(),
            integrity,
        );

        let registry_user_dir = dir.path().join("profiles-user");
        let registry = ProfileRegistry::new(dir.path().join("profiles-system"), registry_user_dir.clone());
        let binder = TimerBinder::new(
            dir.path().join("units"),
            PathBuf::from("/usr/local/bin/sysmaint"),
        );
        let state_file = dir.path().join("state.json");
        let facade = SchedulerFacade::new(
            registry,
            guard,
            executor,
            binder,
            database.clone(),
            lock_manager,
            notifier,
            StateStore::new(state_file.clone()),
        );

        Self {
            facade,
            database,
            registry_user_dir,
            config_root,
            sentinel,
            state_file,
            snapshots_dir,
            dir,
        }
    }

    /// Writes a profile into the user tier so the facade can load it.
    pub async fn save_profile(&self, profile: &Profile) {
        let registry = ProfileRegistry::new(
            self.dir.path().join("profiles-system"),
            self.registry_user_dir.clone(),
        );
        registry.save(profile, ProfileTier::User).await.unwrap();
    }

    pub fn snapshot_count(&self) -> usize {
        match std::fs::read_dir(&self.snapshots_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().ends_with(".tar.gz"))
                .count(),
            Err(_) => 0,
        }
    }
}
