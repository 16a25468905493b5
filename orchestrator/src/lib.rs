// File: orchestrator/src/lib.rs
pub mod backup;
pub mod config;
pub mod constants;
pub mod database;
pub mod errors;
pub mod lock_manager;
pub mod preconditions;
pub mod profiles;
pub mod resource_limits;
pub mod safety;
pub mod scheduler;
pub mod services;
pub mod timer;

// Re-export commonly used types
pub use backup::{BackupManager, BackupSources, RestoreReport, SnapshotPoint};
pub use config::{Config, ConfigManager, NotificationConfig};
pub use database::records::{ExecutionRecord, NotificationLevel, RunStatus, Trigger};
pub use database::Database;
pub use errors::OrchestratorError;
pub use lock_manager::JobLockManager;
pub use preconditions::PreconditionEvaluator;
pub use profiles::{Profile, ProfileRegistry};
pub use safety::{IntegrityChecker, SafetyGuard};
pub use scheduler::{SchedulerFacade, StateStore};
pub use services::{BackgroundJobExecutor, NotificationDispatcher};
pub use timer::TimerBinder;
