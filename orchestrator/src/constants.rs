//! Application-wide constants for timeouts, limits, and configuration values

//! Central repository for all configuration constants and magic numbers
//!
//! This module organizes constants by category to improve maintainability
//! and provide a single source of truth for timeouts, intervals, and limits.

#![allow(dead_code)] // Some constants are defined for future use

use std::time::Duration;

/// Job execution constants
pub mod execution {
    use super::Duration;

    /// Default wall-clock timeout for a single operation command
    pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(3600);

    /// Grace period between SIGTERM and SIGKILL when terminating a job
    pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(10);

    /// Polling interval while waiting for a signalled child to exit
    pub const TERMINATION_POLL_INTERVAL: Duration = Duration::from_millis(200);

    /// Interval between resource usage samples while a job runs
    pub const USAGE_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

    /// Maximum time to wait for the sampling task to join after a run
    pub const SAMPLER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Job lock constants
pub mod locks {
    /// Minutes after which a lock with a dead owner is reported in sweeps
    pub const SWEEP_REPORT_AGE_MINUTES: i64 = 1;

    /// File extension for lock records
    pub const LOCK_FILE_EXTENSION: &str = "lock";
}

/// Snapshot and rollback constants
pub mod snapshots {
    /// Default number of snapshots retained before oldest-first deletion
    pub const DEFAULT_RETENTION_COUNT: usize = 5;

    /// Minimum plausible archive size in bytes; smaller archives fail verification
    pub const MIN_ARCHIVE_SIZE_BYTES: u64 = 64;

    /// Subdirectory of a snapshot used for restore staging
    pub const RESTORE_STAGING_DIR: &str = "restore-staging";

    /// Label prefix for emergency snapshots taken after a failed rollback
    pub const EMERGENCY_LABEL_PREFIX: &str = "emergency";
}

/// History store constants
pub mod history {
    /// Days of execution history kept by the compaction sweep
    pub const DEFAULT_RETENTION_DAYS: i64 = 90;

    /// Hours after which a record still marked running is treated as crashed
    pub const STUCK_RUN_HOURS: i64 = 6;

    /// Recent window for trend analysis (days)
    pub const TREND_RECENT_DAYS: i64 = 7;

    /// Baseline window preceding the recent window (days)
    pub const TREND_BASELINE_DAYS: i64 = 14;

    /// Window for repeated-failure suggestion scanning (days)
    pub const SUGGESTION_WINDOW_DAYS: i64 = 30;

    /// Failures of the same operation within the window that trigger a suggestion
    pub const SUGGESTION_FAILURE_THRESHOLD: i64 = 3;

    /// Maximum rows returned by history queries
    pub const MAX_HISTORY_ROWS: i64 = 500;
}

/// Notification constants
pub mod notifications {
    use super::Duration;

    /// Webhook request timeout
    pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

    /// Timeout for desktop and email channel commands
    pub const CHANNEL_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

    /// Command used for desktop notifications
    pub const DESKTOP_COMMAND: &str = "notify-send";

    /// Command used for email delivery
    pub const EMAIL_COMMAND: &str = "mail";
}

/// Default precondition thresholds
pub mod preconditions {
    /// Maximum 1-minute load average permitted by default
    pub const DEFAULT_MAX_SYSTEM_LOAD: f64 = 0.8;

    /// Minimum user idle time in seconds
    pub const DEFAULT_MIN_IDLE_SECONDS: u64 = 300;

    /// Minimum free disk space in gigabytes
    pub const DEFAULT_MIN_FREE_DISK_GB: u64 = 1;

    /// Minimum battery percentage when not on AC power
    pub const DEFAULT_MIN_BATTERY_PERCENT: u64 = 20;

    /// Timeout for the idle-time probe command
    pub const IDLE_PROBE_TIMEOUT_SECONDS: u64 = 5;
}

/// Platform timer binding constants
pub mod timer {
    /// Prefix for generated systemd unit names
    pub const UNIT_PREFIX: &str = "sysmaint";

    /// Default directory for installed unit files
    pub const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

    /// Seconds to wait for systemctl commands
    pub const SYSTEMCTL_TIMEOUT_SECONDS: u64 = 30;
}

/// Default filesystem layout
pub mod defaults {
    /// Application directory name under the state root
    pub const APP_DIR_NAME: &str = "sysmaint";

    /// Database file name under the state directory
    pub const DATABASE_FILE: &str = "history.db";

    /// Scheduler state file name under the state directory
    pub const STATE_FILE: &str = "scheduler_state.json";

    /// Subdirectory for job locks
    pub const LOCKS_DIR: &str = "locks";

    /// Subdirectory for snapshots
    pub const SNAPSHOTS_DIR: &str = "snapshots";

    /// Subdirectory for per-run logs
    pub const RUN_LOGS_DIR: &str = "runs";

    /// Subdirectory for system-tier profiles
    pub const SYSTEM_PROFILES_DIR: &str = "profiles";

    /// Subdirectory for user-tier profile overrides
    pub const USER_PROFILES_DIR: &str = "profiles.d";
}
