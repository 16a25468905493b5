//! Custom error types for the maintenance orchestrator
//!
//! Provides structured error handling with context for different failure scenarios.

use std::fmt;

/// Main error type for the orchestrator
#[derive(Debug)]
pub enum OrchestratorError {
    /// Configuration-related errors
    Config(ConfigError),

    /// Profile registry errors
    Profile(ProfileError),

    /// Job lock errors
    Lock(LockError),

    /// History database errors
    Database(DatabaseError),

    /// Job execution errors
    Execution(ExecutionError),

    /// Snapshot and rollback errors
    Snapshot(SnapshotError),

    /// Safety guard errors
    Guard(GuardError),

    /// Platform timer binding errors
    Timer(TimerError),

    /// Other errors with context
    Other(String),
}

/// Configuration error variants
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to load configuration file
    LoadFailed { path: String, reason: String },

    /// Invalid configuration value
    InvalidValue { field: String, reason: String },

    /// Missing required configuration
    MissingRequired { field: String },

    /// Configuration parsing error
    ParseError { reason: String },
}

/// Profile registry error variants
#[derive(Debug)]
pub enum ProfileError {
    /// Profile not found in either tier
    NotFound { name: String },

    /// Schedule expression rejected by the grammar
    InvalidSchedule { expr: String, reason: String },

    /// Profile file could not be parsed
    ParseFailed { path: String, reason: String },

    /// Profile file could not be written
    WriteFailed { name: String, reason: String },

    /// Profile still has a bound timer and cannot be deleted
    TimerStillActive { name: String },
}

/// Job lock error variants
#[derive(Debug)]
pub enum LockError {
    /// Lock is held by a live owner
    Busy { job_name: String, owner_pid: u32 },

    /// Lock file could not be read or written
    Io { job_name: String, reason: String },

    /// Lock file exists but does not parse
    Corrupted { job_name: String, reason: String },

    /// Release attempted by a process that is not the recorded owner
    NotOwner { job_name: String, owner_pid: u32 },
}

/// Database error variants
#[derive(Debug)]
pub enum DatabaseError {
    /// Connection failed
    ConnectionFailed { reason: String },

    /// Query execution failed
    QueryFailed { query: String, reason: String },

    /// Data serialization/deserialization error
    SerializationError { reason: String },
}

/// Job execution error variants
#[derive(Debug)]
pub enum ExecutionError {
    /// Command could not be spawned
    SpawnFailed { operation: String, reason: String },

    /// Command exited non-zero
    OperationFailed {
        operation: String,
        exit_code: i32,
        reason: String,
    },

    /// Command exceeded its wall-clock timeout
    Timeout { operation: String, seconds: u64 },

    /// Stop request could not be delivered
    StopFailed { job_name: String, reason: String },
}

/// Snapshot error variants
#[derive(Debug)]
pub enum SnapshotError {
    /// Snapshot archive creation failed
    CreateFailed { label: String, reason: String },

    /// Archive failed post-creation verification
    VerificationFailed { id: String, reason: String },

    /// Snapshot not found on disk
    NotFound { id: String },

    /// Restore of an archived subsystem failed
    RestoreFailed { id: String, reason: String },
}

/// Safety guard error variants
#[derive(Debug)]
pub enum GuardError {
    /// Pre-run integrity check failed, nothing was changed
    IntegrityCheckFailed { check: String, reason: String },

    /// Snapshot phase failed, run aborted before mutation
    SnapshotFailed { reason: String },

    /// Post-run verification failed, rollback was triggered
    PostVerificationFailed { check: String, reason: String },

    /// Rollback itself failed, operator intervention required
    RollbackFailed { snapshot_id: String, reason: String },
}

/// Platform timer error variants
#[derive(Debug)]
pub enum TimerError {
    /// Unit file could not be written
    InstallFailed { unit: String, reason: String },

    /// systemctl invocation failed
    SystemctlFailed { command: String, reason: String },

    /// No timer is bound for the profile
    NotInstalled { profile: String },
}

// Implement Display for all error types
impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::Config(e) => write!(f, "Configuration error: {}", e),
            OrchestratorError::Profile(e) => write!(f, "Profile error: {}", e),
            OrchestratorError::Lock(e) => write!(f, "Lock error: {}", e),
            OrchestratorError::Database(e) => write!(f, "Database error: {}", e),
            OrchestratorError::Execution(e) => write!(f, "Execution error: {}", e),
            OrchestratorError::Snapshot(e) => write!(f, "Snapshot error: {}", e),
            OrchestratorError::Guard(e) => write!(f, "Safety guard error: {}", e),
            OrchestratorError::Timer(e) => write!(f, "Timer error: {}", e),
            OrchestratorError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::LoadFailed { path, reason } => {
                write!(f, "Failed to load config from '{}': {}", path, reason)
            }
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "Invalid value for '{}': {}", field, reason)
            }
            ConfigError::MissingRequired { field } => {
                write!(f, "Missing required field: {}", field)
            }
            ConfigError::ParseError { reason } => {
                write!(f, "Failed to parse config: {}", reason)
            }
        }
    }
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileError::NotFound { name } => {
                write!(f, "Profile '{}' not found", name)
            }
            ProfileError::InvalidSchedule { expr, reason } => {
                write!(f, "Invalid schedule '{}': {}", expr, reason)
            }
            ProfileError::ParseFailed { path, reason } => {
                write!(f, "Failed to parse profile '{}': {}", path, reason)
            }
            ProfileError::WriteFailed { name, reason } => {
                write!(f, "Failed to write profile '{}': {}", name, reason)
            }
            ProfileError::TimerStillActive { name } => {
                write!(
                    f,
                    "Profile '{}' still has an active timer; disable it first",
                    name
                )
            }
        }
    }
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Busy {
                job_name,
                owner_pid,
            } => {
                write!(
                    f,
                    "Job '{}' is locked by live process {}",
                    job_name, owner_pid
                )
            }
            LockError::Io { job_name, reason } => {
                write!(f, "Lock I/O for '{}' failed: {}", job_name, reason)
            }
            LockError::Corrupted { job_name, reason } => {
                write!(f, "Lock file for '{}' is corrupted: {}", job_name, reason)
            }
            LockError::NotOwner {
                job_name,
                owner_pid,
            } => {
                write!(
                    f,
                    "Lock for '{}' is owned by process {}, refusing release",
                    job_name, owner_pid
                )
            }
        }
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseError::ConnectionFailed { reason } => {
                write!(f, "Database connection failed: {}", reason)
            }
            DatabaseError::QueryFailed { query, reason } => {
                write!(f, "Query '{}' failed: {}", query, reason)
            }
            DatabaseError::SerializationError { reason } => {
                write!(f, "Serialization error: {}", reason)
            }
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::SpawnFailed { operation, reason } => {
                write!(f, "Failed to spawn '{}': {}", operation, reason)
            }
            ExecutionError::OperationFailed {
                operation,
                exit_code,
                reason,
            } => {
                write!(
                    f,
                    "Operation '{}' failed with exit code {}: {}",
                    operation, exit_code, reason
                )
            }
            ExecutionError::Timeout { operation, seconds } => {
                write!(f, "Operation '{}' timed out after {}s", operation, seconds)
            }
            ExecutionError::StopFailed { job_name, reason } => {
                write!(f, "Failed to stop job '{}': {}", job_name, reason)
            }
        }
    }
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::CreateFailed { label, reason } => {
                write!(f, "Failed to create snapshot '{}': {}", label, reason)
            }
            SnapshotError::VerificationFailed { id, reason } => {
                write!(f, "Snapshot '{}' failed verification: {}", id, reason)
            }
            SnapshotError::NotFound { id } => {
                write!(f, "Snapshot '{}' not found", id)
            }
            SnapshotError::RestoreFailed { id, reason } => {
                write!(f, "Failed to restore snapshot '{}': {}", id, reason)
            }
        }
    }
}

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardError::IntegrityCheckFailed { check, reason } => {
                write!(f, "Integrity check '{}' failed: {}", check, reason)
            }
            GuardError::SnapshotFailed { reason } => {
                write!(f, "Snapshot phase failed: {}", reason)
            }
            GuardError::PostVerificationFailed { check, reason } => {
                write!(f, "Post-run verification '{}' failed: {}", check, reason)
            }
            GuardError::RollbackFailed {
                snapshot_id,
                reason,
            } => {
                write!(
                    f,
                    "Rollback of snapshot '{}' failed: {}",
                    snapshot_id, reason
                )
            }
        }
    }
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerError::InstallFailed { unit, reason } => {
                write!(f, "Failed to install unit '{}': {}", unit, reason)
            }
            TimerError::SystemctlFailed { command, reason } => {
                write!(f, "systemctl {} failed: {}", command, reason)
            }
            TimerError::NotInstalled { profile } => {
                write!(f, "No timer installed for profile '{}'", profile)
            }
        }
    }
}

// Implement std::error::Error
impl std::error::Error for OrchestratorError {}
impl std::error::Error for ConfigError {}
impl std::error::Error for ProfileError {}
impl std::error::Error for LockError {}
impl std::error::Error for DatabaseError {}
impl std::error::Error for ExecutionError {}
impl std::error::Error for SnapshotError {}
impl std::error::Error for GuardError {}
impl std::error::Error for TimerError {}

// Conversions from anyhow::Error for gradual migration
impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Other(err.to_string())
    }
}

// Conversion helpers for sub-errors
impl From<ConfigError> for OrchestratorError {
    fn from(err: ConfigError) -> Self {
        OrchestratorError::Config(err)
    }
}

impl From<ProfileError> for OrchestratorError {
    fn from(err: ProfileError) -> Self {
        OrchestratorError::Profile(err)
    }
}

impl From<LockError> for OrchestratorError {
    fn from(err: LockError) -> Self {
        OrchestratorError::Lock(err)
    }
}

impl From<DatabaseError> for OrchestratorError {
    fn from(err: DatabaseError) -> Self {
        OrchestratorError::Database(err)
    }
}

impl From<ExecutionError> for OrchestratorError {
    fn from(err: ExecutionError) -> Self {
        OrchestratorError::Execution(err)
    }
}

impl From<SnapshotError> for OrchestratorError {
    fn from(err: SnapshotError) -> Self {
        OrchestratorError::Snapshot(err)
    }
}

impl From<GuardError> for OrchestratorError {
    fn from(err: GuardError) -> Self {
        OrchestratorError::Guard(err)
    }
}

impl From<TimerError> for OrchestratorError {
    fn from(err: TimerError) -> Self {
        OrchestratorError::Timer(err)
    }
}
