//! Database record types (entities).
//!
//! This module contains all the record structs used by the history layer,
//! plus the closed status/trigger/level vocabularies they are typed with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Schema version written into the database metadata table
pub const SCHEMA_VERSION: i64 = 1;

/// Record type tag used for run-level summary rows
pub const RUN_RECORD_TYPE: &str = "maintenance_run";

// ============================================================================
// Closed vocabularies
// ============================================================================

/// Final (or transient) status of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Still executing; repaired to `Crashed` if found stuck at init
    Running,
    Success,
    Failed,
    Stopped,
    Crashed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
            RunStatus::Crashed => "crashed",
            RunStatus::Skipped => "skipped",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "stopped" => Ok(RunStatus::Stopped),
            "crashed" => Ok(RunStatus::Crashed),
            "skipped" => Ok(RunStatus::Skipped),
            other => Err(format!("Unknown run status: {}", other)),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a run to start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Scheduled,
    Manual,
    Emergency,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
            Trigger::Emergency => "emergency",
        }
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Trigger::Scheduled),
            "manual" => Ok(Trigger::Manual),
            "emergency" => Ok(Trigger::Emergency),
            other => Err(format!("Unknown trigger: {}", other)),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification severity; ordering is total so thresholds can filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationLevel {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl NotificationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationLevel::Debug => "DEBUG",
            NotificationLevel::Info => "INFO",
            NotificationLevel::Warn => "WARN",
            NotificationLevel::Error => "ERROR",
            NotificationLevel::Critical => "CRITICAL",
        }
    }
}

impl FromStr for NotificationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(NotificationLevel::Debug),
            "INFO" => Ok(NotificationLevel::Info),
            "WARN" | "WARNING" => Ok(NotificationLevel::Warn),
            "ERROR" => Ok(NotificationLevel::Error),
            "CRITICAL" => Ok(NotificationLevel::Critical),
            other => Err(format!("Unknown notification level: {}", other)),
        }
    }
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Execution and notification entities
// ============================================================================

/// One immutable row describing a single execution.
///
/// Rows exist at two granularities: one per operation inside a run
/// (`operation_type` is the operation's kind tag) and one summary per run
/// (`operation_type` is [`RUN_RECORD_TYPE`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub operation_type: String,
    pub profile: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: i64,
    pub space_freed_bytes: i64,
    pub files_processed: i64,
    pub error_count: i64,
    pub system_load_at_start: f64,
    pub memory_usage_at_start: i64,
    pub trigger: Trigger,
    pub details: Option<String>,
}

impl ExecutionRecord {
    /// Starts a run-level summary row in the `running` state.
    pub fn begin_run(
        profile: &str,
        trigger: Trigger,
        system_load: f64,
        memory_usage: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation_type: RUN_RECORD_TYPE.to_string(),
            profile: profile.to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_seconds: 0,
            space_freed_bytes: 0,
            files_processed: 0,
            error_count: 0,
            system_load_at_start: system_load,
            memory_usage_at_start: memory_usage,
            trigger,
            details: None,
        }
    }

    pub fn is_run_summary(&self) -> bool {
        self.operation_type == RUN_RECORD_TYPE
    }
}

/// One write-once notification event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEventRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
    pub operation: Option<String>,
}
