//! Maintenance profile definitions.
//!
//! A profile names an ordered list of opaque cleanup commands together with
//! the schedule, preconditions, resource limits, and notification thresholds
//! that govern how the safety guard runs them. Profiles are TOML files; the
//! schedule grammar and operation kinds are validated here once at load time.

pub mod registry;

use crate::database::records::NotificationLevel;
use crate::errors::ProfileError;
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::fmt;
pub use registry::{ProfileRegistry, ProfileTier};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub schedule: String,
    #[serde(default)]
    pub operations: Vec<OperationSpec>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    #[serde(default)]
    pub preconditions: Preconditions,
    #[serde(default = "default_notify_threshold")]
    pub notify_threshold: NotificationLevel,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_continue_on_error")]
    pub continue_on_error: bool,
    #[serde(default)]
    pub skip_backup: bool,
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_seconds: u64,
}

/// One opaque command inside a profile. The kind tag is a closed set resolved
/// at deserialization; the command itself stays an uninterpreted shell string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSpec {
    pub name: String,
    pub kind: OperationKind,
    pub command: String,
    pub timeout_seconds: Option<u64>,
    /// Operations that sweep user or development directories; the guard skips
    /// the whole run if a protected interactive session is active.
    #[serde(default)]
    pub touches_user_data: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    PackageCache,
    BrowserCache,
    KernelPackages,
    TempFiles,
    LogCleanup,
    Custom,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::PackageCache => "package_cache",
            OperationKind::BrowserCache => "browser_cache",
            OperationKind::KernelPackages => "kernel_packages",
            OperationKind::TempFiles => "temp_files",
            OperationKind::LogCleanup => "log_cleanup",
            OperationKind::Custom => "custom",
        }
    }

    /// Kinds that remove packages or kernels mutate system state that only a
    /// snapshot can bring back.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            OperationKind::KernelPackages | OperationKind::PackageCache | OperationKind::Custom
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Best-effort limits applied to each spawned operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU scheduling niceness, -20..=19
    pub nice_level: Option<i32>,
    /// I/O scheduling class
    pub io_class: Option<IoClass>,
    /// Priority within the best-effort class, 0..=7
    pub io_priority: Option<u8>,
    /// Address-space ceiling in megabytes
    pub memory_limit_mb: Option<u64>,
    /// Open file descriptor ceiling
    pub max_open_files: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoClass {
    BestEffort,
    Idle,
}

/// Predicates gating a run; absent fields are not checked
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preconditions {
    pub on_ac_power: Option<bool>,
    pub max_system_load: Option<f64>,
    pub min_idle_seconds: Option<u64>,
    pub min_free_disk_gb: Option<u64>,
    pub min_battery_percent: Option<u64>,
}

impl Preconditions {
    pub fn is_empty(&self) -> bool {
        self.on_ac_power.is_none()
            && self.max_system_load.is_none()
            && self.min_idle_seconds.is_none()
            && self.min_free_disk_gb.is_none()
            && self.min_battery_percent.is_none()
    }
}

fn default_notify_threshold() -> NotificationLevel {
    NotificationLevel::Info
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_continue_on_error() -> bool {
    true
}

fn default_operation_timeout() -> u64 {
    crate::constants::execution::DEFAULT_OPERATION_TIMEOUT.as_secs()
}

impl Profile {
    /// Parsed form of the schedule string; only valid after `validate`.
    pub fn parsed_schedule(&self) -> Result<Schedule, ProfileError> {
        parse_schedule(&self.schedule)
    }

    /// Effective timeout for one operation, per-operation override first.
    pub fn timeout_for(&self, operation: &OperationSpec) -> u64 {
        operation
            .timeout_seconds
            .unwrap_or(self.operation_timeout_seconds)
    }

    /// Full structural validation, applied before any registry write.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ProfileError::WriteFailed {
                name: self.name.clone(),
                reason: "profile names must be non-empty and [a-zA-Z0-9_-]".to_string(),
            });
        }

        parse_schedule(&self.schedule)?;

        if self.operations.is_empty() {
            return Err(ProfileError::WriteFailed {
                name: self.name.clone(),
                reason: "profile has no operations".to_string(),
            });
        }

        for operation in &self.operations {
            if operation.name.is_empty() || operation.command.trim().is_empty() {
                return Err(ProfileError::WriteFailed {
                    name: self.name.clone(),
                    reason: format!("operation '{}' has an empty name or command", operation.name),
                });
            }
            if operation.timeout_seconds == Some(0) {
                return Err(ProfileError::WriteFailed {
                    name: self.name.clone(),
                    reason: format!("operation '{}' has a zero timeout", operation.name),
                });
            }
        }

        if self.operation_timeout_seconds == 0 {
            return Err(ProfileError::WriteFailed {
                name: self.name.clone(),
                reason: "operation_timeout_seconds must be positive".to_string(),
            });
        }

        if let Some(nice) = self.resource_limits.nice_level {
            if !(-20..=19).contains(&nice) {
                return Err(ProfileError::WriteFailed {
                    name: self.name.clone(),
                    reason: format!("nice_level {} is outside -20..=19", nice),
                });
            }
        }
        if let Some(prio) = self.resource_limits.io_priority {
            if prio > 7 {
                return Err(ProfileError::WriteFailed {
                    name: self.name.clone(),
                    reason: format!("io_priority {} is outside 0..=7", prio),
                });
            }
        }

        Ok(())
    }
}

// ============================================================================
// Schedule grammar
// ============================================================================

/// Accepted recurrence forms: the named intervals `hourly`, `daily`,
/// `weekly`, `monthly`, and the calendar patterns `daily HH:MM`,
/// `weekly <mon..sun> HH:MM`, `monthly <1-28> HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    DailyAt { hour: u32, minute: u32 },
    WeeklyAt { weekday: Weekday, hour: u32, minute: u32 },
    MonthlyAt { day: u32, hour: u32, minute: u32 },
}

impl Schedule {
    /// Renders the systemd OnCalendar expression for this schedule.
    pub fn to_oncalendar(&self) -> String {
        match self {
            Schedule::Hourly => "hourly".to_string(),
            Schedule::Daily => "daily".to_string(),
            Schedule::Weekly => "weekly".to_string(),
            Schedule::Monthly => "monthly".to_string(),
            Schedule::DailyAt { hour, minute } => {
                format!("*-*-* {:02}:{:02}:00", hour, minute)
            }
            Schedule::WeeklyAt {
                weekday,
                hour,
                minute,
            } => {
                format!(
                    "{} *-*-* {:02}:{:02}:00",
                    weekday_token(*weekday),
                    hour,
                    minute
                )
            }
            Schedule::MonthlyAt { day, hour, minute } => {
                format!("*-*-{:02} {:02}:{:02}:00", day, hour, minute)
            }
        }
    }
}

fn weekday_token(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Mon",
        Weekday::Tue => "Tue",
        Weekday::Wed => "Wed",
        Weekday::Thu => "Thu",
        Weekday::Fri => "Fri",
        Weekday::Sat => "Sat",
        Weekday::Sun => "Sun",
    }
}

pub fn parse_schedule(expr: &str) -> Result<Schedule, ProfileError> {
    let parts: Vec<&str> = expr.split_whitespace().collect();

    match parts.as_slice() {
        ["hourly"] => Ok(Schedule::Hourly),
        ["daily"] => Ok(Schedule::Daily),
        ["weekly"] => Ok(Schedule::Weekly),
        ["monthly"] => Ok(Schedule::Monthly),
        ["daily", time] => {
            let (hour, minute) = parse_time_field(expr, time)?;
            Ok(Schedule::DailyAt { hour, minute })
        }
        ["weekly", day, time] => {
            let weekday = day.parse::<Weekday>().map_err(|_| {
                ProfileError::InvalidSchedule {
                    expr: expr.to_string(),
                    reason: format!("'{}' is not a weekday name", day),
                }
            })?;
            let (hour, minute) = parse_time_field(expr, time)?;
            Ok(Schedule::WeeklyAt {
                weekday,
                hour,
                minute,
            })
        }
        ["monthly", day, time] => {
            let day: u32 = day.parse().map_err(|_| ProfileError::InvalidSchedule {
                expr: expr.to_string(),
                reason: format!("'{}' is not a day of month", day),
            })?;
            // Capped at 28 so the rule fires in February too
            if !(1..=28).contains(&day) {
                return Err(ProfileError::InvalidSchedule {
                    expr: expr.to_string(),
                    reason: format!("day of month {} is outside 1..=28", day),
                });
            }
            let (hour, minute) = parse_time_field(expr, time)?;
            Ok(Schedule::MonthlyAt { day, hour, minute })
        }
        _ => Err(ProfileError::InvalidSchedule {
            expr: expr.to_string(),
            reason: "expected 'hourly|daily|weekly|monthly', 'daily HH:MM', \
                     'weekly <mon..sun> HH:MM', or 'monthly <1-28> HH:MM'"
                .to_string(),
        }),
    }
}

fn parse_time_field(expr: &str, time: &str) -> Result<(u32, u32), ProfileError> {
    let invalid = |reason: String| ProfileError::InvalidSchedule {
        expr: expr.to_string(),
        reason,
    };

    let (hour_str, minute_str) = time
        .split_once(':')
        .ok_or_else(|| invalid(format!("'{}' is not HH:MM", time)))?;

    let hour: u32 = hour_str
        .parse()
        .map_err(|_| invalid(format!("invalid hour '{}'", hour_str)))?;
    let minute: u32 = minute_str
        .parse()
        .map_err(|_| invalid(format!("invalid minute '{}'", minute_str)))?;

    if hour > 23 {
        return Err(invalid(format!("hour {} is outside 0..=23", hour)));
    }
    if minute > 59 {
        return Err(invalid(format!("minute {} is outside 0..=59", minute)));
    }

    Ok((hour, minute))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn minimal_profile(schedule: &str) -> Profile {
        Profile {
            name: "test-profile".to_string(),
            description: String::new(),
            schedule: schedule.to_string(),
            operations: vec![OperationSpec {
                name: "tmp-sweep".to_string(),
                kind: OperationKind::TempFiles,
                command: "find /tmp -mindepth 1 -mtime +3 -delete".to_string(),
                timeout_seconds: None,
                touches_user_data: false,
            }],
            resource_limits: ResourceLimits::default(),
            preconditions: Preconditions::default(),
            notify_threshold: NotificationLevel::Info,
            log_level: "info".to_string(),
            continue_on_error: true,
            skip_backup: false,
            operation_timeout_seconds: 3600,
        }
    }

    #[test_case("hourly", Schedule::Hourly)]
    #[test_case("daily", Schedule::Daily)]
    #[test_case("weekly", Schedule::Weekly)]
    #[test_case("monthly", Schedule::Monthly)]
    #[test_case("daily 18:00", Schedule::DailyAt { hour: 18, minute: 0 })]
    #[test_case("weekly sun 03:30", Schedule::WeeklyAt { weekday: Weekday::Sun, hour: 3, minute: 30 })]
    #[test_case("monthly 1 04:15", Schedule::MonthlyAt { day: 1, hour: 4, minute: 15 })]
    fn test_schedule_grammar_accepts(expr: &str, expected: Schedule) {
        assert_eq!(parse_schedule(expr).unwrap(), expected);
    }

    #[test_case("daily 24:00"; "hour out of range")]
    #[test_case("daily 18:60"; "minute out of range")]
    #[test_case("weekly funday 03:30"; "bad weekday")]
    #[test_case("monthly 29 04:00"; "day past 28")]
    #[test_case("monthly 0 04:00"; "day zero")]
    #[test_case("every 5 minutes"; "free-form text")]
    #[test_case(""; "empty")]
    #[test_case("daily 1800"; "missing colon")]
    fn test_schedule_grammar_rejects(expr: &str) {
        assert!(parse_schedule(expr).is_err());
    }

    #[test]
    fn test_oncalendar_rendering() {
        assert_eq!(
            parse_schedule("daily 18:00").unwrap().to_oncalendar(),
            "*-*-* 18:00:00"
        );
        assert_eq!(
            parse_schedule("weekly mon 07:05").unwrap().to_oncalendar(),
            "Mon *-*-* 07:05:00"
        );
        assert_eq!(
            parse_schedule("monthly 5 04:00").unwrap().to_oncalendar(),
            "*-*-05 04:00:00"
        );
        assert_eq!(parse_schedule("weekly").unwrap().to_oncalendar(), "weekly");
    }

    #[test]
    fn test_validate_rejects_empty_operations() {
        let mut profile = minimal_profile("daily 18:00");
        profile.operations.clear();
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_nice_level() {
        let mut profile = minimal_profile("daily 18:00");
        profile.resource_limits.nice_level = Some(25);
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_profile_name() {
        let mut profile = minimal_profile("daily");
        profile.name = "has spaces".to_string();
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_per_operation_timeout_overrides_profile_default() {
        let mut profile = minimal_profile("daily");
        profile.operations[0].timeout_seconds = Some(120);
        let op = profile.operations[0].clone();
        assert_eq!(profile.timeout_for(&op), 120);

        profile.operations[0].timeout_seconds = None;
        let op = profile.operations[0].clone();
        assert_eq!(profile.timeout_for(&op), 3600);
    }

    #[test]
    fn test_profile_toml_round_trip() {
        let toml = r#"
name = "desktop"
description = "Evening cleanup"
schedule = "daily 18:00"
notify_threshold = "WARN"

[preconditions]
on_ac_power = true
min_idle_seconds = 300

[resource_limits]
nice_level = 10
io_class = "idle"

[[operations]]
name = "apt-cache"
kind = "package_cache"
command = "apt-get clean"

[[operations]]
name = "tmp-sweep"
kind = "temp_files"
command = "find /tmp -mtime +3 -delete"
touches_user_data = true
"#;
        let profile: Profile = toml::from_str(toml).unwrap();
        assert_eq!(profile.name, "desktop");
        assert_eq!(profile.operations.len(), 2);
        assert_eq!(profile.operations[0].kind, OperationKind::PackageCache);
        assert!(profile.operations[1].touches_user_data);
        assert_eq!(profile.notify_threshold, NotificationLevel::Warn);
        assert_eq!(profile.preconditions.on_ac_power, Some(true));
        assert!(profile.continue_on_error, "default should be continue");
        profile.validate().unwrap();
    }
}
