// File: orchestrator/src/config/mod.rs
pub mod manager;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
pub use manager::ConfigManager;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Overrides the default state directory
    pub state_dir: Option<String>,
    #[serde(default = "default_snapshot_retention")]
    pub snapshot_retention_count: usize,
    #[serde(default = "default_history_retention_days")]
    pub history_retention_days: i64,
    #[serde(default = "default_unit_dir")]
    pub unit_dir: String,
    #[serde(default)]
    pub notifications: NotificationConfig,
    // Populated after load from the resolved directory layout
    #[serde(skip)]
    pub paths: ResolvedPaths,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_notify_level")]
    pub level: String,
    #[serde(default = "default_desktop_enabled")]
    pub desktop_enabled: bool,
    #[serde(default)]
    pub email_enabled: bool,
    pub email_to: Option<String>,
    pub webhook_url: Option<String>,
}

/// Absolute locations derived from the config and state directories
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolvedPaths {
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
    pub database_file: PathBuf,
    pub state_file: PathBuf,
    pub locks_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub run_logs_dir: PathBuf,
    pub system_profiles_dir: PathBuf,
    pub user_profiles_dir: PathBuf,
    pub unit_dir: PathBuf,
}

fn default_snapshot_retention() -> usize {
    crate::constants::snapshots::DEFAULT_RETENTION_COUNT
}

fn default_history_retention_days() -> i64 {
    crate::constants::history::DEFAULT_RETENTION_DAYS
}

fn default_unit_dir() -> String {
    crate::constants::timer::DEFAULT_UNIT_DIR.to_string()
}

fn default_notify_level() -> String {
    "INFO".to_string()
}

fn default_desktop_enabled() -> bool {
    true
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            level: default_notify_level(),
            desktop_enabled: true,
            email_enabled: false,
            email_to: None,
            webhook_url: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: None,
            snapshot_retention_count: default_snapshot_retention(),
            history_retention_days: default_history_retention_days(),
            unit_dir: default_unit_dir(),
            notifications: NotificationConfig::default(),
            paths: ResolvedPaths::default(),
        }
    }
}
