// File: orchestrator/src/scheduler/state.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// The one piece of global mutable state: a single JSON record reloaded at
/// each invocation and owned exclusively by the facade.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerState {
    pub last_check: Option<DateTime<Utc>>,
    pub maintenance_count: u64,
    pub last_maintenance: Option<DateTime<Utc>>,
    #[serde(default)]
    pub active_profiles: Vec<String>,
}

impl SchedulerState {
    pub fn mark_checked(&mut self) {
        self.last_check = Some(Utc::now());
    }

    pub fn mark_maintenance(&mut self) {
        self.maintenance_count += 1;
        self.last_maintenance = Some(Utc::now());
    }

    pub fn activate(&mut self, profile: &str) {
        if !self.active_profiles.iter().any(|p| p == profile) {
            self.active_profiles.push(profile.to_string());
            self.active_profiles.sort();
        }
    }

    pub fn deactivate(&mut self, profile: &str) {
        self.active_profiles.retain(|p| p != profile);
    }

    pub fn is_active(&self, profile: &str) -> bool {
        self.active_profiles.iter().any(|p| p == profile)
    }
}

/// Load-or-default plus atomic persist for the state record.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// A missing or unreadable state file yields a fresh default; state is
    /// advisory bookkeeping, never worth refusing to start over.
    pub async fn load(&self) -> SchedulerState {
        match fs::read_to_string(&self.path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        "State file {} is corrupt ({}), starting fresh",
                        self.path.display(),
                        e
                    );
                    SchedulerState::default()
                }
            },
            Err(_) => {
                debug!("No state file at {}, starting fresh", self.path.display());
                SchedulerState::default()
            }
        }
    }

    pub async fn persist(&self, state: &SchedulerState) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let rendered = serde_json::to_vec_pretty(state)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp_path = tmp_name(&self.path);
        fs::write(&tmp_path, rendered).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

fn tmp_name(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_state_file_yields_default() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let state = store.load().await;
        assert_eq!(state.maintenance_count, 0);
        assert!(state.active_profiles.is_empty());
    }

    #[tokio::test]
    async fn test_persist_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        let mut state = store.load().await;
        state.mark_checked();
        state.mark_maintenance();
        state.activate("standard");
        state.activate("deep");
        state.activate("standard"); // no duplicate
        store.persist(&state).await.unwrap();

        let reloaded = store.load().await;
        assert_eq!(reloaded.maintenance_count, 1);
        assert!(reloaded.last_maintenance.is_some());
        assert_eq!(reloaded.active_profiles, vec!["deep", "standard"]);
    }

    #[tokio::test]
    async fn test_corrupt_state_file_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let store = StateStore::new(path);
        let state = store.load().await;
        assert_eq!(state.maintenance_count, 0);
    }

    #[tokio::test]
    async fn test_deactivate_removes_profile() {
        let mut state = SchedulerState::default();
        state.activate("standard");
        assert!(state.is_active("standard"));
        state.deactivate("standard");
        assert!(!state.is_active("standard"));
    }
}
