// File: orchestrator/src/profiles/registry.rs
use super::{OperationKind, OperationSpec, Preconditions, Profile, ResourceLimits};
use crate::database::records::NotificationLevel;
use crate::errors::ProfileError;
use anyhow::{anyhow, Result};
use glob::glob;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Which precedence tier a profile file lives in. User-tier files override
/// system-tier files of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileTier {
    System,
    User,
}

pub struct ProfileRegistry {
    system_dir: PathBuf,
    user_dir: PathBuf,
}

impl ProfileRegistry {
    pub fn new(system_dir: PathBuf, user_dir: PathBuf) -> Self {
        Self {
            system_dir,
            user_dir,
        }
    }

    fn profile_path(&self, tier: ProfileTier, name: &str) -> PathBuf {
        let dir = match tier {
            ProfileTier::System => &self.system_dir,
            ProfileTier::User => &self.user_dir,
        };
        dir.join(format!("{}.toml", name))
    }

    /// Loads every profile from both tiers, user tier winning on name clashes.
    pub async fn load_all(&self) -> Result<HashMap<String, Profile>> {
        let mut profiles = HashMap::new();

        for (tier, dir) in [
            (ProfileTier::System, self.system_dir.clone()),
            (ProfileTier::User, self.user_dir.clone()),
        ] {
            let pattern = format!("{}/*.toml", dir.display());
            for entry in glob(&pattern).map_err(|e| anyhow!("Glob pattern error: {}", e))? {
                let path = entry.map_err(|e| anyhow!("Glob entry error: {}", e))?;
                match Self::load_file(&path).await {
                    Ok(profile) => {
                        if tier == ProfileTier::User && profiles.contains_key(&profile.name) {
                            debug!(
                                "User profile '{}' overrides system definition",
                                profile.name
                            );
                        }
                        profiles.insert(profile.name.clone(), profile);
                    }
                    Err(e) => {
                        warn!("Skipping unreadable profile {}: {}", path.display(), e);
                    }
                }
            }
        }

        info!("Loaded {} profiles", profiles.len());
        Ok(profiles)
    }

    /// Loads one profile by name, user tier first.
    pub async fn load(&self, name: &str) -> Result<Profile, ProfileError> {
        for tier in [ProfileTier::User, ProfileTier::System] {
            let path = self.profile_path(tier, name);
            if fs::try_exists(&path).await.unwrap_or(false) {
                return Self::load_file(&path).await;
            }
        }
        Err(ProfileError::NotFound {
            name: name.to_string(),
        })
    }

    async fn load_file(path: &Path) -> Result<Profile, ProfileError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ProfileError::ParseFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let profile: Profile =
            toml::from_str(&content).map_err(|e| ProfileError::ParseFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        // File name is the registry key; a mismatch would make a profile
        // unloadable under the name it was saved as.
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        if stem != profile.name {
            return Err(ProfileError::ParseFailed {
                path: path.display().to_string(),
                reason: format!("file name '{}' does not match profile name '{}'", stem, profile.name),
            });
        }

        profile.validate()?;
        Ok(profile)
    }

    /// Validates and writes a profile into the given tier. The write is
    /// temp-then-rename so concurrent readers never see a partial file.
    pub async fn save(&self, profile: &Profile, tier: ProfileTier) -> Result<(), ProfileError> {
        profile.validate()?;

        let rendered =
            toml::to_string_pretty(profile).map_err(|e| ProfileError::WriteFailed {
                name: profile.name.clone(),
                reason: e.to_string(),
            })?;

        let path = self.profile_path(tier, &profile.name);
        let tmp_path = path.with_extension("toml.tmp");

        let io_err = |e: std::io::Error| ProfileError::WriteFailed {
            name: profile.name.clone(),
            reason: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        fs::write(&tmp_path, rendered).await.map_err(io_err)?;
        fs::rename(&tmp_path, &path).await.map_err(io_err)?;

        info!("Saved profile '{}' to {}", profile.name, path.display());
        Ok(())
    }

    /// Deletes a profile from whichever tier defines it. Refused while the
    /// profile still has a bound timer.
    pub async fn delete(&self, name: &str, timer_active: bool) -> Result<(), ProfileError> {
        if timer_active {
            return Err(ProfileError::TimerStillActive {
                name: name.to_string(),
            });
        }

        let mut removed = false;
        for tier in [ProfileTier::User, ProfileTier::System] {
            let path = self.profile_path(tier, name);
            if fs::try_exists(&path).await.unwrap_or(false) {
                fs::remove_file(&path)
                    .await
                    .map_err(|e| ProfileError::WriteFailed {
                        name: name.to_string(),
                        reason: e.to_string(),
                    })?;
                removed = true;
            }
        }

        if !removed {
            return Err(ProfileError::NotFound {
                name: name.to_string(),
            });
        }

        info!("Deleted profile '{}'", name);
        Ok(())
    }

    /// Materializes the built-in defaults into the system tier when neither
    /// tier defines any profile, so a fresh install can run immediately.
    pub async fn bootstrap_defaults(&self) -> Result<usize> {
        let existing = self.load_all().await?;
        if !existing.is_empty() {
            return Ok(0);
        }

        let defaults = builtin_profiles();
        let count = defaults.len();
        for profile in &defaults {
            self.save(profile, ProfileTier::System)
                .await
                .map_err(|e| anyhow!("Failed to bootstrap '{}': {}", profile.name, e))?;
        }

        info!("Bootstrapped {} default profiles", count);
        Ok(count)
    }
}

/// Built-in profile set written on first start
pub fn builtin_profiles() -> Vec<Profile> {
    vec![
        Profile {
            name: "standard".to_string(),
            description: "Routine cache and log cleanup".to_string(),
            schedule: "weekly sun 03:00".to_string(),
            operations: vec![
                OperationSpec {
                    name: "apt-cache".to_string(),
                    kind: OperationKind::PackageCache,
                    command: "apt-get clean && apt-get autoclean".to_string(),
                    timeout_seconds: Some(900),
                    touches_user_data: false,
                },
                OperationSpec {
                    name: "journal-vacuum".to_string(),
                    kind: OperationKind::LogCleanup,
                    command: "journalctl --vacuum-time=14d".to_string(),
                    timeout_seconds: Some(600),
                    touches_user_data: false,
                },
                OperationSpec {
                    name: "tmp-sweep".to_string(),
                    kind: OperationKind::TempFiles,
                    command: "find /tmp -mindepth 1 -mtime +7 -delete".to_string(),
                    timeout_seconds: Some(600),
                    touches_user_data: false,
                },
            ],
            resource_limits: ResourceLimits {
                nice_level: Some(10),
                io_class: Some(super::IoClass::Idle),
                io_priority: None,
                memory_limit_mb: Some(2048),
                max_open_files: Some(1024),
            },
            preconditions: Preconditions {
                on_ac_power: Some(true),
                max_system_load: Some(crate::constants::preconditions::DEFAULT_MAX_SYSTEM_LOAD),
                min_idle_seconds: None,
                min_free_disk_gb: Some(1),
                min_battery_percent: None,
            },
            notify_threshold: NotificationLevel::Warn,
            log_level: "info".to_string(),
            continue_on_error: true,
            skip_backup: false,
            operation_timeout_seconds: 1800,
        },
        Profile {
            name: "deep".to_string(),
            description: "Monthly kernel and browser cache cleanup".to_string(),
            schedule: "monthly 1 04:00".to_string(),
            operations: vec![
                OperationSpec {
                    name: "old-kernels".to_string(),
                    kind: OperationKind::KernelPackages,
                    command: "apt-get autoremove --purge -y".to_string(),
                    timeout_seconds: Some(1800),
                    touches_user_data: false,
                },
                OperationSpec {
                    name: "browser-caches".to_string(),
                    kind: OperationKind::BrowserCache,
                    command: "rm -rf ~/.cache/mozilla/firefox/*/cache2 ~/.cache/chromium/*/Cache"
                        .to_string(),
                    timeout_seconds: Some(600),
                    touches_user_data: true,
                },
                OperationSpec {
                    name: "apt-cache".to_string(),
                    kind: OperationKind::PackageCache,
                    command: "apt-get clean".to_string(),
                    timeout_seconds: Some(900),
                    touches_user_data: false,
                },
            ],
            resource_limits: ResourceLimits {
                nice_level: Some(15),
                io_class: Some(super::IoClass::Idle),
                io_priority: None,
                memory_limit_mb: Some(2048),
                max_open_files: Some(1024),
            },
            preconditions: Preconditions {
                on_ac_power: Some(true),
                max_system_load: Some(crate::constants::preconditions::DEFAULT_MAX_SYSTEM_LOAD),
                min_idle_seconds: Some(crate::constants::preconditions::DEFAULT_MIN_IDLE_SECONDS),
                min_free_disk_gb: Some(2),
                min_battery_percent: None,
            },
            notify_threshold: NotificationLevel::Info,
            log_level: "info".to_string(),
            continue_on_error: false,
            skip_backup: false,
            operation_timeout_seconds: 3600,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_registry() -> (TempDir, ProfileRegistry) {
        let dir = TempDir::new().unwrap();
        let registry = ProfileRegistry::new(dir.path().join("profiles"), dir.path().join("profiles.d"));
        (dir, registry)
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let (_dir, registry) = test_registry();
        let profile = builtin_profiles().remove(0);

        registry.save(&profile, ProfileTier::System).await.unwrap();
        let loaded = registry.load(&profile.name).await.unwrap();

        assert_eq!(loaded.name, profile.name);
        assert_eq!(loaded.operations.len(), profile.operations.len());
        assert_eq!(loaded.schedule, profile.schedule);
    }

    #[tokio::test]
    async fn test_user_tier_overrides_system_tier() {
        let (_dir, registry) = test_registry();
        let mut profile = builtin_profiles().remove(0);
        registry.save(&profile, ProfileTier::System).await.unwrap();

        profile.description = "user override".to_string();
        registry.save(&profile, ProfileTier::User).await.unwrap();

        let loaded = registry.load(&profile.name).await.unwrap();
        assert_eq!(loaded.description, "user override");

        let all = registry.load_all().await.unwrap();
        assert_eq!(all.len(), 1, "same name must collapse to one entry");
        assert_eq!(all[&profile.name].description, "user override");
    }

    #[tokio::test]
    async fn test_save_rejects_invalid_schedule() {
        let (_dir, registry) = test_registry();
        let mut profile = builtin_profiles().remove(0);
        profile.schedule = "whenever".to_string();

        let result = registry.save(&profile, ProfileTier::User).await;
        assert!(result.is_err(), "invalid schedule must be rejected at write");
    }

    #[tokio::test]
    async fn test_delete_refused_while_timer_active() {
        let (_dir, registry) = test_registry();
        let profile = builtin_profiles().remove(0);
        registry.save(&profile, ProfileTier::System).await.unwrap();

        let result = registry.delete(&profile.name, true).await;
        assert!(matches!(result, Err(ProfileError::TimerStillActive { .. })));

        registry.delete(&profile.name, false).await.unwrap();
        assert!(registry.load(&profile.name).await.is_err());
    }

    #[tokio::test]
    async fn test_bootstrap_only_when_empty() {
        let (_dir, registry) = test_registry();

        let created = registry.bootstrap_defaults().await.unwrap();
        assert_eq!(created, 2);

        let created_again = registry.bootstrap_defaults().await.unwrap();
        assert_eq!(created_again, 0, "bootstrap must not overwrite existing profiles");
    }

    #[tokio::test]
    async fn test_load_rejects_name_mismatch() {
        let (dir, registry) = test_registry();
        let profiles_dir = dir.path().join("profiles");
        std::fs::create_dir_all(&profiles_dir).unwrap();

        let mut profile = builtin_profiles().remove(0);
        profile.name = "renamed".to_string();
        let rendered = toml::to_string_pretty(&profile).unwrap();
        std::fs::write(profiles_dir.join("standard.toml"), rendered).unwrap();

        assert!(registry.load("standard").await.is_err());
    }
}
