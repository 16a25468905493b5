// File: orchestrator/src/config/manager.rs
use super::{Config, ResolvedPaths};
use crate::constants::defaults;
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

pub struct ConfigManager {
    current_config: Arc<Config>,
}

impl ConfigManager {
    pub async fn new(config_dir: Option<String>) -> Result<Self> {
        let config_dir = Self::resolve_config_dir(config_dir);
        let config = Self::load_configuration(&config_dir).await?;
        Ok(Self {
            current_config: Arc::new(config),
        })
    }

    pub fn get_current_config(&self) -> Arc<Config> {
        self.current_config.clone()
    }

    /// Explicit argument wins, then the environment, then the host layout
    /// (`/etc/sysmaint` when running as root, the user config dir otherwise).
    fn resolve_config_dir(explicit: Option<String>) -> PathBuf {
        if let Some(dir) = explicit {
            return PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("SYSMAINT_CONFIG_DIR") {
            return PathBuf::from(dir);
        }
        if unsafe { libc::geteuid() } == 0 {
            return PathBuf::from("/etc").join(defaults::APP_DIR_NAME);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(defaults::APP_DIR_NAME)
    }

    fn default_state_dir() -> PathBuf {
        if unsafe { libc::geteuid() } == 0 {
            return PathBuf::from("/var/lib").join(defaults::APP_DIR_NAME);
        }
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(defaults::APP_DIR_NAME)
    }

    async fn load_configuration(config_dir: &Path) -> Result<Config> {
        let main_config_path = config_dir.join("main.toml");

        let mut config: Config = match fs::read_to_string(&main_config_path).await {
            Ok(content) => toml::from_str(&content)
                .map_err(|e| anyhow!("Failed to parse {}: {}", main_config_path.display(), e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    "No main.toml at {}, using built-in defaults",
                    main_config_path.display()
                );
                Config::default()
            }
            Err(e) => {
                return Err(anyhow!(
                    "Failed to read main config {}: {}",
                    main_config_path.display(),
                    e
                ))
            }
        };

        let state_dir = config
            .state_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_state_dir);

        config.paths = ResolvedPaths {
            config_dir: config_dir.to_path_buf(),
            database_file: state_dir.join(defaults::DATABASE_FILE),
            state_file: state_dir.join(defaults::STATE_FILE),
            locks_dir: state_dir.join(defaults::LOCKS_DIR),
            snapshots_dir: state_dir.join(defaults::SNAPSHOTS_DIR),
            run_logs_dir: state_dir.join(defaults::RUN_LOGS_DIR),
            system_profiles_dir: config_dir.join(defaults::SYSTEM_PROFILES_DIR),
            user_profiles_dir: config_dir.join(defaults::USER_PROFILES_DIR),
            unit_dir: PathBuf::from(&config.unit_dir),
            state_dir,
        };

        if config.notifications.email_enabled && config.notifications.email_to.is_none() {
            warn!("Email notifications enabled but no recipient configured, channel will be skipped");
        }

        info!(
            "Loaded configuration from {} (state dir: {})",
            config_dir.display(),
            config.paths.state_dir.display()
        );

        Ok(config)
    }

    /// Creates the state-directory tree so later components can assume it exists.
    pub async fn ensure_directories(&self) -> Result<()> {
        let paths = &self.current_config.paths;
        for dir in [
            &paths.state_dir,
            &paths.locks_dir,
            &paths.snapshots_dir,
            &paths.run_logs_dir,
            &paths.system_profiles_dir,
            &paths.user_profiles_dir,
        ] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| anyhow!("Failed to create {}: {}", dir.display(), e))?;
        }
        debug!("State directories present under {}", paths.state_dir.display());
        Ok(())
    }
}
