// File: orchestrator/src/safety/integrity.rs
use crate::errors::GuardError;
use std::path::PathBuf;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// System sanity checks run before and after a maintenance run. The check
/// lists are injected so hosts (and tests) can tailor what counts as
/// essential.
pub struct IntegrityChecker {
    essential_paths: Vec<PathBuf>,
    essential_commands: Vec<String>,
    package_manager_locks: Vec<PathBuf>,
    /// Shell probe; exit 0 means a protected interactive session is active
    session_probe: Option<String>,
}

impl Default for IntegrityChecker {
    fn default() -> Self {
        Self {
            essential_paths: vec![
                PathBuf::from("/etc"),
                PathBuf::from("/var/lib/dpkg/status"),
                PathBuf::from("/boot"),
            ],
            essential_commands: vec![
                "sh".to_string(),
                "tar".to_string(),
                "systemctl".to_string(),
            ],
            package_manager_locks: vec![
                PathBuf::from("/var/lib/dpkg/lock-frontend"),
                PathBuf::from("/var/lib/apt/lists/lock"),
            ],
            session_probe: Some("who | grep -q .".to_string()),
        }
    }
}

impl IntegrityChecker {
    pub fn new(
        essential_paths: Vec<PathBuf>,
        essential_commands: Vec<String>,
        package_manager_locks: Vec<PathBuf>,
        session_probe: Option<String>,
    ) -> Self {
        Self {
            essential_paths,
            essential_commands,
            package_manager_locks,
            session_probe,
        }
    }

    /// Full pre-run sweep. `guard_user_data` is set when any operation in the
    /// run touches user or development directories, which additionally
    /// requires no protected interactive session.
    pub async fn pre_check(&self, guard_user_data: bool) -> Result<(), GuardError> {
        self.check_essentials(integrity_failed).await?;

        for lock in &self.package_manager_locks {
            if !lock.exists() {
                continue;
            }
            // fuser exits 0 when another process holds the lock file open
            if shell_succeeds(&format!("fuser '{}' > /dev/null 2>&1", lock.display())).await {
                return Err(integrity_failed(
                    "package_manager_lock",
                    format!("{} is held by another process", lock.display()),
                ));
            }
        }

        if guard_user_data {
            if let Some(probe) = &self.session_probe {
                if shell_succeeds(probe).await {
                    return Err(integrity_failed(
                        "interactive_session",
                        "a protected interactive session is active".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Reduced post-run sweep: essentials only. Lock and session states are
    /// expected to have changed during the run and are not re-checked.
    pub async fn post_check(&self) -> Result<(), GuardError> {
        self.check_essentials(post_verification_failed).await
    }

    async fn check_essentials(
        &self,
        fail: fn(&str, String) -> GuardError,
    ) -> Result<(), GuardError> {
        for path in &self.essential_paths {
            if !path.exists() {
                return Err(fail(
                    "essential_path",
                    format!("{} is missing", path.display()),
                ));
            }
        }

        for command in &self.essential_commands {
            if !shell_succeeds(&format!("command -v '{}' > /dev/null", command)).await {
                return Err(fail(
                    "essential_command",
                    format!("'{}' not found in PATH", command),
                ));
            }
        }

        Ok(())
    }
}

fn integrity_failed(check: &str, reason: String) -> GuardError {
    GuardError::IntegrityCheckFailed {
        check: check.to_string(),
        reason,
    }
}

fn post_verification_failed(check: &str, reason: String) -> GuardError {
    GuardError::PostVerificationFailed {
        check: check.to_string(),
        reason,
    }
}

async fn shell_succeeds(command: &str) -> bool {
    debug!("Probing: {}", command);
    AsyncCommand::new("sh")
        .arg("-c")
        .arg(command)
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}
