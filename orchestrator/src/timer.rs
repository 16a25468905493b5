// File: orchestrator/src/timer.rs
//! Binds profiles to the platform scheduler. Each activated profile gets a
//! persistent systemd timer driving a one-shot service that invokes
//! `sysmaint run <profile>`.

use crate::constants::timer::{SYSTEMCTL_TIMEOUT_SECONDS, UNIT_PREFIX};
use crate::errors::TimerError;
use crate::profiles::Schedule;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

/// Reported state of one profile's timer binding
#[derive(Debug, Clone)]
pub struct TimerStatus {
    pub profile: String,
    pub enabled: bool,
    pub next_elapse: Option<String>,
    pub last_trigger: Option<String>,
}

pub struct TimerBinder {
    unit_dir: PathBuf,
    /// Absolute path of the binary the service unit executes
    executable: PathBuf,
}

impl TimerBinder {
    pub fn new(unit_dir: PathBuf, executable: PathBuf) -> Self {
        Self {
            unit_dir,
            executable,
        }
    }

    fn unit_base(profile: &str) -> String {
        format!("{}-{}", UNIT_PREFIX, profile)
    }

    fn service_name(profile: &str) -> String {
        format!("{}.service", Self::unit_base(profile))
    }

    fn timer_name(profile: &str) -> String {
        format!("{}.timer", Self::unit_base(profile))
    }

    fn render_service(&self, profile: &str) -> String {
        format!(
            "[Unit]\n\
             Description=Scheduled maintenance run of profile '{profile}'\n\
             Wants=network-online.target\n\
             \n\
             [Service]\n\
             Type=oneshot\n\
             ExecStart={exec} run {profile} --scheduled\n",
            profile = profile,
            exec = self.executable.display(),
        )
    }

    fn render_timer(&self, profile: &str, schedule: &Schedule) -> String {
        format!(
            "[Unit]\n\
             Description=Timer for maintenance profile '{profile}'\n\
             \n\
             [Timer]\n\
             OnCalendar={oncalendar}\n\
             Persistent=true\n\
             Unit={service}\n\
             \n\
             [Install]\n\
             WantedBy=timers.target\n",
            profile = profile,
            oncalendar = schedule.to_oncalendar(),
            service = Self::service_name(profile),
        )
    }

    /// Writes both unit files and enables the timer. Unit files are written
    /// to a temp name and renamed so systemd never sees a partial file.
    pub async fn install(&self, profile: &str, schedule: &Schedule) -> Result<(), TimerError> {
        fs::create_dir_all(&self.unit_dir)
            .await
            .map_err(|e| TimerError::InstallFailed {
                unit: Self::unit_base(profile),
                reason: e.to_string(),
            })?;

        self.write_unit(&Self::service_name(profile), &self.render_service(profile))
            .await?;
        self.write_unit(
            &Self::timer_name(profile),
            &self.render_timer(profile, schedule),
        )
        .await?;

        self.systemctl(&["daemon-reload"]).await?;
        self.systemctl(&["enable", "--now", &Self::timer_name(profile)])
            .await?;

        info!(
            "Timer '{}' installed ({})",
            Self::timer_name(profile),
            schedule.to_oncalendar()
        );
        Ok(())
    }

    /// Stops and disables the timer and removes both unit files.
    pub async fn uninstall(&self, profile: &str) -> Result<(), TimerError> {
        let timer_path = self.unit_dir.join(Self::timer_name(profile));
        if !timer_path.exists() {
            return Err(TimerError::NotInstalled {
                profile: profile.to_string(),
            });
        }

        if let Err(e) = self
            .systemctl(&["disable", "--now", &Self::timer_name(profile)])
            .await
        {
            // Keep going; the unit files still come off disk
            warn!("Could not disable {}: {}", Self::timer_name(profile), e);
        }

        for unit in [Self::timer_name(profile), Self::service_name(profile)] {
            let path = self.unit_dir.join(&unit);
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(TimerError::InstallFailed {
                        unit,
                        reason: e.to_string(),
                    })
                }
            }
        }

        self.systemctl(&["daemon-reload"]).await?;
        info!("Timer '{}' removed", Self::timer_name(profile));
        Ok(())
    }

    pub fn is_installed(&self, profile: &str) -> bool {
        self.unit_dir.join(Self::timer_name(profile)).exists()
    }

    /// Queries systemd for the timer's enablement and fire times.
    pub async fn status(&self, profile: &str) -> Result<TimerStatus, TimerError> {
        if !self.is_installed(profile) {
            return Err(TimerError::NotInstalled {
                profile: profile.to_string(),
            });
        }

        let timer = Self::timer_name(profile);
        let enabled = self
            .systemctl(&["is-enabled", &timer])
            .await
            .map(|out| out.trim() == "enabled")
            .unwrap_or(false);

        let show = self
            .systemctl(&[
                "show",
                &timer,
                "--property=NextElapseUSecRealtime",
                "--property=LastTriggerUSec",
            ])
            .await
            .unwrap_or_default();

        Ok(TimerStatus {
            profile: profile.to_string(),
            enabled,
            next_elapse: show_property(&show, "NextElapseUSecRealtime"),
            last_trigger: show_property(&show, "LastTriggerUSec"),
        })
    }

    async fn write_unit(&self, unit: &str, content: &str) -> Result<(), TimerError> {
        let install_err = |reason: String| TimerError::InstallFailed {
            unit: unit.to_string(),
            reason,
        };

        let final_path = self.unit_dir.join(unit);
        let tmp_path = self.unit_dir.join(format!("{}.tmp", unit));
        fs::write(&tmp_path, content)
            .await
            .map_err(|e| install_err(e.to_string()))?;
        fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| install_err(e.to_string()))?;
        debug!("Wrote unit file {}", final_path.display());
        Ok(())
    }

    async fn systemctl(&self, args: &[&str]) -> Result<String, TimerError> {
        let command = format!("systemctl {}", args.join(" "));
        debug!("Executing: {}", command);

        let systemctl_err = |reason: String| TimerError::SystemctlFailed {
            command: command.clone(),
            reason,
        };

        let child = AsyncCommand::new("systemctl")
            .args(args)
            .output();
        let output = tokio::time::timeout(Duration::from_secs(SYSTEMCTL_TIMEOUT_SECONDS), child)
            .await
            .map_err(|_| systemctl_err("timed out".to_string()))?
            .map_err(|e| systemctl_err(e.to_string()))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(systemctl_err(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

fn show_property(show_output: &str, property: &str) -> Option<String> {
    show_output
        .lines()
        .find_map(|line| line.strip_prefix(&format!("{}=", property)))
        .map(str::trim)
        .filter(|v| !v.is_empty() && *v != "n/a" && *v != "0")
        .map(str::to_string)
}
