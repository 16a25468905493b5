//! Environment predicates gating job start.
//!
//! A run is allowed only if every configured predicate holds against a live
//! [`SystemSnapshot`]. Probing and evaluation are separated: `probe` reads the
//! host once, `evaluate` is a pure function over the snapshot so the threshold
//! logic is testable without a real machine. Unmeasurable sensors evaluate to
//! pass (fail-open), with one exception: free disk space fails closed, since
//! running cleanup blind on a possibly-full disk is the one case the gate
//! exists to stop.

use crate::constants::preconditions as limits;
use crate::profiles::Preconditions;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::process::Command;
use tracing::{debug, warn};

/// One observation of the host, taken immediately before a run
#[derive(Debug, Clone, Default)]
pub struct SystemSnapshot {
    pub load_avg_one: Option<f64>,
    pub memory_used_bytes: Option<u64>,
    pub free_disk_gb: Option<u64>,
    pub idle_seconds: Option<u64>,
    pub on_ac_power: Option<bool>,
    pub battery_percent: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PreconditionVerdict {
    Pass,
    /// First failing predicate, in declaration order
    Fail {
        predicate: &'static str,
        reason: String,
    },
}

impl PreconditionVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, PreconditionVerdict::Pass)
    }
}

pub struct PreconditionEvaluator {
    power_supply_dir: PathBuf,
}

impl PreconditionEvaluator {
    pub fn new() -> Self {
        Self {
            power_supply_dir: PathBuf::from("/sys/class/power_supply"),
        }
    }

    #[cfg(test)]
    fn with_power_supply_dir(dir: PathBuf) -> Self {
        Self {
            power_supply_dir: dir,
        }
    }

    /// Reads every sensor once. Individual probe failures become `None`
    /// fields rather than errors.
    pub async fn probe(&self) -> SystemSnapshot {
        let load_avg_one = Some(System::load_average().one);

        let mut sys = System::new();
        sys.refresh_memory();
        let memory_used_bytes = Some(sys.used_memory());

        let free_disk_gb = probe_root_disk_free_gb();
        if free_disk_gb.is_none() {
            warn!("Could not measure free disk space on /");
        }

        let idle_seconds = probe_idle_seconds().await;
        let (on_ac_power, battery_percent) = read_power_supply(&self.power_supply_dir).await;

        let snapshot = SystemSnapshot {
            load_avg_one,
            memory_used_bytes,
            free_disk_gb,
            idle_seconds,
            on_ac_power,
            battery_percent,
        };
        debug!("System snapshot: {:?}", snapshot);
        snapshot
    }

    /// Pure conjunction over the snapshot; reports the first failing
    /// predicate in field order: power, load, idle, disk, battery.
    pub fn evaluate(
        &self,
        preconditions: &Preconditions,
        snapshot: &SystemSnapshot,
    ) -> PreconditionVerdict {
        if let Some(required) = preconditions.on_ac_power {
            if let Some(actual) = snapshot.on_ac_power {
                if actual != required {
                    return PreconditionVerdict::Fail {
                        predicate: "on_ac_power",
                        reason: if required {
                            "host is on battery power".to_string()
                        } else {
                            "host is on AC power".to_string()
                        },
                    };
                }
            }
        }

        if let Some(max_load) = preconditions.max_system_load {
            if let Some(load) = snapshot.load_avg_one {
                if load > max_load {
                    return PreconditionVerdict::Fail {
                        predicate: "max_system_load",
                        reason: format!("load average {:.2} exceeds {:.2}", load, max_load),
                    };
                }
            }
        }

        if let Some(min_idle) = preconditions.min_idle_seconds {
            if let Some(idle) = snapshot.idle_seconds {
                if idle < min_idle {
                    return PreconditionVerdict::Fail {
                        predicate: "min_idle_seconds",
                        reason: format!("user idle {}s, need at least {}s", idle, min_idle),
                    };
                }
            }
        }

        if let Some(min_free) = preconditions.min_free_disk_gb {
            match snapshot.free_disk_gb {
                Some(free) if free < min_free => {
                    return PreconditionVerdict::Fail {
                        predicate: "min_free_disk_gb",
                        reason: format!("{}GB free, need at least {}GB", free, min_free),
                    };
                }
                None => {
                    // Disk space is the one predicate that fails closed
                    return PreconditionVerdict::Fail {
                        predicate: "min_free_disk_gb",
                        reason: "free disk space could not be measured".to_string(),
                    };
                }
                _ => {}
            }
        }

        if let Some(min_battery) = preconditions.min_battery_percent {
            if let Some(percent) = snapshot.battery_percent {
                if percent < min_battery {
                    return PreconditionVerdict::Fail {
                        predicate: "min_battery_percent",
                        reason: format!("battery at {}%, need at least {}%", percent, min_battery),
                    };
                }
            }
        }

        PreconditionVerdict::Pass
    }

    /// Probe then evaluate, the normal entry point for a run.
    pub async fn check(&self, preconditions: &Preconditions) -> (SystemSnapshot, PreconditionVerdict) {
        let snapshot = self.probe().await;
        let verdict = self.evaluate(preconditions, &snapshot);
        (snapshot, verdict)
    }
}

impl Default for PreconditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn probe_root_disk_free_gb() -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| disk.available_space() / 1_000_000_000)
}

/// User idle time via xprintidle; absent display sessions or a missing
/// binary leave the sensor unmeasured.
async fn probe_idle_seconds() -> Option<u64> {
    if std::env::var("DISPLAY").is_err() && std::env::var("WAYLAND_DISPLAY").is_err() {
        return None;
    }

    let probe = Command::new("xprintidle").output();
    let output = match tokio::time::timeout(
        Duration::from_secs(limits::IDLE_PROBE_TIMEOUT_SECONDS),
        probe,
    )
    .await
    {
        Ok(Ok(output)) if output.status.success() => output,
        _ => {
            debug!("xprintidle probe unavailable");
            return None;
        }
    };

    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<u64>()
        .ok()
        .map(|millis| millis / 1000)
}

/// Scans power supply entries: any online Mains adapter means AC power, the
/// first battery entry provides the charge percentage.
async fn read_power_supply(dir: &Path) -> (Option<bool>, Option<u64>) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return (None, None),
    };

    let mut saw_mains = false;
    let mut mains_online = false;
    let mut battery_percent = None;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let supply = entry.path();
        let kind = match tokio::fs::read_to_string(supply.join("type")).await {
            Ok(kind) => kind.trim().to_string(),
            Err(_) => continue,
        };

        match kind.as_str() {
            "Mains" => {
                saw_mains = true;
                if let Ok(online) = tokio::fs::read_to_string(supply.join("online")).await {
                    if online.trim() == "1" {
                        mains_online = true;
                    }
                }
            }
            "Battery" => {
                if battery_percent.is_none() {
                    battery_percent = tokio::fs::read_to_string(supply.join("capacity"))
                        .await
                        .ok()
                        .and_then(|c| c.trim().parse::<u64>().ok());
                }
            }
            _ => {}
        }
    }

    let on_ac = if saw_mains { Some(mains_online) } else { None };
    (on_ac, battery_percent)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_on_battery() -> SystemSnapshot {
        SystemSnapshot {
            load_avg_one: Some(0.4),
            memory_used_bytes: Some(1024 * 1024 * 1024),
            free_disk_gb: Some(50),
            idle_seconds: Some(10),
            on_ac_power: Some(false),
            battery_percent: Some(45),
        }
    }

    #[test]
    fn test_empty_preconditions_always_pass() {
        let evaluator = PreconditionEvaluator::new();
        let verdict = evaluator.evaluate(&Preconditions::default(), &snapshot_on_battery());
        assert!(verdict.is_pass());
    }

    #[test]
    fn test_first_failing_predicate_is_reported() {
        // Battery-powered, non-idle host against an AC + idle profile:
        // power is declared first, so it must be the reported reason
        let evaluator = PreconditionEvaluator::new();
        let preconditions = Preconditions {
            on_ac_power: Some(true),
            min_idle_seconds: Some(300),
            ..Default::default()
        };

        match evaluator.evaluate(&preconditions, &snapshot_on_battery()) {
            PreconditionVerdict::Fail { predicate, .. } => {
                assert_eq!(predicate, "on_ac_power");
            }
            PreconditionVerdict::Pass => panic!("Expected a failure"),
        }
    }

    #[test]
    fn test_load_threshold() {
        let evaluator = PreconditionEvaluator::new();
        let preconditions = Preconditions {
            max_system_load: Some(0.8),
            ..Default::default()
        };

        let mut snapshot = snapshot_on_battery();
        snapshot.load_avg_one = Some(0.79);
        assert!(evaluator.evaluate(&preconditions, &snapshot).is_pass());

        snapshot.load_avg_one = Some(1.2);
        match evaluator.evaluate(&preconditions, &snapshot) {
            PreconditionVerdict::Fail { predicate, .. } => {
                assert_eq!(predicate, "max_system_load")
            }
            PreconditionVerdict::Pass => panic!("Expected a failure"),
        }
    }

    #[test]
    fn test_unmeasured_sensors_fail_open_except_disk() {
        let evaluator = PreconditionEvaluator::new();
        let preconditions = Preconditions {
            on_ac_power: Some(true),
            max_system_load: Some(0.8),
            min_idle_seconds: Some(300),
            min_free_disk_gb: Some(1),
            min_battery_percent: Some(20),
        };

        // Nothing measurable: every sensor passes open except disk
        let empty = SystemSnapshot::default();
        match evaluator.evaluate(&preconditions, &empty) {
            PreconditionVerdict::Fail { predicate, .. } => {
                assert_eq!(predicate, "min_free_disk_gb");
            }
            PreconditionVerdict::Pass => panic!("Disk must fail closed"),
        }

        // With disk measured and plentiful, the rest stay fail-open
        let mut with_disk = SystemSnapshot::default();
        with_disk.free_disk_gb = Some(100);
        assert!(evaluator.evaluate(&preconditions, &with_disk).is_pass());
    }

    #[test]
    fn test_idle_and_battery_thresholds() {
        let evaluator = PreconditionEvaluator::new();
        let preconditions = Preconditions {
            min_idle_seconds: Some(300),
            min_battery_percent: Some(20),
            ..Default::default()
        };

        let mut snapshot = snapshot_on_battery();
        snapshot.idle_seconds = Some(301);
        snapshot.battery_percent = Some(21);
        assert!(evaluator.evaluate(&preconditions, &snapshot).is_pass());

        snapshot.battery_percent = Some(19);
        match evaluator.evaluate(&preconditions, &snapshot) {
            PreconditionVerdict::Fail { predicate, .. } => {
                assert_eq!(predicate, "min_battery_percent")
            }
            PreconditionVerdict::Pass => panic!("Expected a failure"),
        }
    }

    #[tokio::test]
    async fn test_power_supply_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = dir.path().join("AC0");
        let battery = dir.path().join("BAT0");
        std::fs::create_dir_all(&adapter).unwrap();
        std::fs::create_dir_all(&battery).unwrap();
        std::fs::write(adapter.join("type"), "Mains\n").unwrap();
        std::fs::write(adapter.join("online"), "1\n").unwrap();
        std::fs::write(battery.join("type"), "Battery\n").unwrap();
        std::fs::write(battery.join("capacity"), "73\n").unwrap();

        let (on_ac, percent) = read_power_supply(dir.path()).await;
        assert_eq!(on_ac, Some(true));
        assert_eq!(percent, Some(73));

        std::fs::write(adapter.join("online"), "0\n").unwrap();
        let (on_ac, _) = read_power_supply(dir.path()).await;
        assert_eq!(on_ac, Some(false));
    }

    #[tokio::test]
    async fn test_power_supply_missing_dir_is_unmeasured() {
        let evaluator =
            PreconditionEvaluator::with_power_supply_dir(PathBuf::from("/nonexistent/power"));
        let (on_ac, percent) = read_power_supply(&evaluator.power_supply_dir).await;
        assert_eq!(on_ac, None);
        assert_eq!(percent, None);
    }
}
