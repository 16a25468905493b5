//! Best-effort resource limiting for spawned jobs.
//!
//! Limits are applied to the child by pid right after spawn, in a fixed
//! order: CPU niceness, I/O scheduling class/priority, address-space
//! ceiling, open-file ceiling. A primitive that the host refuses (missing
//! capability, kernel without the syscall) degrades to a warning; the run
//! itself is never failed by the limiter.

use crate::profiles::{IoClass, ResourceLimits};
use tracing::{debug, warn};

const IOPRIO_WHO_PROCESS: libc::c_int = 1;
const IOPRIO_CLASS_BE: i32 = 2;
const IOPRIO_CLASS_IDLE: i32 = 3;
const IOPRIO_CLASS_SHIFT: i32 = 13;

pub struct ResourceLimiter;

impl ResourceLimiter {
    pub fn new() -> Self {
        Self
    }

    /// Applies every configured limit to `pid`. Returns how many limits
    /// actually took effect.
    pub fn apply(&self, pid: u32, limits: &ResourceLimits) -> u32 {
        let mut applied = 0u32;

        if let Some(nice) = limits.nice_level {
            match apply_nice(pid, nice) {
                Ok(()) => {
                    debug!("Set niceness {} for pid {}", nice, pid);
                    applied += 1;
                }
                Err(reason) => warn!("Could not set niceness for pid {}: {}", pid, reason),
            }
        }

        if let Some(class) = limits.io_class {
            let priority = limits.io_priority.unwrap_or(4);
            match apply_io_priority(pid, class, priority) {
                Ok(()) => {
                    debug!("Set I/O class {:?} for pid {}", class, pid);
                    applied += 1;
                }
                Err(reason) => warn!("Could not set I/O priority for pid {}: {}", pid, reason),
            }
        }

        if let Some(megabytes) = limits.memory_limit_mb {
            let bytes = megabytes.saturating_mul(1024 * 1024);
            match apply_rlimit(pid, libc::RLIMIT_AS, bytes) {
                Ok(()) => {
                    debug!("Set address-space ceiling {}MB for pid {}", megabytes, pid);
                    applied += 1;
                }
                Err(reason) => warn!("Could not set memory ceiling for pid {}: {}", pid, reason),
            }
        }

        if let Some(max_files) = limits.max_open_files {
            match apply_rlimit(pid, libc::RLIMIT_NOFILE, max_files) {
                Ok(()) => {
                    debug!("Set open-file ceiling {} for pid {}", max_files, pid);
                    applied += 1;
                }
                Err(reason) => warn!("Could not set open-file ceiling for pid {}: {}", pid, reason),
            }
        }

        applied
    }
}

impl Default for ResourceLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_nice(pid: u32, nice: i32) -> Result<(), String> {
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, nice) };
    if ret == -1 {
        return Err(std::io::Error::last_os_error().to_string());
    }
    Ok(())
}

fn apply_io_priority(pid: u32, class: IoClass, priority: u8) -> Result<(), String> {
    let class_value = match class {
        IoClass::BestEffort => IOPRIO_CLASS_BE,
        IoClass::Idle => IOPRIO_CLASS_IDLE,
    };
    // Idle class ignores the priority data field
    let data = match class {
        IoClass::BestEffort => i32::from(priority.min(7)),
        IoClass::Idle => 0,
    };
    let ioprio = (class_value << IOPRIO_CLASS_SHIFT) | data;

    let ret = unsafe {
        libc::syscall(
            libc::SYS_ioprio_set,
            IOPRIO_WHO_PROCESS,
            pid as libc::c_int,
            ioprio,
        )
    };
    if ret == -1 {
        return Err(std::io::Error::last_os_error().to_string());
    }
    Ok(())
}

fn apply_rlimit(pid: u32, resource: libc::__rlimit_resource_t, limit: u64) -> Result<(), String> {
    let rlimit = libc::rlimit {
        rlim_cur: limit,
        rlim_max: limit,
    };
    let ret = unsafe { libc::prlimit(pid as libc::pid_t, resource, &rlimit, std::ptr::null_mut()) };
    if ret == -1 {
        return Err(std::io::Error::last_os_error().to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_sleeper() -> std::process::Child {
        std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .expect("spawn sleep")
    }

    fn read_rlimit_nofile(pid: u32) -> u64 {
        let mut old = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let ret = unsafe {
            libc::prlimit(
                pid as libc::pid_t,
                libc::RLIMIT_NOFILE,
                std::ptr::null(),
                &mut old,
            )
        };
        assert_eq!(ret, 0, "prlimit read-back failed");
        old.rlim_cur
    }

    #[test]
    fn test_raising_niceness_of_child() {
        let mut child = spawn_sleeper();

        let limiter = ResourceLimiter::new();
        let limits = ResourceLimits {
            nice_level: Some(10),
            ..Default::default()
        };
        let applied = limiter.apply(child.id(), &limits);
        assert_eq!(applied, 1);

        let priority = unsafe { libc::getpriority(libc::PRIO_PROCESS, child.id() as libc::id_t) };
        assert_eq!(priority, 10);

        child.kill().ok();
        child.wait().ok();
    }

    #[test]
    fn test_open_file_ceiling_applies() {
        let mut child = spawn_sleeper();

        let limiter = ResourceLimiter::new();
        let limits = ResourceLimits {
            max_open_files: Some(256),
            ..Default::default()
        };
        let applied = limiter.apply(child.id(), &limits);
        assert_eq!(applied, 1);
        assert_eq!(read_rlimit_nofile(child.id()), 256);

        child.kill().ok();
        child.wait().ok();
    }

    #[test]
    fn test_empty_limits_apply_nothing() {
        let limiter = ResourceLimiter::new();
        assert_eq!(limiter.apply(std::process::id(), &ResourceLimits::default()), 0);
    }

    #[test]
    fn test_unlimitable_pid_degrades_to_warning() {
        // PID beyond pid_max: every primitive fails, apply still returns
        let limiter = ResourceLimiter::new();
        let limits = ResourceLimits {
            nice_level: Some(5),
            io_class: Some(IoClass::Idle),
            io_priority: None,
            memory_limit_mb: Some(512),
            max_open_files: Some(512),
        };
        assert_eq!(limiter.apply(4_000_000, &limits), 0);
    }
}
