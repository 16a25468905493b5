//! Profile builders and common names used across the integration tests.

use orchestrator::database::records::NotificationLevel;
use orchestrator::profiles::{
    OperationKind, OperationSpec, Preconditions, Profile, ResourceLimits,
};

/// Common profile names
pub mod profiles {
    pub const STANDARD: &str = "standard";
    pub const DEEP: &str = "deep";
    pub const NIGHTLY: &str = "nightly";
}

/// Common operation names
pub mod operations {
    pub const NOOP: &str = "noop";
    pub const FAILING: &str = "failing";
    pub const SLOW: &str = "slow";
}

/// A minimal valid profile running the given shell commands in order.
pub fn profile_with_commands(name: &str, commands: &[(&str, &str)]) -> Profile {
    Profile {
        name: name.to_string(),
        description: format!("test profile {}", name),
        schedule: "daily 03:00".to_string(),
        operations: commands
            .iter()
            .map(|(op_name, command)| OperationSpec {
                name: op_name.to_string(),
                kind: OperationKind::Custom,
                command: command.to_string(),
                timeout_seconds: Some(30),
                touches_user_data: false,
            })
            .collect(),
        resource_limits: ResourceLimits::default(),
        preconditions: Preconditions::default(),
        notify_threshold: NotificationLevel::Info,
        log_level: "info".to_string(),
        continue_on_error: false,
        skip_backup: false,
        operation_timeout_seconds: 60,
    }
}

/// A profile whose single operation always succeeds.
pub fn passing_profile(name: &str) -> Profile {
    profile_with_commands(name, &[(operations::NOOP, "true")])
}

/// A profile whose single operation always fails.
pub fn failing_profile(name: &str) -> Profile {
    profile_with_commands(name, &[(operations::FAILING, "exit 7")])
}
