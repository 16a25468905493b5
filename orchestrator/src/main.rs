// File: orchestrator/src/main.rs
use anyhow::Result;
use clap::{Parser, Subcommand};
use orchestrator::backup::{BackupManager, BackupSources};
use orchestrator::config::ConfigManager;
use orchestrator::database::records::Trigger;
use orchestrator::database::Database;
use orchestrator::lock_manager::JobLockManager;
use orchestrator::preconditions::PreconditionEvaluator;
use orchestrator::profiles::ProfileRegistry;
use orchestrator::safety::{IntegrityChecker, SafetyGuard};
use orchestrator::scheduler::{SchedulerFacade, StateStore};
use orchestrator::services::{BackgroundJobExecutor, NotificationDispatcher};
use orchestrator::timer::TimerBinder;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "sysmaint",
    about = "Scheduled system maintenance with snapshots and rollback",
    version
)]
struct Cli {
    /// Configuration directory (overrides SYSMAINT_CONFIG_DIR)
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bind a profile's schedule to a persistent system timer
    Enable { profile: String },
    /// Remove a profile's timer binding
    Disable { profile: String },
    /// Run a profile now, under the full safety envelope
    Run {
        profile: String,
        /// Bypass precondition checks (the job lock still applies)
        #[arg(long)]
        force: bool,
        /// Set by the generated service units so timer-fired runs are
        /// recorded as scheduled rather than manual
        #[arg(long, hide = true)]
        scheduled: bool,
    },
    /// Stop a running maintenance job
    Stop { profile: String },
    /// Show every profile's schedule, timer, last run, and live lock
    Status,
    /// List known profiles
    List,
    /// Show past runs
    History {
        #[arg(long)]
        profile: Option<String>,
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Aggregate statistics over a window
    Stats {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Full report: statistics, duration trend, suggestions, recent events
    Report,
    /// Suggestions derived from run history
    Suggest,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::from_default_env()
        .add_directive("orchestrator=info".parse()?)
        .add_directive("sqlx=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    let config_manager = ConfigManager::new(cli.config_dir.clone()).await?;
    config_manager.ensure_directories().await?;
    let config = config_manager.get_current_config();
    let paths = &config.paths;

    let database = Arc::new(
        Database::new(
            &paths.database_file.to_string_lossy(),
            config.history_retention_days,
        )
        .await?,
    );

    let lock_manager = Arc::new(JobLockManager::new(paths.locks_dir.clone()));
    let executor = Arc::new(BackgroundJobExecutor::new(
        lock_manager.clone(),
        Arc::new(PreconditionEvaluator::new()),
        paths.run_logs_dir.clone(),
    ));
    let backups = Arc::new(BackupManager::new(
        paths.snapshots_dir.clone(),
        config.snapshot_retention_count,
        BackupSources::default(),
    ));
    let notifier = NotificationDispatcher::new(config.notifications.clone(), database.clone());
    let guard = SafetyGuard::new(
        executor.clone(),
        backups,
        database.clone(),
        notifier.clone(),
        IntegrityChecker::default(),
    );

    let registry = ProfileRegistry::new(
        paths.system_profiles_dir.clone(),
        paths.user_profiles_dir.clone(),
    );
    let bootstrapped = registry.bootstrap_defaults().await?;
    if bootstrapped > 0 {
        info!("Bootstrapped {} default profiles", bootstrapped);
    }

    let binder = TimerBinder::new(paths.unit_dir.clone(), std::env::current_exe()?);
    let facade = SchedulerFacade::new(
        registry,
        guard,
        executor,
        binder,
        database,
        lock_manager,
        notifier,
        StateStore::new(paths.state_file.clone()),
    );

    let exit_code = dispatch(&facade, cli.command).await?;
    std::process::exit(exit_code);
}

async fn dispatch(facade: &SchedulerFacade, command: Command) -> Result<i32> {
    match command {
        Command::Enable { profile } => {
            facade.enable(&profile).await?;
            println!("Profile '{}' enabled", profile);
        }
        Command::Disable { profile } => {
            facade.disable(&profile).await?;
            println!("Profile '{}' disabled", profile);
        }
        Command::Run {
            profile,
            force,
            scheduled,
        } => {
            let trigger = if scheduled {
                Trigger::Scheduled
            } else {
                Trigger::Manual
            };
            let outcome = facade.run(&profile, trigger, force).await?;
            match &outcome.detail {
                Some(detail) => println!("{}: {}", outcome.run_status, detail),
                None => println!("{}", outcome.run_status),
            }
            return Ok(outcome.exit_code());
        }
        Command::Stop { profile } => {
            if facade.stop(&profile).await? {
                println!("Stop signal sent to '{}'", profile);
            } else {
                println!("'{}' is not running", profile);
            }
        }
        Command::Status => {
            for status in facade.status().await? {
                let running = status
                    .lock
                    .as_ref()
                    .map(|l| format!(" [running, pid {}]", l.owner_pid))
                    .unwrap_or_default();
                let next = status
                    .timer
                    .as_ref()
                    .and_then(|t| t.next_elapse.as_deref())
                    .map(|n| format!(", next {}", n))
                    .unwrap_or_default();
                let last = status
                    .last_run
                    .as_ref()
                    .map(|r| format!(", last run {} ({})", r.started_at.format("%Y-%m-%d %H:%M"), r.status))
                    .unwrap_or_else(|| ", never run".to_string());
                println!(
                    "{:<12} {:<22} {}{}{}{}",
                    status.name,
                    status.schedule,
                    if status.enabled { "enabled" } else { "disabled" },
                    next,
                    last,
                    running,
                );
            }
        }
        Command::List => {
            for profile in facade.list().await? {
                println!(
                    "{:<12} {:<22} {} operations  {}",
                    profile.name,
                    profile.schedule,
                    profile.operations.len(),
                    profile.description
                );
            }
        }
        Command::History { profile, days } => {
            for record in facade.history(profile.as_deref(), days).await? {
                println!(
                    "{}  {:<10} {:<16} {:<8} {:>5}s  {}",
                    record.started_at.format("%Y-%m-%d %H:%M"),
                    record.profile,
                    record.operation_type,
                    record.status,
                    record.duration_seconds,
                    record.details.as_deref().unwrap_or(""),
                );
            }
        }
        Command::Stats { days } => {
            let stats = facade.statistics(days).await?;
            println!("Last {} days: {} runs", stats.window_days, stats.total_runs);
            println!(
                "  success {}, failed {}, stopped {}, crashed {}, skipped {}",
                stats.successes, stats.failures, stats.stopped, stats.crashed, stats.skipped
            );
            if let Some(rate) = stats.success_rate {
                println!("  success rate {:.1}%", rate * 100.0);
            }
            println!("  average duration {:.0}s", stats.avg_duration_seconds);
            for agg in &stats.per_operation {
                println!(
                    "  {:<16} {} runs, avg {:.0}s, {} errors",
                    agg.key, agg.runs, agg.avg_duration_seconds, agg.error_count
                );
            }
        }
        Command::Report => {
            let report = facade.report(30).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.recent_events.is_empty() {
                println!("\nRecent events:");
                for event in &report.recent_events {
                    println!(
                        "  {} [{}] {}: {}",
                        event.timestamp.format("%Y-%m-%d %H:%M"),
                        event.level,
                        event.title,
                        event.message
                    );
                }
            }
        }
        Command::Suggest => {
            let suggestions = facade.suggest().await?;
            if suggestions.is_empty() {
                println!("Nothing to suggest; recent runs look healthy");
            } else {
                for suggestion in suggestions {
                    println!("- {}", suggestion);
                }
            }
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_defaults_to_manual_trigger() {
        let cli = Cli::try_parse_from(["sysmaint", "run", "standard"]).unwrap();
        match cli.command {
            Command::Run { scheduled, force, .. } => {
                assert!(!scheduled);
                assert!(!force);
            }
            _ => panic!("expected a run command"),
        }
    }

    #[test]
    fn test_scheduled_flag_marks_timer_fired_runs() {
        let cli =
            Cli::try_parse_from(["sysmaint", "run", "standard", "--scheduled"]).unwrap();
        match cli.command {
            Command::Run { scheduled, .. } => assert!(scheduled),
            _ => panic!("expected a run command"),
        }
    }
}
