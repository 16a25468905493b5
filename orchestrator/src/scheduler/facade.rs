// File: orchestrator/src/scheduler/facade.rs
use crate::database::records::{
    ExecutionRecord, NotificationEventRecord, NotificationLevel, RunStatus, Trigger,
};
use crate::database::stats::{StatisticsSummary, TrendReport};
use crate::database::Database;
use crate::errors::OrchestratorError;
use crate::lock_manager::{JobLock, JobLockManager};
use crate::profiles::{Profile, ProfileRegistry};
use crate::safety::guard::{GuardOutcome, SafetyGuard};
use crate::scheduler::state::StateStore;
use crate::services::job_executor::BackgroundJobExecutor;
use crate::services::notification_service::NotificationDispatcher;
use crate::timer::{TimerBinder, TimerStatus};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// One profile's standing as reported by `status`
#[derive(Debug)]
pub struct ProfileStatus {
    pub name: String,
    pub schedule: String,
    pub enabled: bool,
    pub timer: Option<TimerStatus>,
    pub last_run: Option<ExecutionRecord>,
    pub lock: Option<JobLock>,
}

/// Everything `report` assembles in one pass
#[derive(Debug, Serialize)]
pub struct MaintenanceReport {
    pub statistics: StatisticsSummary,
    pub trend: TrendReport,
    pub suggestions: Vec<String>,
    #[serde(skip)]
    pub recent_events: Vec<NotificationEventRecord>,
}

/// The single entry point for every command, whether typed by an operator or
/// fired by an installed timer.
pub struct SchedulerFacade {
    registry: ProfileRegistry,
    guard: SafetyGuard,
    executor: Arc<BackgroundJobExecutor>,
    binder: TimerBinder,
    database: Arc<Database>,
    lock_manager: Arc<JobLockManager>,
    notifier: NotificationDispatcher,
    state_store: StateStore,
}

impl SchedulerFacade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: ProfileRegistry,
        guard: SafetyGuard,
        executor: Arc<BackgroundJobExecutor>,
        binder: TimerBinder,
        database: Arc<Database>,
        lock_manager: Arc<JobLockManager>,
        notifier: NotificationDispatcher,
        state_store: StateStore,
    ) -> Self {
        Self {
            registry,
            guard,
            executor,
            binder,
            database,
            lock_manager,
            notifier,
            state_store,
        }
    }

    /// Binds the profile's schedule to a persistent platform timer.
    pub async fn enable(&self, profile_name: &str) -> Result<(), OrchestratorError> {
        let profile = self.registry.load(profile_name).await?;
        let schedule = profile.parsed_schedule()?;

        self.binder.install(&profile.name, &schedule).await?;

        let mut state = self.state_store.load().await;
        state.activate(&profile.name);
        self.persist_state(&state).await;

        self.notifier
            .send(
                NotificationLevel::Info,
                "Profile enabled",
                &format!("'{}' scheduled: {}", profile.name, profile.schedule),
                Some(&profile.name),
            )
            .await;
        Ok(())
    }

    /// Removes the profile's timer binding.
    pub async fn disable(&self, profile_name: &str) -> Result<(), OrchestratorError> {
        // Resolve the name first so typos report NotFound, not NotInstalled
        let profile = self.registry.load(profile_name).await?;

        self.binder.uninstall(&profile.name).await?;

        let mut state = self.state_store.load().await;
        state.deactivate(&profile.name);
        self.persist_state(&state).await;

        self.notifier
            .send(
                NotificationLevel::Info,
                "Profile disabled",
                &format!("'{}' is no longer scheduled", profile.name),
                Some(&profile.name),
            )
            .await;
        Ok(())
    }

    /// Runs a profile under the safety envelope. `force` bypasses
    /// precondition evaluation, never locking.
    pub async fn run(
        &self,
        profile_name: &str,
        trigger: Trigger,
        force: bool,
    ) -> Result<GuardOutcome, OrchestratorError> {
        let profile = self.registry.load(profile_name).await?;

        let mut state = self.state_store.load().await;
        state.mark_checked();
        self.persist_state(&state).await;

        let outcome = self.guard.execute(&profile, trigger, force).await?;

        if outcome.run_status != RunStatus::Skipped {
            let mut state = self.state_store.load().await;
            state.mark_maintenance();
            self.persist_state(&state).await;
        }

        Ok(outcome)
    }

    /// Interrupts a live run of the profile by signalling its lock owner.
    /// Returns false when nothing was running.
    pub async fn stop(&self, profile_name: &str) -> Result<bool, OrchestratorError> {
        let profile = self.registry.load(profile_name).await?;
        let stopped = self.executor.stop_job(&profile.name).await?;
        if stopped {
            info!("Stop signal delivered to run of '{}'", profile.name);
        } else {
            info!("No live run of '{}' to stop", profile.name);
        }
        Ok(stopped)
    }

    /// Standing of every known profile: schedule, timer binding, last run,
    /// and any live lock.
    pub async fn status(&self) -> Result<Vec<ProfileStatus>, OrchestratorError> {
        // Stale locks must not show up as live runs
        let reclaimed = self.lock_manager.sweep().await?;
        if reclaimed > 0 {
            warn!("Reclaimed {} stale locks", reclaimed);
        }

        let mut profiles: Vec<Profile> = self.registry.load_all().await?.into_values().collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name));

        let mut statuses = Vec::with_capacity(profiles.len());
        for profile in profiles {
            let enabled = self.binder.is_installed(&profile.name);
            let timer = if enabled {
                self.binder.status(&profile.name).await.ok()
            } else {
                None
            };
            statuses.push(ProfileStatus {
                enabled,
                timer,
                last_run: self.database.last_run_for_profile(&profile.name).await?,
                lock: self.lock_manager.inspect(&profile.name).await?,
                schedule: profile.schedule,
                name: profile.name,
            });
        }
        Ok(statuses)
    }

    /// All known profiles, sorted by name.
    pub async fn list(&self) -> Result<Vec<Profile>, OrchestratorError> {
        let mut profiles: Vec<Profile> = self.registry.load_all().await?.into_values().collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(profiles)
    }

    pub async fn history(
        &self,
        profile: Option<&str>,
        days: i64,
    ) -> Result<Vec<ExecutionRecord>, OrchestratorError> {
        Ok(self.database.query_history(profile, days).await?)
    }

    pub async fn statistics(&self, days: i64) -> Result<StatisticsSummary, OrchestratorError> {
        Ok(self.database.statistics(days).await?)
    }

    pub async fn report(&self, days: i64) -> Result<MaintenanceReport, OrchestratorError> {
        Ok(MaintenanceReport {
            statistics: self.database.statistics(days).await?,
            trend: self.database.trend().await?,
            suggestions: self.database.suggest().await?,
            recent_events: self.database.recent_notification_events(20).await?,
        })
    }

    pub async fn suggest(&self) -> Result<Vec<String>, OrchestratorError> {
        Ok(self.database.suggest().await?)
    }

    /// State is advisory bookkeeping; a failed write is logged, never fatal.
    async fn persist_state(&self, state: &crate::scheduler::state::SchedulerState) {
        if let Err(e) = self.state_store.persist(state).await {
            warn!("Could not persist scheduler state: {}", e);
        }
    }
}
