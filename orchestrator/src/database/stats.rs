//! Derived statistics over execution history.
//!
//! Aggregation, trend analysis, and suggestion generation are pure functions
//! over fetched rows so they can be tested without a database; the `Database`
//! methods at the bottom just fetch the window and delegate.

use super::records::{ExecutionRecord, RunStatus, RUN_RECORD_TYPE};
use super::Database;
use crate::constants::history;
use crate::errors::DatabaseError;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Aggregates for one operation type (or one profile)
#[derive(Debug, Clone, Serialize)]
pub struct Aggregate {
    pub key: String,
    pub runs: u64,
    pub failures: u64,
    pub avg_duration_seconds: f64,
    pub total_space_freed_bytes: i64,
    pub error_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatisticsSummary {
    pub window_days: i64,
    pub total_runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub stopped: u64,
    pub crashed: u64,
    pub skipped: u64,
    /// successes / finished runs; skips are legitimate no-ops, not outcomes
    pub success_rate: Option<f64>,
    pub avg_duration_seconds: f64,
    pub total_space_freed_bytes: i64,
    pub per_operation: Vec<Aggregate>,
    pub per_profile: Vec<Aggregate>,
}

/// Mean run duration of the recent window against the preceding baseline
#[derive(Debug, Clone, Serialize)]
pub struct TrendReport {
    pub recent_days: i64,
    pub baseline_days: i64,
    pub recent_runs: u64,
    pub baseline_runs: u64,
    pub recent_avg_duration_seconds: f64,
    pub baseline_avg_duration_seconds: f64,
    /// Positive means runs got slower; `None` when either window is empty
    pub delta_percent: Option<f64>,
}

/// Computes the summary over a record window. Run-level numbers come from
/// run-summary rows; per-operation aggregates from the operation rows.
pub fn summarize(records: &[ExecutionRecord], window_days: i64) -> StatisticsSummary {
    let mut total_runs = 0u64;
    let mut successes = 0u64;
    let mut failures = 0u64;
    let mut stopped = 0u64;
    let mut crashed = 0u64;
    let mut skipped = 0u64;
    let mut duration_sum = 0i64;
    let mut space_sum = 0i64;

    let mut per_operation: BTreeMap<String, (u64, u64, i64, i64, i64)> = BTreeMap::new();
    let mut per_profile: BTreeMap<String, (u64, u64, i64, i64, i64)> = BTreeMap::new();

    for record in records {
        if record.is_run_summary() {
            match record.status {
                RunStatus::Success => {
                    total_runs += 1;
                    successes += 1;
                }
                RunStatus::Failed => {
                    total_runs += 1;
                    failures += 1;
                }
                RunStatus::Stopped => {
                    total_runs += 1;
                    stopped += 1;
                }
                RunStatus::Crashed => {
                    total_runs += 1;
                    crashed += 1;
                }
                RunStatus::Skipped => skipped += 1,
                RunStatus::Running => {}
            }
            if record.status != RunStatus::Skipped && record.status != RunStatus::Running {
                duration_sum += record.duration_seconds;
                space_sum += record.space_freed_bytes;
            }

            let entry = per_profile
                .entry(record.profile.clone())
                .or_insert((0, 0, 0, 0, 0));
            accumulate(entry, record);
        } else {
            let entry = per_operation
                .entry(record.operation_type.clone())
                .or_insert((0, 0, 0, 0, 0));
            accumulate(entry, record);
        }
    }

    let success_rate = if total_runs > 0 {
        Some(successes as f64 / total_runs as f64)
    } else {
        None
    };
    let avg_duration_seconds = if total_runs > 0 {
        duration_sum as f64 / total_runs as f64
    } else {
        0.0
    };

    StatisticsSummary {
        window_days,
        total_runs,
        successes,
        failures,
        stopped,
        crashed,
        skipped,
        success_rate,
        avg_duration_seconds,
        total_space_freed_bytes: space_sum,
        per_operation: into_aggregates(per_operation),
        per_profile: into_aggregates(per_profile),
    }
}

fn accumulate(entry: &mut (u64, u64, i64, i64, i64), record: &ExecutionRecord) {
    if record.status == RunStatus::Skipped || record.status == RunStatus::Running {
        return;
    }
    entry.0 += 1;
    if record.status != RunStatus::Success {
        entry.1 += 1;
    }
    entry.2 += record.duration_seconds;
    entry.3 += record.space_freed_bytes;
    entry.4 += record.error_count;
}

fn into_aggregates(map: BTreeMap<String, (u64, u64, i64, i64, i64)>) -> Vec<Aggregate> {
    map.into_iter()
        .map(|(key, (runs, failures, duration_sum, space, errors))| Aggregate {
            key,
            runs,
            failures,
            avg_duration_seconds: if runs > 0 {
                duration_sum as f64 / runs as f64
            } else {
                0.0
            },
            total_space_freed_bytes: space,
            error_count: errors,
        })
        .collect()
}

/// Compares mean run duration in the most recent window against the window
/// immediately preceding it.
pub fn duration_trend(records: &[ExecutionRecord], now: DateTime<Utc>) -> TrendReport {
    let recent_cutoff = now - Duration::days(history::TREND_RECENT_DAYS);
    let baseline_cutoff = recent_cutoff - Duration::days(history::TREND_BASELINE_DAYS);

    let mut recent = (0u64, 0i64);
    let mut baseline = (0u64, 0i64);

    for record in records {
        if !record.is_run_summary()
            || record.status == RunStatus::Skipped
            || record.status == RunStatus::Running
        {
            continue;
        }
        if record.started_at >= recent_cutoff {
            recent.0 += 1;
            recent.1 += record.duration_seconds;
        } else if record.started_at >= baseline_cutoff {
            baseline.0 += 1;
            baseline.1 += record.duration_seconds;
        }
    }

    let recent_avg = mean(recent);
    let baseline_avg = mean(baseline);
    let delta_percent = if recent.0 > 0 && baseline.0 > 0 && baseline_avg > 0.0 {
        Some((recent_avg - baseline_avg) / baseline_avg * 100.0)
    } else {
        None
    };

    TrendReport {
        recent_days: history::TREND_RECENT_DAYS,
        baseline_days: history::TREND_BASELINE_DAYS,
        recent_runs: recent.0,
        baseline_runs: baseline.0,
        recent_avg_duration_seconds: recent_avg,
        baseline_avg_duration_seconds: baseline_avg,
        delta_percent,
    }
}

fn mean((count, sum): (u64, i64)) -> f64 {
    if count > 0 {
        sum as f64 / count as f64
    } else {
        0.0
    }
}

/// Pure suggestion generation over the suggestion window.
pub fn suggestions(records: &[ExecutionRecord], now: DateTime<Utc>) -> Vec<String> {
    let cutoff = now - Duration::days(history::SUGGESTION_WINDOW_DAYS);
    let mut output = Vec::new();

    let mut failures_by_operation: BTreeMap<&str, i64> = BTreeMap::new();
    for record in records {
        if record.started_at < cutoff || record.is_run_summary() {
            continue;
        }
        if matches!(record.status, RunStatus::Failed | RunStatus::Crashed) {
            *failures_by_operation
                .entry(record.operation_type.as_str())
                .or_insert(0) += 1;
        }
    }

    for (operation, count) in &failures_by_operation {
        if *count >= history::SUGGESTION_FAILURE_THRESHOLD {
            output.push(format!(
                "Operation '{}' failed {} times in the last {} days; review its command and preconditions",
                operation, count, history::SUGGESTION_WINDOW_DAYS
            ));
        }
    }

    let summary = summarize(records, history::SUGGESTION_WINDOW_DAYS);
    if let Some(rate) = summary.success_rate {
        if rate < 0.5 && summary.total_runs >= 4 {
            output.push(format!(
                "Overall success rate is {:.0}% over {} runs; check the notification log for recurring causes",
                rate * 100.0,
                summary.total_runs
            ));
        }
    }

    let trend = duration_trend(records, now);
    if let Some(delta) = trend.delta_percent {
        if delta > 50.0 {
            output.push(format!(
                "Average run duration grew {:.0}% against the preceding {}-day window; the host may need a deeper cleanup",
                delta, trend.baseline_days
            ));
        }
    }

    output
}

impl Database {
    pub async fn statistics(&self, days: i64) -> Result<StatisticsSummary, DatabaseError> {
        let records = self.query_history(None, days).await?;
        Ok(summarize(&records, days))
    }

    pub async fn trend(&self) -> Result<TrendReport, DatabaseError> {
        let window = history::TREND_RECENT_DAYS + history::TREND_BASELINE_DAYS;
        let records = self.query_history(None, window).await?;
        Ok(duration_trend(&records, Utc::now()))
    }

    pub async fn suggest(&self) -> Result<Vec<String>, DatabaseError> {
        let records = self
            .query_history(None, history::SUGGESTION_WINDOW_DAYS)
            .await?;
        Ok(suggestions(&records, Utc::now()))
    }
}
