// Types shared by the parallel coordinator and its callers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Workers used when nothing else is configured
pub const DEFAULT_MAX_WORKERS: usize = 3;

/// Hard upper bound on concurrent workers; larger requests are clamped
pub const MAX_WORKERS_CAP: usize = 10;

/// Error recorded for an item that never obtained a credential
pub const CREDENTIAL_UNAVAILABLE: &str = "credential unavailable";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("Worker count must be at least 1 (got {0})")]
    InvalidWorkerCount(usize),
}

/// What to do with an item when no credential could be reserved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialPolicy {
    /// Record the item as failed with "credential unavailable"
    #[default]
    Fail,
    /// Run the worker with no credential
    RunWithout,
}

/// Bounded retry loop around `CredentialPool::reserve()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub on_exhausted: CredentialPolicy,
}

impl Default for ReservationPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_delay: Duration::from_millis(500),
            on_exhausted: CredentialPolicy::Fail,
        }
    }
}

/// Outcome of one attempted item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub item_id: String,
    pub succeeded: bool,
    pub error: Option<String>,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn success(item_id: &str, duration: Duration, started_at: DateTime<Utc>) -> Self {
        Self {
            item_id: item_id.to_string(),
            succeeded: true,
            error: None,
            duration,
            started_at,
        }
    }

    pub fn failure(
        item_id: &str,
        error: impl Into<String>,
        duration: Duration,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            item_id: item_id.to_string(),
            succeeded: false,
            error: Some(error.into()),
            duration,
            started_at,
        }
    }
}

/// Aggregate progress for a run. `completed` counts failed items too.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

impl ProgressStats {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn succeeded(&self) -> usize {
        self.completed - self.failed
    }

    pub fn record(&mut self, succeeded: bool) {
        self.completed += 1;
        if !succeeded {
            self.failed += 1;
        }
    }
}

/// Everything a caller needs after `execute()` returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub stats: ProgressStats,
    /// In completion order
    pub results: Vec<ExecutionResult>,
    /// Items never started because of a shutdown request, in submission order
    pub checkpoints: Vec<String>,
    pub elapsed: Duration,
    pub interrupted: bool,
    pub dry_run: bool,
}

impl RunReport {
    /// Every item ran and succeeded
    pub fn is_clean(&self) -> bool {
        self.stats.failed == 0 && self.checkpoints.is_empty()
    }

    pub fn failed_results(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter().filter(|r| !r.succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_stats_derives_succeeded() {
        let mut stats = ProgressStats::new(4);
        stats.record(true);
        stats.record(false);
        stats.record(true);

        assert_eq!(stats.total, 4);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded(), 2);
    }

    #[test]
    fn test_execution_result_constructors() {
        let now = Utc::now();
        let ok = ExecutionResult::success("issue-1", Duration::from_secs(1), now);
        assert!(ok.succeeded);
        assert!(ok.error.is_none());

        let failed = ExecutionResult::failure("issue-2", "boom", Duration::ZERO, now);
        assert!(!failed.succeeded);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let result = ExecutionResult::success("issue-1", Duration::from_millis(1500), Utc::now());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["itemId"], "issue-1");
        assert_eq!(json["succeeded"], true);
        assert!(json.get("startedAt").is_some());
    }

    #[test]
    fn test_credential_policy_serde() {
        let policy: CredentialPolicy = serde_json::from_str("\"run_without\"").unwrap();
        assert_eq!(policy, CredentialPolicy::RunWithout);
        assert_eq!(CredentialPolicy::default(), CredentialPolicy::Fail);
    }
}
