use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Options handed to the job storage engine. Read-only after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageOptions {
    /// How long a tick waits for the distributed lock before it is skipped.
    pub lock_timeout: Duration,
    /// Verify/create the storage schema when the scheduler starts.
    pub auto_migrate_schema: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5 * 60),
            auto_migrate_schema: true,
        }
    }
}

/// Lifecycle position of a recurring job in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Registered,
    Scheduled,
    LockAcquired,
    Running,
    Completed,
    Skipped,
    Failed,
}

/// Result of one scheduled tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum TickOutcome {
    Completed,
    /// Lock not obtained in time; the job runs again on its next tick.
    Skipped,
    Failed(String),
}

impl TickOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickOutcome::Completed => "completed",
            TickOutcome::Skipped => "skipped",
            TickOutcome::Failed(_) => "failed",
        }
    }

    pub fn state(&self) -> JobState {
        match self {
            TickOutcome::Completed => JobState::Completed,
            TickOutcome::Skipped => JobState::Skipped,
            TickOutcome::Failed(_) => JobState::Failed,
        }
    }
}

/// Point-in-time view of one registered job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub schedule: String,
    pub state: JobState,
    pub next_due: Option<DateTime<Utc>>,
    pub last_outcome: Option<TickOutcome>,
    pub runs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_defaults() {
        let opts = StorageOptions::default();
        assert_eq!(opts.lock_timeout, Duration::from_secs(300));
        assert!(opts.auto_migrate_schema);
    }

    #[test]
    fn test_outcome_serializes_with_reason() {
        let json = serde_json::to_value(TickOutcome::Failed("stale token".into())).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["reason"], "stale token");
        assert_eq!(TickOutcome::Skipped.state(), JobState::Skipped);
    }
}
