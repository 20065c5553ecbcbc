//! Recurring jobs guarded by a distributed lock.

pub mod lock;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod worker;

pub use lock::{advisory_key, JobLock, LockGuard, MemoryJobLock, PgAdvisoryLock};
pub use schedule::CronSchedule;
pub use scheduler::{RecurringJobScheduler, SchedulerHandle};
pub use store::{JobStorage, MemoryJobStorage, PgJobStorage, RecurringJobRecord};
pub use types::{JobState, JobStatus, StorageOptions, TickOutcome};
pub use worker::{ConnectivityProbe, FnWorker, RecurringJobSpec, RecurringWorker};
