//! Distributed execution locks for recurring jobs.
//!
//! `PgAdvisoryLock` coordinates processes sharing one PostgreSQL database.
//! `MemoryJobLock` coordinates schedulers inside a single process and backs
//! the tests that simulate several processes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgConnection;
use sqlx::Connection;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::db::{ConnectionFactory, PgConnector};
use crate::error::BrokerError;

/// Mutual exclusion per job id, with a bounded wait.
#[async_trait]
pub trait JobLock: Send + Sync {
    /// Wait up to `timeout` for the lock on `job_id`.
    ///
    /// Returns `LockAcquisitionTimeout` when the wait runs out.
    async fn acquire(&self, job_id: &str, timeout: Duration) -> Result<Box<dyn LockGuard>, BrokerError>;
}

#[async_trait]
pub trait LockGuard: Send {
    fn job_id(&self) -> &str;

    async fn release(self: Box<Self>) -> Result<(), BrokerError>;
}

/// Advisory lock key for a job id: the first 8 bytes of a SHA-256 digest.
pub fn advisory_key(job_id: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(b"tokenpass:job:");
    hasher.update(job_id.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

// ─────────────────────────────────────────────────────────────────────────────
// PostgreSQL advisory locks
// ─────────────────────────────────────────────────────────────────────────────

/// Session-level advisory lock held on a dedicated connection.
///
/// The wait is bounded server-side with `lock_timeout`. If the holder dies,
/// its session ends and PostgreSQL drops the lock.
pub struct PgAdvisoryLock {
    factory: Arc<ConnectionFactory<PgConnector>>,
}

impl PgAdvisoryLock {
    pub fn new(factory: Arc<ConnectionFactory<PgConnector>>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl JobLock for PgAdvisoryLock {
    async fn acquire(&self, job_id: &str, timeout: Duration) -> Result<Box<dyn LockGuard>, BrokerError> {
        let key = advisory_key(job_id);
        let mut conn = self.factory.get_connection().await?;

        let acquired = if timeout.is_zero() {
            sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
                .bind(key)
                .fetch_one(&mut conn)
                .await?
        } else {
            sqlx::query("SELECT set_config('lock_timeout', $1, false)")
                .bind(format!("{}ms", timeout.as_millis()))
                .execute(&mut conn)
                .await?;
            match sqlx::query("SELECT pg_advisory_lock($1)")
                .bind(key)
                .execute(&mut conn)
                .await
            {
                Ok(_) => true,
                Err(e) => match BrokerError::from(e) {
                    BrokerError::Lock(_) => false,
                    other => return Err(other),
                },
            }
        };

        if !acquired {
            let _ = conn.close().await;
            return Err(BrokerError::LockAcquisitionTimeout {
                job_id: job_id.to_string(),
                timeout,
            });
        }

        debug!(job_id, key, "Advisory lock acquired");
        Ok(Box::new(PgLockGuard {
            conn,
            key,
            job_id: job_id.to_string(),
        }))
    }
}

struct PgLockGuard {
    conn: PgConnection,
    key: i64,
    job_id: String,
}

#[async_trait]
impl LockGuard for PgLockGuard {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    async fn release(self: Box<Self>) -> Result<(), BrokerError> {
        let PgLockGuard { mut conn, key, job_id } = *self;
        let released = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(&mut conn)
            .await?;
        if !released {
            warn!(job_id = %job_id, key, "Advisory lock was not held at release");
        }
        conn.close().await?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-process locks
// ─────────────────────────────────────────────────────────────────────────────

/// Lock table shared by every clone. Clones behave like separate processes
/// talking to the same backing store.
#[derive(Clone, Default)]
pub struct MemoryJobLock {
    inner: Arc<MemoryLockTable>,
}

#[derive(Default)]
struct MemoryLockTable {
    held: Mutex<HashSet<String>>,
    released: Notify,
}

impl MemoryLockTable {
    fn try_take(&self, job_id: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id.to_string())
    }

    fn give_back(&self, job_id: &str) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
        self.released.notify_waiters();
    }
}

impl MemoryJobLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, job_id: &str) -> bool {
        self.inner
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(job_id)
    }
}

#[async_trait]
impl JobLock for MemoryJobLock {
    async fn acquire(&self, job_id: &str, timeout: Duration) -> Result<Box<dyn LockGuard>, BrokerError> {
        let table = &self.inner;
        let wait = async {
            loop {
                let notified = table.released.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if table.try_take(job_id) {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| BrokerError::LockAcquisitionTimeout {
                job_id: job_id.to_string(),
                timeout,
            })?;

        Ok(Box::new(MemoryLockGuard {
            table: self.inner.clone(),
            job_id: job_id.to_string(),
            released: false,
        }))
    }
}

struct MemoryLockGuard {
    table: Arc<MemoryLockTable>,
    job_id: String,
    released: bool,
}

#[async_trait]
impl LockGuard for MemoryLockGuard {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    async fn release(self: Box<Self>) -> Result<(), BrokerError> {
        let mut guard = self;
        guard.table.give_back(&guard.job_id);
        guard.released = true;
        Ok(())
    }
}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.table.give_back(&self.job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_advisory_key_is_stable_and_distinct() {
        assert_eq!(advisory_key("nightly"), advisory_key("nightly"));
        assert_ne!(advisory_key("nightly"), advisory_key("hourly"));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_per_job_id() {
        let lock = MemoryJobLock::new();
        let guard = lock.acquire("a", MINUTE).await.unwrap();
        assert!(lock.is_held("a"));

        // different id is independent
        let other = lock.acquire("b", Duration::ZERO).await.unwrap();
        other.release().await.unwrap();

        guard.release().await.unwrap();
        assert!(!lock.is_held("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_holder_times_out() {
        let p1 = MemoryJobLock::new();
        let p2 = p1.clone();
        let _held = p1.acquire("report", MINUTE).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = p2.acquire("report", 5 * MINUTE).await.err().unwrap();
        assert!(matches!(err, BrokerError::LockAcquisitionTimeout { .. }));
        assert!(started.elapsed() >= 5 * MINUTE);
        assert!(started.elapsed() < 5 * MINUTE + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_acquires_after_release() {
        let p1 = MemoryJobLock::new();
        let p2 = p1.clone();
        let held = p1.acquire("report", MINUTE).await.unwrap();

        let waiter = tokio::spawn(async move { p2.acquire("report", 5 * MINUTE).await.is_ok() });
        tokio::time::sleep(2 * MINUTE).await;
        held.release().await.unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases() {
        let lock = MemoryJobLock::new();
        {
            let _guard = lock.acquire("a", MINUTE).await.unwrap();
            assert!(lock.is_held("a"));
        }
        assert!(!lock.is_held("a"));
    }
}
