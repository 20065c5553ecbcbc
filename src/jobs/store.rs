//! Job storage — the persistent record of registered recurring jobs.
//!
//! Tables:
//! - `tokenpass_recurring_jobs`: one row per job id with its cron expression
//!   and the outcome of its last tick

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Connection, Row};
use tracing::info;

use super::types::TickOutcome;
use crate::db::{ConnectionFactory, PgConnector};
use crate::error::BrokerError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecurringJobRecord {
    pub id: String,
    pub cron: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
}

#[async_trait]
pub trait JobStorage: Send + Sync {
    /// Create the schema if it is missing. Safe to call on every startup.
    async fn migrate(&self) -> Result<(), BrokerError>;

    /// Insert the job or replace its schedule. Never creates a duplicate id.
    async fn upsert_recurring(&self, id: &str, cron: &str) -> Result<(), BrokerError>;

    async fn list_recurring(&self) -> Result<Vec<RecurringJobRecord>, BrokerError>;

    async fn record_run(&self, id: &str, outcome: &TickOutcome) -> Result<(), BrokerError>;
}

/// PostgreSQL job storage. Every operation opens its own connection through
/// the job-storage connection factory.
pub struct PgJobStorage {
    factory: Arc<ConnectionFactory<PgConnector>>,
}

impl PgJobStorage {
    pub fn new(factory: Arc<ConnectionFactory<PgConnector>>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl JobStorage for PgJobStorage {
    async fn migrate(&self) -> Result<(), BrokerError> {
        let mut conn = self.factory.get_connection().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tokenpass_recurring_jobs (
                id              TEXT PRIMARY KEY,
                cron            TEXT NOT NULL,
                registered_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_run_at     TIMESTAMPTZ,
                last_outcome    TEXT
            )
            "#,
        )
        .execute(&mut conn)
        .await?;

        conn.close().await?;
        info!(factory = self.factory.name(), "Job storage schema verified");
        Ok(())
    }

    async fn upsert_recurring(&self, id: &str, cron: &str) -> Result<(), BrokerError> {
        let mut conn = self.factory.get_connection().await?;

        sqlx::query(
            r#"
            INSERT INTO tokenpass_recurring_jobs (id, cron)
            VALUES ($1, $2)
            ON CONFLICT (id)
            DO UPDATE SET
                cron = EXCLUDED.cron,
                updated_at = NOW()
            "#,
        )
        .bind(id)
        .bind(cron)
        .execute(&mut conn)
        .await?;

        conn.close().await?;
        Ok(())
    }

    async fn list_recurring(&self) -> Result<Vec<RecurringJobRecord>, BrokerError> {
        let mut conn = self.factory.get_connection().await?;

        let rows = sqlx::query(
            r#"
            SELECT id, cron, last_run_at, last_outcome
            FROM tokenpass_recurring_jobs
            ORDER BY id
            "#,
        )
        .fetch_all(&mut conn)
        .await?;

        conn.close().await?;

        let jobs = rows
            .iter()
            .map(|row| RecurringJobRecord {
                id: row.get(0),
                cron: row.get(1),
                last_run_at: row.try_get(2).ok().flatten(),
                last_outcome: row.try_get(3).ok().flatten(),
            })
            .collect();

        Ok(jobs)
    }

    async fn record_run(&self, id: &str, outcome: &TickOutcome) -> Result<(), BrokerError> {
        let mut conn = self.factory.get_connection().await?;

        sqlx::query(
            "UPDATE tokenpass_recurring_jobs SET last_run_at = NOW(), last_outcome = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(outcome.as_str())
        .execute(&mut conn)
        .await?;

        conn.close().await?;
        Ok(())
    }
}

/// In-memory job storage for single-process use and tests.
#[derive(Default)]
pub struct MemoryJobStorage {
    jobs: Mutex<BTreeMap<String, RecurringJobRecord>>,
    migrations: AtomicUsize,
}

impl MemoryJobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `migrate` has run.
    pub fn migrations(&self) -> usize {
        self.migrations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStorage for MemoryJobStorage {
    async fn migrate(&self) -> Result<(), BrokerError> {
        self.migrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn upsert_recurring(&self, id: &str, cron: &str) -> Result<(), BrokerError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.entry(id.to_string())
            .and_modify(|job| job.cron = cron.to_string())
            .or_insert_with(|| RecurringJobRecord {
                id: id.to_string(),
                cron: cron.to_string(),
                last_run_at: None,
                last_outcome: None,
            });
        Ok(())
    }

    async fn list_recurring(&self) -> Result<Vec<RecurringJobRecord>, BrokerError> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.values().cloned().collect())
    }

    async fn record_run(&self, id: &str, outcome: &TickOutcome) -> Result<(), BrokerError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(id) {
            Some(job) => {
                job.last_run_at = Some(Utc::now());
                job.last_outcome = Some(outcome.as_str().to_string());
                Ok(())
            }
            None => Err(BrokerError::JobNotFound(id.to_string())),
        }
    }
}
