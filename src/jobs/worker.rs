use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Connection;

use super::schedule::CronSchedule;
use crate::db::{ConnectionFactory, PgConnector};
use crate::error::BrokerError;

/// One schedulable unit of work.
///
/// Invoked only while this process holds the job's distributed lock. Another
/// process may still be running the same job id until that lock is taken, so
/// implementations must not rely on exclusive in-process execution.
#[async_trait]
pub trait RecurringWorker: Send + Sync {
    async fn do_work(&self) -> anyhow::Result<()>;
}

/// Adapts an async closure into a worker.
pub struct FnWorker<F> {
    f: F,
}

impl<F, Fut> FnWorker<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> RecurringWorker for FnWorker<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn do_work(&self) -> anyhow::Result<()> {
        (self.f)().await
    }
}

/// Opens a connection and runs `SELECT 1`.
pub struct ConnectivityProbe {
    factory: Arc<ConnectionFactory<PgConnector>>,
}

impl ConnectivityProbe {
    pub fn new(factory: Arc<ConnectionFactory<PgConnector>>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl RecurringWorker for ConnectivityProbe {
    async fn do_work(&self) -> anyhow::Result<()> {
        let mut conn = self.factory.get_connection().await?;
        let one: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&mut conn).await?;
        conn.close().await?;
        anyhow::ensure!(one == 1, "connectivity probe returned {one}");
        tracing::info!(factory = self.factory.name(), "Connectivity probe ok");
        Ok(())
    }
}

/// A recurring job: id, schedule and the work to run.
#[derive(Clone)]
pub struct RecurringJobSpec {
    pub id: String,
    pub schedule: CronSchedule,
    pub worker: Arc<dyn RecurringWorker>,
}

impl RecurringJobSpec {
    pub fn new(
        id: impl Into<String>,
        expression: &str,
        worker: Arc<dyn RecurringWorker>,
    ) -> Result<Self, BrokerError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(BrokerError::InvalidConfig("job id must not be empty".into()));
        }
        Ok(Self {
            id,
            schedule: CronSchedule::parse(expression)?,
            worker,
        })
    }
}

impl std::fmt::Debug for RecurringJobSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecurringJobSpec")
            .field("id", &self.id)
            .field("schedule", &self.schedule.expression())
            .finish()
    }
}
