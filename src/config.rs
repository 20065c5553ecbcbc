use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::credentials::RefreshPolicy;
use crate::db::ConnectionSettings;
use crate::jobs::{CronSchedule, StorageOptions};

/// Application configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Database ────────────────────────────────────────────────────────
    pub db_host: String,
    pub db_port: u16,
    pub db_name: String,
    pub db_user: String,
    /// Static password. When present the token path is never built.
    pub db_password: Option<String>,
    pub db_ssl_mode: String,

    // ── Credential source ───────────────────────────────────────────────
    /// Resource scope the token must be valid for.
    pub token_scope: String,
    pub token_endpoint: Option<String>,
    pub token_endpoint_bearer: Option<String>,
    pub refresh_success_interval: Duration,
    pub refresh_failure_interval: Duration,

    // ── Jobs ────────────────────────────────────────────────────────────
    pub job_lock_timeout: Duration,
    pub job_auto_migrate: bool,
    pub heartbeat_cron: String,

    // ── ORM pool ────────────────────────────────────────────────────────
    pub orm_pool_max_connections: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Config {
            db_host: var("DB_HOST").context("DB_HOST is required")?,
            db_port: var("DB_PORT")
                .unwrap_or_else(|| "5432".into())
                .parse()
                .context("Invalid DB_PORT")?,
            db_name: var("DB_NAME").context("DB_NAME is required")?,
            db_user: var("DB_USER").context("DB_USER is required (database user identity)")?,
            db_password: var("DB_PASSWORD"),
            db_ssl_mode: var("DB_SSL_MODE").unwrap_or_else(|| "prefer".into()),

            token_scope: var("TOKEN_SCOPE")
                .unwrap_or_else(|| "https://ossrdbms-aad.database.windows.net/.default".into()),
            token_endpoint: var("TOKEN_ENDPOINT"),
            token_endpoint_bearer: var("TOKEN_ENDPOINT_BEARER"),
            refresh_success_interval: seconds(var("REFRESH_SUCCESS_INTERVAL_SECS"), 4 * 60 * 60)
                .context("Invalid REFRESH_SUCCESS_INTERVAL_SECS")?,
            refresh_failure_interval: seconds(var("REFRESH_FAILURE_INTERVAL_SECS"), 10)
                .context("Invalid REFRESH_FAILURE_INTERVAL_SECS")?,

            job_lock_timeout: seconds(var("JOB_LOCK_TIMEOUT_SECS"), 5 * 60)
                .context("Invalid JOB_LOCK_TIMEOUT_SECS")?,
            job_auto_migrate: flag(var("JOB_AUTO_MIGRATE"), true).context("Invalid JOB_AUTO_MIGRATE")?,
            heartbeat_cron: var("HEARTBEAT_CRON").unwrap_or_else(|| "* * * * *".into()),

            orm_pool_max_connections: var("ORM_POOL_MAX_CONNECTIONS")
                .unwrap_or_else(|| "10".into())
                .parse()
                .context("Invalid ORM_POOL_MAX_CONNECTIONS")?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.db_password.is_none() && self.token_endpoint.is_none() {
            bail!("TOKEN_ENDPOINT is required when DB_PASSWORD is unset");
        }
        self.connection_settings().validate()?;
        self.refresh_policy()?;
        CronSchedule::parse(&self.heartbeat_cron).context("Invalid HEARTBEAT_CRON")?;
        Ok(())
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            host: self.db_host.clone(),
            port: self.db_port,
            database: self.db_name.clone(),
            user: self.db_user.clone(),
            password: self.db_password.clone(),
            ssl_mode: self.db_ssl_mode.clone(),
        }
    }

    pub fn refresh_policy(&self) -> Result<RefreshPolicy> {
        Ok(RefreshPolicy::new(
            self.refresh_success_interval,
            self.refresh_failure_interval,
        )?)
    }

    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            lock_timeout: self.job_lock_timeout,
            auto_migrate_schema: self.job_auto_migrate,
        }
    }
}

fn seconds(value: Option<String>, default: u64) -> Result<Duration> {
    match value {
        None => Ok(Duration::from_secs(default)),
        Some(v) => Ok(Duration::from_secs(v.trim().parse()?)),
    }
}

fn flag(value: Option<String>, default: bool) -> Result<bool> {
    match value.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("expected a boolean, got '{other}'"),
        },
    }
}
