use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use tokenpass::credentials::{EndpointTokenSource, TokenSource};
use tokenpass::db::{
    connect_pool, spawn_credential_sync, ConnectionFactory, PasswordSupply, PgConnector,
    SessionParameters,
};
use tokenpass::jobs::{ConnectivityProbe, RecurringJobScheduler, RecurringJobSpec};
use tokenpass::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokenpass=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    info!("tokenpass v{}", env!("CARGO_PKG_VERSION"));
    info!("Database {}:{}/{} as {}", config.db_host, config.db_port, config.db_name, config.db_user);

    // Password path: static override or refreshed tokens
    let settings = config.connection_settings();
    let (passwords, refresher) = PasswordSupply::for_settings(
        &settings,
        &config.token_scope,
        config.refresh_policy()?,
        || {
            let endpoint = config
                .token_endpoint
                .clone()
                .context("TOKEN_ENDPOINT is required when DB_PASSWORD is unset")?;
            let source: Arc<dyn TokenSource> = Arc::new(EndpointTokenSource::new(
                endpoint,
                config.token_endpoint_bearer.clone(),
            ));
            Ok(source)
        },
    )?;

    // One factory per consumer, sharing the password supply
    let orm_factory = Arc::new(
        ConnectionFactory::new("orm", PgConnector::new(&settings)?, passwords.clone())
            .with_hook(Arc::new(
                SessionParameters::new().set("application_name", "tokenpass-orm"),
            )),
    );
    let jobs_factory = Arc::new(
        ConnectionFactory::new("jobs", PgConnector::new(&settings)?, passwords)
            .with_hook(Arc::new(
                SessionParameters::new().set("application_name", "tokenpass-jobs"),
            )),
    );

    let pool = connect_pool(&orm_factory, config.orm_pool_max_connections).await?;
    let pool_sync = spawn_credential_sync(pool.clone(), orm_factory.clone());

    let scheduler = RecurringJobScheduler::configure(config.storage_options(), jobs_factory);
    scheduler
        .register(RecurringJobSpec::new(
            "connectivity-probe",
            &config.heartbeat_cron,
            Arc::new(ConnectivityProbe::new(orm_factory.clone())),
        )?)
        .await;
    let scheduler_handle = scheduler.start().await.context("Failed to start job scheduler")?;
    info!("Ready ✓");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    scheduler_handle.stop().await;
    if let Some(task) = pool_sync {
        task.abort();
    }
    pool.close().await;
    if let Some(refresher) = refresher {
        refresher.stop().await;
    }
    info!("Stopped");
    Ok(())
}
