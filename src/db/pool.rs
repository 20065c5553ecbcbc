//! Pooled connections for the ORM consumer.
//!
//! sqlx pools open connections from a fixed `PgConnectOptions`, so each
//! credential refresh pushes new options into the pool. Connections already
//! open keep the token they were opened with.

use std::sync::Arc;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::factory::{ConnectionFactory, PgConnector};
use crate::error::BrokerError;

/// Build a lazily connecting pool from `factory`'s settings, password and hook.
pub async fn connect_pool(
    factory: &ConnectionFactory<PgConnector>,
    max_connections: u32,
) -> Result<PgPool, BrokerError> {
    let password = factory.passwords().password().await?;
    let mut options = PgPoolOptions::new().max_connections(max_connections);

    if let Some(hook) = factory.hook().cloned() {
        options = options.after_connect(move |conn, _meta| {
            let hook = hook.clone();
            Box::pin(async move {
                hook.on_connect(conn)
                    .await
                    .map_err(|e| sqlx::Error::Configuration(Box::new(e)))
            })
        });
    }

    let pool = options.connect_lazy_with(factory.connector().options_with_password(&password));
    info!(factory = factory.name(), max_connections, "Connection pool ready");
    Ok(pool)
}

/// Keep `pool`'s connect options in step with the factory's credential cache.
///
/// Returns `None` for a static password, which never changes.
pub fn spawn_credential_sync(
    pool: PgPool,
    factory: Arc<ConnectionFactory<PgConnector>>,
) -> Option<JoinHandle<()>> {
    let cache = factory.passwords().cache()?.clone();
    let mut changes = cache.subscribe();
    // A refresh may have landed after `connect_pool` read the password.
    changes.mark_changed();

    Some(tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            if pool.is_closed() {
                break;
            }
            if let Some(password) = cache.cached_password() {
                pool.set_connect_options(factory.connector().options_with_password(&password));
                debug!(factory = factory.name(), "Pool credential updated");
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::settings::tests::settings;
    use crate::credentials::cache::tests::ScriptedSource;
    use crate::credentials::CredentialCache;
    use crate::db::settings::PasswordSupply;

    fn pg_factory(supply: PasswordSupply) -> Arc<ConnectionFactory<PgConnector>> {
        let connector = PgConnector::new(&settings(None)).unwrap();
        Arc::new(ConnectionFactory::new("orm", connector, supply))
    }

    #[tokio::test]
    async fn test_lazy_pool_uses_factory_settings() {
        let factory = pg_factory(PasswordSupply::Static("pw".into()));
        let pool = connect_pool(&factory, 4).await.unwrap();

        assert_eq!(pool.options().get_max_connections(), 4);
        assert_eq!(pool.connect_options().get_username(), "app-identity");
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn test_static_password_needs_no_sync_task() {
        let factory = pg_factory(PasswordSupply::Static("pw".into()));
        let pool = connect_pool(&factory, 1).await.unwrap();
        assert!(spawn_credential_sync(pool, factory).is_none());
    }

    #[tokio::test]
    async fn test_sync_pushes_refresh_that_landed_before_subscribing() {
        let cache = Arc::new(CredentialCache::new(
            Arc::new(ScriptedSource::new(vec![Ok("A"), Ok("B")])),
            "scope",
        ));
        let factory = pg_factory(PasswordSupply::Token(cache.clone()));
        let pool = connect_pool(&factory, 1).await.unwrap();
        let initial = pool.connect_options();

        cache.refresh().await.unwrap();
        let task = spawn_credential_sync(pool.clone(), factory).unwrap();

        for _ in 0..100 {
            if !Arc::ptr_eq(&initial, &pool.connect_options()) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!Arc::ptr_eq(&initial, &pool.connect_options()));
        assert_eq!(pool.connect_options().get_username(), "app-identity");
        task.abort();
    }
}
