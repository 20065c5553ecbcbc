//! Connection factory — opens a connection with the password current at call time.
//!
//! One generic factory type serves every consumer. Consumers differ only in
//! their `Connector` and optional post-connect `ConnectionHook`; the password
//! supply is shared.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use tracing::{debug, warn};

use super::settings::{ConnectionSettings, PasswordSupply};
use crate::error::BrokerError;

/// Opens a raw connection given the password to present.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Send + 'static;

    async fn connect(&self, password: &str) -> Result<Self::Connection, BrokerError>;
}

/// Consumer-specific setup applied to a freshly opened connection.
#[async_trait]
pub trait ConnectionHook<C: Send>: Send + Sync {
    async fn on_connect(&self, conn: &mut C) -> Result<(), BrokerError>;
}

/// PostgreSQL connector over sqlx.
pub struct PgConnector {
    options: PgConnectOptions,
}

impl PgConnector {
    pub fn new(settings: &ConnectionSettings) -> Result<Self, BrokerError> {
        Ok(Self {
            options: settings.pg_options()?,
        })
    }

    /// Connect options with `password` filled in.
    pub fn options_with_password(&self, password: &str) -> PgConnectOptions {
        self.options.clone().password(password)
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgConnection;

    async fn connect(&self, password: &str) -> Result<PgConnection, BrokerError> {
        PgConnection::connect_with(&self.options_with_password(password))
            .await
            .map_err(|e| match BrokerError::from(e) {
                BrokerError::Database(reason) => BrokerError::Connection(reason),
                other => other,
            })
    }
}

/// Runs `set_config(name, value, false)` for each parameter after connecting.
pub struct SessionParameters {
    params: Vec<(String, String)>,
}

impl SessionParameters {
    pub fn new() -> Self {
        Self { params: Vec::new() }
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl Default for SessionParameters {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionHook<PgConnection> for SessionParameters {
    async fn on_connect(&self, conn: &mut PgConnection) -> Result<(), BrokerError> {
        for (name, value) in &self.params {
            sqlx::query("SELECT set_config($1, $2, false)")
                .bind(name)
                .bind(value)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}

pub struct ConnectionFactory<C: Connector> {
    name: String,
    connector: C,
    passwords: PasswordSupply,
    hook: Option<Arc<dyn ConnectionHook<C::Connection>>>,
}

impl<C: Connector> ConnectionFactory<C> {
    pub fn new(name: impl Into<String>, connector: C, passwords: PasswordSupply) -> Self {
        Self {
            name: name.into(),
            connector,
            passwords,
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn ConnectionHook<C::Connection>>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn passwords(&self) -> &PasswordSupply {
        &self.passwords
    }

    pub fn hook(&self) -> Option<&Arc<dyn ConnectionHook<C::Connection>>> {
        self.hook.as_ref()
    }

    /// Open a new connection using the password current right now.
    ///
    /// Authentication failures are returned as `ConnectionAuth` and are not
    /// retried here.
    pub async fn get_connection(&self) -> Result<C::Connection, BrokerError> {
        let password = self.passwords.password().await?;
        let mut conn = match self.connector.connect(&password).await {
            Ok(conn) => conn,
            Err(e) => {
                if e.is_auth_rejection() {
                    warn!(
                        factory = %self.name,
                        expired = self.passwords.credential_expired(),
                        "Connection rejected with current credential: {e}"
                    );
                }
                return Err(e);
            }
        };

        if let Some(hook) = &self.hook {
            hook.on_connect(&mut conn).await?;
        }
        debug!(factory = %self.name, "Connection opened");
        Ok(conn)
    }
}
