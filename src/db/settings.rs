use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use tracing::info;

use crate::credentials::{
    CredentialCache, CredentialRefresher, RefreshHandle, RefreshPolicy, TokenSource,
};
use crate::error::BrokerError;

/// Static connection parameters. The password is resolved per connection.
#[derive(Clone)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    /// Explicit local password. When set, tokens are never fetched.
    pub password: Option<String>,
    pub ssl_mode: String,
}

impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

impl ConnectionSettings {
    /// Reject parameters that could never produce a connection.
    pub fn validate(&self) -> Result<(), BrokerError> {
        for (field, value) in [
            ("host", &self.host),
            ("database", &self.database),
            ("user", &self.user),
        ] {
            if value.trim().is_empty() {
                return Err(BrokerError::InvalidConfig(format!("{field} must not be empty")));
            }
        }
        if self.port == 0 {
            return Err(BrokerError::InvalidConfig("port must not be 0".into()));
        }
        self.parsed_ssl_mode()?;
        Ok(())
    }

    /// Connect options without a password; the factory adds it at connect time.
    pub fn pg_options(&self) -> Result<PgConnectOptions, BrokerError> {
        self.validate()?;
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .ssl_mode(self.parsed_ssl_mode()?))
    }

    fn parsed_ssl_mode(&self) -> Result<PgSslMode, BrokerError> {
        PgSslMode::from_str(&self.ssl_mode)
            .map_err(|e| BrokerError::InvalidConfig(format!("invalid ssl mode '{}': {e}", self.ssl_mode)))
    }
}

/// Where connection passwords come from. Decided once, at construction.
#[derive(Clone)]
pub enum PasswordSupply {
    Static(String),
    Token(Arc<CredentialCache>),
}

impl PasswordSupply {
    /// Pick the password path for `settings`.
    ///
    /// A configured static password short-circuits everything: `make_source`
    /// is not called and no refresher is started. Otherwise a credential cache
    /// for `scope` is created and its refresher spawned.
    pub fn for_settings<F>(
        settings: &ConnectionSettings,
        scope: &str,
        policy: RefreshPolicy,
        make_source: F,
    ) -> Result<(Self, Option<RefreshHandle>), BrokerError>
    where
        F: FnOnce() -> Result<Arc<dyn TokenSource>, BrokerError>,
    {
        if let Some(password) = &settings.password {
            info!(user = %settings.user, "Static database password configured, token refresh disabled");
            return Ok((PasswordSupply::Static(password.clone()), None));
        }

        let cache = Arc::new(CredentialCache::new(make_source()?, scope));
        let handle = CredentialRefresher::spawn(cache.clone(), policy);
        Ok((PasswordSupply::Token(cache), Some(handle)))
    }

    pub async fn password(&self) -> Result<String, BrokerError> {
        match self {
            PasswordSupply::Static(password) => Ok(password.clone()),
            PasswordSupply::Token(cache) => cache.current_password().await,
        }
    }

    /// Whether the cached token is past its expiry. Always false for a static password.
    pub fn credential_expired(&self) -> bool {
        self.cache()
            .and_then(|cache| cache.credential())
            .is_some_and(|credential| credential.is_expired(Utc::now()))
    }

    /// The backing cache, when passwords are tokens.
    pub fn cache(&self) -> Option<&Arc<CredentialCache>> {
        match self {
            PasswordSupply::Static(_) => None,
            PasswordSupply::Token(cache) => Some(cache),
        }
    }
}

impl std::fmt::Debug for PasswordSupply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PasswordSupply::Static(_) => f.write_str("PasswordSupply::Static(<redacted>)"),
            PasswordSupply::Token(cache) => write!(f, "PasswordSupply::Token({})", cache.scope()),
        }
    }
}
