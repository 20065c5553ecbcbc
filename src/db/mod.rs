//! Database connection plumbing.
//!
//! `settings` holds the static parameters and the password-source decision,
//! `factory` opens single connections, `pool` adapts the factory to sqlx pools.

pub mod factory;
pub mod pool;
pub mod settings;

pub use factory::{ConnectionFactory, ConnectionHook, Connector, PgConnector, SessionParameters};
pub use pool::{connect_pool, spawn_credential_sync};
pub use settings::{ConnectionSettings, PasswordSupply};
