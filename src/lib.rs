pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod jobs;

pub use config::Config;
pub use error::BrokerError;
