use std::time::Duration;

/// Unified error type for tokenpass.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    // ── Credential Errors ───────────────────────────────────────────────
    #[error("Credential fetch failed: {0}")]
    CredentialFetch(String),

    // ── Connection Errors ───────────────────────────────────────────────
    #[error("Database rejected the connection credential: {0}")]
    ConnectionAuth(String),

    #[error("Connection error: {0}")]
    Connection(String),

    // ── Lock Errors ─────────────────────────────────────────────────────
    #[error("Lock for job {job_id} not acquired within {timeout:?}")]
    LockAcquisitionTimeout { job_id: String, timeout: Duration },

    #[error("Lock error: {0}")]
    Lock(String),

    // ── Job Errors ──────────────────────────────────────────────────────
    #[error("Job {job_id} failed: {reason}")]
    JobExecution { job_id: String, reason: String },

    #[error("Invalid schedule expression: {0}")]
    InvalidSchedule(String),

    #[error("Job {0} not registered")]
    JobNotFound(String),

    // ── Configuration ───────────────────────────────────────────────────
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Internal ────────────────────────────────────────────────────────
    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Whether the database refused the credential rather than failing for another reason.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, BrokerError::ConnectionAuth(_))
    }
}

/// SQLSTATE codes for `invalid_password` and `invalid_authorization_specification`.
const AUTH_SQLSTATES: [&str; 2] = ["28P01", "28000"];

/// SQLSTATE `lock_not_available`, raised when `lock_timeout` elapses.
pub(crate) const LOCK_NOT_AVAILABLE: &str = "55P03";

impl From<sqlx::Error> for BrokerError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            match db.code().as_deref() {
                Some(code) if AUTH_SQLSTATES.contains(&code) => {
                    tracing::warn!("Database rejected credential: {e}");
                    return BrokerError::ConnectionAuth(db.message().to_string());
                }
                Some(LOCK_NOT_AVAILABLE) => {
                    return BrokerError::Lock(db.message().to_string());
                }
                _ => {}
            }
        }
        tracing::error!("Database error: {e}");
        BrokerError::Database(e.to_string())
    }
}

impl From<anyhow::Error> for BrokerError {
    fn from(e: anyhow::Error) -> Self {
        BrokerError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_job() {
        let err = BrokerError::LockAcquisitionTimeout {
            job_id: "nightly".into(),
            timeout: Duration::from_secs(300),
        };
        assert_eq!(err.to_string(), "Lock for job nightly not acquired within 300s");
    }

    #[test]
    fn test_non_database_sqlx_error_is_database_variant() {
        let err: BrokerError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, BrokerError::Database(_)));
        assert!(!err.is_auth_rejection());
    }
}
