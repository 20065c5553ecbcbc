use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer};

use crate::error::BrokerError;

/// A bearer token as returned by a credential source.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Anything that can mint a short-lived bearer token for a resource scope.
///
/// Implementations perform network I/O. Callers never invoke this on the
/// connection-opening path once the credential cache is warm.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Short identifier used in log lines (e.g. "endpoint", "static-test").
    fn id(&self) -> &str;

    /// Fetch a fresh token valid for `scope`.
    async fn fetch_token(&self, scope: &str) -> Result<AccessToken, BrokerError>;
}

/// Lifetime assumed when a source does not report an expiry.
const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

/// Token source backed by a local or remote HTTP token endpoint.
///
/// Sends `GET {endpoint}?resource={scope}` and expects a JSON body carrying
/// `access_token` plus either `expires_in` or `expires_on`.
pub struct EndpointTokenSource {
    endpoint: String,
    bearer: Option<String>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct EndpointTokenResponse {
    access_token: String,
    #[serde(default, deserialize_with = "lenient_seconds")]
    expires_in: Option<i64>,
    #[serde(default, deserialize_with = "lenient_seconds")]
    expires_on: Option<i64>,
}

impl EndpointTokenSource {
    pub fn new(endpoint: impl Into<String>, bearer: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            bearer,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TokenSource for EndpointTokenSource {
    fn id(&self) -> &str {
        "endpoint"
    }

    async fn fetch_token(&self, scope: &str) -> Result<AccessToken, BrokerError> {
        let mut req = self
            .http
            .get(&self.endpoint)
            .query(&[("resource", scope)])
            .header("Metadata", "true");
        if let Some(bearer) = &self.bearer {
            req = req.bearer_auth(bearer);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| BrokerError::CredentialFetch(format!("Token request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(BrokerError::CredentialFetch(format!(
                "Token endpoint returned {status}: {body}"
            )));
        }

        let body: EndpointTokenResponse = resp
            .json()
            .await
            .map_err(|e| BrokerError::CredentialFetch(format!("Failed to parse token response: {e}")))?;

        Ok(body.into_access_token(Utc::now()))
    }
}

impl EndpointTokenResponse {
    fn into_access_token(self, now: DateTime<Utc>) -> AccessToken {
        let expires_at = match (self.expires_on, self.expires_in) {
            (Some(on), _) => DateTime::from_timestamp(on, 0)
                .unwrap_or_else(|| now + Duration::seconds(DEFAULT_TOKEN_TTL_SECS)),
            (None, Some(secs)) => now + Duration::seconds(secs),
            (None, None) => now + Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
        };
        AccessToken {
            token: self.access_token,
            expires_at,
        }
    }
}

/// Token endpoints disagree on whether seconds are JSON numbers or strings.
fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Number(i64),
        Text(String),
    }

    match Option::<Seconds>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Seconds::Number(n)) => Ok(Some(n)),
        Some(Seconds::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
