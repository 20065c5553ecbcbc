//! Credential cache — one atomically swapped token slot per resource scope.
//!
//! Readers load the slot without locking. Writers (the refresher, or the very
//! first caller when the cache is cold) serialise on `fetch_lock` so the token
//! source sees at most one request at a time.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use super::source::TokenSource;
use crate::error::BrokerError;

/// A token issued by the credential source. Never mutated after creation.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub obtained_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("obtained_at", &self.obtained_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

pub struct CredentialCache {
    source: Arc<dyn TokenSource>,
    scope: String,
    slot: ArcSwapOption<Credential>,
    fetch_lock: Mutex<()>,
    generation: watch::Sender<u64>,
}

impl CredentialCache {
    pub fn new(source: Arc<dyn TokenSource>, scope: impl Into<String>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            source,
            scope: scope.into(),
            slot: ArcSwapOption::empty(),
            fetch_lock: Mutex::new(()),
            generation,
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Snapshot of the current credential, if one has been fetched.
    pub fn credential(&self) -> Option<Arc<Credential>> {
        self.slot.load_full()
    }

    /// Current token without ever touching the network.
    pub fn cached_password(&self) -> Option<String> {
        self.slot.load().as_ref().map(|c| c.token.clone())
    }

    /// Token to present as the database password.
    ///
    /// Once warm this is a lock-free read. A cold cache fetches synchronously
    /// on behalf of the caller, and concurrent cold callers share that fetch.
    pub async fn current_password(&self) -> Result<String, BrokerError> {
        if let Some(token) = self.cached_password() {
            return Ok(token);
        }
        let credential = self.ensure_loaded().await?;
        Ok(credential.token.clone())
    }

    /// Return the cached credential, fetching one first if the slot is empty.
    pub async fn ensure_loaded(&self) -> Result<Arc<Credential>, BrokerError> {
        let _guard = self.fetch_lock.lock().await;
        if let Some(existing) = self.slot.load_full() {
            return Ok(existing);
        }
        debug!(scope = %self.scope, "Credential cache cold, fetching first token");
        self.fetch_and_store().await
    }

    /// Fetch a new token unconditionally and swap it in on success.
    ///
    /// On failure the previous credential stays in place.
    pub async fn refresh(&self) -> Result<Arc<Credential>, BrokerError> {
        let _guard = self.fetch_lock.lock().await;
        self.fetch_and_store().await
    }

    /// Receiver whose value increments after every successful refresh.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    async fn fetch_and_store(&self) -> Result<Arc<Credential>, BrokerError> {
        let token = self.source.fetch_token(&self.scope).await?;
        let credential = Arc::new(Credential {
            token: token.token,
            obtained_at: Utc::now(),
            expires_at: token.expires_at,
        });
        self.slot.store(Some(credential.clone()));
        self.generation.send_modify(|g| *g += 1);
        info!(
            source = self.source.id(),
            scope = %self.scope,
            expires_at = %credential.expires_at,
            "Credential refreshed"
        );
        Ok(credential)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::credentials::source::AccessToken;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Token source that replays a script and records when it was called.
    pub(crate) struct ScriptedSource {
        script: std::sync::Mutex<VecDeque<Result<String, String>>>,
        pub calls: AtomicUsize,
        pub called_at: std::sync::Mutex<Vec<tokio::time::Instant>>,
        latency: Duration,
    }

    impl ScriptedSource {
        pub(crate) fn new(script: Vec<Result<&str, &str>>) -> Self {
            Self {
                script: std::sync::Mutex::new(
                    script
                        .into_iter()
                        .map(|r| r.map(String::from).map_err(String::from))
                        .collect(),
                ),
                calls: AtomicUsize::new(0),
                called_at: std::sync::Mutex::new(Vec::new()),
                latency: Duration::ZERO,
            }
        }

        pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenSource for ScriptedSource {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn fetch_token(&self, _scope: &str) -> Result<AccessToken, BrokerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.called_at.lock().unwrap().push(tokio::time::Instant::now());
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err("script exhausted".into()));
            match next {
                Ok(token) => Ok(AccessToken {
                    token,
                    expires_at: Utc::now() + chrono::Duration::hours(4),
                }),
                Err(reason) => Err(BrokerError::CredentialFetch(reason)),
            }
        }
    }

    #[tokio::test]
    async fn test_cold_cache_fetches_on_first_call() {
        let source = Arc::new(ScriptedSource::new(vec![Ok("A")]));
        let cache = CredentialCache::new(source.clone(), "scope");
        assert!(cache.cached_password().is_none());

        assert_eq!(cache.current_password().await.unwrap(), "A");
        assert_eq!(cache.current_password().await.unwrap(), "A");
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_cold_callers_share_one_fetch() {
        let source =
            Arc::new(ScriptedSource::new(vec![Ok("A")]).with_latency(Duration::from_millis(200)));
        let cache = Arc::new(CredentialCache::new(source.clone(), "scope"));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.current_password().await }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "A");
        }
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_first_fetch_surfaces_and_next_call_retries() {
        let source = Arc::new(ScriptedSource::new(vec![Err("boom"), Ok("A")]));
        let cache = CredentialCache::new(source.clone(), "scope");

        let err = cache.current_password().await.unwrap_err();
        assert!(matches!(err, BrokerError::CredentialFetch(_)));
        assert_eq!(cache.current_password().await.unwrap(), "A");
        assert_eq!(source.call_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_credential() {
        let source = Arc::new(ScriptedSource::new(vec![Ok("A"), Err("down"), Ok("B")]));
        let cache = CredentialCache::new(source, "scope");

        cache.refresh().await.unwrap();
        let before = cache.credential().unwrap();
        assert!(cache.refresh().await.is_err());
        assert_eq!(cache.credential().unwrap(), before);

        cache.refresh().await.unwrap();
        assert_eq!(cache.cached_password().as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_password_tracks_latest_successful_fetch() {
        let source = Arc::new(ScriptedSource::new(vec![Ok("A"), Ok("B"), Ok("C")]));
        let cache = CredentialCache::new(source, "scope");

        for expected in ["A", "B", "C"] {
            let fetched = cache.refresh().await.unwrap();
            assert_eq!(fetched.token, expected);
            assert_eq!(cache.current_password().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_subscribers_see_generation_bump() {
        let source = Arc::new(ScriptedSource::new(vec![Ok("A"), Err("x"), Ok("B")]));
        let cache = CredentialCache::new(source, "scope");
        let rx = cache.subscribe();

        cache.refresh().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
        let _ = cache.refresh().await;
        assert_eq!(*rx.borrow(), 1);
        cache.refresh().await.unwrap();
        assert_eq!(*rx.borrow(), 2);
    }

    #[test]
    fn test_credential_expiry_and_redaction() {
        let now = Utc::now();
        let cred = Credential {
            token: "secret-token".into(),
            obtained_at: now,
            expires_at: now + chrono::Duration::minutes(5),
        };
        assert!(!cred.is_expired(now));
        assert!(cred.is_expired(now + chrono::Duration::minutes(5)));
        assert!(!format!("{cred:?}").contains("secret-token"));
    }
}
