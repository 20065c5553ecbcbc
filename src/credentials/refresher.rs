//! Background credential refresh loop.
//!
//! One task per cache. After a successful fetch it sleeps `success_interval`;
//! after a failure it sleeps `failure_interval` and keeps the last good
//! credential. There is no retry cap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::cache::CredentialCache;
use crate::error::BrokerError;

/// Refresh cadence for a credential cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub success_interval: Duration,
    pub failure_interval: Duration,
}

impl RefreshPolicy {
    pub fn new(success_interval: Duration, failure_interval: Duration) -> Result<Self, BrokerError> {
        if failure_interval.is_zero() || success_interval.is_zero() {
            return Err(BrokerError::InvalidConfig(
                "refresh intervals must be greater than zero".into(),
            ));
        }
        if failure_interval >= success_interval {
            return Err(BrokerError::InvalidConfig(format!(
                "failure interval ({failure_interval:?}) must be shorter than success interval ({success_interval:?})"
            )));
        }
        Ok(Self {
            success_interval,
            failure_interval,
        })
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            success_interval: Duration::from_secs(4 * 60 * 60),
            failure_interval: Duration::from_secs(10),
        }
    }
}

pub struct CredentialRefresher;

impl CredentialRefresher {
    /// Start the refresh loop for `cache`.
    ///
    /// The first iteration reuses a credential that a caller already fetched,
    /// otherwise it fetches immediately.
    pub fn spawn(cache: Arc<CredentialCache>, policy: RefreshPolicy) -> RefreshHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(cache, policy, shutdown_rx));
        RefreshHandle { shutdown, task }
    }
}

async fn run(cache: Arc<CredentialCache>, policy: RefreshPolicy, mut shutdown: watch::Receiver<bool>) {
    info!(
        scope = cache.scope(),
        success_interval = ?policy.success_interval,
        failure_interval = ?policy.failure_interval,
        "Credential refresher started"
    );

    let mut outcome = cache.ensure_loaded().await;
    loop {
        let delay = match &outcome {
            Ok(_) => policy.success_interval,
            Err(e) => {
                error!(
                    scope = cache.scope(),
                    retry_in = ?policy.failure_interval,
                    "Credential refresh failed: {e}"
                );
                policy.failure_interval
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }

        outcome = cache.refresh().await;
    }

    info!(scope = cache.scope(), "Credential refresher stopped");
}

/// Handle to a running refresh loop.
pub struct RefreshHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RefreshHandle {
    /// Signal the loop to exit and wait for it.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Credential refresher task ended abnormally: {e}");
        }
    }

    /// Wait for the loop to exit on its own. The shutdown signal stays
    /// unsent while waiting.
    pub async fn join(self) {
        let RefreshHandle { shutdown, task } = self;
        if let Err(e) = task.await {
            error!("Credential refresher task ended abnormally: {e}");
        }
        drop(shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::cache::tests::ScriptedSource;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_policy_rejects_slow_failure_retry() {
        assert!(RefreshPolicy::new(Duration::from_secs(10), Duration::from_secs(10)).is_err());
        assert!(RefreshPolicy::new(Duration::from_secs(10), Duration::ZERO).is_err());
        assert!(RefreshPolicy::new(Duration::from_secs(10), Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_default_policy() {
        let policy = RefreshPolicy::default();
        assert_eq!(policy.success_interval, 4 * HOUR);
        assert_eq!(policy.failure_interval, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_last_good_token_until_retry_succeeds() {
        let source = Arc::new(ScriptedSource::new(vec![Ok("A"), Err("outage"), Ok("B")]));
        let cache = Arc::new(CredentialCache::new(source.clone(), "scope"));
        let handle = CredentialRefresher::spawn(cache.clone(), RefreshPolicy::default());

        // t = 1h: the connection attempt sees "A"
        tokio::time::sleep(HOUR).await;
        assert_eq!(cache.current_password().await.unwrap(), "A");

        // t = 4h + 1s: the 4h refresh failed, "A" is still served
        tokio::time::sleep(3 * HOUR + Duration::from_secs(1)).await;
        assert_eq!(source.call_count(), 2);
        assert_eq!(cache.current_password().await.unwrap(), "A");

        // t = 4h + 11s: the retry at 4h + 10s produced "B"
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.call_count(), 3);
        assert_eq!(cache.current_password().await.unwrap(), "B");

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_cadence_follows_policy() {
        let source = Arc::new(ScriptedSource::new(vec![
            Ok("A"),
            Err("e1"),
            Err("e2"),
            Ok("B"),
            Ok("C"),
        ]));
        let cache = Arc::new(CredentialCache::new(source.clone(), "scope"));
        let policy = RefreshPolicy::new(Duration::from_secs(600), Duration::from_secs(5)).unwrap();
        let handle = CredentialRefresher::spawn(cache, policy);

        tokio::time::sleep(Duration::from_secs(600 + 5 + 5 + 600 + 1)).await;
        handle.stop().await;

        let calls = source.called_at.lock().unwrap().clone();
        assert_eq!(calls.len(), 5);
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        let expected = [
            Duration::from_secs(600),
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(600),
        ];
        for (gap, want) in gaps.iter().zip(expected) {
            assert!(*gap >= want, "gap {gap:?} shorter than {want:?}");
            assert!(*gap < want + Duration::from_millis(50), "gap {gap:?} overshoots {want:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresher_reuses_token_fetched_by_caller() {
        let source = Arc::new(ScriptedSource::new(vec![Ok("A"), Ok("B")]));
        let cache = Arc::new(CredentialCache::new(source.clone(), "scope"));
        assert_eq!(cache.current_password().await.unwrap(), "A");

        let handle = CredentialRefresher::spawn(cache.clone(), RefreshPolicy::default());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.call_count(), 1);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_the_loop() {
        let source = Arc::new(ScriptedSource::new(vec![Ok("A")]));
        let cache = Arc::new(CredentialCache::new(source.clone(), "scope"));
        let handle = CredentialRefresher::spawn(cache, RefreshPolicy::default());

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.stop().await;
        tokio::time::sleep(10 * HOUR).await;
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_waits_without_stopping_the_loop() {
        let source = Arc::new(ScriptedSource::new(vec![Ok("A"), Ok("B"), Ok("C")]));
        let cache = Arc::new(CredentialCache::new(source.clone(), "scope"));
        let handle = CredentialRefresher::spawn(cache.clone(), RefreshPolicy::default());

        let waited = tokio::time::timeout(8 * HOUR + Duration::from_secs(1), handle.join()).await;
        assert!(waited.is_err(), "loop exited without a stop signal");
        assert_eq!(source.call_count(), 3);
        assert_eq!(cache.cached_password().as_deref(), Some("C"));
    }
}
