//! Bounded polling of cluster state.

use std::{future::Future, time::Duration};

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    api::ClusterApi,
    claim::ClaimPhase,
    error::{KubeApiError, Result},
};

/// Interval used by every wait in the crate.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Calls `check` right away and then every `interval` until it yields a value.
///
/// - `Ok(None)` means the state was not reached yet, and `check` is retried;
/// - `Err(_)` means querying the state failed, and the error is returned as is;
/// - once `timeout` has passed without a value, [`KubeApiError::Timeout`] is returned;
/// - cancelling `cancel` ends the wait with [`KubeApiError::Cancelled`].
pub async fn poll_until<T, F, Fut>(
    what: &str,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(KubeApiError::Cancelled(what.to_owned())),
            outcome = check() => outcome,
        };

        if let Some(value) = outcome? {
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(KubeApiError::Timeout {
                what: what.to_owned(),
                timeout,
            });
        }

        let wake_at = deadline.min(now + interval);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(KubeApiError::Cancelled(what.to_owned())),
            _ = tokio::time::sleep_until(wake_at) => {}
        }
    }
}

/// Waits until the claim is gone. A claim that cannot be found counts as deleted.
#[tracing::instrument(level = "debug", skip(cluster, cancel), err)]
pub async fn wait_for_claim_deleted<C>(
    cluster: &C,
    name: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()>
where
    C: ClusterApi + ?Sized,
{
    poll_until(
        &format!("deletion of claim `{name}`"),
        DEFAULT_POLL_INTERVAL,
        timeout,
        cancel,
        || async {
            match cluster.get_claim(name).await {
                Ok(None) => Ok(Some(())),
                Err(error) if error.is_not_found() => Ok(Some(())),
                Ok(Some(_)) => {
                    debug!(claim = name, "waiting for claim deletion, retrying");
                    Ok(None)
                }
                Err(error) => Err(error),
            }
        },
    )
    .await
}

/// Waits until the claim reports the `Bound` phase. A missing claim is not bound yet.
#[tracing::instrument(level = "debug", skip(cluster, cancel), err)]
pub async fn wait_for_claim_bound<C>(
    cluster: &C,
    name: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<PersistentVolumeClaim>
where
    C: ClusterApi + ?Sized,
{
    poll_until(
        &format!("claim `{name}` to be bound"),
        DEFAULT_POLL_INTERVAL,
        timeout,
        cancel,
        || async {
            match cluster.get_claim(name).await? {
                Some(claim) if ClaimPhase::of(&claim) == Some(ClaimPhase::Bound) => {
                    Ok(Some(claim))
                }
                Some(claim) => {
                    let phase = ClaimPhase::of(&claim)
                        .map(|phase| phase.to_string())
                        .unwrap_or_else(|| "Unknown".to_owned());
                    warn!(claim = name, phase, "claim not bound yet, retrying");
                    Ok(None)
                }
                None => {
                    debug!(claim = name, "claim not found yet, retrying");
                    Ok(None)
                }
            }
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rstest::rstest;

    use super::*;
    use crate::fake::{self, FakeCluster};

    const INTERVAL: Duration = Duration::from_secs(2);
    const TIMEOUT: Duration = Duration::from_secs(60);

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(5)]
    #[tokio::test(start_paused = true)]
    async fn satisfied_after_k_intervals(#[case] k: usize) {
        let calls = AtomicUsize::new(0);
        let start = Instant::now();

        let value = poll_until("test", INTERVAL, TIMEOUT, &CancellationToken::new(), || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok((call == k).then_some(call)) }
        })
        .await
        .unwrap();

        assert_eq!(value, k);
        assert_eq!(calls.load(Ordering::SeqCst), k + 1);
        assert_eq!(start.elapsed(), INTERVAL * k as u32);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_no_earlier_than_timeout() {
        let start = Instant::now();

        let result: Result<()> = poll_until(
            "never",
            INTERVAL,
            Duration::from_secs(7),
            &CancellationToken::new(),
            || async { Ok(None) },
        )
        .await;

        assert!(matches!(result, Err(ref error) if error.is_timeout()));
        assert!(start.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_error_is_returned_immediately() {
        let calls = AtomicUsize::new(0);
        let start = Instant::now();

        let result: Result<()> = poll_until("broken", INTERVAL, TIMEOUT, &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(KubeApiError::InvalidQuantity("x".to_owned())) }
        })
        .await;

        assert!(matches!(result, Err(KubeApiError::InvalidQuantity(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result: Result<()> =
            poll_until("cancelled", INTERVAL, TIMEOUT, &cancel, || async { Ok(None) }).await;

        assert!(matches!(result, Err(ref error) if error.is_cancelled()));
        assert!(start.elapsed() < TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_claim_is_not_bound_yet() {
        let cluster = FakeCluster::new("apps");
        let start = Instant::now();

        let error = wait_for_claim_bound(
            &cluster,
            "data-copy-1",
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(error.is_timeout());
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_claim_is_not_bound_yet() {
        let cluster = FakeCluster::new("apps");
        cluster.leave_claims_pending("data");
        cluster
            .create_claim(&fake::claim("apps", "data", "1Gi"))
            .await
            .unwrap();

        let error = wait_for_claim_bound(
            &cluster,
            "data",
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(error.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn bound_claim_is_returned() {
        let cluster = FakeCluster::new("apps");
        cluster.insert_claim(fake::claim("apps", "data", "1Gi"));

        let claim = wait_for_claim_bound(&cluster, "data", TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ClaimPhase::of(&claim), Some(ClaimPhase::Bound));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_claim_counts_as_deleted() {
        let cluster = FakeCluster::new("apps");
        let start = Instant::now();

        wait_for_claim_deleted(&cluster, "data", TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_claim_is_not_deleted() {
        let cluster = FakeCluster::new("apps");
        cluster.insert_claim(fake::claim("apps", "data", "1Gi"));

        let error = wait_for_claim_deleted(
            &cluster,
            "data",
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(error.is_timeout());
    }
}
