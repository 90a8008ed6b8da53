//! Stale-read policy and retrying reads.
//!
//! Reads go to any server when stale reads are allowed. If the answering
//! server has not heard from the leader for longer than the configured
//! bound, the read is repeated against the leader.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::api::{QueryMeta, QueryOptions};
use crate::error::Result;

/// Delay between attempts of a retrying read.
pub const RETRY_DELAY: Duration = Duration::from_secs(10);

/// How reads treat follower answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalePolicy {
    /// Let followers answer reads.
    pub allow_stale: bool,
    /// Longest acceptable leader silence before a follower answer is redone.
    pub max_last_contact: Duration,
}

impl Default for StalePolicy {
    fn default() -> Self {
        Self {
            allow_stale: true,
            max_last_contact: Duration::from_secs(3),
        }
    }
}

impl StalePolicy {
    /// Options for the first attempt of a read.
    #[must_use]
    pub const fn options(&self) -> QueryOptions {
        QueryOptions {
            allow_stale: self.allow_stale,
        }
    }

    /// Whether an answer described by `meta` is too old to use.
    #[must_use]
    pub fn is_too_stale(&self, meta: &QueryMeta) -> bool {
        self.allow_stale && meta.last_contact > self.max_last_contact
    }
}

/// Perform `read`, repeating it against the leader if the first answer was
/// too stale.
///
/// # Errors
///
/// Returns the error of whichever attempt failed.
pub async fn fresh<T, F, Fut>(policy: &StalePolicy, mut read: F) -> Result<(T, QueryMeta)>
where
    F: FnMut(QueryOptions) -> Fut,
    Fut: Future<Output = Result<(T, QueryMeta)>>,
{
    let (value, meta) = read(policy.options()).await?;
    if policy.is_too_stale(&meta) {
        return read(QueryOptions::consistent()).await;
    }
    Ok((value, meta))
}

/// Perform a [`fresh`] read until it succeeds, sleeping [`RETRY_DELAY`]
/// between attempts. `what` names the object in log lines.
pub async fn with_retry<T, F, Fut>(policy: &StalePolicy, what: &str, mut read: F) -> (T, QueryMeta)
where
    F: FnMut(QueryOptions) -> Fut,
    Fut: Future<Output = Result<(T, QueryMeta)>>,
{
    loop {
        match fresh(policy, &mut read).await {
            Ok(answer) => return answer,
            Err(e) => {
                warn!(what, error = %e, retry_in = ?RETRY_DELAY, "cluster read failed");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

/// Like [`with_retry`], but a missing object ends the retries with `None`.
pub async fn with_retry_or_missing<T, F, Fut>(
    policy: &StalePolicy,
    what: &str,
    mut read: F,
) -> Option<(T, QueryMeta)>
where
    F: FnMut(QueryOptions) -> Fut,
    Fut: Future<Output = Result<(T, QueryMeta)>>,
{
    loop {
        match fresh(policy, &mut read).await {
            Ok(answer) => return Some(answer),
            Err(e) if e.is_not_found() => return None,
            Err(e) => {
                warn!(what, error = %e, retry_in = ?RETRY_DELAY, "cluster read failed");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClusterError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn meta(contact_secs: u64) -> QueryMeta {
        QueryMeta {
            last_index: 1,
            last_contact: Duration::from_secs(contact_secs),
        }
    }

    #[tokio::test]
    async fn stale_answer_is_reread_from_leader() {
        let policy = StalePolicy::default();
        let mut seen = Vec::new();
        let (value, answer) = fresh(&policy, |opts| {
            seen.push(opts);
            let contact = if opts.allow_stale { 10 } else { 0 };
            async move { Ok((opts.allow_stale, meta(contact))) }
        })
        .await
        .unwrap();

        assert!(!value);
        assert_eq!(answer.last_contact, Duration::ZERO);
        assert_eq!(seen, vec![QueryOptions::stale(), QueryOptions::consistent()]);
    }

    #[tokio::test]
    async fn recent_answer_is_kept() {
        let policy = StalePolicy::default();
        let calls = AtomicUsize::new(0);
        let (value, _) = fresh(&policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok((7, meta(1))) }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn consistent_policy_never_rereads() {
        let policy = StalePolicy {
            allow_stale: false,
            max_last_contact: Duration::ZERO,
        };
        let calls = AtomicUsize::new(0);
        fresh(&policy, |opts| {
            assert!(!opts.allow_stale);
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(((), meta(60))) }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_sleeps_between_failures() {
        let policy = StalePolicy::default();
        let calls = AtomicUsize::new(0);
        let started = tokio::time::Instant::now();

        let (value, _) = with_retry(&policy, "job shop", |_| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(ClusterError::Stream("connection reset".into()))
                } else {
                    Ok(("shop", meta(0)))
                }
            }
        })
        .await;

        assert_eq!(value, "shop");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= RETRY_DELAY * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_object_stops_retrying() {
        let policy = StalePolicy::default();
        let calls = AtomicUsize::new(0);
        let answer: Option<((), QueryMeta)> = with_retry_or_missing(&policy, "job gone", |_| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(ClusterError::Stream("connection reset".into()))
                } else {
                    Err(ClusterError::NotFound("job gone".into()))
                }
            }
        })
        .await;

        assert!(answer.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
