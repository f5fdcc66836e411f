//! Opt-in reconnection policy and timeout helper.
//!
//! The stream core never reconnects on its own. Callers that want a retry loop
//! layer [`spawn_reconnector`] on top of a client; it reacts to lifecycle
//! changes and re-issues `connect` with bounded exponential backoff.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::stream::client::StreamClient;
use crate::stream::state::ConnectionState;

/// Backoff policy for re-establishing a failed connection.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts tolerated before giving up.
    /// `None` retries indefinitely.
    pub max_attempts: Option<usize>,
    /// Delay before the first reconnect.
    pub initial_backoff: Duration,
    /// Upper bound for exponential delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each delay.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    /// Computes the delay before the given reconnect attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay + jitter_duration(self.jitter, attempt)
    }

    fn exhausted(&self, attempt: usize) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            jitter: Duration::from_millis(50),
        }
    }
}

/// Watches `client` and reconnects after transient failures.
///
/// Only `Errored` states whose reason is transient (transport failure or
/// handshake timeout) trigger a reconnect; auth rejections, configuration
/// errors and clean closes are left alone. Reaching
/// `Streaming` resets the attempt counter. The task ends when the policy is
/// exhausted or the client is dropped.
pub fn spawn_reconnector(client: &Arc<StreamClient>, policy: ReconnectPolicy) -> JoinHandle<()> {
    let mut states = client.watch_state();
    let client: Weak<StreamClient> = Arc::downgrade(client);

    tokio::spawn(async move {
        let mut attempt = 0usize;
        loop {
            if states.changed().await.is_err() {
                return;
            }
            let state = states.borrow_and_update().clone();
            match state {
                ConnectionState::Streaming => attempt = 0,
                ConnectionState::Errored(reason) if reason.is_transient() => {
                    attempt += 1;
                    if policy.exhausted(attempt) {
                        warn!(event = "reconnect_gave_up", attempts = attempt - 1, reason = %reason);
                        return;
                    }

                    let delay = policy.delay_for_attempt(attempt);
                    debug!(
                        event = "reconnect_scheduled",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }

                    let Some(client) = client.upgrade() else {
                        return;
                    };
                    // A manual connect or disconnect during the delay wins.
                    if !matches!(client.current_state(), ConnectionState::Errored(_)) {
                        continue;
                    }
                    match client.connect() {
                        Ok(session) => info!(event = "reconnect_started", attempt, session = %session),
                        Err(err) => warn!(event = "reconnect_failed", attempt, error = %err),
                    }
                }
                _ => {}
            }
        }
    })
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{with_timeout, ReconnectPolicy};

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: Some(3),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = policy();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = ReconnectPolicy {
            jitter: Duration::from_millis(10),
            ..policy()
        };
        for attempt in 1..20 {
            let delay = policy.delay_for_attempt(attempt);
            let base = ReconnectPolicy {
                jitter: Duration::ZERO,
                ..policy.clone()
            }
            .delay_for_attempt(attempt);
            assert!(delay >= base);
            assert!(delay <= base + Duration::from_millis(10));
        }
    }

    #[test]
    fn exhaustion_respects_max_attempts() {
        let policy = policy();
        assert!(!policy.exhausted(3));
        assert!(policy.exhausted(4));
        let unbounded = ReconnectPolicy {
            max_attempts: None,
            ..policy
        };
        assert!(!unbounded.exhausted(usize::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_elapses() {
        let result = with_timeout(
            Duration::from_millis(50),
            tokio::time::sleep(Duration::from_secs(5)),
        )
        .await;
        assert!(result.is_err());
    }
}
