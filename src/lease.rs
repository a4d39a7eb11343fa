// ABOUTME: Lease coordinator over a distributed lock service
// ABOUTME: Bounded exponential-backoff acquisition, refresh and best-effort release

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, StateError};

/// Distributed lock primitives. Implementations must make a successful
/// `try_obtain` visible to every other caller immediately.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Take `key` for `token` if no live holder exists.
    async fn try_obtain(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Extend the lock if `token` still holds it.
    async fn refresh(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Drop the lock if `token` still holds it.
    async fn release(&self, key: &str, token: &str) -> Result<bool>;
}

/// Exponential backoff bounded by a total wait budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStrategy {
    initial: Duration,
    max_delay: Duration,
    max_wait: Duration,
}

impl RetryStrategy {
    /// Delays start at `initial`, double per attempt and are capped at `max_delay`.
    /// The wait budget defaults to `max_delay`.
    pub fn exponential(initial: Duration, max_delay: Duration) -> Self {
        Self {
            initial,
            max_delay: max_delay.max(initial),
            max_wait: max_delay,
        }
    }

    /// A single attempt.
    pub fn no_retry() -> Self {
        Self {
            initial: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_wait: Duration::ZERO,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay)
    }
}

/// Hands out exclusive, time-bounded leases.
#[derive(Clone)]
pub struct LeaseCoordinator {
    locks: Arc<dyn LockService>,
}

impl LeaseCoordinator {
    pub fn new(locks: Arc<dyn LockService>) -> Self {
        Self { locks }
    }

    /// Acquire `key`, retrying with backoff until the strategy's budget runs out.
    ///
    /// Returns [`StateError::NotObtained`] on contention and
    /// [`StateError::Canceled`] if `cancel` fires while waiting.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
        key: &str,
        ttl: Duration,
        retry: &RetryStrategy,
    ) -> Result<Lease> {
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut delay = retry.initial;
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(StateError::Canceled);
            }
            attempts += 1;
            if self.locks.try_obtain(key, &token, ttl).await? {
                tracing::debug!(key, attempts, "lease acquired");
                return Ok(Lease {
                    key: key.to_string(),
                    token,
                    locks: Arc::clone(&self.locks),
                    released: false,
                });
            }

            if delay.is_zero() || started.elapsed() + delay > retry.max_wait {
                tracing::debug!(key, attempts, "lease not obtained within retry budget");
                return Err(StateError::NotObtained {
                    key: key.to_string(),
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(StateError::Canceled),
                _ = sleep(delay) => {}
            }
            delay = retry.next_delay(delay);
        }
    }
}

/// An acquired lease. Dropping it without [`Lease::release`] schedules a
/// background release on the current runtime.
pub struct Lease {
    key: String,
    token: String,
    locks: Arc<dyn LockService>,
    released: bool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Extend the lease to `ttl` from now.
    pub async fn refresh(&self, cancel: &CancellationToken, ttl: Duration) -> Result<()> {
        if self.released {
            return Err(StateError::LeaseExpired {
                key: self.key.clone(),
            });
        }
        let refreshed = tokio::select! {
            _ = cancel.cancelled() => return Err(StateError::Canceled),
            refreshed = self.locks.refresh(&self.key, &self.token, ttl) => refreshed?,
        };
        if refreshed {
            Ok(())
        } else {
            Err(StateError::LeaseExpired {
                key: self.key.clone(),
            })
        }
    }

    /// Idempotent; failures are logged because the ttl reclaims the lock anyway.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match self.locks.release(&self.key, &self.token).await {
            Ok(true) => tracing::debug!(key = %self.key, "lease released"),
            Ok(false) => tracing::debug!(key = %self.key, "lease already expired at release"),
            Err(e) => tracing::warn!(key = %self.key, "failed to release lease: {}", e),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let locks = Arc::clone(&self.locks);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        runtime.spawn(async move {
            if let Err(e) = locks.release(&key, &token).await {
                tracing::warn!(key = %key, "failed to release dropped lease: {}", e);
            }
        });
    }
}
