//! Reconnection with exponential backoff
//!
//! [`Reconnector`] owns the two flags that govern recovery of a broker
//! connection: the closed flag (set once by `close`) and the
//! reconnect-in-progress flag (at most one recovery loop at a time).
//!
//! Delays grow as `base_delay * 2^(attempt - 1)`, capped at `max_delay`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::error::BrokerError;

/// Backoff parameters for reconnection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Attempts before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// How a reconnection run ended
#[derive(Debug)]
pub enum ReconnectOutcome<T> {
    /// A new link was opened. The caller must recheck the closed flag
    /// before installing it.
    Connected(T),
    /// Another run was already in progress; this one did nothing
    AlreadyInProgress,
    /// The owner was closed before or during the run
    Closed,
    /// Every attempt failed
    Exhausted,
}

/// Single-flight reconnection loop guarded by a closed flag
#[derive(Debug)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    closed: CancellationToken,
    close_requested: AtomicBool,
    in_progress: AtomicBool,
}

struct InProgressGuard<'a>(&'a AtomicBool);

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            closed: CancellationToken::new(),
            close_requested: AtomicBool::new(false),
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Mark the owner closed. Returns true only for the first call.
    pub fn close(&self) -> bool {
        let first = !self.close_requested.swap(true, Ordering::AcqRel);
        self.closed.cancel();
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the owner is closed
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Run the reconnection loop, calling `connect(attempt)` until it
    /// succeeds, the owner is closed, or the attempts run out.
    ///
    /// Returns immediately with [`ReconnectOutcome::AlreadyInProgress`] if
    /// another run holds the in-progress flag.
    pub async fn run<T, F, Fut>(&self, mut connect: F) -> ReconnectOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Reconnection already in progress");
            return ReconnectOutcome::AlreadyInProgress;
        }
        let _guard = InProgressGuard(&self.in_progress);

        let max_attempts = self.policy.max_attempts;
        for attempt in 1..=max_attempts {
            if self.is_closed() {
                return ReconnectOutcome::Closed;
            }

            tracing::info!(attempt, max = max_attempts, "Attempting to reconnect to broker");

            match connect(attempt).await {
                Ok(link) => return ReconnectOutcome::Connected(link),
                Err(e) => {
                    if attempt == max_attempts {
                        tracing::warn!(attempt, error = %e, "Reconnection attempt failed");
                        break;
                    }

                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Reconnection failed, retrying"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.closed.cancelled() => return ReconnectOutcome::Closed,
                    }
                }
            }
        }

        tracing::error!(
            attempts = max_attempts,
            "Failed to reconnect to broker after maximum retries"
        );
        ReconnectOutcome::Exhausted
    }
}
