//! Graceful Shutdown
//!
//! Handlers are registered in the order they should run. After a signal
//! they run one by one against a single shared deadline; a handler that
//! fails or overruns is logged and the remaining handlers still run. Once
//! the deadline has passed, each remaining handler still gets a short
//! grace period.

use futures_util::future::BoxFuture;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Budget for a step that starts after the shared deadline
pub const DEFAULT_GRACE: Duration = Duration::from_secs(1);

type Handler = Box<dyn FnOnce(Duration) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Outcome of one shutdown step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Failed(String),
    TimedOut,
}

/// Ordered shutdown steps with a shared deadline
pub struct GracefulShutdown {
    timeout: Duration,
    grace: Duration,
    handlers: Vec<(String, Handler)>,
}

impl GracefulShutdown {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            grace: DEFAULT_GRACE,
            handlers: Vec::new(),
        }
    }

    /// Budget given to steps that start after the deadline
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Register a step. It receives the time left before the deadline.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: FnOnce(Duration) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers
            .push((name.into(), Box::new(move |left| Box::pin(handler(left)))));
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every step in registration order
    pub async fn run(self) -> Vec<(String, StepOutcome)> {
        let deadline = Instant::now() + self.timeout;
        let mut outcomes = Vec::with_capacity(self.handlers.len());

        for (name, handler) in self.handlers {
            let mut left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                tracing::warn!(step = %name, grace = ?self.grace, "Shutdown deadline passed, running step with grace period");
                left = self.grace;
            }

            let outcome = match tokio::time::timeout(left, handler(left)).await {
                Ok(Ok(())) => {
                    tracing::info!(step = %name, "Shutdown step completed");
                    StepOutcome::Completed
                }
                Ok(Err(e)) => {
                    tracing::error!(step = %name, error = %format!("{:#}", e), "Shutdown step failed");
                    StepOutcome::Failed(e.to_string())
                }
                Err(_) => {
                    tracing::error!(step = %name, "Shutdown step timed out");
                    StepOutcome::TimedOut
                }
            };
            outcomes.push((name, outcome));
        }

        outcomes
    }
}

/// Wait for SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[tokio::test(start_paused = true)]
    async fn test_steps_run_in_order_despite_failures() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut shutdown = GracefulShutdown::new(Duration::from_secs(10));

        for name in ["consumers", "websocket", "broker"] {
            let order = Arc::clone(&order);
            shutdown.register(name, move |_| async move {
                order.lock().unwrap().push(name);
                if name == "websocket" {
                    anyhow::bail!("sessions still open");
                }
                Ok(())
            });
        }
        assert_eq!(shutdown.len(), 3);

        let outcomes = shutdown.run().await;
        assert_eq!(*order.lock().unwrap(), vec!["consumers", "websocket", "broker"]);
        assert_eq!(outcomes[0].1, StepOutcome::Completed);
        assert_eq!(outcomes[1].1, StepOutcome::Failed("sessions still open".into()));
        assert_eq!(outcomes[2].1, StepOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_steps_after_overrun_still_run() {
        let broker_closed = Arc::new(AtomicBool::new(false));
        let mut shutdown = GracefulShutdown::new(Duration::from_secs(1));
        shutdown.register("websocket", |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        let closed = Arc::clone(&broker_closed);
        shutdown.register("broker", move |left| async move {
            assert_eq!(left, DEFAULT_GRACE);
            closed.store(true, Ordering::SeqCst);
            Ok(())
        });

        let outcomes = shutdown.run().await;
        assert_eq!(outcomes[0], ("websocket".to_string(), StepOutcome::TimedOut));
        assert_eq!(outcomes[1], ("broker".to_string(), StepOutcome::Completed));
        assert!(broker_closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_steps_are_bounded_by_grace() {
        let mut shutdown =
            GracefulShutdown::new(Duration::from_secs(5)).with_grace(Duration::from_millis(200));
        shutdown.register("slow", |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        shutdown.register("also_slow", |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        let started = Instant::now();
        let outcomes = shutdown.run().await;
        assert_eq!(outcomes[0].1, StepOutcome::TimedOut);
        assert_eq!(outcomes[1].1, StepOutcome::TimedOut);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(5200));
        assert!(elapsed < Duration::from_millis(5300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_steps_see_remaining_time() {
        let seen = Arc::new(Mutex::new(None));
        let mut shutdown = GracefulShutdown::new(Duration::from_secs(10));
        shutdown.register("first", |_| async {
            tokio::time::sleep(Duration::from_secs(4)).await;
            Ok(())
        });
        let seen_by_second = Arc::clone(&seen);
        shutdown.register("second", move |left| async move {
            *seen_by_second.lock().unwrap() = Some(left);
            Ok(())
        });

        shutdown.run().await;
        let left = seen.lock().unwrap().unwrap();
        assert!(left <= Duration::from_secs(6));
        assert!(left > Duration::from_secs(5));
    }
}
