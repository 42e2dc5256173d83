//! Bounded polling with two ways out: the target becomes ready, or one of the
//! checks sees it die first.
//!
//! A tick walks the checks in order. The first check that does not return
//! [`Tick::Continue`] decides the tick. The wall-clock deadline is checked
//! before every tick, and sleeps never run past it.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_wait: Duration,
    pub interval: Duration,
}

impl PollPolicy {
    pub const fn new(max_wait: Duration, interval: Duration) -> Self {
        Self { max_wait, interval }
    }
}

#[derive(Debug)]
pub enum Tick {
    /// This check passed; evaluate the next one.
    Continue,
    /// Not yet; sleep and try again.
    Pending,
    Ready,
    Failed(OrchestratorError),
}

#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    /// Shown in debug logs.
    fn label(&self) -> &str;

    /// `remaining` is the time left in the loop budget, for callers that need
    /// to clamp their own per-call timeout.
    async fn check(&self, remaining: Duration) -> Tick;
}

/// Run `checks` until one reports ready or failed, or `policy.max_wait` runs
/// out. Timeout becomes [`OrchestratorError::ReadinessTimeout`] named after
/// `name`.
pub async fn poll_until_ready(
    name: &str,
    checks: &[&dyn ReadinessCheck],
    policy: PollPolicy,
) -> Result<()> {
    let started = Instant::now();
    let deadline = started + policy.max_wait;
    let mut ticks: u32 = 0;

    loop {
        let now = Instant::now();
        if now >= deadline {
            debug!(%name, ticks, "readiness budget exhausted");
            return Err(OrchestratorError::ReadinessTimeout {
                name: name.to_string(),
                waited: started.elapsed(),
            });
        }
        ticks += 1;

        let remaining = deadline - now;
        for check in checks {
            match check.check(remaining).await {
                Tick::Continue => continue,
                Tick::Pending => {
                    debug!(%name, check = check.label(), ticks, "not ready yet");
                    break;
                }
                Tick::Ready => {
                    debug!(
                        %name,
                        check = check.label(),
                        ticks,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "ready"
                    );
                    return Ok(());
                }
                Tick::Failed(err) => return Err(err),
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(policy.interval.min(remaining)).await;
    }
}

/// Await a side-channel operation whose failure must not mask the caller's
/// own outcome. Errors are logged at `warn` with `label`.
pub async fn best_effort<T, E, F>(label: &str, fut: F) -> Option<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    match fut.await {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(operation = label, error = %err, "best-effort step failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        label: &'static str,
        calls: AtomicU32,
        outcome: fn(u32) -> Tick,
    }

    impl Scripted {
        fn new(label: &'static str, outcome: fn(u32) -> Tick) -> Self {
            Self {
                label,
                calls: AtomicU32::new(0),
                outcome,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReadinessCheck for Scripted {
        fn label(&self) -> &str {
            self.label
        }

        async fn check(&self, _remaining: Duration) -> Tick {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            (self.outcome)(n)
        }
    }

    fn fast(max_wait_ms: u64) -> PollPolicy {
        PollPolicy::new(
            Duration::from_millis(max_wait_ms),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn ready_after_a_few_pending_ticks() {
        let alive = Scripted::new("alive", |_| Tick::Continue);
        let status = Scripted::new("status", |n| if n < 3 { Tick::Pending } else { Tick::Ready });

        poll_until_ready("agent", &[&alive, &status], fast(2_000))
            .await
            .expect("ready");
        assert_eq!(alive.calls(), 3);
        assert_eq!(status.calls(), 3);
    }

    #[tokio::test]
    async fn failed_check_short_circuits_later_checks() {
        let alive = Scripted::new("alive", |n| {
            if n < 2 {
                Tick::Continue
            } else {
                Tick::Failed(OrchestratorError::CrashedBeforeReady {
                    name: "agent".to_string(),
                    logs: None,
                })
            }
        });
        let status = Scripted::new("status", |_| Tick::Pending);

        let err = poll_until_ready("agent", &[&alive, &status], fast(2_000))
            .await
            .expect_err("crashed");
        assert!(matches!(err, OrchestratorError::CrashedBeforeReady { .. }));
        assert_eq!(status.calls(), 1);
    }

    #[tokio::test]
    async fn times_out_close_to_budget() {
        let never = Scripted::new("never", |_| Tick::Pending);
        let started = Instant::now();
        let err = poll_until_ready(
            "agent",
            &[&never],
            PollPolicy::new(Duration::from_millis(300), Duration::from_millis(200)),
        )
        .await
        .expect_err("never ready");

        let elapsed = started.elapsed();
        assert!(matches!(err, OrchestratorError::ReadinessTimeout { .. }));
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(600), "{elapsed:?}");
        assert_eq!(never.calls(), 2);
    }

    #[tokio::test]
    async fn all_continue_counts_as_pending() {
        let passing = Scripted::new("passing", |_| Tick::Continue);
        let err = poll_until_ready("agent", &[&passing], fast(50))
            .await
            .expect_err("nothing said ready");
        assert!(matches!(err, OrchestratorError::ReadinessTimeout { .. }));
    }

    #[tokio::test]
    async fn best_effort_swallows_errors() {
        let ok = best_effort("ok", async { Ok::<_, String>(7) }).await;
        assert_eq!(ok, Some(7));
        let failed = best_effort("boom", async { Err::<u8, _>("nope".to_string()) }).await;
        assert_eq!(failed, None);
    }
}
