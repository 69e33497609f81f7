//! Adaptive completion polling for worker invocations.
//!
//! The poll interval starts at `floor`, grows by `factor` after every
//! non-terminal poll and is capped at `ceiling`. Each invocation gets a fresh
//! interval. Waiting can be cut short by the attempt deadline or a
//! [`CancellationToken`]; in both cases the invocation is terminated and its
//! cleanup awaited before the poller returns.

use crate::worker::{DrainStatus, WorkerInvocation, WorkerTerminal};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Interval bounds for the adaptive poller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    pub floor: Duration,
    pub factor: f64,
    pub ceiling: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(5),
            factor: 1.5,
            ceiling: Duration::from_secs(30),
        }
    }
}

impl PollerConfig {
    pub fn new(floor: Duration, factor: f64, ceiling: Duration) -> Self {
        Self {
            floor,
            factor,
            ceiling,
        }
    }
}

/// Growing interval sequence: floor, floor×factor, … capped at ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: PollerConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: PollerConfig) -> Self {
        let current = config.floor.min(config.ceiling);
        Self { config, current }
    }

    /// Return the next interval to wait and advance the sequence.
    pub fn next_interval(&mut self) -> Duration {
        let interval = self.current;
        let factor = if self.config.factor.is_finite() && self.config.factor >= 1.0 {
            self.config.factor
        } else {
            1.0
        };
        let ceiling = self.config.ceiling;
        let grown = (interval.as_secs_f64() * factor).min(ceiling.as_secs_f64());
        self.current = Duration::try_from_secs_f64(grown).unwrap_or(ceiling).min(ceiling);
        interval
    }
}

/// How waiting for an invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The worker produced its terminal event
    Terminal(WorkerTerminal),
    /// The deadline passed; the worker was terminated
    TimedOut { after: Duration },
    /// The run was cancelled; the worker was terminated
    Cancelled,
}

/// Waits for worker invocations to reach a terminal state.
#[derive(Debug, Clone, Default)]
pub struct AdaptivePoller {
    config: PollerConfig,
}

impl AdaptivePoller {
    pub fn new(config: PollerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Poll `invocation` until it is terminal, `timeout` elapses, or `cancel` fires.
    pub async fn await_terminal(
        &self,
        invocation: &mut WorkerInvocation,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        let started = Instant::now();
        // `None` when the deadline is beyond what `Instant` can represent.
        let deadline = started.checked_add(timeout);
        let mut backoff = Backoff::new(self.config);
        let mut polls: u32 = 0;

        loop {
            polls += 1;
            if let DrainStatus::Terminal(terminal) = invocation.drain() {
                tracing::debug!(
                    polls,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "worker reached terminal state"
                );
                return PollOutcome::Terminal(terminal);
            }

            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                tracing::warn!(
                    timeout_secs = timeout.as_secs(),
                    "worker deadline passed, terminating"
                );
                Self::shutdown(invocation).await;
                return PollOutcome::TimedOut { after: timeout };
            }

            let mut wait = backoff.next_interval();
            if let Some(deadline) = deadline {
                wait = wait.min(deadline - now);
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("cancellation requested, terminating worker");
                    Self::shutdown(invocation).await;
                    return PollOutcome::Cancelled;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn shutdown(invocation: &mut WorkerInvocation) {
        if let Err(e) = invocation.terminate().await {
            tracing::warn!(error = %e, "worker termination reported an error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::scripted::{ScriptedAttempt, ScriptedGateway};
    use crate::worker::{WorkerGateway, WorkerRequest};
    use tempfile::tempdir;

    fn fast() -> PollerConfig {
        PollerConfig::new(Duration::from_millis(5), 1.5, Duration::from_millis(20))
    }

    fn request(dir: &std::path::Path) -> WorkerRequest {
        WorkerRequest {
            milestone: "m".into(),
            phase: "p".into(),
            attempt: 1,
            payload: String::new(),
            workdir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(PollerConfig::default());
        let secs: Vec<f64> = (0..7).map(|_| backoff.next_interval().as_secs_f64()).collect();
        assert_eq!(secs[0], 5.0);
        assert_eq!(secs[1], 7.5);
        assert_eq!(secs[2], 11.25);
        assert!((secs[3] - 16.875).abs() < 1e-9);
        assert!((secs[4] - 25.3125).abs() < 1e-9);
        assert_eq!(secs[5], 30.0);
        assert_eq!(secs[6], 30.0);
    }

    #[test]
    fn test_backoff_ignores_shrinking_factor() {
        let mut backoff = Backoff::new(PollerConfig::new(
            Duration::from_secs(2),
            0.5,
            Duration::from_secs(10),
        ));
        assert_eq!(backoff.next_interval(), Duration::from_secs(2));
        assert_eq!(backoff.next_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_huge_factor_stays_at_ceiling() {
        let mut backoff = Backoff::new(PollerConfig::new(
            Duration::from_secs(5),
            1e300,
            Duration::from_secs(30),
        ));
        assert_eq!(backoff.next_interval(), Duration::from_secs(5));
        assert_eq!(backoff.next_interval(), Duration::from_secs(30));
        assert_eq!(backoff.next_interval(), Duration::from_secs(30));

        let mut unbounded = Backoff::new(PollerConfig::new(Duration::from_secs(1), 1e300, Duration::MAX));
        unbounded.next_interval();
        assert_eq!(unbounded.next_interval(), Duration::MAX);
    }

    #[tokio::test]
    async fn test_unrepresentable_deadline_still_polls() {
        let dir = tempdir().unwrap();
        let gateway = ScriptedGateway::new()
            .with_fallback(ScriptedAttempt::succeed().after(Duration::from_millis(15)));
        let mut inv = gateway.start(request(dir.path())).await.unwrap();

        let outcome = AdaptivePoller::new(fast())
            .await_terminal(&mut inv, Duration::from_secs(u64::MAX), &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome,
            PollOutcome::Terminal(WorkerTerminal::Success { .. })
        ));
    }

    #[tokio::test]
    async fn test_returns_terminal_event() {
        let dir = tempdir().unwrap();
        let gateway = ScriptedGateway::new()
            .with_fallback(ScriptedAttempt::succeed().after(Duration::from_millis(15)));
        let mut inv = gateway.start(request(dir.path())).await.unwrap();

        let outcome = AdaptivePoller::new(fast())
            .await_terminal(&mut inv, Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome,
            PollOutcome::Terminal(WorkerTerminal::Success { .. })
        ));
        assert_eq!(gateway.terminations(), 0);
    }

    #[tokio::test]
    async fn test_timeout_terminates_worker() {
        let dir = tempdir().unwrap();
        let gateway = ScriptedGateway::new().with_fallback(ScriptedAttempt::hang());
        let mut inv = gateway.start(request(dir.path())).await.unwrap();

        let outcome = AdaptivePoller::new(fast())
            .await_terminal(
                &mut inv,
                Duration::from_millis(40),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(
            outcome,
            PollOutcome::TimedOut {
                after: Duration::from_millis(40)
            }
        );
        assert_eq!(gateway.terminations(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_terminates_worker() {
        let dir = tempdir().unwrap();
        let gateway = ScriptedGateway::new().with_fallback(ScriptedAttempt::hang());
        let mut inv = gateway.start(request(dir.path())).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            trigger.cancel();
        });

        let outcome = AdaptivePoller::new(fast())
            .await_terminal(&mut inv, Duration::from_secs(30), &cancel)
            .await;
        assert_eq!(outcome, PollOutcome::Cancelled);
        assert_eq!(gateway.terminations(), 1);
    }
}
