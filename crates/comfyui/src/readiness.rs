//! Bounded readiness polling for freshly opened sessions.
//!
//! The transport's "open" signal can be missed if checked once, so
//! callers that need an open socket poll the session state at a fixed
//! interval until it opens, fails, or the wait budget runs out. There is
//! no retry here: a failed or expired wait is reported to the caller.

use std::time::Duration;

use tokio::time::Instant;

use crate::session::SessionState;

/// Tunable parameters for the readiness wait.
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// Total time a caller may wait for a session to open.
    pub wait_budget: Duration,
    /// Delay between state checks.
    pub poll_interval: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            wait_budget: Duration::from_secs(15),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Outcome of [`wait_until_open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Open,
    /// The session reached a state it cannot open from.
    Failed(SessionState),
    TimedOut,
}

/// Poll `probe` until it reports [`SessionState::Open`], a terminal
/// state, or the wait budget elapses.
pub async fn wait_until_open<F>(probe: F, config: &ReadinessConfig) -> Readiness
where
    F: Fn() -> SessionState,
{
    let deadline = Instant::now() + config.wait_budget;

    loop {
        match probe() {
            SessionState::Open => return Readiness::Open,
            state @ (SessionState::Errored | SessionState::Closed) => {
                return Readiness::Failed(state)
            }
            SessionState::Idle | SessionState::Connecting => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return Readiness::TimedOut;
        }
        tokio::time::sleep(config.poll_interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;

    use super::*;

    fn state_cell(initial: SessionState) -> Arc<AtomicU8> {
        Arc::new(AtomicU8::new(initial as u8))
    }

    fn read(cell: &AtomicU8) -> SessionState {
        match cell.load(Ordering::SeqCst) {
            x if x == SessionState::Open as u8 => SessionState::Open,
            x if x == SessionState::Errored as u8 => SessionState::Errored,
            x if x == SessionState::Closed as u8 => SessionState::Closed,
            _ => SessionState::Connecting,
        }
    }

    #[test]
    fn default_budget_and_interval() {
        let config = ReadinessConfig::default();
        assert_eq!(config.wait_budget, Duration::from_secs(15));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn already_open_returns_immediately() {
        let start = Instant::now();
        let result = wait_until_open(|| SessionState::Open, &ReadinessConfig::default()).await;
        assert_eq!(result, Readiness::Open);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn open_detected_on_next_poll() {
        let cell = state_cell(SessionState::Connecting);
        let flip = Arc::clone(&cell);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            flip.store(SessionState::Open as u8, Ordering::SeqCst);
        });

        let start = Instant::now();
        let result = wait_until_open(|| read(&cell), &ReadinessConfig::default()).await;
        assert_eq!(result, Readiness::Open);
        assert!(start.elapsed() >= Duration::from_millis(350));
        assert!(start.elapsed() <= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn never_opening_times_out_at_budget() {
        let start = Instant::now();
        let result =
            wait_until_open(|| SessionState::Connecting, &ReadinessConfig::default()).await;
        assert_eq!(result, Readiness::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn errored_session_fails_fast() {
        let result = wait_until_open(|| SessionState::Errored, &ReadinessConfig::default()).await;
        assert_eq!(result, Readiness::Failed(SessionState::Errored));
    }

    #[tokio::test(start_paused = true)]
    async fn custom_budget_is_respected() {
        let config = ReadinessConfig {
            wait_budget: Duration::from_millis(250),
            ..Default::default()
        };
        let start = Instant::now();
        assert_eq!(
            wait_until_open(|| SessionState::Connecting, &config).await,
            Readiness::TimedOut
        );
        assert_eq!(start.elapsed(), Duration::from_millis(250));
    }
}
