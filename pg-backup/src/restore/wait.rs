//! Bounded polling.

use std::future::Future;
use std::time::Duration;

use tokio::time::{interval_at, timeout_at, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
}

/// Check `ready` every `period` until it returns true or `timeout` elapses.
///
/// The first check happens one period after the call. Nothing outlives the returned
/// future: the ticker and the deadline are both dropped on either outcome.
pub async fn poll_until<F, Fut>(period: Duration, timeout: Duration, mut ready: F) -> WaitOutcome
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = bool> + Send,
{
    let start = Instant::now();
    let mut ticker = interval_at(start + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let poll = async {
        loop {
            ticker.tick().await;
            if ready().await {
                return;
            }
        }
    };

    match timeout_at(start + timeout, poll).await {
        Ok(()) => WaitOutcome::Ready,
        Err(_) => WaitOutcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_third_check() {
        let start = Instant::now();
        let mut checks = 0;
        let outcome = poll_until(Duration::from_secs(30), Duration::from_secs(3600), || {
            checks += 1;
            let done = checks == 3;
            async move { done }
        })
        .await;

        assert_eq!(outcome, WaitOutcome::Ready);
        assert_eq!(checks, 3);
        assert_eq!(start.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_at_deadline() {
        let start = Instant::now();
        let mut checks = 0;
        let outcome = poll_until(Duration::from_secs(30), Duration::from_secs(3600), || {
            checks += 1;
            async { false }
        })
        .await;

        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_secs(3600));
        assert!(checks >= 119 && checks <= 120, "checks = {checks}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_check_before_first_period() {
        let mut checks = 0;
        let outcome = poll_until(Duration::from_secs(30), Duration::from_secs(10), || {
            checks += 1;
            async { true }
        })
        .await;

        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(checks, 0);
    }
}
