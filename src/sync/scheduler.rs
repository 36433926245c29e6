use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Minimum spacing between outbound portal requests.
const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(1000);

/// Serializes outbound portal calls and enforces a minimum interval
/// between them, measured from the last dispatch.
///
/// Callers await [`throttle`](Self::throttle) immediately before sending.
/// The internal mutex is held across the wait, so concurrent callers are
/// released one at a time in submission order; the portal never sees two
/// requests closer together than the configured interval, regardless of
/// which pipeline stage issued them.
pub struct RequestScheduler {
    min_interval: Duration,
    last_dispatch: Mutex<Option<Instant>>,
}

impl RequestScheduler {
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_MIN_INTERVAL)
    }

    pub fn with_interval(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_dispatch: Mutex::new(None),
        }
    }

    /// Wait until the minimum interval since the last dispatch has
    /// elapsed, then record this dispatch. Called once per attempt, so
    /// retried calls are spaced exactly like first attempts.
    pub async fn throttle(&self) {
        let mut last = self.last_dispatch.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

impl Default for RequestScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn second_call_waits_out_the_interval() {
        let scheduler = RequestScheduler::with_interval(Duration::from_millis(1000));

        let start = Instant::now();
        scheduler.throttle().await;
        assert!(start.elapsed() < Duration::from_millis(10));

        scheduler.throttle().await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_is_measured_from_last_dispatch_not_call_time() {
        let scheduler = RequestScheduler::with_interval(Duration::from_millis(1000));

        scheduler.throttle().await;
        tokio::time::sleep(Duration::from_millis(700)).await;

        let before = Instant::now();
        scheduler.throttle().await;
        // Only the remaining 300ms of the window should be slept.
        let waited = before.elapsed();
        assert!(waited >= Duration::from_millis(300));
        assert!(waited < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_interval_means_no_wait() {
        let scheduler = RequestScheduler::with_interval(Duration::from_millis(100));

        scheduler.throttle().await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let before = Instant::now();
        scheduler.throttle().await;
        assert!(before.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_callers_are_spaced_one_interval_apart() {
        use std::sync::Arc;

        let scheduler = Arc::new(RequestScheduler::with_interval(Duration::from_millis(1000)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let s = Arc::clone(&scheduler);
            handles.push(tokio::spawn(async move {
                s.throttle().await;
                start.elapsed()
            }));
        }

        let mut times: Vec<Duration> = Vec::new();
        for h in handles {
            times.push(h.await.unwrap());
        }
        times.sort();

        assert!(times[0] < Duration::from_millis(10));
        assert!(times[1] >= Duration::from_millis(1000));
        assert!(times[2] >= Duration::from_millis(2000));
    }
}
