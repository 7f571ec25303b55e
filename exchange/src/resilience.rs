use backon::{BackoffBuilder, ExponentialBuilder};
use std::time::Duration;

/// Backoff for REST requests: 250ms → 500ms → 1s → ... capped at 8s, with
/// jitter to avoid thundering herds. Five attempts total (the first try plus
/// four retries); 4xx responses never reach the retry loop.
pub fn rest_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(250))
        .with_max_delay(Duration::from_secs(8))
        .with_jitter()
        .with_max_times(4)
        .build()
}

/// Same curve for websocket reconnects, but unlimited — the stream loop
/// retries until cancelled or fatally rejected.
pub fn reconnect_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(250))
        .with_max_delay(Duration::from_secs(8))
        .with_jitter()
        .without_max_times()
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_backoff_caps_attempts_and_delay() {
        let delays: Vec<Duration> = rest_backoff().collect();
        assert_eq!(delays.len(), 4);
        for delay in &delays {
            // jitter can at most double the base delay
            assert!(*delay <= Duration::from_secs(16));
            assert!(*delay >= Duration::from_millis(250));
        }
    }

    #[test]
    fn reconnect_backoff_keeps_yielding() {
        let mut backoff = reconnect_backoff();
        for _ in 0..64 {
            let delay = backoff.next().expect("reconnect backoff never runs dry");
            assert!(delay <= Duration::from_secs(16));
        }
    }
}
