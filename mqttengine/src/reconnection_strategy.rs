use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::ReconnectOptions;

/// Mqtt reconnection strategy
pub trait ReconnectionStrategy: Send + Sync {
    /// Callback function invoked after the connection is correcly established
    /// and connack is received
    fn on_connection_established(&mut self) {}

    /// Callback function invoked when a connection error happens and therefore connection is lost,
    /// or when a reconnection attempt fails
    fn on_connection_failed(&mut self) {}

    /// Delay before the next connection attempt
    fn next_delay(&self) -> Duration;
}

/// Truncated exponential backoff reconnection strategy
/// Delay doubles with every failed attempt, plus a random delay of up to `jitter`
/// to avoid synchronizations between clients
#[derive(Debug)]
pub struct TruncatedExponentialBackoff {
    connection_stable_threshold: Duration,
    options: ReconnectOptions,
    connection_established_ts: Option<Instant>,
    attempts: u32,
}

const EXPONENTIAL_BACKOFF_MAX_ATTEMPTS: u32 = 32;

impl TruncatedExponentialBackoff {
    /// New `TruncatedExponentialBackoff`
    ///
    /// * `connection_stable_threshold` - If connection is lost before this duration is elapsed,
    ///    backoff algorithm won't be resetted
    /// * `options` - Minimum and maximum delay, and the jitter on top
    pub fn new(connection_stable_threshold: Duration, options: ReconnectOptions) -> Self {
        Self {
            connection_stable_threshold,
            options,
            connection_established_ts: None,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn is_connection_stable(&self) -> bool {
        self.connection_established_ts
            .filter(|ts| ts.elapsed() > self.connection_stable_threshold)
            .is_some()
    }
}

impl ReconnectionStrategy for TruncatedExponentialBackoff {
    fn on_connection_established(&mut self) {
        self.connection_established_ts = Some(Instant::now());
    }

    fn on_connection_failed(&mut self) {
        if self.is_connection_stable() {
            self.attempts = 0;
        }

        // cap max attempts
        if self.attempts < EXPONENTIAL_BACKOFF_MAX_ATTEMPTS {
            self.attempts += 1;
        }

        self.connection_established_ts = None;
    }

    fn next_delay(&self) -> Duration {
        if self.attempts == 0 {
            return Duration::ZERO;
        }

        let base = self
            .options
            .min_backoff
            .saturating_mul(2_u32.saturating_pow(self.attempts - 1));

        let jitter_ms = self.options.jitter.as_millis() as u64;
        let jitter = match jitter_ms {
            0 => Duration::ZERO,
            _ => Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms)),
        };

        let backoff_delay = std::cmp::min(base.saturating_add(jitter), self.options.max_backoff);
        debug!(
            "reconnection attempt: {} - delay {:?}",
            self.attempts, backoff_delay
        );

        backoff_delay
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn options(jitter: Duration) -> ReconnectOptions {
        ReconnectOptions {
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            jitter,
        }
    }

    #[test]
    fn delays_double_until_capped() {
        let mut strategy =
            TruncatedExponentialBackoff::new(Duration::from_secs(30), options(Duration::ZERO));
        assert_eq!(strategy.next_delay(), Duration::ZERO);

        let mut delays = Vec::new();
        for _ in 0..6 {
            strategy.on_connection_failed();
            delays.push(strategy.next_delay().as_secs());
        }

        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut strategy = TruncatedExponentialBackoff::new(
            Duration::from_secs(30),
            options(Duration::from_millis(500)),
        );

        strategy.on_connection_failed();
        for _ in 0..100 {
            let delay = strategy.next_delay();
            assert!(delay >= Duration::from_secs(1));
            assert!(delay < Duration::from_millis(1500));
        }
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let mut strategy =
            TruncatedExponentialBackoff::new(Duration::from_secs(30), options(Duration::ZERO));
        for _ in 0..100 {
            strategy.on_connection_failed();
        }

        assert_eq!(strategy.attempts(), EXPONENTIAL_BACKOFF_MAX_ATTEMPTS);
        assert_eq!(strategy.next_delay(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn stable_connection_resets_backoff() {
        let mut strategy =
            TruncatedExponentialBackoff::new(Duration::from_secs(30), options(Duration::ZERO));
        strategy.on_connection_failed();
        strategy.on_connection_failed();
        assert_eq!(strategy.next_delay(), Duration::from_secs(2));

        // lost again before it was stable
        strategy.on_connection_established();
        tokio::time::advance(Duration::from_secs(5)).await;
        strategy.on_connection_failed();
        assert_eq!(strategy.next_delay(), Duration::from_secs(4));

        strategy.on_connection_established();
        tokio::time::advance(Duration::from_secs(31)).await;
        strategy.on_connection_failed();
        assert_eq!(strategy.next_delay(), Duration::from_secs(1));
    }
}
