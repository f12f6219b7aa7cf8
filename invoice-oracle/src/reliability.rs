//! Retry policy for chain reads that may fail transiently

use ethers::providers::ProviderError;
use std::time::Duration;

const MAX_DELAY: Duration = Duration::from_secs(10);

const TRANSIENT_MARKERS: &[&str] = &["network", "timeout", "timed out", "connection", "rate limit", "429"];

/// Delays between attempts: `attempts - 1` of them, doubling up to `MAX_DELAY`
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    retries_left: u32,
}

impl Backoff {
    pub fn new(attempts: u32, initial: Duration) -> Self {
        Self { delay: initial, retries_left: attempts.saturating_sub(1) }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.retries_left == 0 {
            return None;
        }
        self.retries_left -= 1;

        let delay = self.delay;
        self.delay = self.delay.saturating_mul(2).min(MAX_DELAY);
        Some(delay)
    }
}

/// Whether a failed read may succeed if repeated. Reverts never do.
pub fn is_transient(err: &anyhow::Error) -> bool {
    let msg = format!("{:#}", err).to_lowercase();
    if msg.contains("revert") {
        return false;
    }

    err.downcast_ref::<ProviderError>().is_some() || TRANSIENT_MARKERS.iter().any(|m| msg.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let delays: Vec<_> = Backoff::new(6, Duration::from_secs(2)).collect();
        assert_eq!(
            delays,
            [2, 4, 8, 10, 10].map(Duration::from_secs).to_vec()
        );

        assert_eq!(Backoff::new(1, Duration::from_millis(5)).next(), None);
        assert_eq!(Backoff::new(0, Duration::from_millis(5)).next(), None);
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&anyhow!("connection reset by peer")));
        assert!(is_transient(&anyhow!("HTTP 429 Too Many Requests")));
        assert!(is_transient(&anyhow!("request timed out").context("eth_getLogs")));
        assert!(!is_transient(&anyhow!("execution reverted: InsufficientBalance()")));
        assert!(!is_transient(&anyhow!("query returned more than 10000 results")));
    }
}
