//! Fixed retry ladder for update delivery.
//!
//! Each rung is an offset from the moment a delivery was triggered
//! (`set_payload`, `ready` or `request-update`). All rungs are scheduled
//! up front; an `ack` cancels whatever is still pending. Once the last
//! rung has fired the delivery is abandoned.
use std::time::Duration;

/// Default rungs in milliseconds: tens of ms up to one second.
pub const DEFAULT_LADDER_MS: [u64; 6] = [30, 80, 160, 320, 640, 1000];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryLadder {
    rungs: Vec<Duration>,
}

impl RetryLadder {
    pub fn new(rungs: Vec<Duration>) -> Self {
        Self { rungs }
    }

    pub fn from_millis(rungs: &[u64]) -> Self {
        Self::new(rungs.iter().map(|ms| Duration::from_millis(*ms)).collect())
    }

    /// Offsets of every retry, in firing order.
    pub fn rungs(&self) -> &[Duration] {
        &self.rungs
    }

    /// Number of retries after the immediate send.
    pub fn len(&self) -> usize {
        self.rungs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rungs.is_empty()
    }

    /// Offset of the final retry, after which delivery gives up.
    pub fn horizon(&self) -> Duration {
        self.rungs.last().copied().unwrap_or_default()
    }

    /// Returns true if every rung is strictly later than the previous one.
    pub fn is_increasing(&self) -> bool {
        self.rungs.windows(2).all(|w| w[0] < w[1])
    }
}

impl Default for RetryLadder {
    fn default() -> Self {
        Self::from_millis(&DEFAULT_LADDER_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ladder() {
        let ladder = RetryLadder::default();
        assert_eq!(ladder.len(), 6);
        assert_eq!(ladder.rungs()[0], Duration::from_millis(30));
        assert_eq!(ladder.horizon(), Duration::from_secs(1));
        assert!(ladder.is_increasing());
    }

    #[test]
    fn test_from_millis_keeps_order() {
        let ladder = RetryLadder::from_millis(&[5, 10, 20]);
        assert_eq!(
            ladder.rungs(),
            &[
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(20)
            ]
        );
    }

    #[test]
    fn test_non_increasing_detected() {
        assert!(!RetryLadder::from_millis(&[50, 50, 100]).is_increasing());
        assert!(!RetryLadder::from_millis(&[100, 50]).is_increasing());
    }

    #[test]
    fn test_empty_ladder_has_zero_horizon() {
        let ladder = RetryLadder::new(vec![]);
        assert!(ladder.is_empty());
        assert_eq!(ladder.horizon(), Duration::ZERO);
    }
}
