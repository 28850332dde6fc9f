//! Repeated-attempt throttling
//!
//! Tracks failed authentication attempts per peer over a sliding window.
//! While a peer is throttled, new pairing attempts with it are refused with
//! the Repeated Attempts reason.

use crate::gap::Address;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct AttemptThrottle {
    max_failures: u32,
    window: Duration,
    failures: HashMap<Address, VecDeque<Instant>>,
    /// Last time stale peers were swept out of `failures`
    last_sweep: Option<Instant>,
}

impl AttemptThrottle {
    pub fn new(max_failures: u32, window: Duration) -> Self {
        Self {
            max_failures,
            window,
            failures: HashMap::new(),
            last_sweep: None,
        }
    }

    /// Drop peers whose failures have all left the window, at most once per window
    fn maybe_sweep(&mut self, now: Instant) {
        let last = *self.last_sweep.get_or_insert(now);
        if now.saturating_duration_since(last) < self.window {
            return;
        }
        let window = self.window;
        self.failures.retain(|_, times| {
            times
                .back()
                .map_or(false, |&newest| now.saturating_duration_since(newest) < window)
        });
        self.last_sweep = Some(now);
    }

    fn prune(&mut self, peer: &Address, now: Instant) {
        let window = self.window;
        if let Some(times) = self.failures.get_mut(peer) {
            while let Some(&oldest) = times.front() {
                if now.saturating_duration_since(oldest) >= window {
                    times.pop_front();
                } else {
                    break;
                }
            }
            if times.is_empty() {
                self.failures.remove(peer);
            }
        }
    }

    /// Whether the peer has used up its attempts inside the window
    pub fn is_blocked(&mut self, peer: &Address, now: Instant) -> bool {
        self.maybe_sweep(now);
        self.prune(peer, now);
        self.failures
            .get(peer)
            .map_or(false, |times| times.len() as u32 >= self.max_failures)
    }

    /// Record a failed authentication attempt
    pub fn record_failure(&mut self, peer: Address, now: Instant) {
        self.maybe_sweep(now);
        self.prune(&peer, now);
        self.failures.entry(peer).or_default().push_back(now);
    }

    /// Forget the failures of a peer after a successful pairing
    pub fn clear(&mut self, peer: &Address) {
        self.failures.remove(peer);
    }

    /// Change limits; recorded failures are kept
    pub fn reconfigure(&mut self, max_failures: u32, window: Duration) {
        self.max_failures = max_failures;
        self.window = window;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_after_limit_and_expires() {
        let peer = Address::public([1, 2, 3, 4, 5, 6]);
        let other = Address::public([6, 5, 4, 3, 2, 1]);
        let mut throttle = AttemptThrottle::new(2, Duration::from_secs(60));
        let start = Instant::now();

        assert!(!throttle.is_blocked(&peer, start));
        throttle.record_failure(peer, start);
        assert!(!throttle.is_blocked(&peer, start));
        throttle.record_failure(peer, start + Duration::from_secs(10));
        assert!(throttle.is_blocked(&peer, start + Duration::from_secs(11)));
        assert!(!throttle.is_blocked(&other, start + Duration::from_secs(11)));

        // the first failure leaves the window
        assert!(!throttle.is_blocked(&peer, start + Duration::from_secs(60)));
    }

    #[test]
    fn test_stale_peers_are_swept() {
        let mut throttle = AttemptThrottle::new(3, Duration::from_secs(60));
        let start = Instant::now();
        for last in 0..10u8 {
            throttle.record_failure(Address::public([1, 0, 0, 0, 0, last]), start);
        }
        assert_eq!(throttle.failures.len(), 10);

        // one-off peers are never queried again
        let later = start + Duration::from_secs(61);
        let peer = Address::public([2, 0, 0, 0, 0, 0]);
        throttle.record_failure(peer, later);
        assert_eq!(throttle.failures.len(), 1);
        assert!(throttle.failures.contains_key(&peer));
    }

    #[test]
    fn test_clear() {
        let peer = Address::public([1, 2, 3, 4, 5, 6]);
        let mut throttle = AttemptThrottle::new(1, Duration::from_secs(60));
        let now = Instant::now();
        throttle.record_failure(peer, now);
        assert!(throttle.is_blocked(&peer, now));
        throttle.clear(&peer);
        assert!(!throttle.is_blocked(&peer, now));
    }
}
