use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Result of a single rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Messages the sender may still send inside the current window.
    pub remaining: usize,
}

/// Per-sender sliding-window limiter.
///
/// Each sender gets a list of accepted timestamps; a check evicts entries
/// older than the window and denies once `max_messages` remain. State is
/// process-local.
pub struct RateLimiter {
    max_messages: usize,
    window: Duration,
    buckets: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_messages: usize, window: Duration) -> Self {
        Self {
            max_messages,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, sender: &str) -> RateDecision {
        self.check_at(sender, Instant::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock.
    pub fn check_at(&self, sender: &str, now: Instant) -> RateDecision {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let timestamps = buckets.entry(sender.to_string()).or_default();

        if let Some(cutoff) = now.checked_sub(self.window) {
            timestamps.retain(|t| *t > cutoff);
        }

        if timestamps.len() >= self.max_messages {
            return RateDecision {
                allowed: false,
                remaining: 0,
            };
        }

        timestamps.push(now);
        RateDecision {
            allowed: true,
            remaining: self.max_messages - timestamps.len(),
        }
    }

    /// Drops empty or fully expired buckets.
    pub fn prune(&self) {
        self.prune_at(Instant::now());
    }

    fn prune_at(&self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.retain(|_, timestamps| {
            timestamps.retain(|t| *t > cutoff);
            !timestamps.is_empty()
        });
    }

    #[cfg(test)]
    fn tracked_senders(&self) -> usize {
        self.buckets.lock().map(|b| b.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_then_denies() {
        let rl = RateLimiter::new(3, Duration::from_secs(60));
        let t0 = Instant::now();
        let remaining: Vec<usize> = (0..3)
            .map(|i| {
                let d = rl.check_at("5511999", t0 + Duration::from_secs(i));
                assert!(d.allowed);
                d.remaining
            })
            .collect();
        assert_eq!(remaining, vec![2, 1, 0]);

        let denied = rl.check_at("5511999", t0 + Duration::from_secs(3));
        assert_eq!(
            denied,
            RateDecision {
                allowed: false,
                remaining: 0
            }
        );
    }

    #[test]
    fn recovers_after_window() {
        let window = Duration::from_secs(60);
        let rl = RateLimiter::new(2, window);
        let t0 = Instant::now();
        assert!(rl.check_at("a", t0).allowed);
        assert!(rl.check_at("a", t0).allowed);
        assert!(!rl.check_at("a", t0 + Duration::from_secs(30)).allowed);
        assert!(rl.check_at("a", t0 + window + Duration::from_millis(1)).allowed);
    }

    #[test]
    fn denied_checks_do_not_extend_the_window() {
        let window = Duration::from_secs(10);
        let rl = RateLimiter::new(1, window);
        let t0 = Instant::now();
        assert!(rl.check_at("a", t0).allowed);
        for s in 1..10 {
            assert!(!rl.check_at("a", t0 + Duration::from_secs(s)).allowed);
        }
        assert!(rl.check_at("a", t0 + Duration::from_secs(11)).allowed);
    }

    #[test]
    fn senders_are_independent() {
        let rl = RateLimiter::new(1, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(rl.check_at("a", t0).allowed);
        assert!(!rl.check_at("a", t0).allowed);
        assert!(rl.check_at("b", t0).allowed);
    }

    #[test]
    fn prune_drops_expired_buckets() {
        let window = Duration::from_secs(5);
        let rl = RateLimiter::new(5, window);
        let t0 = Instant::now();
        rl.check_at("a", t0);
        rl.check_at("b", t0 + Duration::from_secs(4));
        rl.prune_at(t0 + Duration::from_secs(6));
        assert_eq!(rl.tracked_senders(), 1);
    }
}
