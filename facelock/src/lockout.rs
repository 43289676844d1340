use std::time::{Duration, Instant};

/// Whether an attempt may be evaluated right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Open,
    Locked { remaining: Duration },
}

/// Converts a stream of match outcomes into an access-control gate with a
/// cooldown after repeated failures. One instance per lock identity; state
/// lives for the session only and is never persisted.
///
/// The clock is passed in explicitly so transitions are testable without
/// sleeping.
#[derive(Debug)]
pub struct LockoutPolicy {
    max_failures: u32,
    lock_duration: Duration,
    consecutive_failures: u32,
    locked_until: Option<Instant>,
}

impl LockoutPolicy {
    pub fn new(max_failures: u32, lock_duration: Duration) -> Self {
        Self {
            max_failures,
            lock_duration,
            consecutive_failures: 0,
            locked_until: None,
        }
    }

    /// Check the gate, unlocking first if the cooldown has elapsed. Must be
    /// called before evaluating an attempt; while locked the attempt is
    /// rejected outright and never reaches the matcher.
    pub fn gate(&mut self, now: Instant) -> Gate {
        if let Some(until) = self.locked_until {
            if now >= until {
                self.locked_until = None;
            } else {
                return Gate::Locked {
                    remaining: until - now,
                };
            }
        }
        Gate::Open
    }

    /// Feed the outcome of an evaluated attempt. Returns `true` if this
    /// outcome tripped the lockout.
    pub fn record(&mut self, matched: bool, now: Instant) -> bool {
        if matched {
            self.consecutive_failures = 0;
            return false;
        }
        self.consecutive_failures += 1;
        log::warn!(
            "recognition failed {}/{}",
            self.consecutive_failures,
            self.max_failures
        );
        if self.consecutive_failures >= self.max_failures {
            self.locked_until = Some(now + self.lock_duration);
            self.consecutive_failures = 0;
            true
        } else {
            false
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> LockoutPolicy {
        LockoutPolicy::new(3, Duration::from_secs(60))
    }

    #[test]
    fn three_failures_lock() {
        let mut p = policy();
        let t0 = Instant::now();
        assert!(!p.record(false, t0));
        assert!(!p.record(false, t0));
        assert!(p.record(false, t0));
        assert!(matches!(p.gate(t0), Gate::Locked { .. }));
        // counter resets on lock entry
        assert_eq!(p.consecutive_failures(), 0);
    }

    #[test]
    fn success_resets_counter() {
        let mut p = policy();
        let t0 = Instant::now();
        p.record(false, t0);
        p.record(false, t0);
        p.record(true, t0);
        assert_eq!(p.consecutive_failures(), 0);
        assert_eq!(p.gate(t0), Gate::Open);
    }

    #[test]
    fn lock_expires_and_attempt_is_evaluated() {
        let mut p = policy();
        let t0 = Instant::now();
        for _ in 0..3 {
            p.record(false, t0);
        }
        let mid = t0 + Duration::from_secs(30);
        assert!(matches!(p.gate(mid), Gate::Locked { remaining } if remaining <= Duration::from_secs(30)));
        let after = t0 + Duration::from_secs(61);
        assert_eq!(p.gate(after), Gate::Open);
        // fresh attempt counts from zero again
        assert!(!p.record(false, after));
        assert_eq!(p.consecutive_failures(), 1);
    }

    #[test]
    fn remaining_time_shrinks() {
        let mut p = policy();
        let t0 = Instant::now();
        for _ in 0..3 {
            p.record(false, t0);
        }
        let Gate::Locked { remaining: r1 } = p.gate(t0 + Duration::from_secs(10)) else {
            panic!("expected locked");
        };
        let Gate::Locked { remaining: r2 } = p.gate(t0 + Duration::from_secs(50)) else {
            panic!("expected locked");
        };
        assert!(r2 < r1);
    }
}
