//! Per-source-address admission scheduling
//!
//! Each address carries the earliest instant at which its next session may
//! start. A connection arriving before that instant waits out the difference
//! and pushes the schedule one interval further, so bursts from one address
//! are serialized to one session start per interval. There is no burst
//! allowance.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Sweep the store once this many intervals have passed since the last sweep
const SWEEP_EVERY_INTERVALS: u32 = 4;

pub struct RateLimiter {
    interval: Option<Duration>,
    state: Mutex<Schedule>,
}

struct Schedule {
    next_allowed: HashMap<String, Instant>,
    last_sweep: Instant,
}

impl RateLimiter {
    /// `None` disables limiting entirely
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval: interval.filter(|d| !d.is_zero()),
            state: Mutex::new(Schedule {
                next_allowed: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    /// Reserve the next start slot for `addr` and return how long the caller
    /// must wait before proceeding.
    pub fn admit(&self, addr: &str) -> Duration {
        self.admit_at(addr, Instant::now())
    }

    pub fn admit_at(&self, addr: &str, now: Instant) -> Duration {
        let Some(interval) = self.interval else {
            return Duration::ZERO;
        };

        let mut state = self.state.lock();
        state.sweep(now, interval);

        let scheduled = state.next_allowed.get(addr).copied().unwrap_or(now);
        let (wait, next) = if scheduled > now {
            (scheduled - now, scheduled + interval)
        } else {
            (Duration::ZERO, now + interval)
        };
        state.next_allowed.insert(addr.to_string(), next);
        wait
    }

    /// Number of addresses currently holding a schedule entry
    pub fn tracked(&self) -> usize {
        self.state.lock().next_allowed.len()
    }
}

impl Schedule {
    // An entry whose slot is already in the past admits exactly like an
    // absent one, so dropping it never changes a decision.
    fn sweep(&mut self, now: Instant, interval: Duration) {
        if now.saturating_duration_since(self.last_sweep) < interval * SWEEP_EVERY_INTERVALS {
            return;
        }
        self.next_allowed.retain(|_, next| *next > now);
        self.last_sweep = now;
    }
}
