// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! In-memory, TTL'd retry counter. Never persisted — bans must lift on
//! restart — so this is a plain keyed counter with expiry, the
//! same shape as the per-pool atomic counters in
//! `storage::chunk_pool::PoolReadCounters` elsewhere in this codebase, generalized from a fixed-size
//! array to a keyed map since events come and go rather than being a fixed
//! set of pools.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Attempts reach this many before an event is permanently banned.
pub const MAX_ATTEMPTS: u32 = 10;

struct Entry {
    attempts: u32,
    expires_at: Instant,
}

/// Keyed, expiring attempt counter used to bound per-event retries and to
/// ban events that fail `MAX_ATTEMPTS` times until the TTL elapses.
pub struct RetryCounter {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl RetryCounter {
    /// `ttl` must be at least the retention window so a banned event can't
    /// come back into scope before its ban naturally expires.
    pub fn new(ttl: Duration) -> Self {
        RetryCounter { ttl, entries: Mutex::new(HashMap::new()) }
    }

    /// Record one more attempt for `event_id`. Returns the new attempt count.
    pub fn increment(&self, event_id: &str) -> u32 {
        let mut entries = self.entries.lock();
        self.sweep_locked(&mut entries);
        let entry = entries.entry(event_id.to_string()).or_insert(Entry {
            attempts: 0,
            expires_at: Instant::now() + self.ttl,
        });
        entry.attempts += 1;
        entry.expires_at = Instant::now() + self.ttl;
        entry.attempts
    }

    /// Current attempt count for `event_id` (0 if never attempted or expired).
    pub fn attempts(&self, event_id: &str) -> u32 {
        let mut entries = self.entries.lock();
        self.sweep_locked(&mut entries);
        entries.get(event_id).map(|e| e.attempts).unwrap_or(0)
    }

    /// Whether `event_id` has reached `MAX_ATTEMPTS` and is currently banned.
    pub fn is_banned(&self, event_id: &str) -> bool {
        self.attempts(event_id) >= MAX_ATTEMPTS
    }

    /// Drop every entry whose TTL has elapsed. Called opportunistically on
    /// every access; also safe to call on a timer from the supervisor.
    pub fn sweep(&self) {
        let mut entries = self.entries.lock();
        self.sweep_locked(&mut entries);
    }

    fn sweep_locked(&self, entries: &mut HashMap<String, Entry>) {
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_and_bans_at_max_attempts() {
        let rc = RetryCounter::new(Duration::from_secs(60));
        for i in 1..MAX_ATTEMPTS {
            assert_eq!(rc.increment("E1"), i);
            assert!(!rc.is_banned("E1"));
        }
        assert_eq!(rc.increment("E1"), MAX_ATTEMPTS);
        assert!(rc.is_banned("E1"));
    }

    #[test]
    fn expired_entries_are_swept() {
        let rc = RetryCounter::new(Duration::from_millis(1));
        rc.increment("E1");
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(rc.attempts("E1"), 0);
        assert_eq!(rc.len(), 0);
    }

    #[test]
    fn independent_events_have_independent_counters() {
        let rc = RetryCounter::new(Duration::from_secs(60));
        rc.increment("E1");
        rc.increment("E1");
        rc.increment("E2");
        assert_eq!(rc.attempts("E1"), 2);
        assert_eq!(rc.attempts("E2"), 1);
    }
}
