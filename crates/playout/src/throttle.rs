//! Time-window log rate limiting for hot paths.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Lets one log line per key through per window and counts the rest.
#[derive(Debug)]
pub struct LogThrottle<K> {
    window: Duration,
    slots: HashMap<K, Slot>,
}

#[derive(Debug)]
struct Slot {
    last_emit: Instant,
    suppressed: u64,
}

impl<K: Eq + Hash> LogThrottle<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            slots: HashMap::new(),
        }
    }

    /// `Some(n)` when the caller should log now, `n` being how many
    /// occurrences were swallowed since the last emitted line.
    pub fn check(&mut self, key: K) -> Option<u64> {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&mut self, key: K, now: Instant) -> Option<u64> {
        match self.slots.get_mut(&key) {
            Some(slot) if now.saturating_duration_since(slot.last_emit) < self.window => {
                slot.suppressed += 1;
                None
            }
            Some(slot) => {
                let suppressed = std::mem::take(&mut slot.suppressed);
                slot.last_emit = now;
                Some(suppressed)
            }
            None => {
                self.slots.insert(
                    key,
                    Slot {
                        last_emit: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}
