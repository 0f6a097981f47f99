//! Replay defense for webhook deliveries (spec §4.1 step 3).
//!
//! A SET-NX keyed store with TTL ≈5 minutes. Generalizes the same
//! `Mutex<HashMap<String, Instant>>` shape used by [`crate::cache`] and the
//! teacher's `RateLimiter`, here storing a single timestamp per delivery id
//! instead of a vector, since replay defense only needs "have we seen this
//! key before, within TTL" rather than a count.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct ReplayStore {
    seen: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl ReplayStore {
    pub fn new(ttl: Duration) -> Self {
        ReplayStore {
            seen: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// SET-NX semantics: returns `true` if `key` was newly inserted (not a
    /// replay), `false` if it was already present within TTL (a replay).
    pub fn set_nx(&self, key: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match seen.get(key) {
            Some(at) if now.duration_since(*at) < self.ttl => false,
            _ => {
                seen.insert(key.to_string(), now);
                true
            }
        }
    }

    pub fn sweep_expired(&self) -> usize {
        let cutoff = self.ttl * 2;
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let before = seen.len();
        let now = Instant::now();
        seen.retain(|_, at| now.duration_since(*at) < cutoff);
        before - seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_insert_is_not_a_replay() {
        let store = ReplayStore::new(Duration::from_secs(300));
        assert!(store.set_nx("delivery-1"));
    }

    #[test]
    fn second_insert_within_ttl_is_a_replay() {
        let store = ReplayStore::new(Duration::from_secs(300));
        assert!(store.set_nx("delivery-1"));
        assert!(!store.set_nx("delivery-1"));
    }

    #[test]
    fn insert_after_ttl_is_allowed_again() {
        let store = ReplayStore::new(Duration::from_millis(10));
        assert!(store.set_nx("delivery-1"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(store.set_nx("delivery-1"));
    }
}
