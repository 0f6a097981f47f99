//! Tenant router: phone_number_id -> workspace_id lookup cache (spec §4.3).
//!
//! Grounded in the teacher's `PresenceTracker`/`TypingTracker` shape
//! (`Arc<RwLock<HashMap<...>>>` with explicit join/leave/get mutation
//! methods) generalized to a TTL cache with negative-result caching so a
//! storm of webhooks for an unknown phone number doesn't hit the DB for
//! every delivery.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum CacheEntry {
    Hit { workspace_id: String, at: Instant },
    Miss { at: Instant },
}

pub struct TenantRouter {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl TenantRouter {
    pub fn new(ttl: Duration) -> Self {
        TenantRouter {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Returns `Some(Some(workspace_id))` for a cached positive hit,
    /// `Some(None)` for a cached negative (not-found) result still within
    /// TTL, or `None` if the caller must consult the database.
    pub fn get(&self, phone_number_id: &str) -> Option<Option<String>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match entries.get(phone_number_id) {
            Some(CacheEntry::Hit { workspace_id, at }) if at.elapsed() < self.ttl => {
                Some(Some(workspace_id.clone()))
            }
            Some(CacheEntry::Miss { at }) if at.elapsed() < self.ttl => Some(None),
            _ => None,
        }
    }

    pub fn put_hit(&self, phone_number_id: &str, workspace_id: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            phone_number_id.to_string(),
            CacheEntry::Hit {
                workspace_id: workspace_id.to_string(),
                at: Instant::now(),
            },
        );
    }

    pub fn put_miss(&self, phone_number_id: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(phone_number_id.to_string(), CacheEntry::Miss { at: Instant::now() });
    }

    /// Must be called whenever a workspace's phone_number_id is reassigned,
    /// before the new mapping is persisted, so no stale hit can be served
    /// between the write and the next cache miss.
    pub fn invalidate(&self, phone_number_id: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(phone_number_id);
    }

    pub fn clear_phone_cache(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    /// Sweeps entries older than 2x TTL. Called from the retention task.
    pub fn sweep_expired(&self) -> usize {
        let cutoff = self.ttl * 2;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, v| match v {
            CacheEntry::Hit { at, .. } | CacheEntry::Miss { at } => at.elapsed() < cutoff,
        });
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_cache_expires() {
        let router = TenantRouter::new(Duration::from_millis(10));
        router.put_miss("phone-1");
        assert_eq!(router.get("phone-1"), Some(None));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(router.get("phone-1"), None);
    }

    #[test]
    fn invalidate_clears_positive_hit() {
        let router = TenantRouter::new(Duration::from_secs(300));
        router.put_hit("phone-1", "ws-1");
        assert_eq!(router.get("phone-1"), Some(Some("ws-1".to_string())));
        router.invalidate("phone-1");
        assert_eq!(router.get("phone-1"), None);
    }
}
