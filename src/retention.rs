//! Background retention sweeps, mirroring the teacher's
//! `spawn_retention_task` shape (own `Connection`, initial delay, fixed
//! interval loop) repurposed from pruning old chat messages to the TTLs
//! spec §6.4 names: webhook logs (30 days), rate-limit/replay in-memory
//! entries (2x window), kill-switch events (7 days workspace / 24h global).

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::TenantRouter;
use crate::rate_limit::RateLimiter;
use crate::replay::ReplayStore;

const RETENTION_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Default)]
pub struct RetentionResult {
    pub webhook_logs_deleted: i64,
    pub killswitch_events_deleted: i64,
    pub tenant_cache_swept: usize,
    pub replay_store_swept: usize,
    pub rate_limiter_swept: usize,
}

pub fn run_retention(
    conn: &Connection,
    tenant_router: &TenantRouter,
    replay_store: &ReplayStore,
    rate_limiter: &RateLimiter,
    webhook_log_retention_days: i64,
) -> RetentionResult {
    let mut result = RetentionResult::default();

    let cutoff = (Utc::now() - ChronoDuration::days(webhook_log_retention_days)).to_rfc3339();
    if let Ok(n) = conn.execute("DELETE FROM webhook_logs WHERE created_at < ?1", params![cutoff]) {
        result.webhook_logs_deleted = n as i64;
    }

    let now = Utc::now().to_rfc3339();
    if let Ok(n) = conn.execute("DELETE FROM killswitch_events WHERE ttl_expires_at < ?1", params![now]) {
        result.killswitch_events_deleted = n as i64;
    }
    conn.execute(
        "UPDATE global_killswitch SET active = 0, reason = NULL, actor = NULL, activated_at = NULL, ttl_expires_at = NULL
         WHERE id = 1 AND active = 1 AND ttl_expires_at IS NOT NULL AND ttl_expires_at < ?1",
        params![now],
    )
    .ok();

    result.tenant_cache_swept = tenant_router.sweep_expired();
    result.replay_store_swept = replay_store.sweep_expired();
    result.rate_limiter_swept = rate_limiter.sweep_expired();

    if result.webhook_logs_deleted > 0 || result.killswitch_events_deleted > 0 {
        tracing::info!(
            webhook_logs_deleted = result.webhook_logs_deleted,
            killswitch_events_deleted = result.killswitch_events_deleted,
            "retention sweep"
        );
    }

    result
}

pub fn spawn_retention_task(
    db_path: String,
    tenant_router: Arc<TenantRouter>,
    replay_store: Arc<ReplayStore>,
    rate_limiter: Arc<RateLimiter>,
    webhook_log_retention_days: i64,
) {
    tokio::spawn(async move {
        let conn = match Connection::open(&db_path) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "retention task: failed to open DB");
                return;
            }
        };
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;").ok();

        tokio::time::sleep(Duration::from_secs(30)).await;

        loop {
            run_retention(&conn, &tenant_router, &replay_store, &rate_limiter, webhook_log_retention_days);
            tokio::time::sleep(Duration::from_secs(RETENTION_INTERVAL_SECS)).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    #[test]
    fn old_webhook_logs_are_pruned() {
        let db = Db::in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        let old = (Utc::now() - ChronoDuration::days(40)).to_rfc3339();
        conn.execute(
            "INSERT INTO webhook_logs (id, event_type, created_at) VALUES ('log1', 'message', ?1)",
            params![old],
        )
        .unwrap();
        let tenant_router = TenantRouter::new(Duration::from_secs(300));
        let replay_store = ReplayStore::new(Duration::from_secs(300));
        let rate_limiter = RateLimiter::new();

        let result = run_retention(&conn, &tenant_router, &replay_store, &rate_limiter, 30);
        assert_eq!(result.webhook_logs_deleted, 1);
    }
}
