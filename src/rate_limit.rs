//! Per-workspace rate limiter (spec §4.8).
//!
//! Generalizes the teacher's `RateLimiter` (`Mutex<HashMap<String,
//! Vec<Instant>>>` sliding window keyed by `"action:ip"`) to four limit
//! kinds keyed by `(workspace, limit_kind)`, with burst/API-minute limits
//! using the same sliding-window approach and daily/monthly limits checked
//! against materialized workspace counters instead of timestamp vectors.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::models::PlanTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    Burst,
    Daily,
    Monthly,
    TemplateSubmissionsDaily,
    ApiPerMinute,
}

impl LimitKind {
    fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Burst => "burst",
            LimitKind::Daily => "daily",
            LimitKind::Monthly => "monthly",
            LimitKind::TemplateSubmissionsDaily => "template_submissions_daily",
            LimitKind::ApiPerMinute => "api_per_minute",
        }
    }
}

/// Plan-tier defaults from spec §4.8's table. Index order:
/// free, basic, premium, enterprise.
pub struct PlanDefaults {
    pub burst_per_sec: u64,
    pub messages_per_day: u64,
    pub messages_per_month: u64,
    pub template_submissions_per_day: u64,
    pub api_requests_per_minute: u64,
}

pub fn plan_defaults(tier: PlanTier) -> PlanDefaults {
    match tier {
        PlanTier::Free => PlanDefaults {
            burst_per_sec: 1,
            messages_per_day: 100,
            messages_per_month: 1_000,
            template_submissions_per_day: 3,
            api_requests_per_minute: 100,
        },
        PlanTier::Basic => PlanDefaults {
            burst_per_sec: 10,
            messages_per_day: 1_000,
            messages_per_month: 25_000,
            template_submissions_per_day: 10,
            api_requests_per_minute: 500,
        },
        PlanTier::Premium => PlanDefaults {
            burst_per_sec: 50,
            messages_per_day: 10_000,
            messages_per_month: 250_000,
            template_submissions_per_day: 50,
            api_requests_per_minute: 2_000,
        },
        PlanTier::Enterprise => PlanDefaults {
            burst_per_sec: 200,
            messages_per_day: 100_000,
            messages_per_month: 2_500_000,
            template_submissions_per_day: 200,
            api_requests_per_minute: 10_000,
        },
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub retry_after_secs: i64,
}

/// Sliding-window store for the two rolling limit kinds (burst, API/minute).
/// Daily/monthly limits are checked against workspace counter columns by the
/// caller (the caller has the `Db` connection; this struct only holds the
/// in-memory windows).
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter {
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn window_key(workspace_id: &str, kind: LimitKind) -> String {
        format!("{workspace_id}:{}", kind.as_str())
    }

    /// Checks and records a hit against a rolling window (burst = 1s,
    /// api-per-minute = 60s). Not used for daily/monthly limits.
    pub fn check_rolling(
        &self,
        workspace_id: &str,
        kind: LimitKind,
        max: u64,
        window: Duration,
    ) -> RateLimitInfo {
        let key = Self::window_key(workspace_id, kind);
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let entries = windows.entry(key).or_default();
        entries.retain(|t| now.duration_since(*t) < window);

        if entries.len() as u64 >= max {
            let oldest = entries.iter().min().copied().unwrap_or(now);
            let elapsed = now.duration_since(oldest);
            let retry_after = if elapsed < window {
                (window - elapsed).as_secs() as i64 + 1
            } else {
                1
            };
            return RateLimitInfo {
                allowed: false,
                limit: max,
                remaining: 0,
                retry_after_secs: retry_after,
            };
        }

        entries.push(now);
        RateLimitInfo {
            allowed: true,
            limit: max,
            remaining: max - entries.len() as u64,
            retry_after_secs: 0,
        }
    }

    /// Sweeps window entries older than 2x their window. Burst uses a 1s
    /// window and API/minute a 60s window, so a single generous cutoff
    /// covers both the way spec §4.8 describes ("counter entries older than
    /// twice the window are swept periodically").
    pub fn sweep_expired(&self) -> usize {
        let cutoff = Duration::from_secs(120);
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for entries in windows.values_mut() {
            let before = entries.len();
            let now = Instant::now();
            entries.retain(|t| now.duration_since(*t) < cutoff);
            removed += before - entries.len();
        }
        windows.retain(|_, v| !v.is_empty());
        removed
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Seconds until the next UTC midnight, for `DAILY_LIMIT_EXCEEDED`'s
/// retry-after.
pub fn secs_until_midnight_utc(now: chrono::DateTime<chrono::Utc>) -> i64 {
    let tomorrow = (now + chrono::Duration::days(1)).date_naive();
    let next_midnight = tomorrow.and_hms_opt(0, 0, 0).unwrap().and_utc();
    (next_midnight - now).num_seconds().max(1)
}

/// Seconds until the first of next month UTC, for `MONTHLY_LIMIT_EXCEEDED`'s
/// retry-after.
pub fn secs_until_month_boundary_utc(now: chrono::DateTime<chrono::Utc>) -> i64 {
    let (year, month) = (now.year(), now.month());
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let next = chrono::NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc();
    (next - now).num_seconds().max(1)
}

use chrono::Datelike;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_limit_blocks_after_max() {
        let limiter = RateLimiter::new();
        for _ in 0..10 {
            let info = limiter.check_rolling("ws1", LimitKind::Burst, 10, Duration::from_secs(1));
            assert!(info.allowed);
        }
        let info = limiter.check_rolling("ws1", LimitKind::Burst, 10, Duration::from_secs(1));
        assert!(!info.allowed);
        assert_eq!(info.remaining, 0);
    }

    #[test]
    fn plan_defaults_match_table() {
        let free = plan_defaults(PlanTier::Free);
        assert_eq!(free.burst_per_sec, 1);
        assert_eq!(free.messages_per_day, 100);
        let ent = plan_defaults(PlanTier::Enterprise);
        assert_eq!(ent.messages_per_month, 2_500_000);
    }

    #[test]
    fn workspaces_have_independent_windows() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            limiter.check_rolling("ws1", LimitKind::Burst, 5, Duration::from_secs(1));
        }
        let info = limiter.check_rolling("ws2", LimitKind::Burst, 5, Duration::from_secs(1));
        assert!(info.allowed);
    }
}
