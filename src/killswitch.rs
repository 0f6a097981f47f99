//! Kill-switch & health reactor (spec §4.9).
//!
//! Shaped after the teacher's `retention.rs` background-sweep pattern
//! (query affected rows, act row-by-row, log a summary) but repurposed from
//! pruning old messages to pausing campaigns in response to health signals.

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::models::{CampaignSafety, QualityRating};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSwitchReason {
    QualityDegraded,
    TierDowngraded,
    AccountBlocked,
    CapabilityRevoked,
    EnforcementDetected,
    AdminTriggered,
}

impl KillSwitchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            KillSwitchReason::QualityDegraded => "QUALITY_DEGRADED",
            KillSwitchReason::TierDowngraded => "TIER_DOWNGRADED",
            KillSwitchReason::AccountBlocked => "ACCOUNT_BLOCKED",
            KillSwitchReason::CapabilityRevoked => "CAPABILITY_REVOKED",
            KillSwitchReason::EnforcementDetected => "ENFORCEMENT_DETECTED",
            KillSwitchReason::AdminTriggered => "ADMIN_TRIGGERED",
        }
    }
}

/// Detects which trigger (if any) applies given a before/after health
/// snapshot (§4.9 "Triggers").
pub struct HealthTransition {
    pub quality_before: QualityRating,
    pub quality_after: QualityRating,
    pub tier_before: i64,
    pub tier_after: i64,
    pub account_blocked: bool,
    pub capability_revoked: bool,
    pub decision_status_before: String,
    pub decision_status_after: String,
}

pub fn detect_trigger(t: &HealthTransition) -> Option<KillSwitchReason> {
    if t.quality_after == QualityRating::Red && t.quality_before != QualityRating::Red {
        return Some(KillSwitchReason::QualityDegraded);
    }
    if t.tier_after < t.tier_before {
        return Some(KillSwitchReason::TierDowngraded);
    }
    if t.account_blocked {
        return Some(KillSwitchReason::AccountBlocked);
    }
    if t.capability_revoked {
        return Some(KillSwitchReason::CapabilityRevoked);
    }
    let enforcement_statuses = ["DISABLED", "PENDING_DELETION", "UNDER_REVIEW"];
    if enforcement_statuses.contains(&t.decision_status_after.as_str())
        && !enforcement_statuses.contains(&t.decision_status_before.as_str())
    {
        return Some(KillSwitchReason::EnforcementDetected);
    }
    None
}

/// Pauses every running campaign for a workspace, marks their pending/queued
/// batches paused, and persists a kill-switch event (§4.9 "Effect"). This is
/// idempotent: calling it when there are no running campaigns still
/// succeeds and records an event with an empty campaign-id list would be
/// noise, so it short-circuits when nothing was running.
pub fn pause_campaigns_for_workspace(
    conn: &Connection,
    workspace_id: &str,
    reason: KillSwitchReason,
    ttl_days: i64,
) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM campaigns WHERE workspace_id = ?1 AND status = 'running'",
    )?;
    let campaign_ids: Vec<String> = stmt
        .query_map(params![workspace_id], |r| r.get(0))?
        .filter_map(|r| r.ok())
        .collect();
    drop(stmt);

    if campaign_ids.is_empty() {
        return Ok(Vec::new());
    }

    let now = Utc::now().to_rfc3339();
    for campaign_id in &campaign_ids {
        conn.execute(
            "UPDATE campaigns SET status = 'paused', pause_reason = ?1, updated_at = ?2 WHERE id = ?3",
            params![reason.as_str(), now, campaign_id],
        )?;
        conn.execute(
            "UPDATE campaign_batches SET status = 'paused' WHERE campaign_id = ?1 AND status IN ('pending', 'queued')",
            params![campaign_id],
        )?;
    }

    let expires = (Utc::now() + ChronoDuration::days(ttl_days)).to_rfc3339();
    conn.execute(
        "INSERT INTO killswitch_events (id, workspace_id, reason, paused_campaign_ids, created_at, ttl_expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            Uuid::new_v4().to_string(),
            workspace_id,
            reason.as_str(),
            serde_json::to_string(&campaign_ids).unwrap_or_else(|_| "[]".to_string()),
            now,
            expires,
        ],
    )?;

    Ok(campaign_ids)
}

/// Activates the global switch (§4.9 "Global switch"); always
/// `ADMIN_TRIGGERED` and pauses every running campaign across all
/// workspaces.
pub fn activate_global_switch(conn: &Connection, actor: &str, ttl_hours: i64) -> rusqlite::Result<Vec<String>> {
    let now = Utc::now().to_rfc3339();
    let expires = (Utc::now() + ChronoDuration::hours(ttl_hours)).to_rfc3339();
    conn.execute(
        "UPDATE global_killswitch SET active = 1, reason = ?1, actor = ?2, activated_at = ?3, ttl_expires_at = ?4 WHERE id = 1",
        params![KillSwitchReason::AdminTriggered.as_str(), actor, now, expires],
    )?;

    let workspace_ids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT DISTINCT workspace_id FROM campaigns WHERE status = 'running'")?;
        stmt.query_map([], |r| r.get(0))?.filter_map(|r| r.ok()).collect()
    };

    let mut all_paused = Vec::new();
    for workspace_id in workspace_ids {
        match pause_campaigns_for_workspace(conn, &workspace_id, KillSwitchReason::AdminTriggered, 7) {
            Ok(ids) => all_paused.extend(ids),
            Err(e) => tracing::warn!(workspace_id, error = %e, "failed to pause campaigns for workspace during global kill-switch activation"),
        }
    }
    Ok(all_paused)
}

pub fn deactivate_global_switch(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE global_killswitch SET active = 0, reason = NULL, actor = NULL, activated_at = NULL, ttl_expires_at = NULL WHERE id = 1",
        [],
    )?;
    Ok(())
}

fn global_switch_active(conn: &Connection) -> rusqlite::Result<bool> {
    conn.query_row("SELECT active FROM global_killswitch WHERE id = 1", [], |r| {
        r.get::<_, i64>(0)
    })
    .map(|v| v != 0)
}

/// `isWorkspaceSafeForCampaigns` (§4.9 "Safety query"): an explicit
/// multi-check structure rather than a single boolean.
pub fn is_workspace_safe_for_campaigns(conn: &Connection, workspace_id: &str) -> rusqlite::Result<CampaignSafety> {
    let global_active = global_switch_active(conn)?;
    let (quality_rating, account_status, capability_blocked): (String, String, i64) = conn.query_row(
        "SELECT quality_rating, account_status, capability_blocked FROM workspaces WHERE id = ?1",
        params![workspace_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;

    let mut warnings = Vec::new();
    let mut reason = None;
    let mut safe = true;

    if global_active {
        safe = false;
        reason = Some("Global kill-switch is active".to_string());
    } else if quality_rating == "RED" {
        safe = false;
        reason = Some("Phone quality rating is RED".to_string());
    } else if account_status != "active" {
        safe = false;
        reason = Some(format!("Account status is {account_status}"));
    } else if capability_blocked != 0 {
        safe = false;
        reason = Some("Messaging capability has been revoked".to_string());
    } else if quality_rating == "YELLOW" {
        warnings.push("Phone quality rating is YELLOW".to_string());
    }

    Ok(CampaignSafety {
        safe,
        global_switch_active: global_active,
        quality_rating,
        account_status,
        capability_blocked: capability_blocked != 0,
        warnings,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    fn seed_workspace_with_running_campaign(conn: &Connection) {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO workspaces (id, name, quality_rating, account_status, created_at, updated_at)
             VALUES ('ws3', 'W3', 'GREEN', 'active', ?1, ?1)",
            params![now],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO campaigns (id, workspace_id, status, created_at, updated_at)
             VALUES ('camp1', 'ws3', 'running', ?1, ?1)",
            params![now],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO campaign_batches (id, campaign_id, status, created_at) VALUES ('batch1', 'camp1', 'queued', ?1)",
            params![now],
        )
        .unwrap();
    }

    #[test]
    fn quality_degradation_pauses_running_campaigns() {
        let db = Db::in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        seed_workspace_with_running_campaign(&conn);
        conn.execute("UPDATE workspaces SET quality_rating = 'RED' WHERE id = 'ws3'", []).unwrap();

        let transition = HealthTransition {
            quality_before: QualityRating::Green,
            quality_after: QualityRating::Red,
            tier_before: 2,
            tier_after: 2,
            account_blocked: false,
            capability_revoked: false,
            decision_status_before: "".to_string(),
            decision_status_after: "".to_string(),
        };
        let reason = detect_trigger(&transition).unwrap();
        assert_eq!(reason, KillSwitchReason::QualityDegraded);

        let paused = pause_campaigns_for_workspace(&conn, "ws3", reason, 7).unwrap();
        assert_eq!(paused, vec!["camp1".to_string()]);

        let status: String = conn.query_row("SELECT status FROM campaigns WHERE id='camp1'", [], |r| r.get(0)).unwrap();
        assert_eq!(status, "paused");
        let batch_status: String =
            conn.query_row("SELECT status FROM campaign_batches WHERE id='batch1'", [], |r| r.get(0)).unwrap();
        assert_eq!(batch_status, "paused");

        let safety = is_workspace_safe_for_campaigns(&conn, "ws3").unwrap();
        assert!(!safety.safe);
        assert_eq!(safety.reason.unwrap(), "Phone quality rating is RED");
    }

    #[test]
    fn yellow_quality_is_a_warning_not_a_block() {
        let db = Db::in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        seed_workspace_with_running_campaign(&conn);
        conn.execute("UPDATE workspaces SET quality_rating = 'YELLOW' WHERE id = 'ws3'", []).unwrap();

        let safety = is_workspace_safe_for_campaigns(&conn, "ws3").unwrap();
        assert!(safety.safe);
        assert_eq!(safety.warnings.len(), 1);
    }
}
