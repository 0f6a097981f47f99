//! Account & capability reactors (spec §4.10): applies `account_update` and
//! `business_capability_update` change objects to workspace state.

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::error::GatewayError;

fn valid_account_status(status: &str) -> bool {
    matches!(status, "ACTIVE" | "DISABLED" | "PENDING_REVIEW" | "SUSPENDED")
}

pub struct AccountUpdate {
    pub phone_status: Option<String>,
    pub decision_status: Option<String>,
    pub account_status: Option<String>,
    pub quality_rating: Option<String>,
}

/// Applies an `account_update` change object (§4.10): updates phone status,
/// decision/account status (after enum validation), and quality rating
/// when present.
pub fn apply_account_update(conn: &Connection, workspace_id: &str, update: AccountUpdate) -> Result<(), GatewayError> {
    if let Some(status) = &update.account_status {
        if !valid_account_status(status) {
            return Err(GatewayError::Internal(format!("invalid account status: {status}")));
        }
    }

    let now = Utc::now().to_rfc3339();
    if let Some(phone_status) = update.phone_status {
        conn.execute(
            "UPDATE workspaces SET phone_health = ?1, updated_at = ?2 WHERE id = ?3",
            params![phone_status, now, workspace_id],
        )?;
    }
    if let Some(decision_status) = update.decision_status {
        conn.execute(
            "UPDATE workspaces SET decision_status = ?1, updated_at = ?2 WHERE id = ?3",
            params![decision_status, now, workspace_id],
        )?;
    }
    if let Some(account_status) = update.account_status {
        // Normalize to the lowercase form used elsewhere in the schema
        // (`active`, `disabled`, ...) while still validating against the
        // enum spelled out in the spec.
        conn.execute(
            "UPDATE workspaces SET account_status = ?1, updated_at = ?2 WHERE id = ?3",
            params![account_status.to_lowercase(), now, workspace_id],
        )?;
    }
    if let Some(quality_rating) = update.quality_rating {
        conn.execute(
            "UPDATE workspaces SET quality_rating = ?1, updated_at = ?2 WHERE id = ?3",
            params![quality_rating, now, workspace_id],
        )?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Messaging,
    PhoneNumberManagement,
    Other,
}

impl Capability {
    pub fn parse(s: &str) -> Self {
        match s {
            "MESSAGING" => Capability::Messaging,
            "PHONE_NUMBER_MANAGEMENT" => Capability::PhoneNumberManagement,
            _ => Capability::Other,
        }
    }
}

/// Applies a `business_capability_update` change object (§4.10): revocation
/// of `MESSAGING` or `PHONE_NUMBER_MANAGEMENT` sets the capability-block
/// flag the outbound sender observes.
pub fn apply_capability_update(
    conn: &Connection,
    workspace_id: &str,
    capability: Capability,
    status: &str,
) -> Result<(), GatewayError> {
    let revoked = status.eq_ignore_ascii_case("revoked") || status.eq_ignore_ascii_case("disabled");
    if revoked && matches!(capability, Capability::Messaging | Capability::PhoneNumberManagement) {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE workspaces SET capability_blocked = 1, updated_at = ?1 WHERE id = ?2",
            params![now, workspace_id],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    fn seed(conn: &Connection) {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO workspaces (id, name, created_at, updated_at) VALUES ('ws1', 'W1', ?1, ?1)",
            params![now],
        )
        .unwrap();
    }

    #[test]
    fn messaging_revocation_sets_capability_block() {
        let db = Db::in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        seed(&conn);
        apply_capability_update(&conn, "ws1", Capability::Messaging, "revoked").unwrap();
        let blocked: i64 = conn
            .query_row("SELECT capability_blocked FROM workspaces WHERE id='ws1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(blocked, 1);
    }

    #[test]
    fn unrelated_capability_does_not_block() {
        let db = Db::in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        seed(&conn);
        apply_capability_update(&conn, "ws1", Capability::Other, "revoked").unwrap();
        let blocked: i64 = conn
            .query_row("SELECT capability_blocked FROM workspaces WHERE id='ws1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(blocked, 0);
    }

    #[test]
    fn invalid_account_status_is_rejected() {
        let db = Db::in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        seed(&conn);
        let result = apply_account_update(
            &conn,
            "ws1",
            AccountUpdate {
                phone_status: None,
                decision_status: None,
                account_status: Some("NOT_A_REAL_STATUS".to_string()),
                quality_rating: None,
            },
        );
        assert!(result.is_err());
    }
}
