//! Status applier (spec §4.5): idempotent status transitions for outbound
//! messages driven by provider delivery-status webhooks.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::collaborators::WorkflowSink;
use crate::error::GatewayError;
use crate::events::{EventBus, GatewayEvent};
use crate::models::status_rank;

pub struct StatusUpdate<'a> {
    pub provider_message_id: &'a str,
    pub status: &'a str,
    pub failure_reason: Option<&'a str>,
    /// Event-time from the webhook payload, used to stamp the timestamp
    /// field if not already set. See SPEC_FULL §9 / spec §9 open question:
    /// this implementation fixes the authoritative choice as event-time
    /// (falls back to `now` if absent), not second-resolution wall clock.
    pub event_time: Option<chrono::DateTime<chrono::Utc>>,
}

fn timestamp_column(status: &str) -> Option<&'static str> {
    match status {
        "sending" => Some("sending_at"),
        "sent" => Some("sent_at"),
        "delivered" => Some("delivered_at"),
        "read" => Some("read_at"),
        "failed" => Some("failed_at"),
        _ => None,
    }
}

/// Applies one status update. Returns `Ok(Some(message_id))` if a message
/// was found and changed, `Ok(None)` if the message could not be located
/// (a no-op, not an error per §4.5's "locate by provider id" contract), and
/// is a no-op (but still `Ok`) when the new status does not advance the
/// monotonic forward path (§3 invariant, §8 idempotence law).
pub fn apply_status(
    conn: &Connection,
    events: &EventBus,
    workflow: &dyn WorkflowSink,
    workspace_id: Option<&str>,
    update: StatusUpdate,
) -> Result<Option<String>, GatewayError> {
    let row: Option<(String, String, String)> = if let Some(ws) = workspace_id {
        conn.query_row(
            "SELECT id, status, workspace_id FROM messages WHERE provider_message_id = ?1 AND workspace_id = ?2",
            params![update.provider_message_id, ws],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?
    } else {
        conn.query_row(
            "SELECT id, status, workspace_id FROM messages WHERE provider_message_id = ?1",
            params![update.provider_message_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?
    };

    let Some((message_id, current_status, resolved_workspace_id)) = row else {
        return Ok(None);
    };

    // Idempotence: the same terminal status repeated, or a status that does
    // not advance the forward-path rank, is a no-op (§3, §8).
    let advances = match (status_rank(&current_status), status_rank(update.status)) {
        (Some(cur), Some(next)) => next > cur,
        _ => update.status == "failed" && current_status != "failed",
    };
    if !advances {
        return Ok(Some(message_id));
    }

    let now = update.event_time.unwrap_or_else(Utc::now).to_rfc3339();
    let mut sql = "UPDATE messages SET status = ?1".to_string();
    let mut bind_count = 1;
    if let Some(col) = timestamp_column(update.status) {
        bind_count += 1;
        sql.push_str(&format!(", {col} = COALESCE({col}, ?{bind_count})"));
    }
    if update.status == "failed" {
        bind_count += 1;
        sql.push_str(&format!(", failure_reason = ?{bind_count}"));
    }
    bind_count += 1;
    sql.push_str(&format!(" WHERE id = ?{bind_count}"));

    let mut stmt = conn.prepare(&sql)?;
    match (timestamp_column(update.status).is_some(), update.status == "failed") {
        (true, true) => {
            stmt.execute(params![update.status, now, update.failure_reason, message_id])?;
        }
        (true, false) => {
            stmt.execute(params![update.status, now, message_id])?;
        }
        (false, true) => {
            stmt.execute(params![update.status, update.failure_reason, message_id])?;
        }
        (false, false) => {
            stmt.execute(params![update.status, message_id])?;
        }
    }

    // Campaign-message rollup, if this message participates in a campaign.
    conn.execute(
        "UPDATE campaign_messages SET status = ?1, updated_at = ?2
         WHERE provider_message_id = ?3",
        params![update.status, now, update.provider_message_id],
    )?;

    workflow.status_updated(&resolved_workspace_id, &message_id, update.status);
    events.publish(GatewayEvent::MessageStatus {
        workspace_id: resolved_workspace_id,
        message_id: message_id.clone(),
        status: update.status.to_string(),
    });

    Ok(Some(message_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::LoggingWorkflowSink;
    use crate::db::Db;

    fn seed_message(conn: &Connection) {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO workspaces (id, name, created_at, updated_at) VALUES ('ws1','W1',?1,?1)",
            params![now],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO contacts (id, workspace_id, phone, opt_at, created_at, updated_at)
             VALUES ('c1','ws1','9198765',?1,?1,?1)",
            params![now],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO conversations (id, workspace_id, contact_id, last_activity_at, started_at, created_at)
             VALUES ('conv1','ws1','c1',?1,?1,?1)",
            params![now],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO messages (id, workspace_id, conversation_id, contact_id, provider_message_id,
             direction, status, created_at) VALUES ('m1','ws1','conv1','c1','wamid.1','out','sent',?1)",
            params![now],
        )
        .unwrap();
    }

    #[test]
    fn repeated_terminal_status_is_a_noop() {
        let db = Db::in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        seed_message(&conn);
        let events = EventBus::new();
        let workflow = LoggingWorkflowSink;

        apply_status(
            &conn,
            &events,
            &workflow,
            Some("ws1"),
            StatusUpdate {
                provider_message_id: "wamid.1",
                status: "delivered",
                failure_reason: None,
                event_time: None,
            },
        )
        .unwrap();
        let first: String = conn
            .query_row("SELECT status FROM messages WHERE id='m1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(first, "delivered");

        apply_status(
            &conn,
            &events,
            &workflow,
            Some("ws1"),
            StatusUpdate {
                provider_message_id: "wamid.1",
                status: "delivered",
                failure_reason: None,
                event_time: None,
            },
        )
        .unwrap();
        let second: String = conn
            .query_row("SELECT status FROM messages WHERE id='m1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(second, "delivered");
    }

    #[test]
    fn sequence_collapses_like_single_delivery() {
        let db = Db::in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        seed_message(&conn);
        let events = EventBus::new();
        let workflow = LoggingWorkflowSink;

        for status in ["sent", "delivered", "delivered", "read"] {
            apply_status(
                &conn,
                &events,
                &workflow,
                Some("ws1"),
                StatusUpdate {
                    provider_message_id: "wamid.1",
                    status,
                    failure_reason: None,
                    event_time: None,
                },
            )
            .unwrap();
        }
        let final_status: String = conn
            .query_row("SELECT status FROM messages WHERE id='m1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(final_status, "read");
    }
}
