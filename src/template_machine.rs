//! Template state machine: authoritative reconciliation from provider
//! webhooks (spec §4.6), plus the template namespacing scheme (§6.2).
//!
//! Grounded in the teacher's HMAC/webhook-adjacent modules for shape (one
//! pure-logic module with its matching rules exposed as free functions, unit
//! tested directly) even though the teacher has no template concept of its
//! own to generalize from.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::GatewayError;
use crate::events::{EventBus, GatewayEvent};

/// `{workspaceIdSuffix}_{localName}` (§6.2): suffix is the last 8 chars of
/// the workspace id.
pub fn provider_template_name(workspace_id: &str, local_name: &str) -> String {
    let suffix = workspace_suffix(workspace_id);
    format!("{suffix}_{local_name}")
}

pub fn workspace_suffix(workspace_id: &str) -> String {
    if workspace_id.len() <= 8 {
        workspace_id.to_string()
    } else {
        workspace_id[workspace_id.len() - 8..].to_string()
    }
}

/// Splits a provider-side template name back into `(suffix, local_name)`.
/// Used for tenant resolution when a webhook lacks a phone id (§4.2) and for
/// filtering a provider-side template sync to the owning tenant's view
/// (§6.2).
pub fn split_provider_template_name(provider_name: &str) -> Option<(&str, &str)> {
    let idx = provider_name.find('_')?;
    let (suffix, rest) = provider_name.split_at(idx);
    if suffix.len() != 8 {
        return None;
    }
    Some((suffix, &rest[1..]))
}

/// Event -> local status map (spec §4.6).
pub fn event_to_status(event: &str) -> Option<&'static str> {
    match event {
        "APPROVED" | "REINSTATED" => Some("APPROVED"),
        "REJECTED" => Some("REJECTED"),
        "PENDING" | "PENDING_DELETION" | "IN_APPEAL" | "QUALITY_PENDING" => Some("PENDING"),
        "DELETED" => Some("DELETED"),
        "DISABLED" | "FLAGGED" | "FLAGGED_FOR_REVIEW" | "AUTO_DISABLED" | "BLOCKED" => {
            Some("DISABLED")
        }
        "PAUSED" => Some("PAUSED"),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionCategory {
    Scam,
    PromotionalContent,
    AbusiveContent,
    InvalidFormat,
    MissingExample,
    InvalidUrl,
    InvalidMedia,
    Duplicate,
    Trademark,
    PolicyViolation,
    Other,
}

impl RejectionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionCategory::Scam => "SCAM",
            RejectionCategory::PromotionalContent => "PROMOTIONAL_CONTENT",
            RejectionCategory::AbusiveContent => "ABUSIVE_CONTENT",
            RejectionCategory::InvalidFormat => "INVALID_FORMAT",
            RejectionCategory::MissingExample => "MISSING_EXAMPLE",
            RejectionCategory::InvalidUrl => "INVALID_URL",
            RejectionCategory::InvalidMedia => "INVALID_MEDIA",
            RejectionCategory::Duplicate => "DUPLICATE",
            RejectionCategory::Trademark => "TRADEMARK",
            RejectionCategory::PolicyViolation => "POLICY_VIOLATION",
            RejectionCategory::Other => "OTHER",
        }
    }

    pub fn help_text(&self) -> &'static str {
        match self {
            RejectionCategory::Scam => {
                "The template was flagged as a scam or deceptive offer. Remove misleading claims."
            }
            RejectionCategory::PromotionalContent => {
                "Promotional language was found in a non-marketing category template. Move promotional copy to a MARKETING template or soften the wording."
            }
            RejectionCategory::AbusiveContent => {
                "The template contains abusive or harassing language."
            }
            RejectionCategory::InvalidFormat => {
                "The template structure does not match the required component format."
            }
            RejectionCategory::MissingExample => {
                "One or more variable placeholders are missing a required example value."
            }
            RejectionCategory::InvalidUrl => {
                "A button or header URL is malformed or not publicly reachable."
            }
            RejectionCategory::InvalidMedia => {
                "The header media sample failed validation (unsupported type or unreachable link)."
            }
            RejectionCategory::Duplicate => {
                "A template with equivalent content already exists for this account."
            }
            RejectionCategory::Trademark => "The template references a protected trademark.",
            RejectionCategory::PolicyViolation => {
                "The template violates platform messaging policy."
            }
            RejectionCategory::Other => "No specific category matched; see the raw reason text.",
        }
    }
}

struct CategoryPattern {
    category: RejectionCategory,
    regex: &'static Lazy<Regex>,
}

static RE_SCAM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)scam|deceptive|fraud").unwrap());
static RE_PROMOTIONAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)promotional|marketing language|discount|offer").unwrap());
static RE_ABUSIVE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)abusive|harass|hate speech").unwrap());
static RE_MISSING_EXAMPLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)missing example|example value").unwrap());
static RE_INVALID_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)invalid url|broken link").unwrap());
static RE_INVALID_MEDIA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)invalid media|media sample").unwrap());
static RE_DUPLICATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)duplicate").unwrap());
static RE_TRADEMARK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)trademark|copyright").unwrap());
static RE_POLICY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)policy violation|violates policy").unwrap());
static RE_INVALID_FORMAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)invalid format|malformed component").unwrap());

/// Parses a free-text rejection reason into the fixed category set (§4.6),
/// by case-insensitive regex match, first pattern wins.
pub fn classify_rejection(reason: &str) -> RejectionCategory {
    let patterns: [CategoryPattern; 10] = [
        CategoryPattern { category: RejectionCategory::Scam, regex: &RE_SCAM },
        CategoryPattern {
            category: RejectionCategory::PromotionalContent,
            regex: &RE_PROMOTIONAL,
        },
        CategoryPattern { category: RejectionCategory::AbusiveContent, regex: &RE_ABUSIVE },
        CategoryPattern {
            category: RejectionCategory::MissingExample,
            regex: &RE_MISSING_EXAMPLE,
        },
        CategoryPattern { category: RejectionCategory::InvalidUrl, regex: &RE_INVALID_URL },
        CategoryPattern { category: RejectionCategory::InvalidMedia, regex: &RE_INVALID_MEDIA },
        CategoryPattern { category: RejectionCategory::Duplicate, regex: &RE_DUPLICATE },
        CategoryPattern { category: RejectionCategory::Trademark, regex: &RE_TRADEMARK },
        CategoryPattern { category: RejectionCategory::PolicyViolation, regex: &RE_POLICY },
        CategoryPattern {
            category: RejectionCategory::InvalidFormat,
            regex: &RE_INVALID_FORMAT,
        },
    ];

    for pattern in &patterns {
        if pattern.regex.is_match(reason) {
            return pattern.category;
        }
    }
    RejectionCategory::Other
}

/// §4.6 idempotency: the same event type for the same template within 5s is
/// dropped.
pub fn is_within_idempotency_window(
    last_update: Option<chrono::DateTime<chrono::Utc>>,
    now: chrono::DateTime<chrono::Utc>,
) -> bool {
    match last_update {
        Some(last) => now.signed_duration_since(last) < chrono::Duration::seconds(5),
        None => false,
    }
}

struct TemplateRow {
    id: String,
    workspace_id: String,
    status: String,
    original_template_id: Option<String>,
    approval_history: String,
    last_webhook_event_type: Option<String>,
    last_webhook_update: Option<String>,
}

fn find_template(
    conn: &Connection,
    provider_template_id: Option<&str>,
    provider_template_name: Option<&str>,
) -> rusqlite::Result<Option<TemplateRow>> {
    let select = "SELECT id, workspace_id, status, original_template_id, approval_history,
                  last_webhook_event_type, last_webhook_update FROM templates";

    if let Some(id) = provider_template_id {
        let row = conn
            .query_row(&format!("{select} WHERE provider_template_id = ?1"), params![id], map_template_row)
            .optional()?;
        if row.is_some() {
            return Ok(row);
        }
    }
    if let Some(name) = provider_template_name {
        return conn
            .query_row(&format!("{select} WHERE provider_name = ?1"), params![name], map_template_row)
            .optional();
    }
    Ok(None)
}

fn map_template_row(row: &rusqlite::Row) -> rusqlite::Result<TemplateRow> {
    Ok(TemplateRow {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        status: row.get(2)?,
        original_template_id: row.get(3)?,
        approval_history: row.get(4)?,
        last_webhook_event_type: row.get(5)?,
        last_webhook_update: row.get(6)?,
    })
}

/// Applies one `message_template_status_update` webhook event (§4.6):
/// resolves the template by provider id then provider name, collapses
/// duplicate events inside the 5s idempotency window, overwrites local
/// status as authoritative, classifies rejection reasons, and flips the
/// active/inactive flag on a forked template pair when the fork is approved.
#[allow(clippy::too_many_arguments)]
pub fn apply_template_status_update(
    conn: &Connection,
    events: &EventBus,
    provider_template_id: Option<&str>,
    provider_template_name: Option<&str>,
    event: &str,
    event_id: Option<&str>,
    reason: Option<&str>,
) -> Result<Option<String>, GatewayError> {
    let Some(template) = find_template(conn, provider_template_id, provider_template_name)? else {
        return Ok(None);
    };

    let Some(new_status) = event_to_status(event) else {
        return Ok(Some(template.id));
    };

    let now = Utc::now();
    let last_update = template
        .last_webhook_update
        .as_deref()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    if template.last_webhook_event_type.as_deref() == Some(event) && is_within_idempotency_window(last_update, now) {
        return Ok(Some(template.id));
    }

    let rejection_category = (new_status == "REJECTED")
        .then(|| reason.map(classify_rejection).unwrap_or(RejectionCategory::Other).as_str());
    let previous_status = template.status.clone();

    let mut history: Vec<serde_json::Value> =
        serde_json::from_str(&template.approval_history).unwrap_or_default();
    history.push(serde_json::json!({
        "status": new_status,
        "source": "WEBHOOK",
        "providerEventId": event_id,
        "at": now.to_rfc3339(),
    }));
    let history_json = serde_json::to_string(&history).unwrap_or_else(|_| "[]".to_string());

    let now_str = now.to_rfc3339();
    if new_status == "APPROVED" {
        conn.execute(
            "UPDATE templates SET status = ?1, rejection_category = NULL, rejection_reason = NULL,
             approval_history = ?2, last_webhook_event_id = ?3, last_webhook_event_type = ?4,
             last_webhook_update = ?5, updated_at = ?5 WHERE id = ?6",
            params![new_status, history_json, event_id, event, now_str, template.id],
        )?;
        if let Some(original_id) = &template.original_template_id {
            conn.execute(
                "UPDATE templates SET active_version = 1, updated_at = ?1 WHERE id = ?2",
                params![now_str, template.id],
            )?;
            conn.execute(
                "UPDATE templates SET active_version = 0, updated_at = ?1 WHERE id = ?2",
                params![now_str, original_id],
            )?;
        }
    } else {
        conn.execute(
            "UPDATE templates SET status = ?1, rejection_category = ?2, rejection_reason = ?3,
             approval_history = ?4, last_webhook_event_id = ?5, last_webhook_event_type = ?6,
             last_webhook_update = ?7, updated_at = ?7 WHERE id = ?8",
            params![new_status, rejection_category, reason, history_json, event_id, event, now_str, template.id],
        )?;
    }

    events.publish(GatewayEvent::TemplateStatus {
        workspace_id: template.workspace_id,
        template_id: template.id.clone(),
        status: new_status.to_string(),
    });
    let _ = previous_status;

    Ok(Some(template.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespacing_round_trips() {
        let workspace_id = "ws_abcdefgh12345678";
        let provider_name = provider_template_name(workspace_id, "order_shipped");
        assert_eq!(provider_name, "12345678_order_shipped");
        let (suffix, local) = split_provider_template_name(&provider_name).unwrap();
        assert_eq!(suffix, workspace_suffix(workspace_id));
        assert_eq!(local, "order_shipped");
    }

    #[test]
    fn promotional_reason_classifies_correctly() {
        let category = classify_rejection("Promotional language in UTILITY template");
        assert_eq!(category, RejectionCategory::PromotionalContent);
        assert!(!category.help_text().is_empty());
    }

    #[test]
    fn unmatched_reason_falls_back_to_other() {
        assert_eq!(classify_rejection("unrecognized free text"), RejectionCategory::Other);
    }

    #[test]
    fn event_map_covers_all_documented_events() {
        assert_eq!(event_to_status("REINSTATED"), Some("APPROVED"));
        assert_eq!(event_to_status("QUALITY_PENDING"), Some("PENDING"));
        assert_eq!(event_to_status("AUTO_DISABLED"), Some("DISABLED"));
        assert_eq!(event_to_status("UNKNOWN_EVENT"), None);
    }

    #[test]
    fn rejection_updates_category_and_history() {
        use crate::db::Db;
        let db = Db::in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO workspaces (id, name, created_at, updated_at) VALUES ('ws1','W1',?1,?1)",
            params![now],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO templates (id, workspace_id, name, language, provider_name, status, created_at, updated_at)
             VALUES ('t1','ws1','order_shipped','en_US','12345678_order_shipped','PENDING',?1,?1)",
            params![now],
        )
        .unwrap();

        let events = EventBus::new();
        let id = apply_template_status_update(
            &conn,
            &events,
            None,
            Some("12345678_order_shipped"),
            "REJECTED",
            Some("evt1"),
            Some("Promotional language detected"),
        )
        .unwrap();
        assert_eq!(id, Some("t1".to_string()));

        let (status, category): (String, Option<String>) = conn
            .query_row("SELECT status, rejection_category FROM templates WHERE id='t1'", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(status, "REJECTED");
        assert_eq!(category, Some("PROMOTIONAL_CONTENT".to_string()));
    }

    #[test]
    fn duplicate_event_within_window_is_a_noop() {
        use crate::db::Db;
        let db = Db::in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO workspaces (id, name, created_at, updated_at) VALUES ('ws1','W1',?1,?1)",
            params![now],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO templates (id, workspace_id, name, language, provider_name, status, created_at, updated_at)
             VALUES ('t1','ws1','order_shipped','en_US','12345678_order_shipped','PENDING',?1,?1)",
            params![now],
        )
        .unwrap();

        let events = EventBus::new();
        apply_template_status_update(&conn, &events, None, Some("12345678_order_shipped"), "APPROVED", Some("e1"), None)
            .unwrap();
        apply_template_status_update(&conn, &events, None, Some("12345678_order_shipped"), "APPROVED", Some("e2"), None)
            .unwrap();

        let history: String = conn
            .query_row("SELECT approval_history FROM templates WHERE id='t1'", [], |r| r.get(0))
            .unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&history).unwrap();
        assert_eq!(parsed.len(), 1);
    }
}
