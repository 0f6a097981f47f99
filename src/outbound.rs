//! Outbound template sender (spec §4.7): validation, variable binding,
//! rate limiting, provider call, and ledger updates for a single recipient.
//!
//! Threads an explicit [`RequestContext`] through the pipeline rather than
//! reaching for thread-local or global "current workspace" state (spec §9).

use chrono::Utc;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::collaborators::{BillingBlock, BillingGate};
use crate::error::GatewayError;
use crate::models::{PhoneHealth, PlanTier};
use crate::provider::ProviderClient;
use crate::rate_limit::{plan_defaults, secs_until_midnight_utc, secs_until_month_boundary_utc, LimitKind, RateLimiter};
use crate::template_machine::provider_template_name;
use std::time::Duration;

/// Explicit request context threaded through every step of the pipeline,
/// replacing a global "current workspace" (spec §9).
pub struct RequestContext {
    pub workspace_id: String,
}

pub struct SendTemplateInput {
    pub template_id: Option<String>,
    pub template_name: Option<String>,
    pub to: String,
    pub header_vars: Vec<String>,
    pub body_vars: Vec<String>,
    pub button_vars: Vec<String>,
    pub contact_id: Option<String>,
    pub campaign_id: Option<String>,
}

pub struct SendTemplateOutcome {
    pub message_id: String,
    pub provider_message_id: String,
}

/// §4.7 step 1: strip non-digits; map a leading zero to a configured
/// country code; reject if fewer than 10 digits.
pub fn normalize_phone(raw: &str, default_country_code: &str) -> Result<String, GatewayError> {
    fn digits_re() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"\D").unwrap())
    }
    let mut digits = digits_re().replace_all(raw, "").to_string();
    if let Some(rest) = digits.strip_prefix('0') {
        digits = format!("{default_country_code}{rest}");
    }
    if digits.len() < 10 {
        return Err(GatewayError::InvalidRecipient);
    }
    Ok(digits)
}

/// §4.7 step 6: counts `{{N}}` placeholders in `text`.
pub fn placeholder_count(text: &str) -> usize {
    fn placeholder_re() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"\{\{\d+\}\}").unwrap())
    }
    placeholder_re().find_iter(text).count()
}

/// Validates the variable arity of header/body text against the number of
/// values supplied, returning the structured mismatch error the spec names
/// (§4.7 step 6, §7).
pub fn validate_variable_arity(
    header_text: Option<&str>,
    header_vars: &[String],
    body_text: &str,
    body_vars: &[String],
) -> Result<(), GatewayError> {
    if let Some(header) = header_text {
        let expected = placeholder_count(header);
        if expected != header_vars.len() {
            return Err(GatewayError::VariableCountMismatch { expected, got: header_vars.len() });
        }
    }
    let expected = placeholder_count(body_text);
    if expected != body_vars.len() {
        return Err(GatewayError::VariableCountMismatch { expected, got: body_vars.len() });
    }
    Ok(())
}

/// Builds the provider payload (§4.7 step 8): header, body, buttons in
/// order; omits the `components` array entirely when nothing is dynamic.
pub fn build_provider_payload(
    provider_name: &str,
    language: &str,
    to: &str,
    header_vars: &[String],
    header_is_media: bool,
    header_media_link: Option<&str>,
    body_vars: &[String],
    button_url_vars: &[String],
    button_copy_code: Option<&str>,
) -> Value {
    let mut components = Vec::new();

    if header_is_media {
        if let Some(link) = header_media_link {
            components.push(json!({
                "type": "header",
                "parameters": [{"type": "image", "image": {"link": link}}]
            }));
        }
    } else if !header_vars.is_empty() {
        components.push(json!({
            "type": "header",
            "parameters": header_vars.iter().map(|v| json!({"type": "text", "text": v})).collect::<Vec<_>>()
        }));
    }

    if !body_vars.is_empty() {
        components.push(json!({
            "type": "body",
            "parameters": body_vars.iter().map(|v| json!({"type": "text", "text": v})).collect::<Vec<_>>()
        }));
    }

    for (idx, url_var) in button_url_vars.iter().enumerate() {
        components.push(json!({
            "type": "button",
            "sub_type": "url",
            "index": idx,
            "parameters": [{"type": "text", "text": url_var}]
        }));
    }

    if let Some(code) = button_copy_code {
        components.push(json!({
            "type": "button",
            "sub_type": "copy_code",
            "index": button_url_vars.len(),
            "parameters": [{"type": "coupon_code", "coupon_code": code}]
        }));
    }

    let mut template = json!({
        "name": provider_name,
        "language": {"code": language},
    });
    if !components.is_empty() {
        template["components"] = json!(components);
    }

    json!({
        "messaging_product": "whatsapp",
        "to": to,
        "type": "template",
        "template": template,
    })
}

struct LoadedWorkspace {
    phone_number_id: String,
    billing_status: String,
    trial_allows_send: bool,
    plan_tier: PlanTier,
    phone_health: PhoneHealth,
    bsp_connected: bool,
}

fn load_workspace(conn: &Connection, workspace_id: &str) -> Result<LoadedWorkspace, GatewayError> {
    conn.query_row(
        "SELECT phone_number_id, billing_status, trial_allows_send, plan_tier, phone_health, bsp_connected
         FROM workspaces WHERE id = ?1",
        params![workspace_id],
        |row| {
            Ok(LoadedWorkspace {
                phone_number_id: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                billing_status: row.get(1)?,
                trial_allows_send: row.get::<_, i64>(2)? != 0,
                plan_tier: PlanTier::parse(&row.get::<_, String>(3)?),
                phone_health: PhoneHealth::parse(&row.get::<_, String>(4)?),
                bsp_connected: row.get::<_, i64>(5)? != 0,
            })
        },
    )
    .optional()
    .map_err(GatewayError::from)?
    .ok_or(GatewayError::WorkspaceNotConfigured)
}

struct LoadedTemplate {
    id: String,
    workspace_id: String,
    name: String,
    language: String,
    status: String,
    category: String,
}

fn load_template(
    conn: &Connection,
    template_id: Option<&str>,
    template_name: Option<&str>,
    workspace_id: &str,
) -> Result<LoadedTemplate, GatewayError> {
    let row = if let Some(id) = template_id {
        conn.query_row(
            "SELECT id, workspace_id, name, language, status, category FROM templates WHERE id = ?1",
            params![id],
            |r| {
                Ok(LoadedTemplate {
                    id: r.get(0)?,
                    workspace_id: r.get(1)?,
                    name: r.get(2)?,
                    language: r.get(3)?,
                    status: r.get(4)?,
                    category: r.get(5)?,
                })
            },
        )
        .optional()
    } else if let Some(name) = template_name {
        conn.query_row(
            "SELECT id, workspace_id, name, language, status, category FROM templates
             WHERE workspace_id = ?1 AND name = ?2 ORDER BY created_at DESC LIMIT 1",
            params![workspace_id, name],
            |r| {
                Ok(LoadedTemplate {
                    id: r.get(0)?,
                    workspace_id: r.get(1)?,
                    name: r.get(2)?,
                    language: r.get(3)?,
                    status: r.get(4)?,
                    category: r.get(5)?,
                })
            },
        )
        .optional()
    } else {
        return Err(GatewayError::TemplateNotFound);
    }
    .map_err(GatewayError::from)?;

    row.ok_or(GatewayError::TemplateNotFound)
}

fn is_opted_out(conn: &Connection, workspace_id: &str, contact_id: Option<&str>, phone: &str) -> Result<bool, GatewayError> {
    let opted_in: Option<i64> = if let Some(id) = contact_id {
        conn.query_row("SELECT opted_in FROM contacts WHERE id = ?1", params![id], |r| r.get(0))
            .optional()?
    } else {
        conn.query_row(
            "SELECT opted_in FROM contacts WHERE workspace_id = ?1 AND phone = ?2",
            params![workspace_id, phone],
            |r| r.get(0),
        )
        .optional()?
    };
    Ok(matches!(opted_in, Some(0)))
}

#[allow(clippy::too_many_arguments)]
pub async fn send_template(
    conn: &Connection,
    provider: &ProviderClient,
    rate_limiter: &RateLimiter,
    billing_gate: &dyn BillingGate,
    ctx: &RequestContext,
    default_country_code: &str,
    input: SendTemplateInput,
) -> Result<SendTemplateOutcome, GatewayError> {
    // Step 1.
    let normalized_to = normalize_phone(&input.to, default_country_code)?;

    // Step 2.
    let workspace = load_workspace(conn, &ctx.workspace_id)?;
    if !workspace.bsp_connected || workspace.phone_number_id.is_empty() {
        return Err(GatewayError::PhoneNotConfigured);
    }
    match workspace.phone_health {
        PhoneHealth::Connected => {}
        PhoneHealth::Restricted | PhoneHealth::Flagged => return Err(GatewayError::PhoneDisconnected),
        PhoneHealth::Banned => return Err(GatewayError::PhoneBanned),
        PhoneHealth::RateLimited => return Err(GatewayError::PhoneRateLimited { retry_after_secs: 3600 }),
        PhoneHealth::Disconnected | PhoneHealth::Pending => return Err(GatewayError::PhoneDisconnected),
    }

    // Step 3.
    if is_opted_out(conn, &ctx.workspace_id, input.contact_id.as_deref(), &normalized_to)? {
        return Err(GatewayError::OptedOut);
    }

    // Step 4.
    if let Err(block) = billing_gate.check(&workspace.billing_status, workspace.trial_allows_send) {
        return Err(match block {
            BillingBlock::TrialNoSend => GatewayError::BillingTrialNoSend,
            BillingBlock::PastDue => GatewayError::BillingPastDue,
            BillingBlock::Suspended => GatewayError::BillingSuspended,
        });
    }

    // Step 5.
    let template = load_template(conn, input.template_id.as_deref(), input.template_name.as_deref(), &ctx.workspace_id)?;
    if template.workspace_id != ctx.workspace_id {
        return Err(GatewayError::TemplateOwnershipMismatch);
    }
    if template.status != "APPROVED" {
        return Err(GatewayError::TemplateNotApproved);
    }

    // Step 7: rate limits. Burst first (cheapest / most likely to trip),
    // then the materialized daily/monthly counters.
    let defaults = plan_defaults(workspace.plan_tier);
    let burst = rate_limiter.check_rolling(&ctx.workspace_id, LimitKind::Burst, defaults.burst_per_sec, Duration::from_secs(1));
    if !burst.allowed {
        return Err(GatewayError::RateLimitExceeded {
            limit_kind: "burst".to_string(),
            retry_after_secs: burst.retry_after_secs,
        });
    }
    let (messages_today, messages_month): (i64, i64) = conn.query_row(
        "SELECT messages_today, messages_month FROM workspaces WHERE id = ?1",
        params![ctx.workspace_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    if messages_today as u64 >= defaults.messages_per_day {
        return Err(GatewayError::DailyLimitExceeded);
    }
    if messages_month as u64 >= defaults.messages_per_month {
        return Err(GatewayError::MonthlyLimitExceeded);
    }

    // Step 8.
    let provider_name = provider_template_name(&ctx.workspace_id, &template.name);
    let payload = build_provider_payload(
        &provider_name,
        &template.language,
        &normalized_to,
        &input.header_vars,
        false,
        None,
        &input.body_vars,
        &input.button_vars,
        None,
    );

    // Step 9.
    let result = provider.send_template(&workspace.phone_number_id, &payload).await?;

    // Step 10/11: persist outbound message, upsert contact/conversation,
    // append usage ledger, bump counters.
    let now = Utc::now().to_rfc3339();
    let contact_id = match input.contact_id {
        Some(id) => id,
        None => {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM contacts WHERE workspace_id = ?1 AND phone = ?2",
                    params![ctx.workspace_id, normalized_to],
                    |r| r.get(0),
                )
                .optional()?;
            match existing {
                Some(id) => id,
                None => {
                    let id = Uuid::new_v4().to_string();
                    conn.execute(
                        "INSERT INTO contacts (id, workspace_id, phone, opt_at, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?4, ?4)",
                        params![id, ctx.workspace_id, normalized_to, now],
                    )?;
                    id
                }
            }
        }
    };

    let conversation_id: String = {
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM conversations WHERE workspace_id = ?1 AND contact_id = ?2 ORDER BY created_at DESC LIMIT 1",
                params![ctx.workspace_id, contact_id],
                |r| r.get(0),
            )
            .optional()?;
        match existing {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO conversations (id, workspace_id, contact_id, status, conversation_type,
                     last_activity_at, started_at, created_at)
                     VALUES (?1, ?2, ?3, 'open', 'business_initiated', ?4, ?4, ?4)",
                    params![id, ctx.workspace_id, contact_id, now],
                )?;
                id
            }
        }
    };

    let template_json = json!({
        "name": template.name,
        "category": template.category,
        "language": template.language,
        "variables": { "header": input.header_vars, "body": input.body_vars, "buttons": input.button_vars },
    })
    .to_string();

    let message_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO messages (id, workspace_id, conversation_id, contact_id, provider_message_id,
         direction, message_type, status, template_json, campaign_id, sent_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'out', 'template', 'sent', ?6, ?7, ?8, ?8)",
        params![
            message_id,
            ctx.workspace_id,
            conversation_id,
            contact_id,
            result.provider_message_id,
            template_json,
            input.campaign_id,
            now,
        ],
    )?;

    conn.execute(
        "INSERT INTO usage_ledger (id, workspace_id, conversation_id, contact_id, direction, template_category, billable, created_at)
         VALUES (?1, ?2, ?3, ?4, 'out', ?5, 1, ?6)",
        params![Uuid::new_v4().to_string(), ctx.workspace_id, conversation_id, contact_id, template.category, now],
    )?;

    conn.execute(
        "UPDATE workspaces SET messages_today = messages_today + 1, messages_month = messages_month + 1, updated_at = ?1
         WHERE id = ?2",
        params![now, ctx.workspace_id],
    )?;

    Ok(SendTemplateOutcome {
        message_id,
        provider_message_id: result.provider_message_id,
    })
}

/// Retry-after for the two calendar-boundary limit errors (§7).
pub fn limit_retry_after(kind: &str, now: chrono::DateTime<chrono::Utc>) -> i64 {
    match kind {
        "daily" => secs_until_midnight_utc(now),
        "monthly" => secs_until_month_boundary_utc(now),
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_leading_zero_with_country_code() {
        assert_eq!(normalize_phone("0987 654 3210", "91").unwrap(), "919876543210");
    }

    #[test]
    fn rejects_short_numbers() {
        assert!(normalize_phone("12345", "91").is_err());
    }

    #[test]
    fn placeholder_count_matches_body_text() {
        assert_eq!(placeholder_count("Hi {{1}}, your order {{2}} shipped."), 2);
    }

    #[test]
    fn variable_arity_mismatch_is_rejected() {
        let result = validate_variable_arity(None, &[], "Hi {{1}}, order {{2}}", &["only one".to_string()]);
        assert!(matches!(result, Err(GatewayError::VariableCountMismatch { expected: 2, got: 1 })));
    }

    #[test]
    fn payload_uses_body_parameters_in_order() {
        let payload = build_provider_payload(
            "suffix1_order_shipped",
            "en_US",
            "919800000000",
            &[],
            false,
            None,
            &["Alex".to_string(), "A123".to_string()],
            &[],
            None,
        );
        assert_eq!(payload["template"]["name"], "suffix1_order_shipped");
        assert_eq!(payload["template"]["components"][0]["type"], "body");
        assert_eq!(payload["template"]["components"][0]["parameters"][0]["text"], "Alex");
    }

    #[test]
    fn static_template_omits_components() {
        let payload = build_provider_payload("suffix1_static", "en_US", "919800000000", &[], false, None, &[], &[], None);
        assert!(payload["template"].get("components").is_none());
    }
}
