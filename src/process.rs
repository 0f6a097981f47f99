//! Routes a classified webhook change object to its handler (spec §4.2).
//!
//! This is the concrete `ProcessJob` the dispatcher drains its queue with;
//! `ingress.rs`/`webhook.rs` only admit and enqueue, `dispatcher.rs` only
//! retries, and this module is where classification meets domain logic.

use rusqlite::OptionalExtension;
use serde_json::Value;
use std::sync::Arc;

use crate::account_reactor::{apply_account_update, apply_capability_update, AccountUpdate, Capability};
use crate::cache::TenantRouter;
use crate::collaborators::{DefaultOptKeywordHandler, LoggingWorkflowSink};
use crate::config::GatewayConfig;
use crate::db::Db;
use crate::dispatcher::{already_processed, classify_change, ChangeObject, DispatchJob, JobOutcome};
use crate::events::EventBus;
use crate::ingestor::{ingest_message, run_reply_cascade, InboundMessage};
use crate::killswitch::{detect_trigger, pause_campaigns_for_workspace, HealthTransition};
use crate::models::QualityRating;
use crate::provider::ProviderClient;
use crate::rate_limit::RateLimiter;
use crate::status_applier::{apply_status, StatusUpdate};
use crate::template_machine::{apply_template_status_update, split_provider_template_name};

/// Shared state the router needs beyond the raw `Db` connection the
/// dispatcher already threads through.
pub struct RouterDeps {
    pub events: Arc<EventBus>,
    pub tenant_router: Arc<TenantRouter>,
    pub provider: Arc<ProviderClient>,
    pub rate_limiter: Arc<RateLimiter>,
    pub config: Arc<GatewayConfig>,
}

fn resolve_by_phone_id(conn: &rusqlite::Connection, router: &TenantRouter, phone_number_id: &str) -> Option<String> {
    if let Some(cached) = router.get(phone_number_id) {
        return cached;
    }
    let found: Option<String> = conn
        .query_row("SELECT id FROM workspaces WHERE phone_number_id = ?1", rusqlite::params![phone_number_id], |r| r.get(0))
        .ok();
    match &found {
        Some(id) => router.put_hit(phone_number_id, id),
        None => router.put_miss(phone_number_id),
    }
    found
}

/// Resolves the owning workspace for a template-status event lacking a
/// phone id, by the template-name tenant prefix (§4.2, §6.2).
fn resolve_by_template_prefix(conn: &rusqlite::Connection, provider_name: Option<&str>) -> Option<String> {
    let provider_name = provider_name?;
    let (suffix, _local) = split_provider_template_name(provider_name)?;
    conn.query_row(
        "SELECT id FROM workspaces WHERE substr(id, -8) = ?1",
        rusqlite::params![suffix],
        |r| r.get(0),
    )
    .optional()
    .ok()
    .flatten()
}

fn mark_processed(conn: &rusqlite::Connection, delivery_id: Option<&str>, event_type: &str) {
    if let Some(id) = delivery_id {
        let _ = conn.execute(
            "UPDATE webhook_logs SET processed = 1 WHERE delivery_id = ?1 AND event_type = ?2",
            rusqlite::params![id, event_type],
        );
    }
}

/// Builds the concrete [`crate::dispatcher::ProcessJob`] closure for
/// `spawn_dispatcher`, closing over the shared deps it needs.
pub fn build_process_job(deps: Arc<RouterDeps>) -> crate::dispatcher::ProcessJob {
    Arc::new(move |db: Arc<Db>, job: DispatchJob| {
        let deps = deps.clone();
        Box::pin(async move { process_job(&deps, &db, &job).await })
    })
}

async fn process_job(deps: &RouterDeps, db: &Db, job: &DispatchJob) -> JobOutcome {
    let envelope: Value = match serde_json::from_slice(&job.body) {
        Ok(v) => v,
        Err(_) => return JobOutcome::Terminal,
    };

    let entries = envelope["entry"].as_array().cloned().unwrap_or_default();
    let mut any_retryable = false;

    for entry in entries {
        let changes = entry["changes"].as_array().cloned().unwrap_or_default();
        for change in changes {
            let field = change["field"].as_str().unwrap_or("").to_string();
            let value = change["value"].clone();
            let Some(object) = classify_change(&field, &value) else { continue };
            let event_type = event_type_label(&object);

            if let Some(delivery_id) = &job.delivery_id
                && already_processed(db, delivery_id, event_type)
            {
                continue;
            }

            let outcome = route_change(deps, db, object).await;
            match outcome {
                JobOutcome::Retryable => any_retryable = true,
                _ => {
                    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
                    mark_processed(&conn, job.delivery_id.as_deref(), event_type);
                }
            }
        }
    }

    if any_retryable {
        JobOutcome::Retryable
    } else {
        JobOutcome::Processed
    }
}

fn event_type_label(object: &ChangeObject) -> &'static str {
    match object {
        ChangeObject::Message { .. } => "message",
        ChangeObject::Status { .. } => "status",
        ChangeObject::TemplateStatus { .. } => "template_status",
        ChangeObject::AccountUpdate { .. } => "account_update",
        ChangeObject::BusinessCapabilityUpdate { .. } => "business_capability_update",
        ChangeObject::AdUpdate { .. } => "ad_update",
    }
}

async fn route_change(deps: &RouterDeps, db: &Db, object: ChangeObject) -> JobOutcome {
    match object {
        ChangeObject::Message { phone_number_id, value } => route_message(deps, db, phone_number_id, value).await,
        ChangeObject::Status { phone_number_id, value } => route_status(deps, db, phone_number_id, value),
        ChangeObject::TemplateStatus { value } => route_template_status(deps, db, value),
        ChangeObject::AccountUpdate { phone_number_id, value } => route_account_update(deps, db, phone_number_id, value),
        ChangeObject::BusinessCapabilityUpdate { phone_number_id, value } => {
            route_capability_update(deps, db, phone_number_id, value)
        }
        ChangeObject::AdUpdate { kind, value } => {
            tracing::info!(?kind, "ad update received, no-op (out of scope)");
            let _ = value;
            JobOutcome::Dropped
        }
    }
}

async fn route_message(deps: &RouterDeps, db: &Db, phone_number_id: Option<String>, value: Value) -> JobOutcome {
    let Some(phone_number_id) = phone_number_id else { return JobOutcome::Terminal };
    let workspace_id = {
        let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
        resolve_by_phone_id(&conn, &deps.tenant_router, &phone_number_id)
    };
    let Some(workspace_id) = workspace_id else { return JobOutcome::Terminal };

    let Some(messages) = value["messages"].as_array().cloned() else { return JobOutcome::Dropped };
    let opt_handler = DefaultOptKeywordHandler::new();
    let workflow = LoggingWorkflowSink;

    for message in messages {
        let phone = message["from"].as_str().unwrap_or_default().to_string();
        let provider_message_id = message["id"].as_str().map(|s| s.to_string());
        let message_type = message["type"].as_str().unwrap_or("text").to_string();
        let body = message["text"]["body"].as_str().map(|s| s.to_string());
        let media_json = message.get(message_type.as_str()).cloned();

        let inbound = InboundMessage {
            phone: phone.clone(),
            provider_message_id,
            message_type,
            body: body.clone(),
            media_json,
        };

        let ingested = {
            let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
            ingest_message(&conn, &deps.events, &opt_handler, &workflow, &workspace_id, inbound)
        };
        let outcome = match ingested {
            Ok(out) => out,
            Err(_) => return JobOutcome::Retryable,
        };
        if outcome.opted_out {
            continue;
        }

        let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = run_reply_cascade(
            &conn,
            &deps.provider,
            &deps.rate_limiter,
            &deps.events,
            &workspace_id,
            &outcome.contact_id,
            &phone,
            body.as_deref(),
            &deps.config.default_country_code(),
            deps.config.faq_match_threshold,
        )
        .await
        {
            tracing::warn!(workspace_id, error = %e, "reply cascade failed, message already ingested");
        }
    }

    JobOutcome::Processed
}

fn route_status(deps: &RouterDeps, db: &Db, phone_number_id: Option<String>, value: Value) -> JobOutcome {
    let workspace_id = phone_number_id.and_then(|id| {
        let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
        resolve_by_phone_id(&conn, &deps.tenant_router, &id)
    });

    let Some(statuses) = value["statuses"].as_array().cloned() else { return JobOutcome::Dropped };
    let workflow = LoggingWorkflowSink;
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());

    for status in statuses {
        let provider_message_id = match status["id"].as_str() {
            Some(id) => id,
            None => continue,
        };
        let status_value = status["status"].as_str().unwrap_or("");
        let failure_reason = status["errors"][0]["title"].as_str();
        let event_time = status["timestamp"]
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0));

        let update = StatusUpdate {
            provider_message_id,
            status: status_value,
            failure_reason,
            event_time,
        };
        if let Err(e) = apply_status(&conn, &deps.events, &workflow, workspace_id.as_deref(), update) {
            tracing::warn!(error = %e, "status apply failed");
            return JobOutcome::Retryable;
        }
    }
    JobOutcome::Processed
}

fn route_template_status(deps: &RouterDeps, db: &Db, value: Value) -> JobOutcome {
    let provider_template_id = value["message_template_id"].as_str().map(|s| s.to_string());
    let provider_template_name = value["message_template_name"].as_str().map(|s| s.to_string());
    let event = value["event"].as_str().unwrap_or("").to_string();
    let event_id = value["message_template_id"].as_str().map(|s| s.to_string());
    let reason = value["reason"].as_str().map(|s| s.to_string());

    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    match apply_template_status_update(
        &conn,
        &deps.events,
        provider_template_id.as_deref(),
        provider_template_name.as_deref(),
        &event,
        event_id.as_deref(),
        reason.as_deref(),
    ) {
        Ok(Some(_)) => JobOutcome::Processed,
        Ok(None) => JobOutcome::Terminal,
        Err(e) => {
            tracing::warn!(error = %e, "template status reconciliation failed");
            JobOutcome::Retryable
        }
    }
}

/// Health fields `detect_trigger` needs a before/after pair of, snapshotted
/// around an account/capability update so the kill-switch reactor sees the
/// same transition the webhook just caused.
struct HealthSnapshot {
    quality_rating: String,
    messaging_tier: i64,
    account_status: String,
    decision_status: String,
    capability_blocked: bool,
}

fn health_snapshot(conn: &rusqlite::Connection, workspace_id: &str) -> HealthSnapshot {
    conn.query_row(
        "SELECT quality_rating, messaging_tier, account_status, decision_status, capability_blocked
         FROM workspaces WHERE id = ?1",
        rusqlite::params![workspace_id],
        |r| {
            Ok(HealthSnapshot {
                quality_rating: r.get(0)?,
                messaging_tier: r.get(1)?,
                account_status: r.get(2)?,
                decision_status: r.get::<_, Option<String>>(3)?.unwrap_or_default(),
                capability_blocked: r.get::<_, i64>(4)? != 0,
            })
        },
    )
    .unwrap_or(HealthSnapshot {
        quality_rating: "UNKNOWN".to_string(),
        messaging_tier: 0,
        account_status: "active".to_string(),
        decision_status: String::new(),
        capability_blocked: false,
    })
}

/// Fires the kill-switch reactor (§4.9 "Triggers") off a before/after health
/// snapshot, pausing running campaigns when `detect_trigger` finds a match.
fn react_to_health_transition(
    deps: &RouterDeps,
    conn: &rusqlite::Connection,
    workspace_id: &str,
    before: &HealthSnapshot,
    after: &HealthSnapshot,
) {
    let transition = HealthTransition {
        quality_before: QualityRating::parse(&before.quality_rating),
        quality_after: QualityRating::parse(&after.quality_rating),
        tier_before: before.messaging_tier,
        tier_after: after.messaging_tier,
        account_blocked: matches!(after.account_status.as_str(), "disabled" | "suspended"),
        capability_revoked: after.capability_blocked,
        decision_status_before: before.decision_status.clone(),
        decision_status_after: after.decision_status.clone(),
    };
    let Some(reason) = detect_trigger(&transition) else { return };
    match pause_campaigns_for_workspace(conn, workspace_id, reason, deps.config.workspace_killswitch_ttl_days) {
        Ok(paused) => {
            if !paused.is_empty() {
                tracing::warn!(workspace_id, reason = reason.as_str(), ?paused, "kill-switch triggered by health transition");
            }
        }
        Err(e) => tracing::warn!(workspace_id, error = %e, "failed to pause campaigns after kill-switch trigger"),
    }
}

fn route_account_update(deps: &RouterDeps, db: &Db, phone_number_id: Option<String>, value: Value) -> JobOutcome {
    let Some(phone_number_id) = phone_number_id else { return JobOutcome::Terminal };
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let workspace_id: Option<String> = conn
        .query_row(
            "SELECT id FROM workspaces WHERE phone_number_id = ?1",
            rusqlite::params![phone_number_id],
            |r| r.get(0),
        )
        .optional()
        .ok()
        .flatten();
    let Some(workspace_id) = workspace_id else { return JobOutcome::Terminal };

    let before = health_snapshot(&conn, &workspace_id);
    let update = AccountUpdate {
        phone_status: value["phone_number_quality_update"]["current_limit"].as_str().map(|s| s.to_string()),
        decision_status: value["decision"].as_str().map(|s| s.to_string()),
        account_status: value["account_status"].as_str().map(|s| s.to_string()),
        quality_rating: value["current_quality_rating"].as_str().map(|s| s.to_string()),
    };
    if apply_account_update(&conn, &workspace_id, update).is_err() {
        return JobOutcome::Terminal;
    }
    let after = health_snapshot(&conn, &workspace_id);
    react_to_health_transition(deps, &conn, &workspace_id, &before, &after);
    JobOutcome::Processed
}

fn route_capability_update(deps: &RouterDeps, db: &Db, phone_number_id: Option<String>, value: Value) -> JobOutcome {
    let Some(phone_number_id) = phone_number_id else { return JobOutcome::Terminal };
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let workspace_id: Option<String> = conn
        .query_row(
            "SELECT id FROM workspaces WHERE phone_number_id = ?1",
            rusqlite::params![phone_number_id],
            |r| r.get(0),
        )
        .optional()
        .ok()
        .flatten();
    let Some(workspace_id) = workspace_id else { return JobOutcome::Terminal };

    let before = health_snapshot(&conn, &workspace_id);
    let capability = Capability::parse(value["capability"].as_str().unwrap_or(""));
    let status = value["status"].as_str().unwrap_or("");
    if apply_capability_update(&conn, &workspace_id, capability, status).is_err() {
        return JobOutcome::Terminal;
    }
    let after = health_snapshot(&conn, &workspace_id);
    react_to_health_transition(deps, &conn, &workspace_id, &before, &after);
    JobOutcome::Processed
}
