//! Event dispatcher & workers (spec §4.2).
//!
//! Generalizes the teacher's `webhooks::spawn_dispatcher` (a `tokio::spawn`
//! loop draining a `broadcast::Receiver<ChatEvent>` and firing outbound
//! HTTP calls) to an at-least-once `tokio::sync::mpsc` queue of admitted
//! webhook payloads, classified into a tagged `ChangeObject` variant per
//! spec §9's "implicit polymorphism -> tagged variant" guidance instead of
//! duck-typed field probing.

use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::db::Db;

/// A dispatch job handler. Boxed-future return lets `spawn_dispatcher` stay
/// generic over whatever async work a job needs (provider calls, DB I/O)
/// without making the dispatcher itself generic over a handler type.
pub type ProcessJob = Arc<dyn Fn(Arc<Db>, DispatchJob) -> Pin<Box<dyn Future<Output = JobOutcome> + Send>> + Send + Sync>;

/// One admitted webhook payload awaiting processing.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub body: Vec<u8>,
    pub signature_header: Option<String>,
    pub delivery_id: Option<String>,
    pub attempt: u32,
}

/// Tagged classification of a single `changes[].value` change object
/// (spec §4.2). The dispatcher performs this match once per change object;
/// handlers never duck-type-probe the payload.
#[derive(Debug, Clone)]
pub enum ChangeObject {
    Message { phone_number_id: Option<String>, value: Value },
    Status { phone_number_id: Option<String>, value: Value },
    TemplateStatus { value: Value },
    AccountUpdate { phone_number_id: Option<String>, value: Value },
    BusinessCapabilityUpdate { phone_number_id: Option<String>, value: Value },
    AdUpdate { kind: AdUpdateKind, value: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdUpdateKind {
    AdReview,
    AdStatusUpdate,
    AccountDisabled,
}

/// Classifies a single `value` object from `entry[].changes[]` into a
/// [`ChangeObject`]. Returns `None` for a `value` this version doesn't
/// recognize (it will surface as `UNROUTED_EVENT` upstream).
pub fn classify_change(field: &str, value: &Value) -> Option<ChangeObject> {
    let phone_number_id = value["metadata"]["phone_number_id"]
        .as_str()
        .map(|s| s.to_string());

    if value.get("messages").is_some() {
        return Some(ChangeObject::Message { phone_number_id, value: value.clone() });
    }
    if value.get("statuses").is_some() {
        return Some(ChangeObject::Status { phone_number_id, value: value.clone() });
    }
    if value.get("message_template_status_update").is_some() || field == "message_template_status_update" {
        return Some(ChangeObject::TemplateStatus { value: value.clone() });
    }
    if value.get("account_update").is_some() || field == "account_update" {
        return Some(ChangeObject::AccountUpdate { phone_number_id, value: value.clone() });
    }
    if value.get("business_capability_update").is_some() || field == "business_capability_update" {
        return Some(ChangeObject::BusinessCapabilityUpdate {
            phone_number_id,
            value: value.clone(),
        });
    }
    match field {
        "ad_review" => Some(ChangeObject::AdUpdate { kind: AdUpdateKind::AdReview, value: value.clone() }),
        "ad_status_update" => {
            Some(ChangeObject::AdUpdate { kind: AdUpdateKind::AdStatusUpdate, value: value.clone() })
        }
        "account_disabled" => {
            Some(ChangeObject::AdUpdate { kind: AdUpdateKind::AccountDisabled, value: value.clone() })
        }
        _ => None,
    }
}

/// Distinguishes retryable provider/DB transients from terminal validation
/// or ownership errors (spec §9 "queue worker retry semantics").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Processed,
    Dropped,
    Retryable,
    Terminal,
}

pub const MAX_SEND_ATTEMPTS: u32 = 5;
pub const MAX_WORKFLOW_ATTEMPTS: u32 = 3;

/// Exponential backoff with jitter, grounded in svix-webhooks'
/// `worker.rs` retry schedule (`JITTER_DELTA` jitter fraction applied to a
/// doubling base delay).
const JITTER_DELTA: f64 = 0.2;

pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt as i32);
    // Deterministic "jitter" derived from the attempt number rather than a
    // random source, since workflow scripts and tests must not call
    // `rand`/`Instant::now()`-seeded RNGs for reproducibility.
    let jitter_frac = JITTER_DELTA * ((attempt % 5) as f64 / 5.0);
    Duration::from_secs_f64(exp * (1.0 + jitter_frac))
}

pub struct DispatchQueue {
    sender: mpsc::Sender<DispatchJob>,
}

impl DispatchQueue {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<DispatchJob>) {
        let (sender, receiver) = mpsc::channel(buffer);
        (DispatchQueue { sender }, receiver)
    }

    pub async fn enqueue(&self, job: DispatchJob) -> Result<(), mpsc::error::SendError<DispatchJob>> {
        self.sender.send(job).await
    }
}

/// Pre-check against `WebhookLog` for `(deliveryId, eventType)` idempotency
/// (spec §4.2, §5). Returns `true` if this pair has already been processed
/// and the job should be dropped.
pub fn already_processed(db: &Db, delivery_id: &str, event_type: &str) -> bool {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    conn.query_row(
        "SELECT 1 FROM webhook_logs WHERE delivery_id = ?1 AND event_type = ?2 AND processed = 1",
        rusqlite::params![delivery_id, event_type],
        |_| Ok(()),
    )
    .is_ok()
}

/// Spawns the worker loop draining the dispatch queue. Mirrors the
/// teacher's `spawn_dispatcher` shape: a single `tokio::spawn`ed loop
/// owning its own DB connection and HTTP client reference.
pub fn spawn_dispatcher(mut receiver: mpsc::Receiver<DispatchJob>, db: Arc<Db>, process_job: ProcessJob) {
    tokio::spawn(async move {
        while let Some(mut job) = receiver.recv().await {
            loop {
                let outcome = process_job(db.clone(), job.clone()).await;
                match outcome {
                    JobOutcome::Processed | JobOutcome::Dropped | JobOutcome::Terminal => break,
                    JobOutcome::Retryable => {
                        job.attempt += 1;
                        if job.attempt >= MAX_SEND_ATTEMPTS {
                            tracing::warn!(
                                delivery_id = job.delivery_id.as_deref().unwrap_or(""),
                                "dispatch job exhausted retry budget"
                            );
                            break;
                        }
                        let delay = backoff_delay(job.attempt, Duration::from_millis(500));
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_message_change() {
        let value = json!({
            "metadata": { "phone_number_id": "PN1" },
            "messages": [{"id": "wamid.1"}]
        });
        let change = classify_change("messages", &value).unwrap();
        matches!(change, ChangeObject::Message { .. });
    }

    #[test]
    fn classifies_ad_review_by_field_name() {
        let value = json!({});
        let change = classify_change("ad_review", &value).unwrap();
        assert!(matches!(
            change,
            ChangeObject::AdUpdate { kind: AdUpdateKind::AdReview, .. }
        ));
    }

    #[test]
    fn unrecognized_field_returns_none() {
        assert!(classify_change("something_else", &json!({})).is_none());
    }

    #[test]
    fn backoff_grows_with_attempt() {
        let d0 = backoff_delay(0, Duration::from_millis(500));
        let d3 = backoff_delay(3, Duration::from_millis(500));
        assert!(d3 > d0);
    }
}
