//! Entity types for the gateway's data model (spec §3).
//!
//! Every entity other than [`Workspace`] carries an explicit `workspace_id`
//! so cross-tenant queries are always scoped at the type level, not just at
//! the SQL layer.

use serde::{Deserialize, Serialize};

// --- Workspace (tenant) ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Basic,
    Premium,
    Enterprise,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Basic => "basic",
            PlanTier::Premium => "premium",
            PlanTier::Enterprise => "enterprise",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "basic" => PlanTier::Basic,
            "premium" => PlanTier::Premium,
            "enterprise" => PlanTier::Enterprise,
            _ => PlanTier::Free,
        }
    }
}

/// Provider-reported phone health. Ordering matters only insofar as some
/// states block sends (§4.7 step 2); there is no total order across all of
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhoneHealth {
    Pending,
    Connected,
    Disconnected,
    Banned,
    Flagged,
    Restricted,
    RateLimited,
}

impl PhoneHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhoneHealth::Pending => "PENDING",
            PhoneHealth::Connected => "CONNECTED",
            PhoneHealth::Disconnected => "DISCONNECTED",
            PhoneHealth::Banned => "BANNED",
            PhoneHealth::Flagged => "FLAGGED",
            PhoneHealth::Restricted => "RESTRICTED",
            PhoneHealth::RateLimited => "RATE_LIMITED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "CONNECTED" => PhoneHealth::Connected,
            "DISCONNECTED" => PhoneHealth::Disconnected,
            "BANNED" => PhoneHealth::Banned,
            "FLAGGED" => PhoneHealth::Flagged,
            "RESTRICTED" => PhoneHealth::Restricted,
            "RATE_LIMITED" => PhoneHealth::RateLimited,
            _ => PhoneHealth::Pending,
        }
    }

    /// §4.7 step 2: only CONNECTED permits sends; RESTRICTED/FLAGGED permit
    /// reads but block sends; everything else blocks both.
    pub fn blocks_send(&self) -> bool {
        !matches!(self, PhoneHealth::Connected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QualityRating {
    Unknown,
    Red,
    Yellow,
    Green,
}

impl QualityRating {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityRating::Green => "GREEN",
            QualityRating::Yellow => "YELLOW",
            QualityRating::Red => "RED",
            QualityRating::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "GREEN" => QualityRating::Green,
            "YELLOW" => QualityRating::Yellow,
            "RED" => QualityRating::Red,
            _ => QualityRating::Unknown,
        }
    }
}

/// Ordered messaging tier scale (spec §4.9: "messaging tier transitioned
/// downward in the ordered tier scale"). Higher numeric value = higher tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessagingTier(pub i64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub plan_tier: String,
    pub phone_number_id: Option<String>,
    pub display_phone_number: Option<String>,
    pub waba_id: Option<String>,
    pub bsp_connected: bool,
    pub phone_health: String,
    pub quality_rating: String,
    pub messaging_tier: i64,
    pub account_status: String,
    pub decision_status: Option<String>,
    pub capability_blocked: bool,
    pub billing_status: String,
    pub trial_allows_send: bool,
    pub messages_today: i64,
    pub messages_month: i64,
    pub template_submissions_today: i64,
    pub usage_day: String,
    pub usage_month: String,
    pub rate_limit_overrides: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

impl Workspace {
    /// §3 invariant: CONNECTED requires both a phone id and a WABA id.
    pub fn is_connected(&self) -> bool {
        self.bsp_connected && self.phone_number_id.is_some() && self.waba_id.is_some()
    }

    pub fn plan(&self) -> PlanTier {
        PlanTier::parse(&self.plan_tier)
    }

    pub fn health(&self) -> PhoneHealth {
        PhoneHealth::parse(&self.phone_health)
    }

    pub fn quality(&self) -> QualityRating {
        QualityRating::parse(&self.quality_rating)
    }
}

// --- Contact ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub workspace_id: String,
    pub phone: String,
    pub display_name: String,
    pub opted_in: bool,
    pub opt_via: String,
    pub opt_at: String,
    pub tags: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

// --- Conversation ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    CustomerInitiated,
    BusinessInitiated,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationType::CustomerInitiated => "customer_initiated",
            ConversationType::BusinessInitiated => "business_initiated",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub workspace_id: String,
    pub contact_id: String,
    pub status: String,
    pub conversation_type: String,
    pub last_activity_at: String,
    pub last_customer_message_at: Option<String>,
    pub started_at: String,
    pub assigned_agent: Option<String>,
    pub sla_deadline: Option<String>,
    pub created_at: String,
}

impl Conversation {
    /// §4.4 "the 24-hour service window is derived from lastCustomerMessageAt".
    pub fn within_service_window(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        match &self.last_customer_message_at {
            Some(ts) => match chrono::DateTime::parse_from_rfc3339(ts) {
                Ok(last) => now.signed_duration_since(last) < chrono::Duration::hours(24),
                Err(_) => false,
            },
            None => false,
        }
    }
}

// --- Message ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDescriptor {
    pub name: String,
    pub category: String,
    pub language: String,
    pub variables: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRef {
    pub id: String,
    pub mime: String,
    pub sha256: Option<String>,
    pub caption: Option<String>,
    pub filename: Option<String>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub workspace_id: String,
    pub conversation_id: String,
    pub contact_id: String,
    pub provider_message_id: Option<String>,
    pub direction: String,
    pub message_type: String,
    pub body: Option<String>,
    pub status: String,
    pub template: Option<TemplateDescriptor>,
    pub campaign_id: Option<String>,
    pub media: Option<MediaRef>,
    pub failure_reason: Option<String>,
    pub queued_at: Option<String>,
    pub sending_at: Option<String>,
    pub sent_at: Option<String>,
    pub delivered_at: Option<String>,
    pub read_at: Option<String>,
    pub failed_at: Option<String>,
    pub received_at: Option<String>,
    pub created_at: String,
}

/// Forward path §3: `queued -> sending -> sent -> delivered -> read`.
/// `failed` is terminal. Used by the status applier to reject regressions
/// and by the sender to stamp the right timestamp.
pub fn status_rank(status: &str) -> Option<u8> {
    match status {
        "queued" => Some(0),
        "sending" => Some(1),
        "sent" => Some(2),
        "delivered" => Some(3),
        "read" => Some(4),
        _ => None,
    }
}

// --- Template ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TemplateCategory {
    Marketing,
    Utility,
    Authentication,
}

impl TemplateCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateCategory::Marketing => "MARKETING",
            TemplateCategory::Utility => "UTILITY",
            TemplateCategory::Authentication => "AUTHENTICATION",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub language: String,
    pub category: String,
    pub components: serde_json::Value,
    pub status: String,
    pub provider_template_id: Option<String>,
    pub provider_name: String,
    pub rejection_category: Option<String>,
    pub rejection_reason: Option<String>,
    pub original_template_id: Option<String>,
    pub approval_history: serde_json::Value,
    pub last_webhook_event_id: Option<String>,
    pub last_webhook_update: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Template {
    pub fn is_approved(&self) -> bool {
        self.status == "APPROVED"
    }
}

// --- WebhookLog ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookLog {
    pub id: String,
    pub delivery_id: Option<String>,
    pub event_type: String,
    pub workspace_id: Option<String>,
    pub phone_id: Option<String>,
    pub processed: bool,
    pub verified: bool,
    pub bsp_routed: bool,
    pub error: Option<String>,
    pub redacted_payload: serde_json::Value,
    pub created_at: String,
}

// --- Campaign / CampaignMessage ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub workspace_id: String,
    pub status: String,
    pub pause_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignBatch {
    pub id: String,
    pub campaign_id: String,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignMessage {
    pub id: String,
    pub campaign_id: String,
    pub contact_id: String,
    pub status: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl CampaignMessage {
    /// §5: "the campaign message's canRetry predicate is
    /// status==failed AND attempts<maxAttempts".
    pub fn can_retry(&self) -> bool {
        self.status == "failed" && self.attempts < self.max_attempts
    }
}

// --- Usage ledger ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLedgerEntry {
    pub id: String,
    pub workspace_id: String,
    pub conversation_id: Option<String>,
    pub contact_id: Option<String>,
    pub direction: String,
    pub template_category: Option<String>,
    pub billable: bool,
    pub created_at: String,
}

// --- Kill-switch ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchEvent {
    pub id: String,
    pub workspace_id: String,
    pub reason: String,
    pub paused_campaign_ids: Vec<String>,
    pub created_at: String,
    pub ttl_expires_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalKillSwitch {
    pub active: bool,
    pub reason: Option<String>,
    pub actor: Option<String>,
    pub activated_at: Option<String>,
    pub ttl_expires_at: Option<String>,
}

/// §4.9 "Safety query": explicit multi-check structure, not a single bool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSafety {
    pub safe: bool,
    pub global_switch_active: bool,
    pub quality_rating: String,
    pub account_status: String,
    pub capability_blocked: bool,
    pub warnings: Vec<String>,
    pub reason: Option<String>,
}

// --- Auto-reply / FAQ (message ingestor reply cascade, §4.4 step 9) ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordMatchType {
    Exact,
    StartsWith,
    Contains,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoReply {
    pub id: String,
    pub workspace_id: String,
    pub keyword: String,
    pub match_type: String,
    pub template_id: String,
    pub enabled: bool,
    pub order_idx: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Faq {
    pub id: String,
    pub workspace_id: String,
    pub question: String,
    pub variations: Vec<String>,
    pub answer: String,
    pub approved: bool,
    pub match_count: i64,
}
