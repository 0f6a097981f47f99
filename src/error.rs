//! Unified error type for the gateway (spec §7).
//!
//! Generalizes the teacher's ad hoc `(Status, Json<Value>)` route return
//! tuples into one `thiserror` enum that implements `Responder` directly, so
//! every handler can return `Result<T, GatewayError>`.

use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::json;
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing signature header")]
    MissingSignature,

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("duplicate delivery")]
    Replay,

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("no workspace routes this event")]
    UnroutedEvent,

    #[error("template not found")]
    TemplateNotFound,

    #[error("template is not approved")]
    TemplateNotApproved,

    #[error("template belongs to a different workspace")]
    TemplateOwnershipMismatch,

    #[error("expected {expected} variables, got {got}")]
    VariableCountMismatch { expected: usize, got: usize },

    #[error("missing required variables: {0:?}")]
    MissingRequiredVariables(Vec<String>),

    #[error("invalid recipient phone number")]
    InvalidRecipient,

    #[error("contact has opted out")]
    OptedOut,

    #[error("trial plan does not allow sending")]
    BillingTrialNoSend,

    #[error("billing account is past due")]
    BillingPastDue,

    #[error("billing account is suspended")]
    BillingSuspended,

    #[error("phone number is banned")]
    PhoneBanned,

    #[error("phone number is disconnected")]
    PhoneDisconnected,

    #[error("phone number is rate limited by the provider")]
    PhoneRateLimited { retry_after_secs: i64 },

    #[error("rate limit exceeded")]
    RateLimitExceeded { limit_kind: String, retry_after_secs: i64 },

    #[error("daily message limit exceeded")]
    DailyLimitExceeded,

    #[error("monthly message limit exceeded")]
    MonthlyLimitExceeded,

    #[error("template submission limit exceeded")]
    TemplateLimitExceeded,

    #[error("provider access token expired")]
    TokenExpired,

    #[error("provider API error: {code} {message}")]
    MetaApiError { code: i64, message: String },

    #[error("workspace is not configured")]
    WorkspaceNotConfigured,

    #[error("workspace has no connected phone number")]
    PhoneNotConfigured,

    #[error("not found")]
    NotFound,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Internal(e.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Internal(e.to_string())
    }
}

impl GatewayError {
    /// Stable machine-readable code, independent of the Display message.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::MissingSignature => "MISSING_SIGNATURE",
            GatewayError::InvalidSignature => "INVALID_SIGNATURE",
            GatewayError::Replay => "REPLAY",
            GatewayError::ConfigError(_) => "CONFIG_ERROR",
            GatewayError::UnroutedEvent => "UNROUTED_EVENT",
            GatewayError::TemplateNotFound => "TEMPLATE_NOT_FOUND",
            GatewayError::TemplateNotApproved => "TEMPLATE_NOT_APPROVED",
            GatewayError::TemplateOwnershipMismatch => "TEMPLATE_OWNERSHIP_MISMATCH",
            GatewayError::VariableCountMismatch { .. } => "VARIABLE_COUNT_MISMATCH",
            GatewayError::MissingRequiredVariables(_) => "MISSING_REQUIRED_VARIABLES",
            GatewayError::InvalidRecipient => "INVALID_RECIPIENT",
            GatewayError::OptedOut => "OPTED_OUT",
            GatewayError::BillingTrialNoSend => "BILLING_TRIAL_NO_SEND",
            GatewayError::BillingPastDue => "BILLING_PAST_DUE",
            GatewayError::BillingSuspended => "BILLING_SUSPENDED",
            GatewayError::PhoneBanned => "PHONE_BANNED",
            GatewayError::PhoneDisconnected => "PHONE_DISCONNECTED",
            GatewayError::PhoneRateLimited { .. } => "PHONE_RATE_LIMITED",
            GatewayError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            GatewayError::DailyLimitExceeded => "DAILY_LIMIT_EXCEEDED",
            GatewayError::MonthlyLimitExceeded => "MONTHLY_LIMIT_EXCEEDED",
            GatewayError::TemplateLimitExceeded => "TEMPLATE_LIMIT_EXCEEDED",
            GatewayError::TokenExpired => "TOKEN_EXPIRED",
            GatewayError::MetaApiError { .. } => "META_API_ERROR",
            GatewayError::WorkspaceNotConfigured => "WORKSPACE_NOT_CONFIGURED",
            GatewayError::PhoneNotConfigured => "PHONE_NOT_CONFIGURED",
            GatewayError::NotFound => "NOT_FOUND",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> Status {
        match self {
            GatewayError::MissingSignature
            | GatewayError::InvalidSignature => Status::Unauthorized,
            GatewayError::Replay => Status::Conflict,
            GatewayError::NotFound
            | GatewayError::TemplateNotFound
            | GatewayError::WorkspaceNotConfigured
            | GatewayError::PhoneNotConfigured => Status::NotFound,
            GatewayError::TemplateOwnershipMismatch => Status::Forbidden,
            GatewayError::RateLimitExceeded { .. }
            | GatewayError::DailyLimitExceeded
            | GatewayError::MonthlyLimitExceeded
            | GatewayError::TemplateLimitExceeded
            | GatewayError::PhoneRateLimited { .. } => Status::TooManyRequests,
            GatewayError::TemplateNotApproved
            | GatewayError::VariableCountMismatch { .. }
            | GatewayError::MissingRequiredVariables(_)
            | GatewayError::InvalidRecipient
            | GatewayError::OptedOut
            | GatewayError::BillingTrialNoSend
            | GatewayError::BillingPastDue
            | GatewayError::BillingSuspended
            | GatewayError::PhoneBanned
            | GatewayError::PhoneDisconnected
            | GatewayError::UnroutedEvent => Status::UnprocessableEntity,
            GatewayError::TokenExpired => Status::Unauthorized,
            GatewayError::MetaApiError { .. } => Status::BadGateway,
            GatewayError::ConfigError(_) | GatewayError::Internal(_) => Status::InternalServerError,
        }
    }
}

impl<'r> Responder<'r, 'static> for GatewayError {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        let mut body = json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        if let GatewayError::RateLimitExceeded { retry_after_secs, .. }
        | GatewayError::PhoneRateLimited { retry_after_secs } = &self
        {
            body["retryAfterSecs"] = json!(retry_after_secs);
        }
        if let GatewayError::MetaApiError { code, .. } = &self {
            body["providerErrorCode"] = json!(code);
        }
        let bytes = serde_json::to_vec(&body).unwrap_or_default();
        Response::build()
            .status(status)
            .header(rocket::http::ContentType::JSON)
            .sized_body(bytes.len(), Cursor::new(bytes))
            .ok()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
