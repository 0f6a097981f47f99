//! Route module decomposition, following the teacher's layout: shared
//! request guards live here, route functions in submodules.

mod admin;
mod outbound;
mod system;
mod webhook;

pub use admin::{activate_global_killswitch, deactivate_global_killswitch, workspace_safety};
pub use outbound::send_template;
pub use system::{health, not_found, too_many_requests};
pub use webhook::{handle_webhook, verify_webhook};

use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};

/// Bearer or `X-Admin-Key` guard for the manual kill-switch endpoints,
/// mirroring the teacher's `AdminKey` guard.
pub struct AdminKey(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminKey {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        if let Some(auth) = req.headers().get_one("Authorization")
            && let Some(key) = auth.strip_prefix("Bearer ")
        {
            return Outcome::Success(AdminKey(key.to_string()));
        }
        if let Some(key) = req.headers().get_one("X-Admin-Key") {
            return Outcome::Success(AdminKey(key.to_string()));
        }
        Outcome::Forward(Status::Unauthorized)
    }
}

/// Workspace id extracted from `X-Workspace-Id`, standing in for the
/// application-layer auth/session lookup that is out of scope (spec §1).
pub struct WorkspaceId(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for WorkspaceId {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match req.headers().get_one("X-Workspace-Id") {
            Some(id) => Outcome::Success(WorkspaceId(id.to_string())),
            None => Outcome::Forward(Status::Unauthorized),
        }
    }
}

/// `x-hub-signature-256` and `x-delivery-id` headers, extracted ahead of
/// the raw body read in [`webhook::handle_webhook`].
pub struct WebhookHeaders {
    pub signature: Option<String>,
    pub delivery_id: Option<String>,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for WebhookHeaders {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(WebhookHeaders {
            signature: req.headers().get_one("x-hub-signature-256").map(|s| s.to_string()),
            delivery_id: req.headers().get_one("x-delivery-id").map(|s| s.to_string()),
        })
    }
}
