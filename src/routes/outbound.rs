use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{post, State};
use serde::{Deserialize, Serialize};

use crate::collaborators::DefaultBillingGate;
use crate::config::GatewayConfig;
use crate::db::Db;
use crate::error::GatewayError;
use crate::outbound::{send_template as send_template_pipeline, RequestContext, SendTemplateInput};
use crate::provider::ProviderClient;
use crate::rate_limit::RateLimiter;
use crate::routes::WorkspaceId;

#[derive(Debug, Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct SendTemplateRequest {
    pub template_id: Option<String>,
    pub template_name: Option<String>,
    pub to: String,
    #[serde(default)]
    pub header_vars: Vec<String>,
    #[serde(default)]
    pub body_vars: Vec<String>,
    #[serde(default)]
    pub button_vars: Vec<String>,
    pub contact_id: Option<String>,
    pub campaign_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct SendTemplateResponse {
    pub message_id: String,
    pub provider_message_id: String,
}

#[post("/v1/messages/template", data = "<body>")]
pub async fn send_template(
    workspace: WorkspaceId,
    body: Json<SendTemplateRequest>,
    db: &State<Db>,
    provider: &State<Arc<ProviderClient>>,
    rate_limiter: &State<Arc<RateLimiter>>,
    config: &State<GatewayConfig>,
) -> Result<Json<SendTemplateResponse>, GatewayError> {
    let ctx = RequestContext { workspace_id: workspace.0 };
    let billing_gate = DefaultBillingGate;
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());

    let input = SendTemplateInput {
        template_id: body.template_id.clone(),
        template_name: body.template_name.clone(),
        to: body.to.clone(),
        header_vars: body.header_vars.clone(),
        body_vars: body.body_vars.clone(),
        button_vars: body.button_vars.clone(),
        contact_id: body.contact_id.clone(),
        campaign_id: body.campaign_id.clone(),
    };

    let outcome = send_template_pipeline(
        &conn,
        provider.inner().as_ref(),
        rate_limiter.inner().as_ref(),
        &billing_gate,
        &ctx,
        &config.default_country_code(),
        input,
    )
    .await?;

    Ok(Json(SendTemplateResponse {
        message_id: outcome.message_id,
        provider_message_id: outcome.provider_message_id,
    }))
}
