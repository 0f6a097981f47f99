//! Boundary type for the single upstream provider surface (spec §6.1).
//!
//! Built once and held as managed state, generalizing the teacher's
//! `spawn_dispatcher`-local `reqwest::Client::builder().timeout(...)`
//! construction into a shared client used by both outbound sends and media
//! fetches.

use serde_json::Value;

use crate::error::GatewayError;

pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

#[derive(Debug, Clone)]
pub struct SendResult {
    pub provider_message_id: String,
}

impl ProviderClient {
    pub fn new(base_url: String, access_token: String, timeout: std::time::Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        ProviderClient {
            http,
            base_url,
            access_token,
        }
    }

    /// POST `/<api-version>/<phone_number_id>/messages` (§6.1, §4.7 step 9).
    pub async fn send_template(
        &self,
        phone_number_id: &str,
        payload: &Value,
    ) -> Result<SendResult, GatewayError> {
        self.post_messages(phone_number_id, payload).await
    }

    /// Sends a free-form text message, used by the auto-reply/FAQ reply
    /// cascade (§4.4 step 9a/9b); same transport and error mapping as
    /// template sends, just a different payload shape.
    pub async fn send_text(&self, phone_number_id: &str, to: &str, body: &str) -> Result<SendResult, GatewayError> {
        let payload = serde_json::json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "text",
            "text": { "body": body },
        });
        self.post_messages(phone_number_id, &payload).await
    }

    async fn post_messages(&self, phone_number_id: &str, payload: &Value) -> Result<SendResult, GatewayError> {
        let url = format!("{}/{}/messages", self.base_url, phone_number_id);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(payload)
            .send()
            .await?;

        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);

        if status.is_success() {
            let provider_message_id = body["messages"][0]["id"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            return Ok(SendResult { provider_message_id });
        }

        let code = body["error"]["code"].as_i64().unwrap_or(0);
        let message = body["error"]["message"]
            .as_str()
            .unwrap_or("provider error")
            .to_string();

        // §6.1: 401 or error code 190 -> TOKEN_EXPIRED.
        if status.as_u16() == 401 || code == 190 {
            return Err(GatewayError::TokenExpired);
        }

        Err(GatewayError::MetaApiError { code, message })
    }

    /// Submits a namespaced template to the parent WABA (§4.6, §6.1).
    pub async fn submit_template(
        &self,
        waba_id: &str,
        payload: &Value,
    ) -> Result<(), GatewayError> {
        let url = format!("{}/{}/message_templates", self.base_url, waba_id);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(payload)
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            let code = body["error"]["code"].as_i64().unwrap_or(0);
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("provider error")
                .to_string();
            Err(GatewayError::MetaApiError { code, message })
        }
    }

    /// On-demand media fetch using the central system token (§4.4 step 6).
    pub async fn fetch_media(&self, media_url: &str) -> Result<Vec<u8>, GatewayError> {
        let resp = self
            .http
            .get(media_url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        Ok(resp.bytes().await?.to_vec())
    }
}
