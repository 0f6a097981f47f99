//! End-to-end route tests against a live `rocket::build()` instance,
//! following the teacher's `tests/integration.rs` pattern: each test gets
//! its own isolated temp-file database via `GatewayConfig::for_tests()`.

use hmac::{Hmac, Mac};
use rocket::http::{Header, Status};
use rocket::local::blocking::Client;
use sha2::Sha256;

use bsp_gateway::config::GatewayConfig;
use bsp_gateway::db::Db;

type HmacSha256 = Hmac<Sha256>;

const SIGNING_SECRET: &str = "test_signing_secret";

fn test_config() -> GatewayConfig {
    GatewayConfig::for_tests()
}

fn test_client(config: GatewayConfig) -> (Client, String) {
    let db_path = config.database_path.clone();
    let rocket = bsp_gateway::rocket_with_config(config);
    (Client::tracked(rocket).expect("valid rocket instance"), db_path)
}

fn sign(body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(SIGNING_SECRET.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn seed_workspace(db_path: &str, workspace_id: &str, phone_number_id: &str) {
    let db = Db::new(db_path).expect("open seed connection");
    let conn = db.conn.lock().unwrap();
    conn.execute(
        "INSERT INTO workspaces (id, name, phone_number_id, bsp_connected, phone_health, plan_tier, created_at, updated_at)
         VALUES (?1, 'acme', ?2, 1, 'CONNECTED', 'free', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
        rusqlite::params![workspace_id, phone_number_id],
    )
    .unwrap();
}

fn seed_template(db_path: &str, id: &str, workspace_id: &str, name: &str, status: &str) {
    let db = Db::new(db_path).expect("open seed connection");
    let conn = db.conn.lock().unwrap();
    conn.execute(
        "INSERT INTO templates (id, workspace_id, name, language, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'en_US', ?4, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
        rusqlite::params![id, workspace_id, name, status],
    )
    .unwrap();
}

// --- Health ---

#[test]
fn health_reports_ok() {
    let (client, _) = test_client(test_config());
    let res = client.get("/health").dispatch();
    assert_eq!(res.status(), Status::Ok);
}

// --- Webhook admission (spec §4.1) ---

#[test]
fn webhook_missing_signature_is_rejected() {
    let (client, _) = test_client(test_config());
    let res = client
        .post("/webhook")
        .header(Header::new("x-delivery-id", "d-1"))
        .body(r#"{"entry":[]}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["error"], "MISSING_SIGNATURE");
}

#[test]
fn webhook_invalid_signature_is_rejected() {
    let (client, _) = test_client(test_config());
    let body = r#"{"entry":[]}"#;
    let res = client
        .post("/webhook")
        .header(Header::new("x-hub-signature-256", "sha256=deadbeef"))
        .header(Header::new("x-delivery-id", "d-2"))
        .body(body)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
    let json: serde_json::Value = res.into_json().unwrap();
    assert_eq!(json["error"], "INVALID_SIGNATURE");
}

#[test]
fn webhook_valid_signature_is_admitted() {
    let (client, _) = test_client(test_config());
    let body = r#"{"entry":[]}"#;
    let res = client
        .post("/webhook")
        .header(Header::new("x-hub-signature-256", sign(body.as_bytes())))
        .header(Header::new("x-delivery-id", "d-3"))
        .body(body)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn webhook_replayed_delivery_id_is_rejected() {
    let (client, _) = test_client(test_config());
    let body = r#"{"entry":[]}"#;
    let first = client
        .post("/webhook")
        .header(Header::new("x-hub-signature-256", sign(body.as_bytes())))
        .header(Header::new("x-delivery-id", "d-replay"))
        .body(body)
        .dispatch();
    assert_eq!(first.status(), Status::Ok);

    let second = client
        .post("/webhook")
        .header(Header::new("x-hub-signature-256", sign(body.as_bytes())))
        .header(Header::new("x-delivery-id", "d-replay"))
        .body(body)
        .dispatch();
    assert_eq!(second.status(), Status::Forbidden);
    let json: serde_json::Value = second.into_json().unwrap();
    assert_eq!(json["error"], "REPLAY");
}

#[test]
fn webhook_verify_challenge_echoes_on_matching_token() {
    let (client, _) = test_client(test_config());
    let res = client
        .get(format!(
            "/webhook?hub_mode=subscribe&hub_verify_token={SIGNING_SECRET}&hub_challenge=ping-123"
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    assert_eq!(res.into_string().unwrap(), "ping-123");
}

#[test]
fn webhook_verify_challenge_rejects_wrong_token() {
    let (client, _) = test_client(test_config());
    let res = client
        .get("/webhook?hub_mode=subscribe&hub_verify_token=wrong&hub_challenge=ping-123")
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}

// --- Admin kill-switch (spec §4.9) ---

#[test]
fn killswitch_activate_requires_admin_key() {
    let (client, _) = test_client(test_config());
    let res = client.post("/v1/admin/killswitch/global/activate").dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}

#[test]
fn killswitch_activate_then_deactivate_round_trips() {
    let (client, _) = test_client(test_config());

    let res = client
        .post("/v1/admin/killswitch/global/activate")
        .header(Header::new("X-Admin-Key", "ops"))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let json: serde_json::Value = res.into_json().unwrap();
    assert_eq!(json["active"], true);

    let res = client
        .post("/v1/admin/killswitch/global/deactivate")
        .header(Header::new("X-Admin-Key", "ops"))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let json: serde_json::Value = res.into_json().unwrap();
    assert_eq!(json["active"], false);
}

#[test]
fn workspace_safety_reports_safe_for_unknown_workspace() {
    let (client, _) = test_client(test_config());
    let res = client.get("/v1/workspaces/unknown-ws/campaign-safety").dispatch();
    assert_eq!(res.status(), Status::Ok);
}

// --- Outbound template sender (spec §4.7) ---

#[test]
fn send_template_requires_workspace_header() {
    let (client, _) = test_client(test_config());
    let res = client
        .post("/v1/messages/template")
        .header(rocket::http::ContentType::JSON)
        .body(r#"{"template_id":"t1","to":"919876543210"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}

#[test]
fn send_template_unknown_workspace_is_not_found() {
    let (client, _) = test_client(test_config());
    let res = client
        .post("/v1/messages/template")
        .header(rocket::http::ContentType::JSON)
        .header(Header::new("X-Workspace-Id", "ghost-ws"))
        .body(r#"{"template_id":"t1","to":"919876543210"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
    let json: serde_json::Value = res.into_json().unwrap();
    assert_eq!(json["error"], "WORKSPACE_NOT_CONFIGURED");
}

#[test]
fn send_template_rejects_unapproved_template() {
    let config = test_config();
    let (client, db_path) = test_client(config);
    seed_workspace(&db_path, "ws-pending", "1555000111");
    seed_template(&db_path, "tmpl-pending", "ws-pending", "welcome", "PENDING");

    let res = client
        .post("/v1/messages/template")
        .header(rocket::http::ContentType::JSON)
        .header(Header::new("X-Workspace-Id", "ws-pending"))
        .body(r#"{"template_id":"tmpl-pending","to":"919876543210"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::UnprocessableEntity);
    let json: serde_json::Value = res.into_json().unwrap();
    assert_eq!(json["error"], "TEMPLATE_NOT_APPROVED");
}

#[test]
fn send_template_rejects_unroutable_recipient() {
    let config = test_config();
    let (client, db_path) = test_client(config);
    seed_workspace(&db_path, "ws-bad-phone", "1555000222");
    seed_template(&db_path, "tmpl-approved", "ws-bad-phone", "welcome", "APPROVED");

    let res = client
        .post("/v1/messages/template")
        .header(rocket::http::ContentType::JSON)
        .header(Header::new("X-Workspace-Id", "ws-bad-phone"))
        .body(r#"{"template_id":"tmpl-approved","to":"123"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::UnprocessableEntity);
    let json: serde_json::Value = res.into_json().unwrap();
    assert_eq!(json["error"], "INVALID_RECIPIENT");
}

// --- Outbound template sender with a mocked provider (success + rate limit) ---

mod provider_mock {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use bsp_gateway::config::GatewayConfig;
    use bsp_gateway::db::Db;

    pub async fn mock_server(phone_number_id: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{phone_number_id}/messages")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"messages": [{"id": "wamid.mock"}]})),
            )
            .mount(&server)
            .await;
        server
    }

    pub fn config_against(server: &MockServer) -> GatewayConfig {
        let mut config = GatewayConfig::for_tests();
        config.provider_base_url = server.uri();
        config
    }

    pub fn seed_workspace(db_path: &str, workspace_id: &str, phone_number_id: &str) {
        let db = Db::new(db_path).expect("open seed connection");
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO workspaces (id, name, phone_number_id, bsp_connected, phone_health, plan_tier, created_at, updated_at)
             VALUES (?1, 'acme', ?2, 1, 'CONNECTED', 'free', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            rusqlite::params![workspace_id, phone_number_id],
        )
        .unwrap();
    }

    pub fn seed_approved_template(db_path: &str, id: &str, workspace_id: &str, name: &str) {
        let db = Db::new(db_path).expect("open seed connection");
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO templates (id, workspace_id, name, language, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'en_US', 'APPROVED', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            rusqlite::params![id, workspace_id, name],
        )
        .unwrap();
    }
}

#[rocket::async_test]
async fn send_template_succeeds_against_mock_provider() {
    let server = provider_mock::mock_server("1555000333").await;
    let config = provider_mock::config_against(&server);
    let db_path = config.database_path.clone();
    provider_mock::seed_workspace(&db_path, "ws-ok", "1555000333");
    provider_mock::seed_approved_template(&db_path, "tmpl-ok", "ws-ok", "welcome");

    let rocket = bsp_gateway::rocket_with_config(config);
    let client = rocket::local::asynchronous::Client::tracked(rocket)
        .await
        .expect("valid rocket instance");

    let res = client
        .post("/v1/messages/template")
        .header(rocket::http::ContentType::JSON)
        .header(Header::new("X-Workspace-Id", "ws-ok"))
        .body(r#"{"template_id":"tmpl-ok","to":"919876543210"}"#)
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Ok);
    let json: serde_json::Value = res.into_json().await.unwrap();
    assert_eq!(json["provider_message_id"], "wamid.mock");
}

#[rocket::async_test]
async fn send_template_burst_limit_trips_on_second_free_tier_send() {
    let server = provider_mock::mock_server("1555000444").await;
    let config = provider_mock::config_against(&server);
    let db_path = config.database_path.clone();
    provider_mock::seed_workspace(&db_path, "ws-burst", "1555000444");
    provider_mock::seed_approved_template(&db_path, "tmpl-burst", "ws-burst", "welcome");

    let rocket = bsp_gateway::rocket_with_config(config);
    let client = rocket::local::asynchronous::Client::tracked(rocket)
        .await
        .expect("valid rocket instance");

    let first = client
        .post("/v1/messages/template")
        .header(rocket::http::ContentType::JSON)
        .header(Header::new("X-Workspace-Id", "ws-burst"))
        .body(r#"{"template_id":"tmpl-burst","to":"919876543210"}"#)
        .dispatch()
        .await;
    assert_eq!(first.status(), Status::Ok);

    // Free tier allows 1 send/sec; a second immediate send must trip the
    // burst limiter before ever reaching the (mocked) provider.
    let second = client
        .post("/v1/messages/template")
        .header(rocket::http::ContentType::JSON)
        .header(Header::new("X-Workspace-Id", "ws-burst"))
        .body(r#"{"template_id":"tmpl-burst","to":"919876543211"}"#)
        .dispatch()
        .await;
    assert_eq!(second.status(), Status::TooManyRequests);
    let json: serde_json::Value = second.into_json().await.unwrap();
    assert_eq!(json["error"], "RATE_LIMIT_EXCEEDED");
}

// --- Inbound message -> auto-reply cascade (spec §4.4), end to end ---

#[rocket::async_test]
async fn inbound_message_triggers_keyword_auto_reply() {
    let phone_number_id = "1555000555";
    let server = provider_mock::mock_server(phone_number_id).await;
    let config = provider_mock::config_against(&server);
    let db_path = config.database_path.clone();
    provider_mock::seed_workspace(&db_path, "ws-auto", phone_number_id);
    provider_mock::seed_approved_template(&db_path, "tmpl-auto", "ws-auto", "hours");

    {
        let db = Db::new(&db_path).expect("open seed connection");
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO auto_replies (id, workspace_id, keyword, match_type, template_id, enabled, order_idx)
             VALUES ('ar-1', 'ws-auto', 'hours', 'exact', 'tmpl-auto', 1, 0)",
            [],
        )
        .unwrap();
    }

    let rocket = bsp_gateway::rocket_with_config(config);
    let client = rocket::local::asynchronous::Client::tracked(rocket)
        .await
        .expect("valid rocket instance");

    let body = serde_json::json!({
        "entry": [{
            "changes": [{
                "field": "messages",
                "value": {
                    "metadata": { "phone_number_id": phone_number_id },
                    "messages": [{
                        "from": "919876543210",
                        "id": "wamid.in.1",
                        "type": "text",
                        "text": { "body": "hours" }
                    }]
                }
            }]
        }]
    })
    .to_string();

    let res = client
        .post("/webhook")
        .header(Header::new("x-hub-signature-256", sign(body.as_bytes())))
        .header(Header::new("x-delivery-id", "d-inbound-1"))
        .body(&body)
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Ok);

    // Dispatch is async; poll for the outbound reply the cascade persists.
    let mut sent_count: i64 = 0;
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let db = Db::new(&db_path).expect("open poll connection");
        let conn = db.conn.lock().unwrap();
        sent_count = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE workspace_id = 'ws-auto' AND direction = 'out'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        if sent_count > 0 {
            break;
        }
    }
    assert_eq!(sent_count, 1, "expected exactly one auto-reply to be sent");
}

// --- Kill-switch cascade triggered by an account_update webhook (spec §4.9) ---

#[test]
fn quality_degradation_webhook_pauses_running_campaigns() {
    let phone_number_id = "1555000666";
    let config = test_config();
    let (client, db_path) = test_client(config);

    {
        let db = Db::new(&db_path).expect("open seed connection");
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO workspaces (id, name, phone_number_id, bsp_connected, phone_health, quality_rating,
             account_status, plan_tier, created_at, updated_at)
             VALUES ('ws-health', 'acme', ?1, 1, 'CONNECTED', 'GREEN', 'active', 'free',
             '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            rusqlite::params![phone_number_id],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO campaigns (id, workspace_id, status, created_at, updated_at)
             VALUES ('camp-health', 'ws-health', 'running', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
    }

    let body = serde_json::json!({
        "entry": [{
            "changes": [{
                "field": "account_update",
                "value": {
                    "metadata": { "phone_number_id": phone_number_id },
                    "current_quality_rating": "RED"
                }
            }]
        }]
    })
    .to_string();

    let res = client
        .post("/webhook")
        .header(Header::new("x-hub-signature-256", sign(body.as_bytes())))
        .header(Header::new("x-delivery-id", "d-health-1"))
        .body(&body)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let mut campaign_status = String::new();
    for _ in 0..50 {
        std::thread::sleep(std::time::Duration::from_millis(20));
        let db = Db::new(&db_path).expect("open poll connection");
        let conn = db.conn.lock().unwrap();
        campaign_status = conn
            .query_row("SELECT status FROM campaigns WHERE id = 'camp-health'", [], |r| r.get(0))
            .unwrap();
        if campaign_status == "paused" {
            break;
        }
    }
    assert_eq!(campaign_status, "paused", "expected quality degradation to pause the running campaign");

    let safety_res = client.get("/v1/workspaces/ws-health/campaign-safety").dispatch();
    assert_eq!(safety_res.status(), Status::Ok);
    let safety: serde_json::Value = safety_res.into_json().unwrap();
    assert_eq!(safety["safe"], false);
}
