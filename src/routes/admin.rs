use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};
use rocket::{post, State};

use crate::config::GatewayConfig;
use crate::db::Db;
use crate::killswitch::{activate_global_switch, deactivate_global_switch, is_workspace_safe_for_campaigns};
use crate::routes::AdminKey;

#[post("/v1/admin/killswitch/global/activate")]
pub fn activate_global_killswitch(
    admin: AdminKey,
    db: &State<Db>,
    config: &State<GatewayConfig>,
) -> Result<Json<Value>, Status> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let paused = activate_global_switch(&conn, &admin.0, config.global_killswitch_ttl_hours)
        .map_err(|_| Status::InternalServerError)?;
    Ok(Json(json!({ "active": true, "pausedCampaignIds": paused })))
}

#[post("/v1/admin/killswitch/global/deactivate")]
pub fn deactivate_global_killswitch(_admin: AdminKey, db: &State<Db>) -> Result<Json<Value>, Status> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    deactivate_global_switch(&conn).map_err(|_| Status::InternalServerError)?;
    Ok(Json(json!({ "active": false })))
}

#[rocket::get("/v1/workspaces/<workspace_id>/campaign-safety")]
pub fn workspace_safety(workspace_id: &str, db: &State<Db>) -> Result<Json<Value>, Status> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let safety = is_workspace_safe_for_campaigns(&conn, workspace_id).map_err(|_| Status::InternalServerError)?;
    Ok(Json(serde_json::to_value(safety).map_err(|_| Status::InternalServerError)?))
}
