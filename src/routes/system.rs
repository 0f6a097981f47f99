use rocket::serde::json::{json, Json, Value};
use rocket::{catch, get};

#[get("/health")]
pub fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "bsp-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[catch(404)]
pub fn not_found() -> Json<Value> {
    Json(json!({ "error": "NOT_FOUND" }))
}

#[catch(429)]
pub fn too_many_requests() -> Json<Value> {
    Json(json!({ "error": "RATE_LIMIT_EXCEEDED" }))
}
