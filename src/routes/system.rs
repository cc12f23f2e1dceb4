use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{catch, get};

#[get("/api/v1/health")]
pub fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "mahilo-registry",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[catch(401)]
pub fn unauthorized() -> (Status, Json<serde_json::Value>) {
    (
        Status::Unauthorized,
        Json(serde_json::json!({
            "error": "UNAUTHORIZED",
            "message": "Invalid or missing API key"
        })),
    )
}

#[catch(404)]
pub fn not_found() -> (Status, Json<serde_json::Value>) {
    (
        Status::NotFound,
        Json(serde_json::json!({
            "error": "NOT_FOUND",
            "message": "Resource not found"
        })),
    )
}

// Rocket reports undeserializable JSON bodies as 422; the API contract calls
// that a validation failure.
#[catch(422)]
pub fn unprocessable() -> (Status, Json<serde_json::Value>) {
    (
        Status::BadRequest,
        Json(serde_json::json!({
            "error": "VALIDATION",
            "message": "Request body could not be parsed"
        })),
    )
}

#[catch(429)]
pub fn too_many_requests() -> (Status, Json<serde_json::Value>) {
    (
        Status::TooManyRequests,
        Json(serde_json::json!({
            "error": "RATE_LIMITED",
            "message": "Too many requests"
        })),
    )
}
