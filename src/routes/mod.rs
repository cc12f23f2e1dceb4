// Route module decomposition — each domain area in its own file.
// Shared helpers (error shape, catchers) live here; route functions in submodules.

mod agents;
mod auth;
mod friends;
mod groups;
mod messages;
mod policies;
mod preferences;
mod roles;
mod system;

// --- Re-exports (all route functions used by lib.rs mount) ---

pub use agents::{contact_connections, delete_agent, list_agents, ping_agent, register_agent};
pub use auth::{get_verification, me, register, rotate_key, verify_user};
pub use friends::{
    accept_friend, assign_friend_role, block_friend, friend_request, list_friend_roles,
    list_friends, reject_friend, remove_friend_role, unfriend,
};
pub use groups::{
    create_group, delete_group, get_group, group_members, invite_to_group, join_group,
    leave_group, list_groups, transfer_group,
};
pub use messages::{message_history, send_message};
pub use policies::{create_policy, delete_policy, list_policies, policy_context, update_policy};
pub use preferences::{get_preferences, update_preferences};
pub use roles::{create_role, list_roles};
pub use system::{health, not_found, too_many_requests, unauthorized, unprocessable};

use rocket::http::Status;
use rocket::serde::json::Json;

/// Error tuple every handler returns on the failure path. Body shape is
/// `{error: <code>, message: <human string>}` with a stable code per status.
pub type ApiError = (Status, Json<serde_json::Value>);

pub fn api_error(status: Status, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(serde_json::json!({"error": code, "message": message.into()})),
    )
}

pub fn validation(message: impl Into<String>) -> ApiError {
    api_error(Status::BadRequest, "VALIDATION", message)
}

pub fn forbidden(message: impl Into<String>) -> ApiError {
    api_error(Status::Forbidden, "FORBIDDEN", message)
}

pub fn not_found_error(message: impl Into<String>) -> ApiError {
    api_error(Status::NotFound, "NOT_FOUND", message)
}

pub fn conflict(message: impl Into<String>) -> ApiError {
    api_error(Status::Conflict, "CONFLICT", message)
}

pub fn internal(message: impl Into<String>) -> ApiError {
    api_error(Status::InternalServerError, "INTERNAL", message)
}
