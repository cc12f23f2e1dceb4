use crate::db::{self, Db};
use crate::identity::{self, Principal};
use crate::models::{RegisterUser, UserInfo, VerifyUser};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get, post};
use rusqlite::{OptionalExtension, params};

use super::{ApiError, api_error, conflict, internal, not_found_error, validation};

fn verification_tweet(code: &str) -> String {
    format!("Verifying my mahilo agent registry account: {code}")
}

/// Register a new user. The API key is shown exactly once; only its hash and
/// indexed key id are stored.
#[post("/api/v1/auth/register", format = "json", data = "<body>")]
pub fn register(
    db: &State<Db>,
    body: Json<RegisterUser>,
) -> Result<(Status, Json<serde_json::Value>), ApiError> {
    let username = identity::validate_username(&body.username).map_err(validation)?;
    let display_name = body
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);

    let (api_key, key_id, secret) = identity::mint_api_key();
    let api_key_hash = identity::hash_api_secret(&key_id, &secret);
    let user_id = uuid::Uuid::new_v4().to_string();
    let verification_code = db::generate_verification_code();
    let now = chrono::Utc::now().to_rfc3339();

    let conn = db.conn();
    conn.execute(
        "INSERT INTO users (id, username, display_name, api_key_hash, api_key_id,
                            verification_code, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            &user_id,
            &username,
            &display_name,
            &api_key_hash,
            &key_id,
            &verification_code,
            &now
        ],
    )
    .map_err(|e| {
        if db::is_unique_violation(&e) {
            conflict(format!("Username '{username}' is already taken"))
        } else {
            internal(e.to_string())
        }
    })?;

    Ok((
        Status::Created,
        Json(serde_json::json!({
            "userId": user_id,
            "username": username,
            "apiKey": api_key,
            "verificationCode": verification_code,
            "verificationTweet": verification_tweet(&verification_code),
            "verified": false
        })),
    ))
}

/// Mark a user as Twitter-verified. The actual tweet check lives outside the
/// registry; this endpoint records the claimed handle.
#[post("/api/v1/auth/verify/<user_id>", format = "json", data = "<body>")]
pub fn verify_user(
    db: &State<Db>,
    user_id: &str,
    body: Json<VerifyUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let handle = body.twitter_handle.trim().trim_start_matches('@').to_string();
    if handle.is_empty() {
        return Err(validation("twitterHandle is required"));
    }

    let conn = db.conn();
    let verified: Option<i64> = conn
        .query_row(
            "SELECT twitter_verified FROM users WHERE id = ?1 AND deleted_at IS NULL",
            params![user_id],
            |r| r.get(0),
        )
        .optional()
        .unwrap_or(None);

    match verified {
        None => Err(not_found_error("User not found")),
        Some(v) if v != 0 => Err(conflict("User is already verified")),
        Some(_) => {
            conn.execute(
                "UPDATE users SET twitter_handle = ?1, twitter_verified = 1 WHERE id = ?2",
                params![&handle, user_id],
            )
            .map_err(|e| internal(e.to_string()))?;
            Ok(Json(serde_json::json!({
                "userId": user_id,
                "twitterHandle": handle,
                "verified": true
            })))
        }
    }
}

/// Fetch the pending verification challenge for a user.
#[get("/api/v1/auth/verify/<user_id>")]
pub fn get_verification(
    db: &State<Db>,
    user_id: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn();
    let row: Option<(Option<String>, i64)> = conn
        .query_row(
            "SELECT verification_code, twitter_verified FROM users
             WHERE id = ?1 AND deleted_at IS NULL",
            params![user_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .unwrap_or(None);

    let (code, verified) = row.ok_or_else(|| not_found_error("User not found"))?;
    let code = code.unwrap_or_default();
    Ok(Json(serde_json::json!({
        "userId": user_id,
        "verified": verified != 0,
        "verificationCode": code,
        "verificationTweet": verification_tweet(&code)
    })))
}

/// Rotate the caller's API key. Hash and key id are replaced in one statement;
/// the prior key is invalid on the next request.
#[post("/api/v1/auth/rotate-key")]
pub fn rotate_key(db: &State<Db>, principal: Principal) -> Result<Json<serde_json::Value>, ApiError> {
    let (api_key, key_id, secret) = identity::mint_api_key();
    let api_key_hash = identity::hash_api_secret(&key_id, &secret);

    let conn = db.conn();
    let updated = conn
        .execute(
            "UPDATE users SET api_key_hash = ?1, api_key_id = ?2 WHERE id = ?3",
            params![&api_key_hash, &key_id, &principal.user_id],
        )
        .map_err(|e| internal(e.to_string()))?;
    if updated == 0 {
        return Err(api_error(Status::Unauthorized, "UNAUTHORIZED", "Unknown user"));
    }

    Ok(Json(serde_json::json!({
        "userId": principal.user_id,
        "apiKey": api_key
    })))
}

#[get("/api/v1/auth/me")]
pub fn me(db: &State<Db>, principal: Principal) -> Result<Json<UserInfo>, ApiError> {
    let conn = db.conn();
    conn.query_row(
        "SELECT id, username, display_name, twitter_handle, twitter_verified, created_at
         FROM users WHERE id = ?1 AND deleted_at IS NULL",
        params![&principal.user_id],
        |r| {
            Ok(UserInfo {
                user_id: r.get(0)?,
                username: r.get(1)?,
                display_name: r.get(2)?,
                twitter_handle: r.get(3)?,
                verified: r.get::<_, i64>(4)? != 0,
                created_at: r.get(5)?,
            })
        },
    )
    .map(Json)
    .map_err(|_| not_found_error("User not found"))
}
