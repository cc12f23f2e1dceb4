use crate::db::Db;
use hmac::{Hmac, Mac};
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rusqlite::params;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const API_KEY_PREFIX: &str = "mahilo";

/// Mint a fresh API key. Returns (full key, key id, secret). The full key
/// `mahilo_<keyId>_<secret>` is shown to the caller exactly once; only the
/// key id and the secret's hash are persisted.
pub fn mint_api_key() -> (String, String, String) {
    let key_id = format!("{:016x}", uuid::Uuid::new_v4().as_u128() as u64);
    let secret = format!("{:032x}", uuid::Uuid::new_v4().as_u128());
    let full = format!("{API_KEY_PREFIX}_{key_id}_{secret}");
    (full, key_id, secret)
}

/// Hash an API secret for storage. HMAC-SHA256 keyed by the key id stands in
/// as the KDF; verification goes through `verify_api_secret`, which compares
/// in constant time.
pub fn hash_api_secret(key_id: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(key_id.as_bytes()).expect("HMAC accepts any key length");
    mac.update(secret.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify_api_secret(key_id: &str, secret: &str, stored_hash: &str) -> bool {
    let Ok(expected) = hex::decode(stored_hash) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key_id.as_bytes()) else {
        return false;
    };
    mac.update(secret.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Split `mahilo_<keyId>_<secret>` into (keyId, secret). Returns None on any
/// malformed shape.
pub fn parse_api_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(API_KEY_PREFIX)?.strip_prefix('_')?;
    let (key_id, secret) = rest.split_once('_')?;
    if key_id.is_empty() || secret.is_empty() || secret.contains('_') {
        return None;
    }
    Some((key_id, secret))
}

/// Username rules: 3-30 chars, alphanumeric + underscore. Stored lowercase;
/// uniqueness is case-insensitive.
pub fn validate_username(username: &str) -> Result<String, String> {
    let username = username.trim();
    if username.len() < 3 || username.len() > 30 {
        return Err("Username must be 3-30 characters".to_string());
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err("Username may only contain letters, digits and underscores".to_string());
    }
    Ok(username.to_lowercase())
}

/// The authenticated caller. Resolved from `Authorization: Bearer <apiKey>` by
/// indexed key-id lookup plus constant-time secret verification. Every failure
/// shape (missing header, malformed key, unknown key id, hash mismatch)
/// surfaces as the same opaque 401.
pub struct Principal {
    pub user_id: String,
    pub username: String,
}

fn resolve(db: &Db, auth_header: Option<&str>) -> Option<Principal> {
    let key = auth_header?.strip_prefix("Bearer ")?.trim();
    let (key_id, secret) = parse_api_key(key)?;

    let conn = db.conn();
    let (user_id, username, stored_hash): (String, String, String) = conn
        .query_row(
            "SELECT id, username, api_key_hash FROM users
             WHERE api_key_id = ?1 AND deleted_at IS NULL",
            params![key_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .ok()?;
    drop(conn);

    if !verify_api_secret(key_id, secret, &stored_hash) {
        return None;
    }
    Some(Principal { user_id, username })
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Principal {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(db) = req.rocket().state::<Db>() else {
            return Outcome::Error((Status::InternalServerError, ()));
        };
        match resolve(db, req.headers().get_one("Authorization")) {
            Some(principal) => Outcome::Success(principal),
            None => Outcome::Error((Status::Unauthorized, ())),
        }
    }
}
