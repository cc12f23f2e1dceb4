use crate::config::RegistryConfig;
use crate::db::{self, Db};
use crate::delivery;
use crate::graph;
use crate::identity::Principal;
use crate::models::{AgentConnection, ContactConnection, RegisterAgent};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, delete, get, post};
use rusqlite::{OptionalExtension, params};

use super::{ApiError, forbidden, internal, not_found_error, validation};

const PUBLIC_KEY_ALGS: [&str; 2] = ["ed25519", "x25519"];

fn agent_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentConnection> {
    let capabilities_json: String = row.get(5)?;
    Ok(AgentConnection {
        id: row.get(0)?,
        user_id: row.get(1)?,
        framework: row.get(2)?,
        label: row.get(3)?,
        description: row.get(4)?,
        capabilities: serde_json::from_str(&capabilities_json).unwrap_or_default(),
        public_key: row.get(6)?,
        public_key_alg: row.get(7)?,
        routing_priority: row.get(8)?,
        callback_url: row.get(9)?,
        status: row.get(10)?,
        last_seen: row.get(11)?,
        created_at: row.get(12)?,
    })
}

const AGENT_COLUMNS: &str = "id, user_id, framework, label, description, capabilities, \
                             public_key, public_key_alg, routing_priority, callback_url, \
                             status, last_seen, created_at";

fn load_agent(conn: &rusqlite::Connection, id: &str) -> Option<AgentConnection> {
    conn.query_row(
        &format!("SELECT {AGENT_COLUMNS} FROM agent_connections WHERE id = ?1"),
        params![id],
        agent_from_row,
    )
    .optional()
    .unwrap_or(None)
}

/// Register an agent connection, or update it when the (user, framework,
/// label) triple already exists. The callback secret is returned only on
/// create or explicit rotation.
#[post("/api/v1/agents", format = "json", data = "<body>")]
pub fn register_agent(
    db: &State<Db>,
    config: &State<RegistryConfig>,
    principal: Principal,
    body: Json<RegisterAgent>,
) -> Result<(Status, Json<serde_json::Value>), ApiError> {
    let framework = body.framework.trim().to_string();
    let label = body.label.trim().to_string();
    if framework.is_empty() || framework.len() > 100 {
        return Err(validation("framework must be 1-100 characters"));
    }
    if label.is_empty() || label.len() > 100 {
        return Err(validation("label must be 1-100 characters"));
    }
    if body.public_key.trim().is_empty() {
        return Err(validation("publicKey is required"));
    }
    if !PUBLIC_KEY_ALGS.contains(&body.public_key_alg.as_str()) {
        return Err(validation(format!(
            "publicKeyAlg must be one of: {}",
            PUBLIC_KEY_ALGS.join(", ")
        )));
    }
    // SSRF guard runs before any write
    delivery::validate_callback_url(&body.callback_url, config.self_hosted)
        .map_err(validation)?;

    let callback_url = body.callback_url.trim().to_string();
    let capabilities =
        serde_json::to_string(body.capabilities.as_deref().unwrap_or_default()).unwrap_or_else(|_| "[]".into());
    let routing_priority = body.routing_priority.unwrap_or(0);
    let now = chrono::Utc::now().to_rfc3339();

    let conn = db.conn();
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM agent_connections
             WHERE user_id = ?1 AND framework = ?2 AND label = ?3",
            params![&principal.user_id, &framework, &label],
            |r| r.get(0),
        )
        .optional()
        .unwrap_or(None);

    match existing {
        Some(connection_id) => {
            let rotate = body.rotate_secret.unwrap_or(false) || body.callback_secret.is_some();
            let new_secret = if rotate {
                Some(
                    body.callback_secret
                        .clone()
                        .unwrap_or_else(db::generate_callback_secret),
                )
            } else {
                None
            };
            conn.execute(
                "UPDATE agent_connections SET description = ?1, capabilities = ?2,
                        public_key = ?3, public_key_alg = ?4, routing_priority = ?5,
                        callback_url = ?6, status = 'active',
                        callback_secret = COALESCE(?7, callback_secret)
                 WHERE id = ?8",
                params![
                    &body.description,
                    &capabilities,
                    body.public_key.trim(),
                    &body.public_key_alg,
                    routing_priority,
                    &callback_url,
                    &new_secret,
                    &connection_id
                ],
            )
            .map_err(|e| internal(e.to_string()))?;

            let agent = load_agent(&conn, &connection_id)
                .ok_or_else(|| internal("Connection disappeared during update"))?;
            let mut response = serde_json::to_value(&agent).unwrap_or_default();
            if let Some(secret) = new_secret {
                response["callbackSecret"] = serde_json::Value::String(secret);
            }
            Ok((Status::Ok, Json(response)))
        }
        None => {
            let connection_id = uuid::Uuid::new_v4().to_string();
            let secret = body
                .callback_secret
                .clone()
                .unwrap_or_else(db::generate_callback_secret);
            conn.execute(
                "INSERT INTO agent_connections
                    (id, user_id, framework, label, description, capabilities, public_key,
                     public_key_alg, routing_priority, callback_url, callback_secret,
                     status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'active', ?12)",
                params![
                    &connection_id,
                    &principal.user_id,
                    &framework,
                    &label,
                    &body.description,
                    &capabilities,
                    body.public_key.trim(),
                    &body.public_key_alg,
                    routing_priority,
                    &callback_url,
                    &secret,
                    &now
                ],
            )
            .map_err(|e| {
                if db::is_unique_violation(&e) {
                    // Raced with a concurrent registration of the same triple
                    validation("Connection already exists; retry to update it")
                } else {
                    internal(e.to_string())
                }
            })?;

            let agent = load_agent(&conn, &connection_id)
                .ok_or_else(|| internal("Connection disappeared during insert"))?;
            let mut response = serde_json::to_value(&agent).unwrap_or_default();
            response["callbackSecret"] = serde_json::Value::String(secret);
            Ok((Status::Created, Json(response)))
        }
    }
}

#[get("/api/v1/agents")]
pub fn list_agents(
    db: &State<Db>,
    principal: Principal,
) -> Result<Json<Vec<AgentConnection>>, ApiError> {
    let conn = db.conn();
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {AGENT_COLUMNS} FROM agent_connections
             WHERE user_id = ?1 ORDER BY routing_priority DESC, created_at ASC"
        ))
        .map_err(|e| internal(e.to_string()))?;
    let agents: Vec<AgentConnection> = stmt
        .query_map(params![&principal.user_id], agent_from_row)
        .map_err(|e| internal(e.to_string()))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(Json(agents))
}

#[delete("/api/v1/agents/<connection_id>")]
pub fn delete_agent(
    db: &State<Db>,
    principal: Principal,
    connection_id: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn();
    let deleted = conn
        .execute(
            "DELETE FROM agent_connections WHERE id = ?1 AND user_id = ?2",
            params![connection_id, &principal.user_id],
        )
        .map_err(|e| internal(e.to_string()))?;
    if deleted == 0 {
        return Err(not_found_error("Connection not found"));
    }
    Ok(Json(serde_json::json!({"deleted": true, "id": connection_id})))
}

/// Signed reachability check against the connection's callback URL. Updates
/// `last_seen` when the agent answers.
#[post("/api/v1/agents/<connection_id>/ping")]
pub async fn ping_agent(
    db: &State<Db>,
    config: &State<RegistryConfig>,
    principal: Principal,
    connection_id: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (callback_url, callback_secret) = {
        let conn = db.conn();
        conn.query_row(
            "SELECT callback_url, callback_secret FROM agent_connections
             WHERE id = ?1 AND user_id = ?2",
            params![connection_id, &principal.user_id],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
        )
        .optional()
        .unwrap_or(None)
        .ok_or_else(|| not_found_error("Connection not found"))?
    };

    let client = delivery::http_client(config.ping_timeout_secs);
    match delivery::ping_connection(
        &client,
        &callback_url,
        &callback_secret,
        config.ping_timeout_secs,
    )
    .await
    {
        Ok(latency_ms) => {
            let conn = db.conn();
            conn.execute(
                "UPDATE agent_connections SET last_seen = ?1 WHERE id = ?2",
                params![chrono::Utc::now().to_rfc3339(), connection_id],
            )
            .ok();
            Ok(Json(serde_json::json!({
                "connectionId": connection_id,
                "reachable": true,
                "latencyMs": latency_ms as u64
            })))
        }
        Err(error) => Ok(Json(serde_json::json!({
            "connectionId": connection_id,
            "reachable": false,
            "error": error
        }))),
    }
}

/// A friend's connections, for sender-side routing decisions. Callback URLs
/// and secrets are not exposed.
#[get("/api/v1/contacts/<username>/connections")]
pub fn contact_connections(
    db: &State<Db>,
    principal: Principal,
    username: &str,
) -> Result<Json<Vec<ContactConnection>>, ApiError> {
    let conn = db.conn();
    let contact = graph::find_user_by_username(&conn, username)
        .ok_or_else(|| not_found_error("User not found"))?;
    if !graph::are_friends(&conn, &principal.user_id, &contact.id) {
        return Err(forbidden("You can only view connections of your friends"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, framework, label, description, capabilities, routing_priority,
                    status, last_seen
             FROM agent_connections
             WHERE user_id = ?1 AND status = 'active'
             ORDER BY routing_priority DESC, created_at ASC",
        )
        .map_err(|e| internal(e.to_string()))?;
    let connections: Vec<ContactConnection> = stmt
        .query_map(params![&contact.id], |row| {
            let capabilities_json: String = row.get(4)?;
            Ok(ContactConnection {
                id: row.get(0)?,
                framework: row.get(1)?,
                label: row.get(2)?,
                description: row.get(3)?,
                capabilities: serde_json::from_str(&capabilities_json).unwrap_or_default(),
                routing_priority: row.get(5)?,
                status: row.get(6)?,
                last_seen: row.get(7)?,
            })
        })
        .map_err(|e| internal(e.to_string()))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(Json(connections))
}
