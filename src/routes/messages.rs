use crate::config::RegistryConfig;
use crate::db::{self, Db};
use crate::delivery;
use crate::events::EventBus;
use crate::graph;
use crate::identity::Principal;
use crate::models::*;
use crate::policy::{self, CIPHERTEXT_PAYLOAD_TYPE, EvalInput};
use crate::routing;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get, post};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;

use super::{ApiError, api_error, forbidden, internal, not_found_error, validation};

/// Resolve a prior send for this idempotency key, if any. Duplicate
/// submissions return the original record with its current status.
fn find_by_idempotency_key(
    conn: &Connection,
    sender_id: &str,
    key: &str,
) -> Option<SendResponse> {
    conn.query_row(
        "SELECT id, status, rejection_reason, recipient_connection_id FROM messages
         WHERE sender_user_id = ?1 AND idempotency_key = ?2",
        params![sender_id, key],
        |r| {
            Ok(SendResponse {
                message_id: r.get(0)?,
                status: r.get(1)?,
                deduplicated: Some(true),
                rejection_reason: r.get(2)?,
                recipient_connection_id: r.get(3)?,
            })
        },
    )
    .optional()
    .unwrap_or(None)
}

fn rejection_response(message_id: &str, reason: &str) -> ApiError {
    (
        Status::Forbidden,
        Json(serde_json::json!({
            "error": "FORBIDDEN",
            "message": "Message rejected by policy",
            "messageId": message_id,
            "status": "rejected",
            "rejectionReason": reason
        })),
    )
}

#[allow(clippy::too_many_arguments)]
fn insert_message(
    conn: &Connection,
    message_id: &str,
    principal: &Principal,
    body: &SendMessage,
    recipient_type: &str,
    recipient_id: &str,
    recipient_connection_id: Option<&str>,
    status: &str,
    rejection_reason: Option<&str>,
) -> Result<(), rusqlite::Error> {
    let encryption = body
        .encryption
        .as_ref()
        .and_then(|e| serde_json::to_string(e).ok());
    let sender_signature = body
        .sender_signature
        .as_ref()
        .and_then(|s| serde_json::to_string(s).ok());
    conn.execute(
        "INSERT INTO messages
            (id, correlation_id, sender_user_id, sender_agent, recipient_type, recipient_id,
             recipient_connection_id, payload, payload_type, encryption, sender_signature,
             context, status, rejection_reason, idempotency_key, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            message_id,
            &body.correlation_id,
            &principal.user_id,
            &body.sender_agent,
            recipient_type,
            recipient_id,
            recipient_connection_id,
            &body.message,
            body.payload_type.as_deref().unwrap_or("text/plain"),
            &encryption,
            &sender_signature,
            &body.context,
            status,
            rejection_reason,
            &body.idempotency_key,
            chrono::Utc::now().to_rfc3339()
        ],
    )
    .map(|_| ())
}

fn message_status(conn: &Connection, message_id: &str) -> (String, Option<String>) {
    conn.query_row(
        "SELECT status, rejection_reason FROM messages WHERE id = ?1",
        params![message_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .unwrap_or(("pending".to_string(), None))
}

/// Send a message to a user or group. The first delivery attempt happens
/// inline (bounded by the callback timeout); failures enter the persistent
/// retry schedule. A client disconnect after the row is written does not
/// cancel delivery.
#[post("/api/v1/messages/send", format = "json", data = "<body>")]
pub async fn send_message(
    db: &State<Db>,
    config: &State<RegistryConfig>,
    events: &State<EventBus>,
    client: &State<reqwest::Client>,
    rate_limiter: &State<crate::rate_limit::RateLimiter>,
    principal: Principal,
    body: Json<SendMessage>,
) -> Result<Json<SendResponse>, ApiError> {
    let body = body.into_inner();
    let rl = rate_limiter.check_with_info(
        &format!("send:{}", principal.user_id),
        config.rate_limit_per_minute,
    );
    if !rl.allowed {
        return Err(api_error(
            Status::TooManyRequests,
            "RATE_LIMITED",
            format!(
                "Rate limited: max {} messages per minute, retry in {}s",
                rl.limit, rl.retry_after_secs
            ),
        ));
    }

    if body.message.is_empty() {
        return Err(validation("message must not be empty"));
    }
    if body.message.len() > config.max_payload_bytes {
        return Err(api_error(
            Status::BadRequest,
            "PAYLOAD_TOO_LARGE",
            format!(
                "Payload of {} bytes exceeds the {} byte limit",
                body.message.len(),
                config.max_payload_bytes
            ),
        ));
    }
    let recipient_type = body.recipient_type.as_deref().unwrap_or("user");
    if recipient_type != "user" && recipient_type != "group" {
        return Err(validation("recipientType must be 'user' or 'group'"));
    }

    if let Some(key) = body.idempotency_key.as_deref() {
        let existing = {
            let conn = db.conn();
            find_by_idempotency_key(&conn, &principal.user_id, key)
        };
        if let Some(original) = existing {
            return Ok(Json(original));
        }
    }

    if recipient_type == "user" {
        send_to_user(db, config, events, client, &principal, &body).await
    } else {
        send_to_group(db, config, events, client, &principal, &body).await
    }
}

async fn send_to_user(
    db: &Db,
    config: &RegistryConfig,
    events: &EventBus,
    client: &reqwest::Client,
    principal: &Principal,
    body: &SendMessage,
) -> Result<Json<SendResponse>, ApiError> {
    let message_id = uuid::Uuid::new_v4().to_string();

    // Resolve, authorize, evaluate and persist under one guard; the outbound
    // attempt happens after it is dropped.
    let connection_id = {
        let conn = db.conn();
        let recipient = graph::find_user_by_username(&conn, &body.recipient)
            .ok_or_else(|| not_found_error("Recipient not found"))?;
        if recipient.id == principal.user_id {
            return Err(validation("Cannot send a message to yourself"));
        }
        if !graph::can_send_to_user(&conn, &principal.user_id, &recipient.id) {
            return Err(forbidden("You can only message accepted friends"));
        }

        let connection = match body.recipient_connection_id.as_deref() {
            Some(explicit_id) => {
                let connection = routing::connection_by_id(&conn, explicit_id)
                    .filter(|c| c.user_id == recipient.id && c.status == "active")
                    .ok_or_else(|| {
                        not_found_error("Connection not found for this recipient")
                    })?;
                connection
            }
            None => {
                let candidates = routing::active_connections(&conn, &recipient.id);
                routing::select_connection(&candidates, body.routing_hints.as_ref())
                    .cloned()
                    .ok_or_else(|| {
                        not_found_error("Recipient has no active agent connections")
                    })?
            }
        };

        let payload_type = body.payload_type.as_deref().unwrap_or("text/plain");
        if config.trusted_mode && payload_type != CIPHERTEXT_PAYLOAD_TYPE {
            let roles = graph::roles_between(&conn, &principal.user_id, &recipient.id);
            let policies = policy::applicable_for_user_send(
                &conn,
                &principal.user_id,
                &recipient.id,
                &roles,
            );
            let input = EvalInput {
                payload: &body.message,
                recipient_username: &recipient.username,
                has_context: body.context.is_some(),
            };
            if let Err(rejection) = policy::evaluate(&policies, &input) {
                insert_message(
                    &conn,
                    &message_id,
                    principal,
                    body,
                    "user",
                    &recipient.id,
                    Some(&connection.id),
                    "rejected",
                    Some(&rejection.reason),
                )
                .map_err(|e| {
                    if db::is_unique_violation(&e) {
                        dedup_or_internal(&conn, principal, body)
                    } else {
                        internal(e.to_string())
                    }
                })?;
                return Err(rejection_response(&message_id, &rejection.reason));
            }
        }

        match insert_message(
            &conn,
            &message_id,
            principal,
            body,
            "user",
            &recipient.id,
            Some(&connection.id),
            "pending",
            None,
        ) {
            Ok(()) => {}
            Err(e) if db::is_unique_violation(&e) => {
                // Raced with a duplicate submission carrying the same key
                if let Some(key) = body.idempotency_key.as_deref()
                    && let Some(original) =
                        find_by_idempotency_key(&conn, &principal.user_id, key)
                {
                    return Ok(Json(original));
                }
                return Err(internal("Unexpected uniqueness conflict on message insert"));
            }
            Err(e) => return Err(internal(e.to_string())),
        }
        connection.id
    };

    delivery::attempt_user_delivery(db, client, &events.sender, config.max_retries, &message_id)
        .await;

    let (status, _) = {
        let conn = db.conn();
        message_status(&conn, &message_id)
    };
    Ok(Json(SendResponse {
        message_id,
        status,
        deduplicated: None,
        rejection_reason: None,
        recipient_connection_id: Some(connection_id),
    }))
}

/// Error-path helper: inserting a rejected audit row can itself collide on the
/// idempotency key; surface the original instead of an internal error.
fn dedup_or_internal(conn: &Connection, principal: &Principal, body: &SendMessage) -> ApiError {
    if let Some(key) = body.idempotency_key.as_deref()
        && let Some(original) = find_by_idempotency_key(conn, &principal.user_id, key)
    {
        let rejection = original.rejection_reason.unwrap_or_default();
        return rejection_response(&original.message_id, &rejection);
    }
    internal("Unexpected uniqueness conflict on message insert")
}

async fn send_to_group(
    db: &Db,
    config: &RegistryConfig,
    events: &EventBus,
    client: &reqwest::Client,
    principal: &Principal,
    body: &SendMessage,
) -> Result<Json<SendResponse>, ApiError> {
    let message_id = uuid::Uuid::new_v4().to_string();

    let pending_children: Vec<String> = {
        let conn = db.conn();
        // Groups are addressed by name, falling back to id.
        let group: Option<(String, String)> = conn
            .query_row(
                "SELECT id, name FROM groups WHERE name = ?1 COLLATE NOCASE OR id = ?1",
                params![body.recipient.trim()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .unwrap_or(None);
        let (group_id, group_name) = group.ok_or_else(|| not_found_error("Group not found"))?;

        if !graph::can_send_to_group(&conn, &principal.user_id, &group_id) {
            return Err(forbidden("You are not an active member of this group"));
        }

        let payload_type = body.payload_type.as_deref().unwrap_or("text/plain");
        if config.trusted_mode && payload_type != CIPHERTEXT_PAYLOAD_TYPE {
            let policies =
                policy::applicable_for_group_send(&conn, &principal.user_id, &group_id);
            let input = EvalInput {
                payload: &body.message,
                recipient_username: &group_name,
                has_context: body.context.is_some(),
            };
            if let Err(rejection) = policy::evaluate(&policies, &input) {
                insert_message(
                    &conn,
                    &message_id,
                    principal,
                    body,
                    "group",
                    &group_id,
                    None,
                    "rejected",
                    Some(&rejection.reason),
                )
                .map_err(|e| {
                    if db::is_unique_violation(&e) {
                        dedup_or_internal(&conn, principal, body)
                    } else {
                        internal(e.to_string())
                    }
                })?;
                return Err(rejection_response(&message_id, &rejection.reason));
            }
        }

        match insert_message(
            &conn,
            &message_id,
            principal,
            body,
            "group",
            &group_id,
            None,
            "pending",
            None,
        ) {
            Ok(()) => {}
            Err(e) if db::is_unique_violation(&e) => {
                if let Some(key) = body.idempotency_key.as_deref()
                    && let Some(original) =
                        find_by_idempotency_key(&conn, &principal.user_id, key)
                {
                    return Ok(Json(original));
                }
                return Err(internal("Unexpected uniqueness conflict on message insert"));
            }
            Err(e) => return Err(internal(e.to_string())),
        }

        // Fan out: one child per other active member, pinned to their
        // highest-priority connection. Members without one fail terminally.
        let mut stmt = conn
            .prepare(
                "SELECT user_id FROM group_memberships
                 WHERE group_id = ?1 AND status = 'active' AND user_id != ?2",
            )
            .map_err(|e| internal(e.to_string()))?;
        let members: Vec<String> = stmt
            .query_map(params![&group_id, &principal.user_id], |r| r.get(0))
            .map_err(|e| internal(e.to_string()))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        let now = chrono::Utc::now().to_rfc3339();
        let mut pending = Vec::new();
        for member_id in members {
            let candidates = routing::active_connections(&conn, &member_id);
            let child_id = uuid::Uuid::new_v4().to_string();
            match candidates.first() {
                Some(connection) => {
                    conn.execute(
                        "INSERT INTO message_deliveries
                            (id, message_id, recipient_user_id, recipient_connection_id,
                             status, created_at)
                         VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
                        params![&child_id, &message_id, &member_id, &connection.id, &now],
                    )
                    .map_err(|e| internal(e.to_string()))?;
                    pending.push(child_id);
                }
                None => {
                    conn.execute(
                        "INSERT INTO message_deliveries
                            (id, message_id, recipient_user_id, recipient_connection_id,
                             status, error_message, created_at)
                         VALUES (?1, ?2, ?3, NULL, 'failed', 'No active connection', ?4)",
                        params![&child_id, &message_id, &member_id, &now],
                    )
                    .map_err(|e| internal(e.to_string()))?;
                }
            }
        }

        // Fold immediate no-connection failures into the parent before the
        // live attempts run.
        delivery::recompute_parent_status(&conn, &message_id);
        pending
    };

    let mut handles = Vec::new();
    for child_id in pending_children {
        let task_db = db.clone();
        let task_client = client.clone();
        let task_events = events.sender.clone();
        let max_retries = config.max_retries;
        handles.push(tokio::spawn(async move {
            delivery::attempt_child_delivery(
                &task_db,
                &task_client,
                &task_events,
                max_retries,
                &child_id,
            )
            .await;
        }));
    }
    for handle in handles {
        handle.await.ok();
    }

    let (status, _) = {
        let conn = db.conn();
        message_status(&conn, &message_id)
    };
    Ok(Json(SendResponse {
        message_id,
        status,
        deduplicated: None,
        rejection_reason: None,
        recipient_connection_id: None,
    }))
}

// --- History ---

struct HistoryRow {
    message_id: String,
    correlation_id: Option<String>,
    direction: String,
    sender_user_id: String,
    sender_username: String,
    sender_agent: Option<String>,
    recipient_type: String,
    recipient: String,
    payload: String,
    payload_type: String,
    status: String,
    rejection_reason: Option<String>,
    retry_count: i64,
    created_at: String,
    delivered_at: Option<String>,
}

fn parse_since(raw: &str) -> Result<String, ApiError> {
    if let Ok(unix) = raw.parse::<i64>() {
        let ts = chrono::DateTime::from_timestamp(unix, 0)
            .ok_or_else(|| validation("since is out of range"))?;
        return Ok(ts.to_rfc3339());
    }
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&chrono::Utc).to_rfc3339())
        .map_err(|_| validation("since must be unix seconds or an RFC3339 timestamp"))
}

/// Message history, newest first. Received entries are enriched with the
/// caller's reply policies so one call carries the constraints for every
/// incoming message.
#[get("/api/v1/messages?<direction>&<since>&<limit>")]
pub fn message_history(
    db: &State<Db>,
    principal: Principal,
    direction: Option<&str>,
    since: Option<&str>,
    limit: Option<i64>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let direction = direction.unwrap_or("both");
    if !["sent", "received", "both"].contains(&direction) {
        return Err(validation("direction must be sent, received or both"));
    }
    let limit = limit.unwrap_or(50).clamp(1, 100);
    let since = since.map(parse_since).transpose()?;
    let since_clause = since.as_deref().unwrap_or("");

    let conn = db.conn();
    let mut rows: Vec<HistoryRow> = Vec::new();

    if direction == "sent" || direction == "both" {
        let mut stmt = conn
            .prepare(
                "SELECT m.id, m.correlation_id, m.sender_agent, m.recipient_type,
                        m.recipient_id, m.payload, m.payload_type, m.status,
                        m.rejection_reason, m.retry_count, m.created_at, m.delivered_at
                 FROM messages m
                 WHERE m.sender_user_id = ?1 AND m.created_at > ?2
                 ORDER BY m.created_at DESC LIMIT ?3",
            )
            .map_err(|e| internal(e.to_string()))?;
        let sent: Vec<HistoryRow> = stmt
            .query_map(params![&principal.user_id, since_clause, limit], |r| {
                Ok(HistoryRow {
                    message_id: r.get(0)?,
                    correlation_id: r.get(1)?,
                    direction: "sent".to_string(),
                    sender_user_id: principal.user_id.clone(),
                    sender_username: principal.username.clone(),
                    sender_agent: r.get(2)?,
                    recipient_type: r.get(3)?,
                    recipient: r.get(4)?,
                    payload: r.get(5)?,
                    payload_type: r.get(6)?,
                    status: r.get(7)?,
                    rejection_reason: r.get(8)?,
                    retry_count: r.get(9)?,
                    created_at: r.get(10)?,
                    delivered_at: r.get(11)?,
                })
            })
            .map_err(|e| internal(e.to_string()))?
            .filter_map(|r| r.ok())
            .collect();
        rows.extend(sent);
    }

    if direction == "received" || direction == "both" {
        // Direct sends addressed to the caller (rejected ones never left the
        // sender's audit trail).
        let mut stmt = conn
            .prepare(
                "SELECT m.id, m.correlation_id, m.sender_user_id, u.username, m.sender_agent,
                        m.payload, m.payload_type, m.status, m.retry_count,
                        m.created_at, m.delivered_at
                 FROM messages m
                 JOIN users u ON u.id = m.sender_user_id
                 WHERE m.recipient_type = 'user' AND m.recipient_id = ?1
                   AND m.status != 'rejected' AND m.created_at > ?2
                 ORDER BY m.created_at DESC LIMIT ?3",
            )
            .map_err(|e| internal(e.to_string()))?;
        let direct: Vec<HistoryRow> = stmt
            .query_map(params![&principal.user_id, since_clause, limit], |r| {
                Ok(HistoryRow {
                    message_id: r.get(0)?,
                    correlation_id: r.get(1)?,
                    direction: "received".to_string(),
                    sender_user_id: r.get(2)?,
                    sender_username: r.get(3)?,
                    sender_agent: r.get(4)?,
                    recipient_type: "user".to_string(),
                    recipient: principal.username.clone(),
                    payload: r.get(5)?,
                    payload_type: r.get(6)?,
                    status: r.get(7)?,
                    rejection_reason: None,
                    retry_count: r.get(8)?,
                    created_at: r.get(9)?,
                    delivered_at: r.get(10)?,
                })
            })
            .map_err(|e| internal(e.to_string()))?
            .filter_map(|r| r.ok())
            .collect();
        rows.extend(direct);

        // Group fan-out children addressed to the caller.
        let mut stmt = conn
            .prepare(
                "SELECT m.id, m.correlation_id, m.sender_user_id, u.username, m.sender_agent,
                        g.name, m.payload, m.payload_type, d.status, d.retry_count,
                        m.created_at, d.delivered_at
                 FROM message_deliveries d
                 JOIN messages m ON m.id = d.message_id
                 JOIN users u ON u.id = m.sender_user_id
                 LEFT JOIN groups g ON g.id = m.recipient_id
                 WHERE d.recipient_user_id = ?1 AND m.created_at > ?2
                 ORDER BY m.created_at DESC LIMIT ?3",
            )
            .map_err(|e| internal(e.to_string()))?;
        let fanned: Vec<HistoryRow> = stmt
            .query_map(params![&principal.user_id, since_clause, limit], |r| {
                Ok(HistoryRow {
                    message_id: r.get(0)?,
                    correlation_id: r.get(1)?,
                    direction: "received".to_string(),
                    sender_user_id: r.get(2)?,
                    sender_username: r.get(3)?,
                    sender_agent: r.get(4)?,
                    recipient_type: "group".to_string(),
                    recipient: r.get::<_, Option<String>>(5)?.unwrap_or_default(),
                    payload: r.get(6)?,
                    payload_type: r.get(7)?,
                    status: r.get(8)?,
                    rejection_reason: None,
                    retry_count: r.get(9)?,
                    created_at: r.get(10)?,
                    delivered_at: r.get(11)?,
                })
            })
            .map_err(|e| internal(e.to_string()))?
            .filter_map(|r| r.ok())
            .collect();
        rows.extend(fanned);
    }

    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    rows.truncate(limit as usize);

    // Reply-policy enrichment, computed once per distinct sender.
    let mut reply_cache: HashMap<String, ReplyPolicies> = HashMap::new();
    let mut messages: Vec<MessageView> = Vec::with_capacity(rows.len());
    for row in rows {
        let reply_policies = if row.direction == "received" {
            let entry = reply_cache
                .entry(row.sender_user_id.clone())
                .or_insert_with(|| {
                    let sender_roles =
                        graph::roles_between(&conn, &principal.user_id, &row.sender_user_id);
                    let policies = policy::applicable_for_user_send(
                        &conn,
                        &principal.user_id,
                        &row.sender_user_id,
                        &sender_roles,
                    );
                    let summary = policy::summarize(&policies);
                    ReplyPolicies {
                        sender_roles,
                        policies,
                        summary,
                    }
                });
            Some(entry.clone())
        } else {
            None
        };

        // Sent rows store the raw recipient id; resolve it for display.
        let recipient = if row.direction == "sent" {
            if row.recipient_type == "user" {
                graph::find_user_by_id(&conn, &row.recipient)
                    .map(|u| u.username)
                    .unwrap_or(row.recipient.clone())
            } else {
                conn.query_row(
                    "SELECT name FROM groups WHERE id = ?1",
                    params![&row.recipient],
                    |r| r.get::<_, String>(0),
                )
                .unwrap_or(row.recipient.clone())
            }
        } else {
            row.recipient.clone()
        };

        messages.push(MessageView {
            message_id: row.message_id,
            correlation_id: row.correlation_id,
            direction: row.direction,
            sender: row.sender_username,
            sender_agent: row.sender_agent,
            recipient_type: row.recipient_type,
            recipient,
            message: row.payload,
            payload_type: row.payload_type,
            status: row.status,
            rejection_reason: row.rejection_reason,
            retry_count: row.retry_count,
            created_at: row.created_at,
            delivered_at: row.delivered_at,
            reply_policies,
        });
    }

    let count = messages.len();
    Ok(Json(HistoryResponse { messages, count }))
}
