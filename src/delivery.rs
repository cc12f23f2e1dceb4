use crate::config::RegistryConfig;
use crate::db::Db;
use crate::events::{RegistryEvent, publish_via};
use hmac::{Hmac, Mac};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::Sha256;
use tokio::sync::broadcast;
use url::{Host, Url};

type HmacSha256 = Hmac<Sha256>;

/// Cap on the exponential backoff delay between delivery attempts.
const MAX_BACKOFF_SECS: u64 = 60;

pub fn http_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .expect("Failed to create HTTP client")
}

/// HMAC-SHA256 over the exact raw body bytes, hex-encoded. The signed buffer
/// and the wire body must be the same byte sequence.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Delay before the next attempt given the current retry count: 1s · 2^count,
/// capped.
pub fn backoff_delay_secs(retry_count: i64) -> u64 {
    let shift = retry_count.clamp(0, 16) as u32;
    (1u64 << shift).min(MAX_BACKOFF_SECS)
}

fn classify_v4(ip: std::net::Ipv4Addr) -> HostClass {
    if ip.is_loopback() {
        HostClass::Loopback
    } else if ip.is_private() || ip.is_link_local() || ip.is_unspecified() || ip.is_broadcast() {
        HostClass::Private
    } else {
        HostClass::Public
    }
}

fn classify_v6(ip: std::net::Ipv6Addr) -> HostClass {
    let segments = ip.segments();
    if ip.is_loopback() {
        HostClass::Loopback
    } else if ip.is_unspecified()
        || (segments[0] & 0xffc0) == 0xfe80
        || (segments[0] & 0xfe00) == 0xfc00
    {
        HostClass::Private
    } else {
        HostClass::Public
    }
}

#[derive(Debug, PartialEq)]
enum HostClass {
    Loopback,
    Private,
    Public,
}

/// SSRF guard, run before the first write at connection registration. Hosted
/// mode: http only to loopback, IP-literal private/link-local hosts rejected.
/// Self-hosted deployments opt in to private targets.
pub fn validate_callback_url(raw: &str, self_hosted: bool) -> Result<(), String> {
    let url = Url::parse(raw.trim()).map_err(|e| format!("Invalid callback URL: {e}"))?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err("Callback URL must use http or https".to_string());
    }
    let host = url
        .host()
        .ok_or_else(|| "Callback URL must include a host".to_string())?;

    let class = match host {
        Host::Ipv4(ip) => classify_v4(ip),
        Host::Ipv6(ip) => classify_v6(ip),
        Host::Domain(domain) => {
            if domain.eq_ignore_ascii_case("localhost") {
                HostClass::Loopback
            } else {
                // Non-literal hostnames are classified as public; resolution
                // failures surface as delivery failures later.
                HostClass::Public
            }
        }
    };

    match class {
        HostClass::Loopback => Ok(()),
        HostClass::Private if self_hosted => Ok(()),
        HostClass::Private => {
            Err("Callback URL points at a private or link-local address".to_string())
        }
        HostClass::Public if scheme == "https" || self_hosted => Ok(()),
        HostClass::Public => {
            Err("Non-HTTPS callback URLs are only allowed on loopback".to_string())
        }
    }
}

/// Everything one delivery attempt needs, loaded in a single pass so no lock
/// is held across the outbound call.
struct Attempt {
    body: String,
    callback_url: String,
    callback_secret: String,
    retry_count: i64,
    sender_user_id: String,
    recipient_user_id: String,
    recipient_connection_id: String,
    message_id: String,
    /// Set for fan-out children.
    delivery_id: Option<String>,
}

#[allow(clippy::too_many_arguments)]
fn build_envelope(
    message_id: &str,
    correlation_id: Option<&str>,
    recipient_connection_id: &str,
    delivery_id: Option<&str>,
    sender: &str,
    sender_agent: Option<&str>,
    payload: &str,
    payload_type: &str,
    encryption: Option<&str>,
    sender_signature: Option<&str>,
    context: Option<&str>,
    group: Option<(&str, &str)>,
) -> String {
    let mut envelope = serde_json::json!({
        "messageId": message_id,
        "recipientConnectionId": recipient_connection_id,
        "sender": sender,
        "senderAgent": sender_agent,
        "message": payload,
        "payloadType": payload_type,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    let obj = envelope.as_object_mut().expect("envelope is an object");
    if let Some(cid) = correlation_id {
        obj.insert("correlationId".into(), cid.into());
    }
    if let Some(did) = delivery_id {
        obj.insert("deliveryId".into(), did.into());
    }
    if let Some(raw) = encryption
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(raw)
    {
        obj.insert("encryption".into(), value);
    }
    if let Some(raw) = sender_signature
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(raw)
    {
        obj.insert("senderSignature".into(), value);
    }
    if let Some(ctx) = context {
        obj.insert("context".into(), ctx.into());
    }
    if let Some((group_id, group_name)) = group {
        obj.insert("groupId".into(), group_id.into());
        obj.insert("groupName".into(), group_name.into());
    }
    envelope.to_string()
}

/// POST the signed envelope. `body` is serialized exactly once; the signature
/// covers the bytes that go on the wire.
async fn send_callback(
    client: &reqwest::Client,
    url: &str,
    secret: &str,
    message_id: &str,
    body: String,
) -> Result<(), String> {
    let signature = sign_body(secret, body.as_bytes());
    let result = client
        .post(url)
        .header("Content-Type", "application/json")
        .header("X-Mahilo-Message-Id", message_id)
        .header(
            "X-Mahilo-Timestamp",
            chrono::Utc::now().timestamp().to_string(),
        )
        .header("X-Mahilo-Signature", format!("sha256={signature}"))
        .body(body)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().is_success() => Ok(()),
        Ok(resp) => Err(format!("HTTP {}", resp.status())),
        Err(e) => Err(format!("request error: {e}")),
    }
}

fn load_user_attempt(conn: &Connection, message_id: &str) -> Option<Attempt> {
    conn.query_row(
        "SELECT m.id, m.correlation_id, m.payload, m.payload_type, m.encryption,
                m.sender_signature, m.context, m.sender_agent, m.retry_count,
                m.sender_user_id, m.recipient_id,
                u.username, c.id, c.callback_url, c.callback_secret
         FROM messages m
         JOIN users u ON u.id = m.sender_user_id
         JOIN agent_connections c ON c.id = m.recipient_connection_id
         WHERE m.id = ?1 AND m.status = 'pending' AND m.recipient_type = 'user'",
        params![message_id],
        |r| {
            let id: String = r.get(0)?;
            let correlation_id: Option<String> = r.get(1)?;
            let payload: String = r.get(2)?;
            let payload_type: String = r.get(3)?;
            let encryption: Option<String> = r.get(4)?;
            let sender_signature: Option<String> = r.get(5)?;
            let context: Option<String> = r.get(6)?;
            let sender_agent: Option<String> = r.get(7)?;
            let retry_count: i64 = r.get(8)?;
            let sender_user_id: String = r.get(9)?;
            let recipient_user_id: String = r.get(10)?;
            let sender_username: String = r.get(11)?;
            let connection_id: String = r.get(12)?;
            let callback_url: String = r.get(13)?;
            let callback_secret: String = r.get(14)?;

            let body = build_envelope(
                &id,
                correlation_id.as_deref(),
                &connection_id,
                None,
                &sender_username,
                sender_agent.as_deref(),
                &payload,
                &payload_type,
                encryption.as_deref(),
                sender_signature.as_deref(),
                context.as_deref(),
                None,
            );
            Ok(Attempt {
                body,
                callback_url,
                callback_secret,
                retry_count,
                sender_user_id,
                recipient_user_id,
                recipient_connection_id: connection_id,
                message_id: id,
                delivery_id: None,
            })
        },
    )
    .optional()
    .unwrap_or(None)
}

fn load_child_attempt(conn: &Connection, delivery_id: &str) -> Option<Attempt> {
    conn.query_row(
        "SELECT m.id, m.correlation_id, m.payload, m.payload_type, m.encryption,
                m.sender_signature, m.context, m.sender_agent, d.retry_count,
                m.sender_user_id, d.recipient_user_id,
                u.username, c.id, c.callback_url, c.callback_secret,
                d.id, g.id, g.name
         FROM message_deliveries d
         JOIN messages m ON m.id = d.message_id
         JOIN users u ON u.id = m.sender_user_id
         JOIN agent_connections c ON c.id = d.recipient_connection_id
         LEFT JOIN groups g ON g.id = m.recipient_id
         WHERE d.id = ?1 AND d.status = 'pending'",
        params![delivery_id],
        |r| {
            let message_id: String = r.get(0)?;
            let correlation_id: Option<String> = r.get(1)?;
            let payload: String = r.get(2)?;
            let payload_type: String = r.get(3)?;
            let encryption: Option<String> = r.get(4)?;
            let sender_signature: Option<String> = r.get(5)?;
            let context: Option<String> = r.get(6)?;
            let sender_agent: Option<String> = r.get(7)?;
            let retry_count: i64 = r.get(8)?;
            let sender_user_id: String = r.get(9)?;
            let recipient_user_id: String = r.get(10)?;
            let sender_username: String = r.get(11)?;
            let connection_id: String = r.get(12)?;
            let callback_url: String = r.get(13)?;
            let callback_secret: String = r.get(14)?;
            let child_id: String = r.get(15)?;
            let group_id: Option<String> = r.get(16)?;
            let group_name: Option<String> = r.get(17)?;

            let group = match (&group_id, &group_name) {
                (Some(id), Some(name)) => Some((id.as_str(), name.as_str())),
                _ => None,
            };
            let body = build_envelope(
                &message_id,
                correlation_id.as_deref(),
                &connection_id,
                Some(&child_id),
                &sender_username,
                sender_agent.as_deref(),
                &payload,
                &payload_type,
                encryption.as_deref(),
                sender_signature.as_deref(),
                context.as_deref(),
                group,
            );
            Ok(Attempt {
                body,
                callback_url,
                callback_secret,
                retry_count,
                sender_user_id,
                recipient_user_id,
                recipient_connection_id: connection_id,
                message_id,
                delivery_id: Some(child_id),
            })
        },
    )
    .optional()
    .unwrap_or(None)
}

/// Attempt delivery of a user-targeted message. On success the message is
/// terminal `delivered`; on failure it either re-enters the retry schedule or,
/// once the budget is spent, becomes terminal `failed`.
pub async fn attempt_user_delivery(
    db: &Db,
    client: &reqwest::Client,
    events: &broadcast::Sender<RegistryEvent>,
    max_retries: i64,
    message_id: &str,
) {
    let attempt = {
        let conn = db.conn();
        load_user_attempt(&conn, message_id)
    };
    let Some(attempt) = attempt else { return };

    let result = send_callback(
        client,
        &attempt.callback_url,
        &attempt.callback_secret,
        &attempt.message_id,
        attempt.body.clone(),
    )
    .await;

    let now = chrono::Utc::now().to_rfc3339();
    match result {
        Ok(()) => {
            {
                let conn = db.conn();
                conn.execute(
                    "UPDATE messages SET status = 'delivered', delivered_at = ?1,
                     next_retry_at = NULL WHERE id = ?2",
                    params![&now, &attempt.message_id],
                )
                .ok();
            }
            publish_via(
                events,
                RegistryEvent::MessageReceived {
                    recipient_user_id: attempt.recipient_user_id.clone(),
                    message_id: attempt.message_id.clone(),
                    sender_user_id: attempt.sender_user_id.clone(),
                    recipient_connection_id: Some(attempt.recipient_connection_id.clone()),
                },
            );
            publish_via(
                events,
                RegistryEvent::DeliveryStatus {
                    sender_user_id: attempt.sender_user_id,
                    message_id: attempt.message_id,
                    delivery_id: None,
                    status: "delivered".to_string(),
                },
            );
        }
        Err(error) => {
            let failed = attempt.retry_count >= max_retries;
            {
                let conn = db.conn();
                if failed {
                    conn.execute(
                        "UPDATE messages SET status = 'failed', next_retry_at = NULL WHERE id = ?1",
                        params![&attempt.message_id],
                    )
                    .ok();
                } else {
                    let next = chrono::Utc::now()
                        + chrono::Duration::seconds(backoff_delay_secs(attempt.retry_count) as i64);
                    conn.execute(
                        "UPDATE messages SET retry_count = retry_count + 1,
                         next_retry_at = ?1 WHERE id = ?2",
                        params![next.to_rfc3339(), &attempt.message_id],
                    )
                    .ok();
                }
            }
            if failed {
                eprintln!(
                    "⚠️ Message {} failed terminally after {} retries: {}",
                    attempt.message_id, attempt.retry_count, error
                );
                publish_via(
                    events,
                    RegistryEvent::DeliveryStatus {
                        sender_user_id: attempt.sender_user_id,
                        message_id: attempt.message_id,
                        delivery_id: None,
                        status: "failed".to_string(),
                    },
                );
            }
        }
    }
}

/// Attempt one fan-out child delivery, then fold the outcome into the parent
/// message status.
pub async fn attempt_child_delivery(
    db: &Db,
    client: &reqwest::Client,
    events: &broadcast::Sender<RegistryEvent>,
    max_retries: i64,
    delivery_id: &str,
) {
    let attempt = {
        let conn = db.conn();
        load_child_attempt(&conn, delivery_id)
    };
    let Some(attempt) = attempt else { return };
    let child_id = attempt.delivery_id.clone().expect("child attempt has id");

    let result = send_callback(
        client,
        &attempt.callback_url,
        &attempt.callback_secret,
        &attempt.message_id,
        attempt.body.clone(),
    )
    .await;

    let now = chrono::Utc::now().to_rfc3339();
    match result {
        Ok(()) => {
            {
                let conn = db.conn();
                conn.execute(
                    "UPDATE message_deliveries SET status = 'delivered', delivered_at = ?1,
                     next_retry_at = NULL, error_message = NULL WHERE id = ?2",
                    params![&now, &child_id],
                )
                .ok();
            }
            publish_via(
                events,
                RegistryEvent::MessageReceived {
                    recipient_user_id: attempt.recipient_user_id.clone(),
                    message_id: attempt.message_id.clone(),
                    sender_user_id: attempt.sender_user_id.clone(),
                    recipient_connection_id: Some(attempt.recipient_connection_id.clone()),
                },
            );
            publish_via(
                events,
                RegistryEvent::DeliveryStatus {
                    sender_user_id: attempt.sender_user_id.clone(),
                    message_id: attempt.message_id.clone(),
                    delivery_id: Some(child_id),
                    status: "delivered".to_string(),
                },
            );
        }
        Err(error) => {
            let failed = attempt.retry_count >= max_retries;
            {
                let conn = db.conn();
                if failed {
                    conn.execute(
                        "UPDATE message_deliveries SET status = 'failed', next_retry_at = NULL,
                         error_message = ?1 WHERE id = ?2",
                        params![&error, &child_id],
                    )
                    .ok();
                } else {
                    let next = chrono::Utc::now()
                        + chrono::Duration::seconds(backoff_delay_secs(attempt.retry_count) as i64);
                    conn.execute(
                        "UPDATE message_deliveries SET retry_count = retry_count + 1,
                         next_retry_at = ?1, error_message = ?2 WHERE id = ?3",
                        params![next.to_rfc3339(), &error, &child_id],
                    )
                    .ok();
                }
            }
            if failed {
                publish_via(
                    events,
                    RegistryEvent::DeliveryStatus {
                        sender_user_id: attempt.sender_user_id.clone(),
                        message_id: attempt.message_id.clone(),
                        delivery_id: Some(child_id),
                        status: "failed".to_string(),
                    },
                );
            }
        }
    }

    finalize_parent(db, events, &attempt.message_id, &attempt.sender_user_id);
}

/// Aggregate children into the parent message: delivered iff all children
/// delivered; pending while any child is still pending; failed once every
/// child is terminal and at least one failed.
pub fn recompute_parent_status(conn: &Connection, message_id: &str) -> Option<String> {
    let (total, delivered, pending): (i64, i64, i64) = conn
        .query_row(
            "SELECT COUNT(*),
                    SUM(CASE WHEN status = 'delivered' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END)
             FROM message_deliveries WHERE message_id = ?1",
            params![message_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    r.get::<_, Option<i64>>(2)?.unwrap_or(0),
                ))
            },
        )
        .unwrap_or((0, 0, 0));
    if total == 0 {
        return None;
    }
    let new_status = if delivered == total {
        "delivered"
    } else if pending > 0 {
        "pending"
    } else {
        "failed"
    };

    let current: Option<String> = conn
        .query_row(
            "SELECT status FROM messages WHERE id = ?1",
            params![message_id],
            |r| r.get(0),
        )
        .optional()
        .unwrap_or(None);
    if current.as_deref() == Some(new_status) {
        return None;
    }

    if new_status == "delivered" {
        conn.execute(
            "UPDATE messages SET status = 'delivered', delivered_at = ?1 WHERE id = ?2",
            params![chrono::Utc::now().to_rfc3339(), message_id],
        )
        .ok();
    } else {
        conn.execute(
            "UPDATE messages SET status = ?1 WHERE id = ?2",
            params![new_status, message_id],
        )
        .ok();
    }
    Some(new_status.to_string())
}

fn finalize_parent(
    db: &Db,
    events: &broadcast::Sender<RegistryEvent>,
    message_id: &str,
    sender_user_id: &str,
) {
    let changed = {
        let conn = db.conn();
        recompute_parent_status(&conn, message_id)
    };
    if let Some(status) = changed
        && status != "pending"
    {
        publish_via(
            events,
            RegistryEvent::DeliveryStatus {
                sender_user_id: sender_user_id.to_string(),
                message_id: message_id.to_string(),
                delivery_id: None,
                status,
            },
        );
    }
}

/// Signed empty-payload ping used by `POST /agents/:id/ping`. Returns the
/// round-trip latency on success.
pub async fn ping_connection(
    client: &reqwest::Client,
    url: &str,
    secret: &str,
    timeout_secs: u64,
) -> Result<u128, String> {
    let body = serde_json::json!({
        "type": "ping",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
    .to_string();
    let signature = sign_body(secret, body.as_bytes());
    let started = std::time::Instant::now();
    let result = client
        .post(url)
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .header("Content-Type", "application/json")
        .header(
            "X-Mahilo-Timestamp",
            chrono::Utc::now().timestamp().to_string(),
        )
        .header("X-Mahilo-Signature", format!("sha256={signature}"))
        .body(body)
        .send()
        .await;
    match result {
        Ok(resp) if resp.status().is_success() => Ok(started.elapsed().as_millis()),
        Ok(resp) => Err(format!("HTTP {}", resp.status())),
        Err(e) => Err(format!("request error: {e}")),
    }
}

/// Background retry processor. Driven entirely from persisted `pending` rows
/// with a due `next_retry_at`, so it tolerates process restart; the in-memory
/// portion is just the sweep timer.
pub fn spawn_retry_processor(
    db: Db,
    config: RegistryConfig,
    events: broadcast::Sender<RegistryEvent>,
) {
    tokio::spawn(async move {
        let client = http_client(config.callback_timeout_secs);
        loop {
            tokio::time::sleep(std::time::Duration::from_millis(
                config.retry_sweep_interval_ms,
            ))
            .await;

            let now = chrono::Utc::now().to_rfc3339();
            // Rows whose first attempt never concluded (crash or cancelled
            // request) have a NULL schedule; pick them up once the inline
            // attempt must have timed out.
            let stale_cutoff = (chrono::Utc::now()
                - chrono::Duration::seconds(config.callback_timeout_secs as i64 + 5))
            .to_rfc3339();
            let due_messages: Vec<String> = {
                let conn = db.conn();
                let mut stmt = match conn.prepare(
                    "SELECT id FROM messages
                     WHERE status = 'pending' AND recipient_type = 'user'
                       AND ((next_retry_at IS NOT NULL AND next_retry_at <= ?1)
                         OR (next_retry_at IS NULL AND created_at <= ?2))
                     ORDER BY created_at ASC",
                ) {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                stmt.query_map(params![&now, &stale_cutoff], |r| r.get(0))
                    .map(|rows| rows.filter_map(|r| r.ok()).collect())
                    .unwrap_or_default()
            };
            for message_id in due_messages {
                attempt_user_delivery(&db, &client, &events, config.max_retries, &message_id)
                    .await;
            }

            let due_children: Vec<String> = {
                let conn = db.conn();
                let mut stmt = match conn.prepare(
                    "SELECT id FROM message_deliveries
                     WHERE status = 'pending'
                       AND ((next_retry_at IS NOT NULL AND next_retry_at <= ?1)
                         OR (next_retry_at IS NULL AND created_at <= ?2))
                     ORDER BY created_at ASC",
                ) {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                stmt.query_map(params![&now, &stale_cutoff], |r| r.get(0))
                    .map(|rows| rows.filter_map(|r| r.ok()).collect())
                    .unwrap_or_default()
            };
            for delivery_id in due_children {
                attempt_child_delivery(&db, &client, &events, config.max_retries, &delivery_id)
                    .await;
            }
        }
    });
}
