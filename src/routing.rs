use crate::models::RoutingHints;
use rusqlite::{Connection, OptionalExtension, params};

/// Connection row as the router sees it (includes the callback secret; never
/// serialized to API callers).
#[derive(Debug, Clone)]
pub struct ConnectionRow {
    pub id: String,
    pub user_id: String,
    pub framework: String,
    pub label: String,
    pub capabilities: Vec<String>,
    pub routing_priority: i64,
    pub callback_url: String,
    pub callback_secret: String,
    pub status: String,
}

fn connection_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConnectionRow> {
    let capabilities_json: String = row.get(4)?;
    Ok(ConnectionRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        framework: row.get(2)?,
        label: row.get(3)?,
        capabilities: serde_json::from_str(&capabilities_json).unwrap_or_default(),
        routing_priority: row.get(5)?,
        callback_url: row.get(6)?,
        callback_secret: row.get(7)?,
        status: row.get(8)?,
    })
}

const CONNECTION_COLUMNS: &str = "id, user_id, framework, label, capabilities, \
                                  routing_priority, callback_url, callback_secret, status";

pub fn connection_by_id(conn: &Connection, connection_id: &str) -> Option<ConnectionRow> {
    conn.query_row(
        &format!("SELECT {CONNECTION_COLUMNS} FROM agent_connections WHERE id = ?1"),
        params![connection_id],
        connection_from_row,
    )
    .optional()
    .unwrap_or(None)
}

/// All active connections for a user, highest routing priority first. The
/// secondary created_at sort keeps selection stable across equal priorities.
pub fn active_connections(conn: &Connection, user_id: &str) -> Vec<ConnectionRow> {
    let mut stmt = match conn.prepare(&format!(
        "SELECT {CONNECTION_COLUMNS} FROM agent_connections
         WHERE user_id = ?1 AND status = 'active'
         ORDER BY routing_priority DESC, created_at ASC"
    )) {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    stmt.query_map(params![user_id], connection_from_row)
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
}

/// Pick a connection from a priority-ordered candidate list. Label hints win
/// over tag hints; with no hint (or no hint match) the head of the list — the
/// highest-priority connection — is chosen.
pub fn select_connection<'a>(
    candidates: &'a [ConnectionRow],
    hints: Option<&RoutingHints>,
) -> Option<&'a ConnectionRow> {
    if candidates.is_empty() {
        return None;
    }
    if let Some(hints) = hints {
        if let Some(labels) = &hints.labels
            && let Some(found) = candidates.iter().find(|c| labels.contains(&c.label))
        {
            return Some(found);
        }
        if let Some(tags) = &hints.tags
            && let Some(found) = candidates
                .iter()
                .find(|c| c.capabilities.iter().any(|cap| tags.contains(cap)))
        {
            return Some(found);
        }
    }
    candidates.first()
}
