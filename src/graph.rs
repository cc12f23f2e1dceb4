use rusqlite::{Connection, OptionalExtension, params};

/// Minimal user row used by lookups across the graph and routing paths.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
}

pub fn find_user_by_username(conn: &Connection, username: &str) -> Option<UserRow> {
    conn.query_row(
        "SELECT id, username, display_name FROM users
         WHERE username = ?1 COLLATE NOCASE AND deleted_at IS NULL",
        params![username.trim()],
        |r| {
            Ok(UserRow {
                id: r.get(0)?,
                username: r.get(1)?,
                display_name: r.get(2)?,
            })
        },
    )
    .optional()
    .unwrap_or(None)
}

pub fn find_user_by_id(conn: &Connection, user_id: &str) -> Option<UserRow> {
    conn.query_row(
        "SELECT id, username, display_name FROM users WHERE id = ?1 AND deleted_at IS NULL",
        params![user_id],
        |r| {
            Ok(UserRow {
                id: r.get(0)?,
                username: r.get(1)?,
                display_name: r.get(2)?,
            })
        },
    )
    .optional()
    .unwrap_or(None)
}

/// A friendship row, direction preserved. At most one row exists per
/// unordered pair; authorization checks accept it in either direction.
#[derive(Debug, Clone)]
pub struct FriendshipRow {
    pub id: String,
    pub requester_id: String,
    pub addressee_id: String,
    pub status: String,
    pub created_at: String,
}

pub fn friendship_between(conn: &Connection, a: &str, b: &str) -> Option<FriendshipRow> {
    conn.query_row(
        "SELECT id, requester_id, addressee_id, status, created_at FROM friendships
         WHERE (requester_id = ?1 AND addressee_id = ?2)
            OR (requester_id = ?2 AND addressee_id = ?1)",
        params![a, b],
        |r| {
            Ok(FriendshipRow {
                id: r.get(0)?,
                requester_id: r.get(1)?,
                addressee_id: r.get(2)?,
                status: r.get(3)?,
                created_at: r.get(4)?,
            })
        },
    )
    .optional()
    .unwrap_or(None)
}

pub fn friendship_by_id(conn: &Connection, id: &str) -> Option<FriendshipRow> {
    conn.query_row(
        "SELECT id, requester_id, addressee_id, status, created_at FROM friendships WHERE id = ?1",
        params![id],
        |r| {
            Ok(FriendshipRow {
                id: r.get(0)?,
                requester_id: r.get(1)?,
                addressee_id: r.get(2)?,
                status: r.get(3)?,
                created_at: r.get(4)?,
            })
        },
    )
    .optional()
    .unwrap_or(None)
}

pub fn are_friends(conn: &Connection, a: &str, b: &str) -> bool {
    matches!(friendship_between(conn, a, b), Some(f) if f.status == "accepted")
}

pub fn can_send_to_user(conn: &Connection, sender: &str, recipient: &str) -> bool {
    are_friends(conn, sender, recipient)
}

pub fn is_active_member(conn: &Connection, user_id: &str, group_id: &str) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM group_memberships
         WHERE group_id = ?1 AND user_id = ?2 AND status = 'active'",
        params![group_id, user_id],
        |r| r.get::<_, i64>(0),
    )
    .map(|c| c > 0)
    .unwrap_or(false)
}

pub fn can_send_to_group(conn: &Connection, user_id: &str, group_id: &str) -> bool {
    is_active_member(conn, user_id, group_id)
}

pub fn can_manage_group_policy(conn: &Connection, user_id: &str, group_id: &str) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM group_memberships
         WHERE group_id = ?1 AND user_id = ?2 AND status = 'active'
           AND role IN ('owner', 'admin')",
        params![group_id, user_id],
        |r| r.get::<_, i64>(0),
    )
    .map(|c| c > 0)
    .unwrap_or(false)
}

/// Roles attached to the friendship between two users (empty when no
/// friendship exists). Role-scoped policies key off these.
pub fn roles_between(conn: &Connection, a: &str, b: &str) -> Vec<String> {
    let Some(friendship) = friendship_between(conn, a, b) else {
        return Vec::new();
    };
    roles_for_friendship(conn, &friendship.id)
}

pub fn roles_for_friendship(conn: &Connection, friendship_id: &str) -> Vec<String> {
    let mut stmt = match conn.prepare(
        "SELECT role_name FROM friend_roles WHERE friendship_id = ?1 ORDER BY role_name ASC",
    ) {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    stmt.query_map(params![friendship_id], |r| r.get(0))
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
}

/// A role is valid for a user when it is a system role or one of their own
/// custom roles.
pub fn role_is_valid_for(conn: &Connection, user_id: &str, role_name: &str) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM roles
         WHERE name = ?1 AND (user_id IS NULL OR user_id = ?2)",
        params![role_name, user_id],
        |r| r.get::<_, i64>(0),
    )
    .map(|c| c > 0)
    .unwrap_or(false)
}

/// Messages exchanged between two users in either direction (direct sends
/// only; group traffic is not pairwise).
pub fn interaction_count(conn: &Connection, a: &str, b: &str) -> i64 {
    conn.query_row(
        "SELECT COUNT(*) FROM messages
         WHERE recipient_type = 'user'
           AND ((sender_user_id = ?1 AND recipient_id = ?2)
             OR (sender_user_id = ?2 AND recipient_id = ?1))",
        params![a, b],
        |r| r.get(0),
    )
    .unwrap_or(0)
}
