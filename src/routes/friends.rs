use crate::db::Db;
use crate::events::{EventBus, RegistryEvent};
use crate::graph;
use crate::identity::Principal;
use crate::models::{AssignRole, FriendRequest, FriendshipView};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, delete, get, post};
use rusqlite::params;

use super::{ApiError, conflict, forbidden, internal, not_found_error, validation};

fn view_for(
    conn: &rusqlite::Connection,
    caller_id: &str,
    friendship: &graph::FriendshipRow,
) -> Option<FriendshipView> {
    let (other_id, direction) = if friendship.requester_id == caller_id {
        (&friendship.addressee_id, "requester")
    } else {
        (&friendship.requester_id, "addressee")
    };
    let other = graph::find_user_by_id(conn, other_id)?;
    Some(FriendshipView {
        friendship_id: friendship.id.clone(),
        username: other.username,
        display_name: other.display_name,
        status: friendship.status.clone(),
        direction: direction.to_string(),
        roles: graph::roles_for_friendship(conn, &friendship.id),
        created_at: friendship.created_at.clone(),
    })
}

/// Send (or implicitly accept) a friend request. A pending request in the
/// opposite direction auto-accepts instead of creating a second row.
#[post("/api/v1/friends/request", format = "json", data = "<body>")]
pub fn friend_request(
    db: &State<Db>,
    events: &State<EventBus>,
    principal: Principal,
    body: Json<FriendRequest>,
) -> Result<(Status, Json<serde_json::Value>), ApiError> {
    let conn = db.conn();
    let target = graph::find_user_by_username(&conn, &body.username)
        .ok_or_else(|| not_found_error("User not found"))?;
    if target.id == principal.user_id {
        return Err(validation("Cannot send a friend request to yourself"));
    }

    if let Some(existing) = graph::friendship_between(&conn, &principal.user_id, &target.id) {
        return match existing.status.as_str() {
            "accepted" => Err(conflict("Already friends")),
            "blocked" => Err(forbidden("This friendship is blocked")),
            "pending" if existing.requester_id == principal.user_id => {
                Err(conflict("Friend request already pending"))
            }
            "pending" => {
                // Reverse pending request exists — accept it in place.
                conn.execute(
                    "UPDATE friendships SET status = 'accepted' WHERE id = ?1",
                    params![&existing.id],
                )
                .map_err(|e| internal(e.to_string()))?;
                Ok((
                    Status::Ok,
                    Json(serde_json::json!({
                        "friendshipId": existing.id,
                        "status": "accepted",
                        "autoAccepted": true
                    })),
                ))
            }
            other => Err(internal(format!("Unexpected friendship status '{other}'"))),
        };
    }

    let friendship_id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO friendships (id, requester_id, addressee_id, status, created_at)
         VALUES (?1, ?2, ?3, 'pending', ?4)",
        params![&friendship_id, &principal.user_id, &target.id, &now],
    )
    .map_err(|e| {
        if crate::db::is_unique_violation(&e) {
            conflict("Friend request already pending")
        } else {
            internal(e.to_string())
        }
    })?;

    events.publish(RegistryEvent::FriendRequest {
        addressee_user_id: target.id,
        friendship_id: friendship_id.clone(),
        requester: principal.username,
    });

    Ok((
        Status::Created,
        Json(serde_json::json!({
            "friendshipId": friendship_id,
            "status": "pending"
        })),
    ))
}

#[post("/api/v1/friends/<friendship_id>/accept")]
pub fn accept_friend(
    db: &State<Db>,
    principal: Principal,
    friendship_id: &str,
) -> Result<Json<FriendshipView>, ApiError> {
    let conn = db.conn();
    let friendship = graph::friendship_by_id(&conn, friendship_id)
        .ok_or_else(|| not_found_error("Friendship not found"))?;
    if friendship.addressee_id != principal.user_id {
        return Err(forbidden("Only the addressee can accept a friend request"));
    }
    if friendship.status != "pending" {
        return Err(conflict(format!(
            "Friendship is already {}",
            friendship.status
        )));
    }
    conn.execute(
        "UPDATE friendships SET status = 'accepted' WHERE id = ?1",
        params![friendship_id],
    )
    .map_err(|e| internal(e.to_string()))?;

    let updated = graph::friendship_by_id(&conn, friendship_id)
        .ok_or_else(|| internal("Friendship disappeared during accept"))?;
    view_for(&conn, &principal.user_id, &updated)
        .map(Json)
        .ok_or_else(|| internal("Friend user missing"))
}

#[post("/api/v1/friends/<friendship_id>/reject")]
pub fn reject_friend(
    db: &State<Db>,
    principal: Principal,
    friendship_id: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn();
    let friendship = graph::friendship_by_id(&conn, friendship_id)
        .ok_or_else(|| not_found_error("Friendship not found"))?;
    if friendship.addressee_id != principal.user_id {
        return Err(forbidden("Only the addressee can reject a friend request"));
    }
    if friendship.status != "pending" {
        return Err(conflict(format!(
            "Friendship is already {}",
            friendship.status
        )));
    }
    conn.execute(
        "DELETE FROM friendships WHERE id = ?1",
        params![friendship_id],
    )
    .map_err(|e| internal(e.to_string()))?;
    Ok(Json(serde_json::json!({"rejected": true, "friendshipId": friendship_id})))
}

/// Block the other side. The row is kept so future requests stay blocked.
#[post("/api/v1/friends/<friendship_id>/block")]
pub fn block_friend(
    db: &State<Db>,
    principal: Principal,
    friendship_id: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn();
    let friendship = graph::friendship_by_id(&conn, friendship_id)
        .ok_or_else(|| not_found_error("Friendship not found"))?;
    if friendship.requester_id != principal.user_id
        && friendship.addressee_id != principal.user_id
    {
        return Err(forbidden("Not your friendship"));
    }
    conn.execute(
        "UPDATE friendships SET status = 'blocked' WHERE id = ?1",
        params![friendship_id],
    )
    .map_err(|e| internal(e.to_string()))?;
    Ok(Json(serde_json::json!({"blocked": true, "friendshipId": friendship_id})))
}

#[get("/api/v1/friends?<status>")]
pub fn list_friends(
    db: &State<Db>,
    principal: Principal,
    status: Option<&str>,
) -> Result<Json<Vec<FriendshipView>>, ApiError> {
    if let Some(s) = status
        && !["pending", "accepted", "blocked"].contains(&s)
    {
        return Err(validation("status must be pending, accepted or blocked"));
    }

    let conn = db.conn();
    let mut sql = String::from(
        "SELECT id, requester_id, addressee_id, status, created_at FROM friendships
         WHERE (requester_id = ?1 OR addressee_id = ?1)",
    );
    let mut values: Vec<String> = vec![principal.user_id.clone()];
    if let Some(s) = status {
        sql.push_str(" AND status = ?2");
        values.push(s.to_string());
    }
    sql.push_str(" ORDER BY created_at DESC");

    let mut stmt = conn.prepare(&sql).map_err(|e| internal(e.to_string()))?;
    let refs: Vec<&dyn rusqlite::types::ToSql> = values
        .iter()
        .map(|v| v as &dyn rusqlite::types::ToSql)
        .collect();
    let rows: Vec<graph::FriendshipRow> = stmt
        .query_map(refs.as_slice(), |r| {
            Ok(graph::FriendshipRow {
                id: r.get(0)?,
                requester_id: r.get(1)?,
                addressee_id: r.get(2)?,
                status: r.get(3)?,
                created_at: r.get(4)?,
            })
        })
        .map_err(|e| internal(e.to_string()))?
        .filter_map(|r| r.ok())
        .collect();

    let views: Vec<FriendshipView> = rows
        .iter()
        .filter_map(|f| view_for(&conn, &principal.user_id, f))
        .collect();
    Ok(Json(views))
}

#[delete("/api/v1/friends/<friendship_id>")]
pub fn unfriend(
    db: &State<Db>,
    principal: Principal,
    friendship_id: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn();
    let friendship = graph::friendship_by_id(&conn, friendship_id)
        .ok_or_else(|| not_found_error("Friendship not found"))?;
    if friendship.requester_id != principal.user_id
        && friendship.addressee_id != principal.user_id
    {
        return Err(forbidden("Not your friendship"));
    }
    conn.execute(
        "DELETE FROM friendships WHERE id = ?1",
        params![friendship_id],
    )
    .map_err(|e| internal(e.to_string()))?;
    Ok(Json(serde_json::json!({"deleted": true, "friendshipId": friendship_id})))
}

// --- Friend roles ---

fn require_party(
    conn: &rusqlite::Connection,
    caller_id: &str,
    friendship_id: &str,
) -> Result<graph::FriendshipRow, ApiError> {
    let friendship = graph::friendship_by_id(conn, friendship_id)
        .ok_or_else(|| not_found_error("Friendship not found"))?;
    if friendship.requester_id != caller_id && friendship.addressee_id != caller_id {
        return Err(forbidden("Not your friendship"));
    }
    Ok(friendship)
}

#[get("/api/v1/friends/<friendship_id>/roles")]
pub fn list_friend_roles(
    db: &State<Db>,
    principal: Principal,
    friendship_id: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn();
    require_party(&conn, &principal.user_id, friendship_id)?;
    let roles = graph::roles_for_friendship(&conn, friendship_id);
    Ok(Json(serde_json::json!({
        "friendshipId": friendship_id,
        "roles": roles
    })))
}

/// Assign a role to a friendship. Assigning an already-assigned role is a
/// no-op, not an error.
#[post("/api/v1/friends/<friendship_id>/roles", format = "json", data = "<body>")]
pub fn assign_friend_role(
    db: &State<Db>,
    principal: Principal,
    friendship_id: &str,
    body: Json<AssignRole>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let role = body.role.trim().to_string();
    let conn = db.conn();
    require_party(&conn, &principal.user_id, friendship_id)?;
    if !graph::role_is_valid_for(&conn, &principal.user_id, &role) {
        return Err(not_found_error(format!("Role '{role}' not found")));
    }

    conn.execute(
        "INSERT OR IGNORE INTO friend_roles (friendship_id, role_name, created_at)
         VALUES (?1, ?2, ?3)",
        params![friendship_id, &role, chrono::Utc::now().to_rfc3339()],
    )
    .map_err(|e| internal(e.to_string()))?;

    Ok(Json(serde_json::json!({
        "friendshipId": friendship_id,
        "roles": graph::roles_for_friendship(&conn, friendship_id)
    })))
}

#[delete("/api/v1/friends/<friendship_id>/roles/<role>")]
pub fn remove_friend_role(
    db: &State<Db>,
    principal: Principal,
    friendship_id: &str,
    role: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn();
    require_party(&conn, &principal.user_id, friendship_id)?;
    let deleted = conn
        .execute(
            "DELETE FROM friend_roles WHERE friendship_id = ?1 AND role_name = ?2",
            params![friendship_id, role],
        )
        .map_err(|e| internal(e.to_string()))?;
    if deleted == 0 {
        return Err(not_found_error(format!(
            "Role '{role}' is not assigned to this friendship"
        )));
    }
    Ok(Json(serde_json::json!({
        "friendshipId": friendship_id,
        "roles": graph::roles_for_friendship(&conn, friendship_id)
    })))
}
