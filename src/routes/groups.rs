use crate::db::{self, Db};
use crate::events::{EventBus, RegistryEvent};
use crate::graph;
use crate::identity::Principal;
use crate::models::{CreateGroup, GroupMemberView, GroupView, InviteToGroup, TransferGroup};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, delete, get, post};
use rusqlite::{OptionalExtension, params};

use super::{ApiError, conflict, forbidden, internal, not_found_error, validation};

#[derive(Debug, Clone)]
struct GroupRow {
    id: String,
    name: String,
    description: Option<String>,
    owner_user_id: String,
    invite_only: bool,
    created_at: String,
}

fn load_group(conn: &rusqlite::Connection, group_id: &str) -> Option<GroupRow> {
    conn.query_row(
        "SELECT id, name, description, owner_user_id, invite_only, created_at
         FROM groups WHERE id = ?1",
        params![group_id],
        |r| {
            Ok(GroupRow {
                id: r.get(0)?,
                name: r.get(1)?,
                description: r.get(2)?,
                owner_user_id: r.get(3)?,
                invite_only: r.get::<_, i64>(4)? != 0,
                created_at: r.get(5)?,
            })
        },
    )
    .optional()
    .unwrap_or(None)
}

fn view_of(conn: &rusqlite::Connection, group: &GroupRow, caller_id: &str) -> GroupView {
    let member_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM group_memberships WHERE group_id = ?1 AND status = 'active'",
            params![&group.id],
            |r| r.get(0),
        )
        .unwrap_or(0);
    let membership: Option<(String, String)> = conn
        .query_row(
            "SELECT role, status FROM group_memberships WHERE group_id = ?1 AND user_id = ?2",
            params![&group.id, caller_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .unwrap_or(None);
    let (my_role, my_status) = match membership {
        Some((role, status)) => (Some(role), Some(status)),
        None => (None, None),
    };
    GroupView {
        id: group.id.clone(),
        name: group.name.clone(),
        description: group.description.clone(),
        owner_user_id: group.owner_user_id.clone(),
        invite_only: group.invite_only,
        member_count,
        my_role,
        my_status,
        created_at: group.created_at.clone(),
    }
}

/// Create a group. The owner membership is written in the same transaction as
/// the group row.
#[post("/api/v1/groups", format = "json", data = "<body>")]
pub fn create_group(
    db: &State<Db>,
    principal: Principal,
    body: Json<CreateGroup>,
) -> Result<(Status, Json<GroupView>), ApiError> {
    let name = body.name.trim().to_string();
    if name.is_empty() || name.len() > 100 {
        return Err(validation("Group name must be 1-100 characters"));
    }

    let group_id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let invite_only = body.invite_only.unwrap_or(false);

    let mut conn = db.conn();
    let tx = conn.transaction().map_err(|e| internal(e.to_string()))?;
    tx.execute(
        "INSERT INTO groups (id, name, description, owner_user_id, invite_only, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            &group_id,
            &name,
            &body.description,
            &principal.user_id,
            invite_only as i64,
            &now
        ],
    )
    .map_err(|e| {
        if db::is_unique_violation(&e) {
            conflict(format!("Group name '{name}' is already taken"))
        } else {
            internal(e.to_string())
        }
    })?;
    tx.execute(
        "INSERT INTO group_memberships (group_id, user_id, role, status, created_at)
         VALUES (?1, ?2, 'owner', 'active', ?3)",
        params![&group_id, &principal.user_id, &now],
    )
    .map_err(|e| internal(e.to_string()))?;
    tx.commit().map_err(|e| internal(e.to_string()))?;

    let group = load_group(&conn, &group_id)
        .ok_or_else(|| internal("Group disappeared during create"))?;
    Ok((Status::Created, Json(view_of(&conn, &group, &principal.user_id))))
}

#[get("/api/v1/groups")]
pub fn list_groups(
    db: &State<Db>,
    principal: Principal,
) -> Result<Json<Vec<GroupView>>, ApiError> {
    let conn = db.conn();
    let mut stmt = conn
        .prepare(
            "SELECT g.id FROM groups g
             JOIN group_memberships m ON m.group_id = g.id
             WHERE m.user_id = ?1
             ORDER BY g.created_at DESC",
        )
        .map_err(|e| internal(e.to_string()))?;
    let ids: Vec<String> = stmt
        .query_map(params![&principal.user_id], |r| r.get(0))
        .map_err(|e| internal(e.to_string()))?
        .filter_map(|r| r.ok())
        .collect();
    drop(stmt);

    let views: Vec<GroupView> = ids
        .iter()
        .filter_map(|id| load_group(&conn, id))
        .map(|g| view_of(&conn, &g, &principal.user_id))
        .collect();
    Ok(Json(views))
}

#[get("/api/v1/groups/<group_id>")]
pub fn get_group(
    db: &State<Db>,
    principal: Principal,
    group_id: &str,
) -> Result<Json<GroupView>, ApiError> {
    let conn = db.conn();
    let group = load_group(&conn, group_id).ok_or_else(|| not_found_error("Group not found"))?;
    Ok(Json(view_of(&conn, &group, &principal.user_id)))
}

/// Invite a user. Owners and admins invite; the invitation is a membership
/// row in `invited` status that the invitee's join promotes.
#[post("/api/v1/groups/<group_id>/invite", format = "json", data = "<body>")]
pub fn invite_to_group(
    db: &State<Db>,
    events: &State<EventBus>,
    principal: Principal,
    group_id: &str,
    body: Json<InviteToGroup>,
) -> Result<(Status, Json<serde_json::Value>), ApiError> {
    let conn = db.conn();
    let group = load_group(&conn, group_id).ok_or_else(|| not_found_error("Group not found"))?;
    if !graph::can_manage_group_policy(&conn, &principal.user_id, group_id) {
        return Err(forbidden("Only group owners and admins can invite"));
    }
    let invitee = graph::find_user_by_username(&conn, &body.username)
        .ok_or_else(|| not_found_error("User not found"))?;

    conn.execute(
        "INSERT INTO group_memberships (group_id, user_id, role, status, invited_by_user_id, created_at)
         VALUES (?1, ?2, 'member', 'invited', ?3, ?4)",
        params![
            group_id,
            &invitee.id,
            &principal.user_id,
            chrono::Utc::now().to_rfc3339()
        ],
    )
    .map_err(|e| {
        if db::is_unique_violation(&e) {
            conflict("User already has a membership or invitation")
        } else {
            internal(e.to_string())
        }
    })?;

    events.publish(RegistryEvent::GroupInvite {
        invitee_user_id: invitee.id.clone(),
        group_id: group_id.to_string(),
        group_name: group.name,
        invited_by: principal.username,
    });

    Ok((
        Status::Created,
        Json(serde_json::json!({
            "groupId": group_id,
            "userId": invitee.id,
            "status": "invited"
        })),
    ))
}

/// Join a group. Public groups accept direct joins; invite-only groups
/// require a prior invitation, which this promotes to active.
#[post("/api/v1/groups/<group_id>/join")]
pub fn join_group(
    db: &State<Db>,
    principal: Principal,
    group_id: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn();
    let group = load_group(&conn, group_id).ok_or_else(|| not_found_error("Group not found"))?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT status FROM group_memberships WHERE group_id = ?1 AND user_id = ?2",
            params![group_id, &principal.user_id],
            |r| r.get(0),
        )
        .optional()
        .unwrap_or(None);

    match existing.as_deref() {
        Some("active") => Err(conflict("Already a member")),
        Some(_) => {
            conn.execute(
                "UPDATE group_memberships SET status = 'active'
                 WHERE group_id = ?1 AND user_id = ?2",
                params![group_id, &principal.user_id],
            )
            .map_err(|e| internal(e.to_string()))?;
            Ok(Json(serde_json::json!({"groupId": group_id, "status": "active"})))
        }
        None if group.invite_only => {
            Err(forbidden("This group is invite-only"))
        }
        None => {
            conn.execute(
                "INSERT INTO group_memberships (group_id, user_id, role, status, created_at)
                 VALUES (?1, ?2, 'member', 'active', ?3)",
                params![group_id, &principal.user_id, chrono::Utc::now().to_rfc3339()],
            )
            .map_err(|e| {
                if db::is_unique_violation(&e) {
                    conflict("Already a member")
                } else {
                    internal(e.to_string())
                }
            })?;
            Ok(Json(serde_json::json!({"groupId": group_id, "status": "active"})))
        }
    }
}

/// Leave a group. The owner must transfer first while other active members
/// remain; an owner leaving an otherwise-empty group deletes it.
#[delete("/api/v1/groups/<group_id>/leave")]
pub fn leave_group(
    db: &State<Db>,
    principal: Principal,
    group_id: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn();
    let group = load_group(&conn, group_id).ok_or_else(|| not_found_error("Group not found"))?;

    let membership: Option<String> = conn
        .query_row(
            "SELECT role FROM group_memberships
             WHERE group_id = ?1 AND user_id = ?2 AND status = 'active'",
            params![group_id, &principal.user_id],
            |r| r.get(0),
        )
        .optional()
        .unwrap_or(None);
    let role = membership.ok_or_else(|| not_found_error("You are not a member of this group"))?;

    if role == "owner" && group.owner_user_id == principal.user_id {
        let other_active: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM group_memberships
                 WHERE group_id = ?1 AND user_id != ?2 AND status = 'active'",
                params![group_id, &principal.user_id],
                |r| r.get(0),
            )
            .unwrap_or(0);
        if other_active > 0 {
            return Err(conflict(
                "Transfer group ownership before leaving (other active members remain)",
            ));
        }
        // Last one out: delete the group, cascading memberships.
        conn.execute("DELETE FROM groups WHERE id = ?1", params![group_id])
            .map_err(|e| internal(e.to_string()))?;
        return Ok(Json(serde_json::json!({"left": true, "groupDeleted": true})));
    }

    conn.execute(
        "DELETE FROM group_memberships WHERE group_id = ?1 AND user_id = ?2",
        params![group_id, &principal.user_id],
    )
    .map_err(|e| internal(e.to_string()))?;
    Ok(Json(serde_json::json!({"left": true, "groupDeleted": false})))
}

#[get("/api/v1/groups/<group_id>/members")]
pub fn group_members(
    db: &State<Db>,
    principal: Principal,
    group_id: &str,
) -> Result<Json<Vec<GroupMemberView>>, ApiError> {
    let conn = db.conn();
    load_group(&conn, group_id).ok_or_else(|| not_found_error("Group not found"))?;
    if !graph::is_active_member(&conn, &principal.user_id, group_id) {
        return Err(forbidden("Only members can list the group roster"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT m.user_id, u.username, m.role, m.status, m.invited_by_user_id, m.created_at
             FROM group_memberships m
             JOIN users u ON u.id = m.user_id
             WHERE m.group_id = ?1
             ORDER BY m.created_at ASC",
        )
        .map_err(|e| internal(e.to_string()))?;
    let members: Vec<GroupMemberView> = stmt
        .query_map(params![group_id], |r| {
            Ok(GroupMemberView {
                user_id: r.get(0)?,
                username: r.get(1)?,
                role: r.get(2)?,
                status: r.get(3)?,
                invited_by_user_id: r.get(4)?,
                joined_at: r.get(5)?,
            })
        })
        .map_err(|e| internal(e.to_string()))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(Json(members))
}

/// Transfer ownership to an existing active member. The old owner stays in
/// the group as a regular member.
#[post("/api/v1/groups/<group_id>/transfer", format = "json", data = "<body>")]
pub fn transfer_group(
    db: &State<Db>,
    principal: Principal,
    group_id: &str,
    body: Json<TransferGroup>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut conn = db.conn();
    let group = load_group(&conn, group_id).ok_or_else(|| not_found_error("Group not found"))?;
    if group.owner_user_id != principal.user_id {
        return Err(forbidden("Only the owner can transfer the group"));
    }
    if body.new_owner_user_id == principal.user_id {
        return Err(validation("Cannot transfer the group to yourself"));
    }

    let target_active: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM group_memberships
             WHERE group_id = ?1 AND user_id = ?2 AND status = 'active'",
            params![group_id, &body.new_owner_user_id],
            |r| r.get(0),
        )
        .unwrap_or(0);
    if target_active == 0 {
        return Err(not_found_error("New owner must be an active group member"));
    }

    let tx = conn.transaction().map_err(|e| internal(e.to_string()))?;
    tx.execute(
        "UPDATE groups SET owner_user_id = ?1 WHERE id = ?2",
        params![&body.new_owner_user_id, group_id],
    )
    .map_err(|e| internal(e.to_string()))?;
    tx.execute(
        "UPDATE group_memberships SET role = 'owner'
         WHERE group_id = ?1 AND user_id = ?2",
        params![group_id, &body.new_owner_user_id],
    )
    .map_err(|e| internal(e.to_string()))?;
    tx.execute(
        "UPDATE group_memberships SET role = 'member'
         WHERE group_id = ?1 AND user_id = ?2",
        params![group_id, &principal.user_id],
    )
    .map_err(|e| internal(e.to_string()))?;
    tx.commit().map_err(|e| internal(e.to_string()))?;

    Ok(Json(serde_json::json!({
        "groupId": group_id,
        "ownerUserId": body.new_owner_user_id
    })))
}

#[delete("/api/v1/groups/<group_id>")]
pub fn delete_group(
    db: &State<Db>,
    principal: Principal,
    group_id: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn();
    let group = load_group(&conn, group_id).ok_or_else(|| not_found_error("Group not found"))?;
    if group.owner_user_id != principal.user_id {
        return Err(forbidden("Only the owner can delete the group"));
    }
    conn.execute("DELETE FROM groups WHERE id = ?1", params![group_id])
        .map_err(|e| internal(e.to_string()))?;
    Ok(Json(serde_json::json!({"deleted": true, "groupId": group_id})))
}
