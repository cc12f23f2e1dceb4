use crate::db::Db;
use crate::graph;
use crate::identity::Principal;
use crate::models::{
    ContextRecipient, ContextResponse, CreatePolicy, PolicyView, RecentInteraction, UpdatePolicy,
};
use crate::policy;
use rocket::form::FromForm;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, delete, get, patch, post};
use rusqlite::{OptionalExtension, params};

use super::{ApiError, forbidden, internal, not_found_error, validation};

fn load_policy(conn: &rusqlite::Connection, policy_id: &str) -> Option<PolicyView> {
    conn.query_row(
        "SELECT id, user_id, scope, target_id, policy_type, policy_content,
                priority, enabled, created_at, updated_at
         FROM policies WHERE id = ?1",
        params![policy_id],
        |r| {
            Ok(PolicyView {
                id: r.get(0)?,
                user_id: r.get(1)?,
                scope: r.get(2)?,
                target_id: r.get(3)?,
                policy_type: r.get(4)?,
                policy_content: r.get(5)?,
                priority: r.get(6)?,
                enabled: r.get::<_, i64>(7)? != 0,
                created_at: r.get(8)?,
                updated_at: r.get(9)?,
            })
        },
    )
    .optional()
    .unwrap_or(None)
}

/// Group-scoped policies are shared-administered: any owner/admin of the
/// target group may manage them. Every other scope binds to the creator.
fn can_manage(conn: &rusqlite::Connection, caller_id: &str, policy: &PolicyView) -> bool {
    if policy.user_id == caller_id {
        return true;
    }
    policy.scope == "group"
        && policy
            .target_id
            .as_deref()
            .is_some_and(|group_id| graph::can_manage_group_policy(conn, caller_id, group_id))
}

#[post("/api/v1/policies", format = "json", data = "<body>")]
pub fn create_policy(
    db: &State<Db>,
    principal: Principal,
    body: Json<CreatePolicy>,
) -> Result<(Status, Json<PolicyView>), ApiError> {
    if !policy::SCOPES.contains(&body.scope.as_str()) {
        return Err(validation(format!(
            "scope must be one of: {}",
            policy::SCOPES.join(", ")
        )));
    }
    policy::parse_policy_content(&body.policy_type, &body.policy_content)
        .map_err(validation)?;

    let conn = db.conn();
    let target_id = body.target_id.as_deref().map(str::trim).filter(|s| !s.is_empty());
    match body.scope.as_str() {
        "global" => {
            if target_id.is_some() {
                return Err(validation("Global policies must not have a targetId"));
            }
        }
        "user" => {
            let target = target_id.ok_or_else(|| validation("User policies require a targetId"))?;
            if graph::find_user_by_id(&conn, target).is_none() {
                return Err(not_found_error("Target user not found"));
            }
        }
        "group" => {
            let target =
                target_id.ok_or_else(|| validation("Group policies require a targetId"))?;
            if !graph::can_manage_group_policy(&conn, &principal.user_id, target) {
                return Err(forbidden(
                    "Only group owners and admins can manage group policies",
                ));
            }
        }
        "role" => {
            let target = target_id.ok_or_else(|| validation("Role policies require a targetId"))?;
            if !graph::role_is_valid_for(&conn, &principal.user_id, target) {
                return Err(validation(format!("Role '{target}' is not valid for you")));
            }
        }
        _ => unreachable!("scope validated above"),
    }

    let policy_id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO policies (id, user_id, scope, target_id, policy_type, policy_content,
                               priority, enabled, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            &policy_id,
            &principal.user_id,
            &body.scope,
            &target_id,
            &body.policy_type,
            &body.policy_content,
            body.priority.unwrap_or(0),
            body.enabled.unwrap_or(true) as i64,
            &now
        ],
    )
    .map_err(|e| internal(e.to_string()))?;

    let created = load_policy(&conn, &policy_id)
        .ok_or_else(|| internal("Policy disappeared during create"))?;
    Ok((Status::Created, Json(created)))
}

#[derive(Debug, FromForm)]
pub struct PolicyQuery {
    pub scope: Option<String>,
    #[field(name = "targetId")]
    pub target_id: Option<String>,
}

#[get("/api/v1/policies?<query..>")]
pub fn list_policies(
    db: &State<Db>,
    principal: Principal,
    query: PolicyQuery,
) -> Result<Json<Vec<PolicyView>>, ApiError> {
    let conn = db.conn();

    // Shared administration: an admin filtering on a group they manage sees
    // that group's policies regardless of creator.
    if query.scope.as_deref() == Some("group")
        && let Some(group_id) = query.target_id.as_deref()
        && graph::can_manage_group_policy(&conn, &principal.user_id, group_id)
    {
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, scope, target_id, policy_type, policy_content,
                        priority, enabled, created_at, updated_at
                 FROM policies WHERE scope = 'group' AND target_id = ?1
                 ORDER BY priority DESC, created_at ASC",
            )
            .map_err(|e| internal(e.to_string()))?;
        let policies: Vec<PolicyView> = stmt
            .query_map(params![group_id], |r| {
                Ok(PolicyView {
                    id: r.get(0)?,
                    user_id: r.get(1)?,
                    scope: r.get(2)?,
                    target_id: r.get(3)?,
                    policy_type: r.get(4)?,
                    policy_content: r.get(5)?,
                    priority: r.get(6)?,
                    enabled: r.get::<_, i64>(7)? != 0,
                    created_at: r.get(8)?,
                    updated_at: r.get(9)?,
                })
            })
            .map_err(|e| internal(e.to_string()))?
            .filter_map(|r| r.ok())
            .collect();
        return Ok(Json(policies));
    }

    let mut sql = String::from(
        "SELECT id, user_id, scope, target_id, policy_type, policy_content,
                priority, enabled, created_at, updated_at
         FROM policies WHERE user_id = ?1",
    );
    let mut values: Vec<String> = vec![principal.user_id.clone()];
    let mut idx = 2;
    if let Some(ref scope) = query.scope {
        sql.push_str(&format!(" AND scope = ?{idx}"));
        values.push(scope.clone());
        idx += 1;
    }
    if let Some(ref target) = query.target_id {
        sql.push_str(&format!(" AND target_id = ?{idx}"));
        values.push(target.clone());
    }
    sql.push_str(" ORDER BY priority DESC, created_at ASC");

    let mut stmt = conn.prepare(&sql).map_err(|e| internal(e.to_string()))?;
    let refs: Vec<&dyn rusqlite::types::ToSql> = values
        .iter()
        .map(|v| v as &dyn rusqlite::types::ToSql)
        .collect();
    let policies: Vec<PolicyView> = stmt
        .query_map(refs.as_slice(), |r| {
            Ok(PolicyView {
                id: r.get(0)?,
                user_id: r.get(1)?,
                scope: r.get(2)?,
                target_id: r.get(3)?,
                policy_type: r.get(4)?,
                policy_content: r.get(5)?,
                priority: r.get(6)?,
                enabled: r.get::<_, i64>(7)? != 0,
                created_at: r.get(8)?,
                updated_at: r.get(9)?,
            })
        })
        .map_err(|e| internal(e.to_string()))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(Json(policies))
}

#[patch("/api/v1/policies/<policy_id>", format = "json", data = "<body>")]
pub fn update_policy(
    db: &State<Db>,
    principal: Principal,
    policy_id: &str,
    body: Json<UpdatePolicy>,
) -> Result<Json<PolicyView>, ApiError> {
    let conn = db.conn();
    let existing =
        load_policy(&conn, policy_id).ok_or_else(|| not_found_error("Policy not found"))?;
    if !can_manage(&conn, &principal.user_id, &existing) {
        return Err(forbidden("Not your policy"));
    }

    if let Some(ref content) = body.policy_content {
        policy::parse_policy_content(&existing.policy_type, content).map_err(validation)?;
    }
    if body.policy_content.is_none() && body.priority.is_none() && body.enabled.is_none() {
        return Err(validation("No fields to update"));
    }

    conn.execute(
        "UPDATE policies SET
            policy_content = COALESCE(?1, policy_content),
            priority = COALESCE(?2, priority),
            enabled = COALESCE(?3, enabled),
            updated_at = ?4
         WHERE id = ?5",
        params![
            &body.policy_content,
            body.priority,
            body.enabled.map(|b| b as i64),
            chrono::Utc::now().to_rfc3339(),
            policy_id
        ],
    )
    .map_err(|e| internal(e.to_string()))?;

    load_policy(&conn, policy_id)
        .map(Json)
        .ok_or_else(|| internal("Policy disappeared during update"))
}

#[delete("/api/v1/policies/<policy_id>")]
pub fn delete_policy(
    db: &State<Db>,
    principal: Principal,
    policy_id: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn();
    let existing =
        load_policy(&conn, policy_id).ok_or_else(|| not_found_error("Policy not found"))?;
    if !can_manage(&conn, &principal.user_id, &existing) {
        return Err(forbidden("Not your policy"));
    }
    conn.execute("DELETE FROM policies WHERE id = ?1", params![policy_id])
        .map_err(|e| internal(e.to_string()))?;
    Ok(Json(serde_json::json!({"deleted": true, "id": policy_id})))
}

/// Pre-send snapshot: relationship, roles, the policies that would gate a
/// message to this recipient, and recent traffic between the pair.
#[get("/api/v1/policies/context/<username>")]
pub fn policy_context(
    db: &State<Db>,
    principal: Principal,
    username: &str,
) -> Result<Json<ContextResponse>, ApiError> {
    let conn = db.conn();
    let recipient = graph::find_user_by_username(&conn, username)
        .ok_or_else(|| not_found_error("User not found"))?;
    let friendship = graph::friendship_between(&conn, &principal.user_id, &recipient.id)
        .filter(|f| f.status == "accepted")
        .ok_or_else(|| not_found_error("No friendship with this user"))?;

    let roles = graph::roles_for_friendship(&conn, &friendship.id);
    let policies =
        policy::applicable_for_user_send(&conn, &principal.user_id, &recipient.id, &roles);
    let summary = policy::summarize(&policies);

    let mut stmt = conn
        .prepare(
            "SELECT id, sender_user_id, payload, status, created_at FROM messages
             WHERE recipient_type = 'user'
               AND ((sender_user_id = ?1 AND recipient_id = ?2)
                 OR (sender_user_id = ?2 AND recipient_id = ?1))
             ORDER BY created_at DESC LIMIT 5",
        )
        .map_err(|e| internal(e.to_string()))?;
    let recent_interactions: Vec<RecentInteraction> = stmt
        .query_map(params![&principal.user_id, &recipient.id], |r| {
            let sender_user_id: String = r.get(1)?;
            let payload: String = r.get(2)?;
            Ok(RecentInteraction {
                message_id: r.get(0)?,
                direction: if sender_user_id == principal.user_id {
                    "sent".to_string()
                } else {
                    "received".to_string()
                },
                preview: payload.chars().take(80).collect(),
                status: r.get(3)?,
                created_at: r.get(4)?,
            })
        })
        .map_err(|e| internal(e.to_string()))?
        .filter_map(|r| r.ok())
        .collect();

    let interaction_count = graph::interaction_count(&conn, &principal.user_id, &recipient.id);

    Ok(Json(ContextResponse {
        recipient: ContextRecipient {
            username: recipient.username,
            display_name: recipient.display_name,
            relationship: "friend".to_string(),
            friendship_id: friendship.id,
            roles,
            connected_since: friendship.created_at,
            interaction_count,
        },
        applicable_policies: policies,
        summary,
        recent_interactions,
    }))
}
