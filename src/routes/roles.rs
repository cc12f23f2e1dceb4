use crate::db::{self, Db};
use crate::identity::Principal;
use crate::models::{CreateRole, RoleInfo};
use regex::Regex;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get, post};
use rusqlite::params;

use super::{ApiError, conflict, internal, validation};

#[get("/api/v1/roles?<type>")]
pub fn list_roles(
    db: &State<Db>,
    principal: Principal,
    r#type: Option<&str>,
) -> Result<Json<Vec<RoleInfo>>, ApiError> {
    let (include_system, include_custom) = match r#type {
        None => (true, true),
        Some("system") => (true, false),
        Some("custom") => (false, true),
        Some(_) => return Err(validation("type must be 'system' or 'custom'")),
    };

    let conn = db.conn();
    let mut stmt = conn
        .prepare(
            "SELECT name, description, is_system FROM roles
             WHERE (user_id IS NULL AND ?1) OR (user_id = ?2 AND ?3)
             ORDER BY is_system DESC, name ASC",
        )
        .map_err(|e| internal(e.to_string()))?;
    let roles: Vec<RoleInfo> = stmt
        .query_map(
            params![include_system, &principal.user_id, include_custom],
            |r| {
                Ok(RoleInfo {
                    name: r.get(0)?,
                    description: r.get(1)?,
                    is_system: r.get::<_, i64>(2)? != 0,
                })
            },
        )
        .map_err(|e| internal(e.to_string()))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(Json(roles))
}

/// Create a custom role. Custom role names cannot shadow a system role and
/// are unique per user.
#[post("/api/v1/roles", format = "json", data = "<body>")]
pub fn create_role(
    db: &State<Db>,
    principal: Principal,
    body: Json<CreateRole>,
) -> Result<(Status, Json<RoleInfo>), ApiError> {
    let name = body.name.trim().to_string();
    let name_pattern = Regex::new("^[A-Za-z][A-Za-z0-9_]*$").expect("static pattern compiles");
    if name.is_empty() || name.len() > 50 || !name_pattern.is_match(&name) {
        return Err(validation(
            "Role name must start with a letter and contain only letters, digits and underscores",
        ));
    }
    if db::SYSTEM_ROLES.iter().any(|(system, _)| *system == name) {
        return Err(validation(format!("'{name}' is a reserved system role")));
    }

    let conn = db.conn();
    conn.execute(
        "INSERT INTO roles (id, name, user_id, description, is_system, created_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        params![
            uuid::Uuid::new_v4().to_string(),
            &name,
            &principal.user_id,
            &body.description,
            chrono::Utc::now().to_rfc3339()
        ],
    )
    .map_err(|e| {
        if db::is_unique_violation(&e) {
            conflict(format!("Role '{name}' already exists"))
        } else {
            internal(e.to_string())
        }
    })?;

    Ok((
        Status::Created,
        Json(RoleInfo {
            name,
            description: body.description.clone(),
            is_system: false,
        }),
    ))
}
