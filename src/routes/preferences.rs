use crate::db::Db;
use crate::identity::Principal;
use crate::models::{Preferences, UpdatePreferences};
use rocket::serde::json::Json;
use rocket::{State, get, patch};
use rusqlite::{Connection, OptionalExtension, params};

use super::{ApiError, internal, validation};

fn load_or_default(conn: &Connection, user_id: &str) -> Preferences {
    conn.query_row(
        "SELECT message_notifications, delivery_notifications, friend_notifications,
                group_notifications, default_llm, settings, updated_at
         FROM user_preferences WHERE user_id = ?1",
        params![user_id],
        |r| {
            let settings_json: String = r.get(5)?;
            Ok(Preferences {
                message_notifications: r.get::<_, i64>(0)? != 0,
                delivery_notifications: r.get::<_, i64>(1)? != 0,
                friend_notifications: r.get::<_, i64>(2)? != 0,
                group_notifications: r.get::<_, i64>(3)? != 0,
                default_llm: r.get(4)?,
                settings: serde_json::from_str(&settings_json)
                    .unwrap_or(serde_json::json!({})),
                updated_at: r.get(6)?,
            })
        },
    )
    .optional()
    .unwrap_or(None)
    .unwrap_or(Preferences {
        message_notifications: true,
        delivery_notifications: true,
        friend_notifications: true,
        group_notifications: true,
        default_llm: None,
        settings: serde_json::json!({}),
        updated_at: chrono::Utc::now().to_rfc3339(),
    })
}

#[get("/api/v1/preferences")]
pub fn get_preferences(db: &State<Db>, principal: Principal) -> Json<Preferences> {
    let conn = db.conn();
    Json(load_or_default(&conn, &principal.user_id))
}

/// Partial update; the row is created on first write.
#[patch("/api/v1/preferences", format = "json", data = "<body>")]
pub fn update_preferences(
    db: &State<Db>,
    principal: Principal,
    body: Json<UpdatePreferences>,
) -> Result<Json<Preferences>, ApiError> {
    let conn = db.conn();
    let mut current = load_or_default(&conn, &principal.user_id);

    if body.message_notifications.is_none()
        && body.delivery_notifications.is_none()
        && body.friend_notifications.is_none()
        && body.group_notifications.is_none()
        && body.default_llm.is_none()
        && body.settings.is_none()
    {
        return Err(validation("No fields to update"));
    }

    if let Some(v) = body.message_notifications {
        current.message_notifications = v;
    }
    if let Some(v) = body.delivery_notifications {
        current.delivery_notifications = v;
    }
    if let Some(v) = body.friend_notifications {
        current.friend_notifications = v;
    }
    if let Some(v) = body.group_notifications {
        current.group_notifications = v;
    }
    if let Some(ref v) = body.default_llm {
        current.default_llm = Some(v.clone());
    }
    if let Some(ref v) = body.settings {
        current.settings = v.clone();
    }
    current.updated_at = chrono::Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO user_preferences
            (user_id, message_notifications, delivery_notifications, friend_notifications,
             group_notifications, default_llm, settings, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(user_id) DO UPDATE SET
            message_notifications = excluded.message_notifications,
            delivery_notifications = excluded.delivery_notifications,
            friend_notifications = excluded.friend_notifications,
            group_notifications = excluded.group_notifications,
            default_llm = excluded.default_llm,
            settings = excluded.settings,
            updated_at = excluded.updated_at",
        params![
            &principal.user_id,
            current.message_notifications as i64,
            current.delivery_notifications as i64,
            current.friend_notifications as i64,
            current.group_notifications as i64,
            &current.default_llm,
            current.settings.to_string(),
            &current.updated_at
        ],
    )
    .map_err(|e| internal(e.to_string()))?;

    Ok(Json(current))
}
