use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    authorize, exists, new_id, now_rfc3339, optional_bool, optional_limit, optional_str,
    required_str, Caller, ADMIN_ONLY, ANY_ROLE,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;

const MAX_LIMIT: i64 = 100;

const NOTIFICATION_SELECT: &str =
    "SELECT id, account_id, title, body, read, created_at FROM notifications";

fn notification_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "userId": r.get::<_, String>(1)?,
        "title": r.get::<_, String>(2)?,
        "message": r.get::<_, String>(3)?,
        "read": r.get::<_, bool>(4)?,
        "createdAt": r.get::<_, String>(5)?,
    }))
}

/// Someone else's notification looks exactly like a missing one.
fn load_owned(conn: &Connection, caller: &Caller, id: &str) -> Result<Value, HandlerErr> {
    let found = conn
        .query_row(&format!("{} WHERE id = ?", NOTIFICATION_SELECT), [id], notification_row)
        .optional()?;
    match found {
        Some(n) if caller.is_admin() || n["userId"] == caller.account_id.as_str() => Ok(n),
        _ => Err(HandlerErr::NotFound("notification")),
    }
}

fn create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let user_id = required_str(params, "userId")?;
    let title = required_str(params, "title")?;
    let message = required_str(params, "message")?;
    if !exists(conn, "accounts", &user_id)? {
        return Err(HandlerErr::NotFound("user"));
    }

    let id = new_id();
    conn.execute(
        "INSERT INTO notifications(id, account_id, title, body, read, created_at)
         VALUES(?, ?, ?, ?, 0, ?)",
        (&id, &user_id, &title, &message, now_rfc3339()),
    )?;
    info!(notification_id = %id, user_id = %user_id, "notification created");
    conn.query_row(&format!("{} WHERE id = ?", NOTIFICATION_SELECT), [&id], notification_row)
        .map_err(HandlerErr::from)
}

fn list(conn: &Connection, caller: &Caller, params: &Value) -> Result<Value, HandlerErr> {
    let mut user_id = optional_str(params, "userId")?;
    if !caller.is_admin() {
        if user_id.as_ref().is_some_and(|u| *u != caller.account_id) {
            return Err(HandlerErr::Forbidden(
                "only administrators may read other users' notifications".into(),
            ));
        }
        user_id = Some(caller.account_id.clone());
    }
    let unread_only = optional_bool(params, "unread")?.unwrap_or(false);
    let limit = optional_limit(params, "limit", MAX_LIMIT)?.unwrap_or(MAX_LIMIT);

    let mut stmt = conn.prepare(&format!(
        "{} WHERE (?1 IS NULL OR account_id = ?1) AND (?2 = 0 OR read = 0)
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?3",
        NOTIFICATION_SELECT
    ))?;
    let notifications = stmt
        .query_map((&user_id, unread_only, limit), notification_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "notifications": notifications }))
}

fn update(conn: &Connection, caller: &Caller, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let read = optional_bool(params, "read")?.unwrap_or(true);
    load_owned(conn, caller, &id)?;
    conn.execute("UPDATE notifications SET read = ? WHERE id = ?", (read, &id))?;
    Ok(json!({ "notification": load_owned(conn, caller, &id)? }))
}

fn delete(conn: &Connection, caller: &Caller, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "id")?;
    load_owned(conn, caller, &id)?;
    conn.execute("DELETE FROM notifications WHERE id = ?", [&id])?;
    info!(notification_id = %id, "notification deleted");
    Ok(json!({ "success": true }))
}

fn handle_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let (conn, _) = authorize(state, req, ADMIN_ONLY)?;
    let notification = create(conn, &req.params)?;
    if let Some(user_id) = notification["userId"].as_str() {
        state.relay.emit_to_user(user_id, "notification", notification.clone());
    }
    Ok(json!({ "notification": notification }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Result<Value, HandlerErr>> {
    let state: &AppState = state;
    let p = &req.params;
    let result = match req.method.as_str() {
        "notifications.create" => handle_create(state, req),
        "notifications.list" => {
            authorize(state, req, ANY_ROLE).and_then(|(c, caller)| list(c, &caller, p))
        }
        "notifications.get" => authorize(state, req, ANY_ROLE).and_then(|(c, caller)| {
            let id = required_str(p, "id")?;
            Ok(json!({ "notification": load_owned(c, &caller, &id)? }))
        }),
        "notifications.update" => {
            authorize(state, req, ANY_ROLE).and_then(|(c, caller)| update(c, &caller, p))
        }
        "notifications.delete" => {
            authorize(state, req, ANY_ROLE).and_then(|(c, caller)| delete(c, &caller, p))
        }
        _ => return None,
    };
    Some(result)
}
