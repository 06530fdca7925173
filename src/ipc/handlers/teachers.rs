use crate::auth;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    authorize, check_password, count, exists, map_unique, new_id, now_rfc3339, optional_str,
    patch_required_str, patch_str, required_str, ADMIN_ONLY, STAFF,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;

fn teacher_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "title": r.get::<_, Option<String>>(2)?,
        "email": r.get::<_, Option<String>>(3)?,
        "accountId": r.get::<_, Option<String>>(4)?,
        "createdAt": r.get::<_, String>(5)?,
    }))
}

const TEACHER_SELECT: &str = "SELECT t.id, t.name, t.title, a.email, a.id, t.created_at
     FROM teachers t
     LEFT JOIN accounts a ON a.teacher_id = t.id";

fn load_teacher(conn: &Connection, id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(&format!("{} WHERE t.id = ?", TEACHER_SELECT), [id], teacher_row)
        .optional()?
        .ok_or(HandlerErr::NotFound("teacher"))
}

fn classes_for(conn: &Connection, column: &str, teacher_id: &str) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, name FROM classes WHERE {} = ? ORDER BY name COLLATE NOCASE",
        column
    ))?;
    let rows = stmt
        .query_map([teacher_id], |r| {
            Ok(json!({ "id": r.get::<_, String>(0)?, "name": r.get::<_, String>(1)? }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_list(conn: &Connection) -> Result<Value, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT t.id, t.name, t.title, a.email, a.id, t.created_at,
           (SELECT COUNT(*) FROM classes c WHERE c.homeroom_teacher_id = t.id),
           (SELECT COUNT(*) FROM classes c WHERE c.supervisor_teacher_id = t.id),
           (SELECT COUNT(*) FROM subject_assignments sa WHERE sa.teacher_id = t.id)
         FROM teachers t
         LEFT JOIN accounts a ON a.teacher_id = t.id
         ORDER BY t.name COLLATE NOCASE",
    )?;
    let teachers = stmt
        .query_map([], |r| {
            let mut t = teacher_row(r)?;
            t["homeroomCount"] = json!(r.get::<_, i64>(6)?);
            t["supervisedCount"] = json!(r.get::<_, i64>(7)?);
            t["assignmentCount"] = json!(r.get::<_, i64>(8)?);
            Ok(t)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "teachers": teachers }))
}

fn handle_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let mut teacher = load_teacher(conn, &id)?;
    teacher["homeroomClasses"] = json!(classes_for(conn, "homeroom_teacher_id", &id)?);
    teacher["supervisedClasses"] = json!(classes_for(conn, "supervisor_teacher_id", &id)?);
    teacher["assignments"] = json!(super::subjects::assignments_where(
        conn,
        "sa.teacher_id = ?",
        &id
    )?);
    Ok(json!({ "teacher": teacher }))
}

fn handle_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let email = required_str(params, "email")?;
    let password = required_str(params, "password")?;
    let title = optional_str(params, "title")?;
    check_password(&password)?;
    let hash = auth::hash_password(&password);

    let id = new_id();
    let now = now_rfc3339();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO teachers(id, name, title, created_at) VALUES(?, ?, ?, ?)",
        (&id, &name, &title, &now),
    )?;
    tx.execute(
        "INSERT INTO accounts(id, name, email, password_hash, role, teacher_id, created_at)
         VALUES(?, ?, ?, ?, 'TEACHER', ?, ?)",
        (new_id(), &name, &email, &hash, &id, &now),
    )
    .map_err(map_unique)?;
    tx.commit()?;

    info!(teacher_id = %id, "teacher created");
    Ok(json!({ "teacher": load_teacher(conn, &id)? }))
}

fn handle_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let current = load_teacher(conn, &id)?;
    let name = patch_required_str(params, "name")?;
    let email = patch_required_str(params, "email")?;
    let title = patch_str(params, "title")?;
    let password = optional_str(params, "password")?;
    if let Some(p) = &password {
        check_password(p)?;
    }
    let hash = password.as_deref().map(auth::hash_password);

    let tx = conn.unchecked_transaction()?;
    if let Some(name) = &name {
        tx.execute("UPDATE teachers SET name = ? WHERE id = ?", (name, &id))?;
        tx.execute("UPDATE accounts SET name = ? WHERE teacher_id = ?", (name, &id))?;
    }
    if let Some(title) = &title {
        tx.execute("UPDATE teachers SET title = ? WHERE id = ?", (title, &id))?;
    }
    if let Some(email) = &email {
        if current["accountId"].is_null() {
            return Err(HandlerErr::BadParams("teacher has no login account".into()));
        }
        tx.execute("UPDATE accounts SET email = ? WHERE teacher_id = ?", (email, &id))
            .map_err(map_unique)?;
    }
    if let Some(hash) = &hash {
        tx.execute(
            "UPDATE accounts SET password_hash = ? WHERE teacher_id = ?",
            (hash, &id),
        )?;
    }
    tx.commit()?;

    info!(teacher_id = %id, "teacher updated");
    Ok(json!({ "teacher": load_teacher(conn, &id)? }))
}

fn handle_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "id")?;
    if !exists(conn, "teachers", &id)? {
        return Err(HandlerErr::NotFound("teacher"));
    }

    let homeroom = count(conn, "SELECT COUNT(*) FROM classes WHERE homeroom_teacher_id = ?", &id)?;
    let supervised = count(conn, "SELECT COUNT(*) FROM classes WHERE supervisor_teacher_id = ?", &id)?;
    let assignments = count(conn, "SELECT COUNT(*) FROM subject_assignments WHERE teacher_id = ?", &id)?;
    let mut blockers = Vec::new();
    if homeroom > 0 {
        blockers.push(format!("homeroom teacher of {} class(es)", homeroom));
    }
    if supervised > 0 {
        blockers.push(format!("supervisor of {} class(es)", supervised));
    }
    if assignments > 0 {
        blockers.push(format!("{} subject assignment(s)", assignments));
    }
    if !blockers.is_empty() {
        return Err(HandlerErr::ReferentialConflict(format!(
            "teacher is still referenced: {}",
            blockers.join("; ")
        )));
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM notifications
         WHERE account_id IN (SELECT id FROM accounts WHERE teacher_id = ?)",
        [&id],
    )?;
    tx.execute("DELETE FROM accounts WHERE teacher_id = ?", [&id])?;
    tx.execute("DELETE FROM teacher_attendance WHERE teacher_id = ?", [&id])?;
    tx.execute("DELETE FROM teachers WHERE id = ?", [&id])?;
    tx.commit()?;

    info!(teacher_id = %id, "teacher deleted");
    Ok(json!({ "success": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Result<Value, HandlerErr>> {
    let p = &req.params;
    let result = match req.method.as_str() {
        "teachers.list" => authorize(state, req, STAFF).and_then(|(c, _)| handle_list(c)),
        "teachers.get" => authorize(state, req, STAFF).and_then(|(c, _)| handle_get(c, p)),
        "teachers.create" => authorize(state, req, ADMIN_ONLY).and_then(|(c, _)| handle_create(c, p)),
        "teachers.update" => authorize(state, req, ADMIN_ONLY).and_then(|(c, _)| handle_update(c, p)),
        "teachers.delete" => authorize(state, req, ADMIN_ONLY).and_then(|(c, _)| handle_delete(c, p)),
        _ => return None,
    };
    Some(result)
}
