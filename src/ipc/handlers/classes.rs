use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    authorize, count, exists, map_unique, new_id, now_rfc3339, optional_str, patch_required_str,
    patch_str, required_str, ADMIN_ONLY, STAFF,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;

const CLASS_SELECT: &str = "SELECT c.id, c.name,
        c.homeroom_teacher_id, h.name, c.supervisor_teacher_id, s.name, c.created_at,
        (SELECT COUNT(*) FROM students st WHERE st.class_id = c.id),
        (SELECT COUNT(*) FROM subject_assignments sa WHERE sa.class_id = c.id)
     FROM classes c
     LEFT JOIN teachers h ON h.id = c.homeroom_teacher_id
     LEFT JOIN teachers s ON s.id = c.supervisor_teacher_id";

fn teacher_ref(id: Option<String>, name: Option<String>) -> Value {
    match id {
        Some(id) => json!({ "id": id, "name": name }),
        None => Value::Null,
    }
}

fn class_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "homeroomTeacher": teacher_ref(r.get(2)?, r.get(3)?),
        "supervisorTeacher": teacher_ref(r.get(4)?, r.get(5)?),
        "createdAt": r.get::<_, String>(6)?,
        "studentCount": r.get::<_, i64>(7)?,
        "assignmentCount": r.get::<_, i64>(8)?,
    }))
}

fn load_class(conn: &Connection, id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(&format!("{} WHERE c.id = ?", CLASS_SELECT), [id], class_row)
        .optional()?
        .ok_or(HandlerErr::NotFound("class"))
}

fn ensure_teacher(conn: &Connection, id: Option<&str>) -> Result<(), HandlerErr> {
    match id {
        Some(id) if !exists(conn, "teachers", id)? => Err(HandlerErr::NotFound("teacher")),
        _ => Ok(()),
    }
}

fn handle_list(conn: &Connection) -> Result<Value, HandlerErr> {
    let mut stmt = conn.prepare(&format!("{} ORDER BY c.name COLLATE NOCASE", CLASS_SELECT))?;
    let classes = stmt
        .query_map([], class_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classes": classes }))
}

fn handle_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let mut class = load_class(conn, &id)?;

    let mut stmt = conn.prepare(
        "SELECT id, nis, nisn, name FROM students
         WHERE class_id = ?
         ORDER BY name COLLATE NOCASE, nis",
    )?;
    let students = stmt
        .query_map([&id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "nis": r.get::<_, String>(1)?,
                "nisn": r.get::<_, String>(2)?,
                "name": r.get::<_, Option<String>>(3)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    class["students"] = json!(students);
    class["assignments"] = json!(super::subjects::assignments_where(conn, "sa.class_id = ?", &id)?);
    Ok(json!({ "class": class }))
}

fn handle_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let homeroom = optional_str(params, "homeroomTeacherId")?;
    let supervisor = optional_str(params, "supervisorTeacherId")?;
    ensure_teacher(conn, homeroom.as_deref())?;
    ensure_teacher(conn, supervisor.as_deref())?;

    let id = new_id();
    conn.execute(
        "INSERT INTO classes(id, name, homeroom_teacher_id, supervisor_teacher_id, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&id, &name, &homeroom, &supervisor, now_rfc3339()),
    )
    .map_err(map_unique)?;

    info!(class_id = %id, name = %name, "class created");
    Ok(json!({ "class": load_class(conn, &id)? }))
}

fn handle_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let current = load_class(conn, &id)?;
    let current_ref = |key: &str| current[key]["id"].as_str().map(|s| s.to_string());

    let name = patch_required_str(params, "name")?
        .or_else(|| current["name"].as_str().map(|s| s.to_string()));
    let homeroom = patch_str(params, "homeroomTeacherId")?
        .unwrap_or_else(|| current_ref("homeroomTeacher"));
    let supervisor = patch_str(params, "supervisorTeacherId")?
        .unwrap_or_else(|| current_ref("supervisorTeacher"));
    ensure_teacher(conn, homeroom.as_deref())?;
    ensure_teacher(conn, supervisor.as_deref())?;

    conn.execute(
        "UPDATE classes SET name = ?, homeroom_teacher_id = ?, supervisor_teacher_id = ?
         WHERE id = ?",
        (&name, &homeroom, &supervisor, &id),
    )
    .map_err(map_unique)?;

    info!(class_id = %id, "class updated");
    Ok(json!({ "class": load_class(conn, &id)? }))
}

fn handle_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "id")?;
    if !exists(conn, "classes", &id)? {
        return Err(HandlerErr::NotFound("class"));
    }
    let students = count(conn, "SELECT COUNT(*) FROM students WHERE class_id = ?", &id)?;
    let assignments = count(conn, "SELECT COUNT(*) FROM subject_assignments WHERE class_id = ?", &id)?;
    if students > 0 || assignments > 0 {
        return Err(HandlerErr::ReferentialConflict(format!(
            "class still has {} student(s) and {} subject assignment(s)",
            students, assignments
        )));
    }

    conn.execute("DELETE FROM classes WHERE id = ?", [&id])?;
    info!(class_id = %id, "class deleted");
    Ok(json!({ "success": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Result<Value, HandlerErr>> {
    let p = &req.params;
    let result = match req.method.as_str() {
        "classes.list" => authorize(state, req, STAFF).and_then(|(c, _)| handle_list(c)),
        "classes.get" => authorize(state, req, STAFF).and_then(|(c, _)| handle_get(c, p)),
        "classes.create" => authorize(state, req, ADMIN_ONLY).and_then(|(c, _)| handle_create(c, p)),
        "classes.update" => authorize(state, req, ADMIN_ONLY).and_then(|(c, _)| handle_update(c, p)),
        "classes.delete" => authorize(state, req, ADMIN_ONLY).and_then(|(c, _)| handle_delete(c, p)),
        _ => return None,
    };
    Some(result)
}
