//! Subjects and the (teacher, subject, class) assignments that tie them to classes.

use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    authorize, count, exists, map_unique, new_id, now_rfc3339, optional_str, required_str,
    ADMIN_ONLY, STAFF,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::info;

const ASSIGNMENT_SELECT: &str = "SELECT sa.id, sa.teacher_id, t.name, sa.subject_id, sj.name,
        sa.class_id, c.name, sa.created_at
     FROM subject_assignments sa
     JOIN teachers t ON t.id = sa.teacher_id
     JOIN subjects sj ON sj.id = sa.subject_id
     JOIN classes c ON c.id = sa.class_id";

fn assignment_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "teacher": { "id": r.get::<_, String>(1)?, "name": r.get::<_, String>(2)? },
        "subject": { "id": r.get::<_, String>(3)?, "name": r.get::<_, String>(4)? },
        "class": { "id": r.get::<_, String>(5)?, "name": r.get::<_, String>(6)? },
        "createdAt": r.get::<_, String>(7)?,
    }))
}

/// Assignments matching a single-parameter filter such as `sa.class_id = ?`.
pub fn assignments_where(
    conn: &Connection,
    filter: &str,
    arg: &str,
) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE {} ORDER BY c.name COLLATE NOCASE, sj.name COLLATE NOCASE",
        ASSIGNMENT_SELECT, filter
    ))?;
    let rows = stmt
        .query_map([arg], assignment_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_subjects_list(conn: &Connection) -> Result<Value, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.name, s.created_at,
           (SELECT COUNT(*) FROM subject_assignments sa WHERE sa.subject_id = s.id)
         FROM subjects s
         ORDER BY s.name COLLATE NOCASE",
    )?;
    let subjects = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "createdAt": r.get::<_, String>(2)?,
                "assignmentCount": r.get::<_, i64>(3)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "subjects": subjects }))
}

fn handle_subjects_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let id = new_id();
    conn.execute(
        "INSERT INTO subjects(id, name, created_at) VALUES(?, ?, ?)",
        (&id, &name, now_rfc3339()),
    )
    .map_err(map_unique)?;
    info!(subject_id = %id, name = %name, "subject created");
    Ok(json!({ "subject": { "id": id, "name": name } }))
}

fn handle_subjects_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "id")?;
    if !exists(conn, "subjects", &id)? {
        return Err(HandlerErr::NotFound("subject"));
    }
    let assigned = count(conn, "SELECT COUNT(*) FROM subject_assignments WHERE subject_id = ?", &id)?;
    if assigned > 0 {
        return Err(HandlerErr::ReferentialConflict(format!(
            "subject is used by {} assignment(s)",
            assigned
        )));
    }
    conn.execute("DELETE FROM subjects WHERE id = ?", [&id])?;
    info!(subject_id = %id, "subject deleted");
    Ok(json!({ "success": true }))
}

fn handle_assignments_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = optional_str(params, "classId")?;
    let teacher_id = optional_str(params, "teacherId")?;
    let mut stmt = conn.prepare(&format!(
        "{} WHERE (?1 IS NULL OR sa.class_id = ?1) AND (?2 IS NULL OR sa.teacher_id = ?2)
         ORDER BY c.name COLLATE NOCASE, sj.name COLLATE NOCASE",
        ASSIGNMENT_SELECT
    ))?;
    let assignments = stmt
        .query_map((&class_id, &teacher_id), assignment_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "assignments": assignments }))
}

fn handle_assignments_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let teacher_id = required_str(params, "teacherId")?;
    let subject_id = required_str(params, "subjectId")?;
    let class_id = required_str(params, "classId")?;
    if !exists(conn, "teachers", &teacher_id)? {
        return Err(HandlerErr::NotFound("teacher"));
    }
    if !exists(conn, "subjects", &subject_id)? {
        return Err(HandlerErr::NotFound("subject"));
    }
    if !exists(conn, "classes", &class_id)? {
        return Err(HandlerErr::NotFound("class"));
    }

    let id = new_id();
    conn.execute(
        "INSERT INTO subject_assignments(id, teacher_id, subject_id, class_id, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&id, &teacher_id, &subject_id, &class_id, now_rfc3339()),
    )
    .map_err(|e| match map_unique(e) {
        HandlerErr::DuplicateKey { .. } => HandlerErr::DuplicateKey {
            field: "assignment".into(),
        },
        other => other,
    })?;

    info!(assignment_id = %id, teacher_id = %teacher_id, class_id = %class_id, "subject assigned");
    let created = assignments_where(conn, "sa.id = ?", &id)?;
    Ok(json!({ "assignment": created.into_iter().next() }))
}

fn handle_assignments_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let n = conn.execute("DELETE FROM subject_assignments WHERE id = ?", [&id])?;
    if n == 0 {
        return Err(HandlerErr::NotFound("assignment"));
    }
    info!(assignment_id = %id, "subject assignment removed");
    Ok(json!({ "success": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Result<Value, HandlerErr>> {
    let p = &req.params;
    let result = match req.method.as_str() {
        "subjects.list" => authorize(state, req, STAFF).and_then(|(c, _)| handle_subjects_list(c)),
        "subjects.create" => {
            authorize(state, req, ADMIN_ONLY).and_then(|(c, _)| handle_subjects_create(c, p))
        }
        "subjects.delete" => {
            authorize(state, req, ADMIN_ONLY).and_then(|(c, _)| handle_subjects_delete(c, p))
        }
        "assignments.list" => {
            authorize(state, req, STAFF).and_then(|(c, _)| handle_assignments_list(c, p))
        }
        "assignments.create" => {
            authorize(state, req, ADMIN_ONLY).and_then(|(c, _)| handle_assignments_create(c, p))
        }
        "assignments.delete" => {
            authorize(state, req, ADMIN_ONLY).and_then(|(c, _)| handle_assignments_delete(c, p))
        }
        _ => return None,
    };
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn seed(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO teachers(id, name, created_at) VALUES('t1', 'Pak Joko', 'now');
             INSERT INTO classes(id, name, created_at) VALUES('c1', 'X-1', 'now');",
        )
        .expect("seed");
    }

    #[test]
    fn assignment_is_unique_per_triple() {
        let conn = db::open_in_memory().expect("db");
        seed(&conn);
        let s = handle_subjects_create(&conn, &json!({ "name": "Matematika" })).expect("subject");
        let sid = s["subject"]["id"].as_str().expect("id").to_string();
        let params = json!({ "teacherId": "t1", "subjectId": sid, "classId": "c1" });

        let a = handle_assignments_create(&conn, &params).expect("assign");
        assert_eq!(a["assignment"]["subject"]["name"], "Matematika");
        assert!(matches!(
            handle_assignments_create(&conn, &params),
            Err(HandlerErr::DuplicateKey { .. })
        ));

        let listed = handle_assignments_list(&conn, &json!({ "classId": "c1" })).expect("list");
        assert_eq!(listed["assignments"].as_array().map(|a| a.len()), Some(1));
        let listed = handle_assignments_list(&conn, &json!({ "teacherId": "nobody" })).expect("list");
        assert_eq!(listed["assignments"], json!([]));
    }

    #[test]
    fn assigned_subject_cannot_be_deleted() {
        let conn = db::open_in_memory().expect("db");
        seed(&conn);
        let s = handle_subjects_create(&conn, &json!({ "name": "Fisika" })).expect("subject");
        let sid = s["subject"]["id"].as_str().expect("id").to_string();
        let a = handle_assignments_create(
            &conn,
            &json!({ "teacherId": "t1", "subjectId": sid, "classId": "c1" }),
        )
        .expect("assign");

        assert!(matches!(
            handle_subjects_delete(&conn, &json!({ "id": sid })),
            Err(HandlerErr::ReferentialConflict(_))
        ));
        let aid = a["assignment"]["id"].as_str().expect("id").to_string();
        handle_assignments_delete(&conn, &json!({ "id": aid })).expect("unassign");
        handle_subjects_delete(&conn, &json!({ "id": sid })).expect("delete");
        assert!(matches!(
            handle_assignments_delete(&conn, &json!({ "id": aid })),
            Err(HandlerErr::NotFound("assignment"))
        ));
    }
}
