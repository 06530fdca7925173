use crate::auth;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    authorize, check_password, exists, map_unique, new_id, now_rfc3339, optional_str,
    patch_required_str, patch_str, required_str, Caller, ADMIN_ONLY, STAFF,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;

const STUDENT_SELECT: &str = "SELECT s.id, s.nis, s.nisn, s.email, s.phone, s.name, s.address,
        s.class_id, c.name, s.created_at,
        EXISTS(SELECT 1 FROM accounts a WHERE a.student_id = s.id)
     FROM students s
     LEFT JOIN classes c ON c.id = s.class_id";

fn student_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let class_id: Option<String> = r.get(7)?;
    let class_name: Option<String> = r.get(8)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "nis": r.get::<_, String>(1)?,
        "nisn": r.get::<_, String>(2)?,
        "email": r.get::<_, String>(3)?,
        "phone": r.get::<_, String>(4)?,
        "name": r.get::<_, Option<String>>(5)?,
        "address": r.get::<_, Option<String>>(6)?,
        "classId": class_id,
        "class": class_id.as_ref().map(|id| json!({ "id": id, "name": class_name })),
        "createdAt": r.get::<_, String>(9)?,
        "hasLogin": r.get::<_, bool>(10)?,
    }))
}

fn load_student(conn: &Connection, id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(&format!("{} WHERE s.id = ?", STUDENT_SELECT), [id], student_row)
        .optional()?
        .ok_or(HandlerErr::NotFound("student"))
}

fn ensure_class(conn: &Connection, class_id: Option<&str>) -> Result<(), HandlerErr> {
    match class_id {
        Some(id) if !exists(conn, "classes", id)? => Err(HandlerErr::NotFound("class")),
        _ => Ok(()),
    }
}

fn handle_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = optional_str(params, "classId")?;
    let q = optional_str(params, "q")?.map(|q| format!("%{}%", q));
    let mut stmt = conn.prepare(&format!(
        "{} WHERE (?1 IS NULL OR s.class_id = ?1)
           AND (?2 IS NULL OR s.name LIKE ?2 OR s.nis LIKE ?2 OR s.nisn LIKE ?2)
         ORDER BY s.name COLLATE NOCASE, s.nis",
        STUDENT_SELECT
    ))?;
    let students = stmt
        .query_map((&class_id, &q), student_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": students }))
}

fn handle_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "id")?;
    Ok(json!({ "student": load_student(conn, &id)? }))
}

fn handle_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let nis = required_str(params, "nis")?;
    let nisn = required_str(params, "nisn")?;
    let email = required_str(params, "email")?;
    let phone = required_str(params, "phone")?;
    let name = optional_str(params, "name")?;
    let address = optional_str(params, "address")?;
    let class_id = optional_str(params, "classId")?;
    let password = optional_str(params, "password")?;
    if let Some(p) = &password {
        check_password(p)?;
    }
    ensure_class(conn, class_id.as_deref())?;
    let password_hash = password.as_deref().map(auth::hash_password);

    let id = new_id();
    let now = now_rfc3339();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO students(id, nis, nisn, email, phone, name, address, class_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![id, nis, nisn, email, phone, name, address, class_id, now],
    )
    .map_err(map_unique)?;
    if let Some(hash) = &password_hash {
        tx.execute(
            "INSERT INTO accounts(id, name, password_hash, role, student_id, created_at)
             VALUES(?, ?, ?, 'STUDENT', ?, ?)",
            (new_id(), name.as_deref().unwrap_or(&nis), hash, &id, &now),
        )?;
    }
    tx.commit()?;

    info!(student_id = %id, with_login = password_hash.is_some(), "student created");
    Ok(json!({ "student": load_student(conn, &id)? }))
}

fn handle_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let current = load_student(conn, &id)?;
    let text = |key: &str| current[key].as_str().map(|s| s.to_string());

    let nis = patch_required_str(params, "nis")?.or_else(|| text("nis"));
    let nisn = patch_required_str(params, "nisn")?.or_else(|| text("nisn"));
    let email = patch_required_str(params, "email")?.or_else(|| text("email"));
    let phone = patch_required_str(params, "phone")?.or_else(|| text("phone"));
    let name = patch_str(params, "name")?.unwrap_or_else(|| text("name"));
    let address = patch_str(params, "address")?.unwrap_or_else(|| text("address"));
    let class_id = patch_str(params, "classId")?.unwrap_or_else(|| text("classId"));
    ensure_class(conn, class_id.as_deref())?;

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE students
         SET nis = ?, nisn = ?, email = ?, phone = ?, name = ?, address = ?, class_id = ?
         WHERE id = ?",
        rusqlite::params![nis, nisn, email, phone, name, address, class_id, id],
    )
    .map_err(map_unique)?;
    tx.execute(
        "UPDATE accounts SET name = ? WHERE student_id = ?",
        (name.as_ref().or(nis.as_ref()), &id),
    )?;
    tx.commit()?;

    info!(student_id = %id, "student updated");
    Ok(json!({ "student": load_student(conn, &id)? }))
}

fn handle_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "id")?;
    if !exists(conn, "students", &id)? {
        return Err(HandlerErr::NotFound("student"));
    }

    // The login account and everything hanging off it go with the student.
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM notifications
         WHERE account_id IN (SELECT id FROM accounts WHERE student_id = ?)",
        [&id],
    )?;
    tx.execute("DELETE FROM accounts WHERE student_id = ?", [&id])?;
    tx.execute("DELETE FROM student_attendance WHERE student_id = ?", [&id])?;
    tx.execute("DELETE FROM students WHERE id = ?", [&id])?;
    tx.commit()?;

    info!(student_id = %id, "student deleted");
    Ok(json!({ "success": true }))
}

fn staff<'a>(state: &'a AppState, req: &Request) -> Result<(&'a Connection, Caller), HandlerErr> {
    authorize(state, req, STAFF)
}

fn admin<'a>(state: &'a AppState, req: &Request) -> Result<(&'a Connection, Caller), HandlerErr> {
    authorize(state, req, ADMIN_ONLY)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Result<Value, HandlerErr>> {
    let p = &req.params;
    match req.method.as_str() {
        "students.list" => Some(staff(state, req).and_then(|(c, _)| handle_list(c, p))),
        "students.get" => Some(staff(state, req).and_then(|(c, _)| handle_get(c, p))),
        "students.create" => Some(admin(state, req).and_then(|(c, _)| handle_create(c, p))),
        "students.update" => Some(admin(state, req).and_then(|(c, _)| handle_update(c, p))),
        "students.delete" => Some(admin(state, req).and_then(|(c, _)| handle_delete(c, p))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn create(conn: &Connection, nis: &str, nisn: &str, email: &str) -> Result<Value, HandlerErr> {
        handle_create(
            conn,
            &json!({ "nis": nis, "nisn": nisn, "email": email, "phone": "0812" }),
        )
    }

    #[test]
    fn each_unique_column_is_reported_by_name() {
        let conn = db::open_in_memory().expect("db");
        create(&conn, "1001", "9001", "a@school.id").expect("first");
        for (nis, nisn, email, field) in [
            ("1001", "9002", "b@school.id", "nis"),
            ("1002", "9001", "b@school.id", "nisn"),
            ("1002", "9002", "a@school.id", "email"),
        ] {
            match create(&conn, nis, nisn, email) {
                Err(HandlerErr::DuplicateKey { field: got }) => assert_eq!(got, field),
                other => panic!("expected duplicate {}, got {:?}", field, other),
            }
        }
        let all = handle_list(&conn, &json!({})).expect("list");
        assert_eq!(all["students"].as_array().map(|a| a.len()), Some(1));
    }

    #[test]
    fn unknown_class_is_not_found() {
        let conn = db::open_in_memory().expect("db");
        let e = handle_create(
            &conn,
            &json!({ "nis": "1", "nisn": "2", "email": "c@d", "phone": "3", "classId": "nope" }),
        )
        .expect_err("must fail");
        assert!(matches!(e, HandlerErr::NotFound("class")));
    }

    #[test]
    fn update_patches_only_given_fields() {
        let conn = db::open_in_memory().expect("db");
        let created = handle_create(
            &conn,
            &json!({ "nis": "1", "nisn": "2", "email": "e@f", "phone": "3", "address": "Jl. Mawar" }),
        )
        .expect("create");
        let id = created["student"]["id"].as_str().expect("id").to_string();

        let updated = handle_update(&conn, &json!({ "id": id, "name": "Sinta", "address": null }))
            .expect("update");
        assert_eq!(updated["student"]["name"], "Sinta");
        assert_eq!(updated["student"]["address"], Value::Null);
        assert_eq!(updated["student"]["nis"], "1");

        let e = handle_update(&conn, &json!({ "id": id, "phone": "" })).expect_err("blank phone");
        assert!(matches!(e, HandlerErr::BadParams(_)));
    }

    #[test]
    fn delete_takes_the_login_account_along() {
        let conn = db::open_in_memory().expect("db");
        let created = handle_create(
            &conn,
            &json!({ "nis": "1", "nisn": "2", "email": "e@f", "phone": "3", "password": "siswa123" }),
        )
        .expect("create");
        assert_eq!(created["student"]["hasLogin"], true);
        let id = created["student"]["id"].as_str().expect("id").to_string();

        handle_delete(&conn, &json!({ "id": id })).expect("delete");
        let accounts: i64 = conn
            .query_row("SELECT COUNT(*) FROM accounts", [], |r| r.get(0))
            .expect("count");
        assert_eq!(accounts, 0);
        assert!(matches!(
            handle_delete(&conn, &json!({ "id": id })),
            Err(HandlerErr::NotFound("student"))
        ));
    }
}
