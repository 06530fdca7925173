use crate::auth::{self, Role};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    authorize, check_password, map_unique, new_id, now_rfc3339, optional_str, require_db,
    required_str, ANY_ROLE,
};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::{info, warn};

struct LoginCandidate {
    id: String,
    name: String,
    email: Option<String>,
    password_hash: String,
    teacher_id: Option<String>,
    student_id: Option<String>,
}

fn find_candidate(
    conn: &Connection,
    role: Role,
    params: &Value,
) -> Result<Option<LoginCandidate>, HandlerErr> {
    const COLUMNS: &str = "a.id, a.name, a.email, a.password_hash, a.teacher_id, a.student_id";
    let map = |r: &rusqlite::Row<'_>| {
        Ok(LoginCandidate {
            id: r.get(0)?,
            name: r.get(1)?,
            email: r.get(2)?,
            password_hash: r.get(3)?,
            teacher_id: r.get(4)?,
            student_id: r.get(5)?,
        })
    };
    let found = match role {
        Role::Admin | Role::Teacher => {
            let email = optional_str(params, "email")?
                .ok_or_else(|| HandlerErr::BadParams("missing email".into()))?;
            conn.query_row(
                &format!(
                    "SELECT {} FROM accounts a WHERE a.email = ? COLLATE NOCASE AND a.role = ?",
                    COLUMNS
                ),
                (&email, role.as_str()),
                map,
            )
            .optional()?
        }
        Role::Student => {
            let nis = optional_str(params, "nis")?
                .ok_or_else(|| HandlerErr::BadParams("missing nis".into()))?;
            conn.query_row(
                &format!(
                    "SELECT {} FROM students s
                     JOIN accounts a ON a.student_id = s.id AND a.role = 'STUDENT'
                     WHERE s.nis = ?",
                    COLUMNS
                ),
                [&nis],
                map,
            )
            .optional()?
        }
    };
    Ok(found)
}

fn handle_login(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let password = required_str(params, "password")?;
    let role_raw = required_str(params, "role")?;
    let role = Role::parse(&role_raw.to_ascii_uppercase())
        .ok_or_else(|| HandlerErr::BadParams(format!("unknown role: {}", role_raw)))?;

    let Some(candidate) = find_candidate(conn, role, params)? else {
        auth::verify_against_dummy(&password);
        warn!(role = role.as_str(), "login failed");
        return Err(HandlerErr::InvalidCredentials);
    };
    if !auth::verify_password(&password, &candidate.password_hash) {
        warn!(role = role.as_str(), "login failed");
        return Err(HandlerErr::InvalidCredentials);
    }

    let now = Utc::now().timestamp();
    let token = state.tokens.issue(&candidate.id, role, now)?;
    info!(account_id = %candidate.id, role = role.as_str(), "login");
    Ok(json!({
        "token": token,
        "expiresAt": now.saturating_add(state.tokens.ttl_secs()),
        "user": {
            "id": candidate.id,
            "name": candidate.name,
            "email": candidate.email,
            "role": role,
            "teacherId": candidate.teacher_id,
            "studentId": candidate.student_id,
        }
    }))
}

fn handle_bootstrap_admin(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let name = required_str(params, "name")?;
    let email = required_str(params, "email")?;
    let password = required_str(params, "password")?;
    check_password(&password)?;
    let hash = auth::hash_password(&password);

    let tx = conn.unchecked_transaction()?;
    let admins: i64 = tx.query_row(
        "SELECT COUNT(*) FROM accounts WHERE role = 'ADMIN'",
        [],
        |r| r.get(0),
    )?;
    if admins > 0 {
        return Err(HandlerErr::Forbidden(
            "an administrator already exists".into(),
        ));
    }
    let id = new_id();
    tx.execute(
        "INSERT INTO accounts(id, name, email, password_hash, role, created_at)
         VALUES(?, ?, ?, ?, 'ADMIN', ?)",
        (&id, &name, &email, &hash, now_rfc3339()),
    )
    .map_err(map_unique)?;
    tx.commit()?;

    info!(account_id = %id, "bootstrap administrator created");
    Ok(json!({
        "user": { "id": id, "name": name, "email": email, "role": Role::Admin }
    }))
}

fn class_refs(conn: &Connection, sql: &str, id: &str) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([id], |r| {
            Ok(json!({ "id": r.get::<_, String>(0)?, "name": r.get::<_, String>(1)? }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Account plus the teacher or student it stands for.
pub fn load_profile(conn: &Connection, account_id: &str) -> Result<Value, HandlerErr> {
    let row: Option<(String, Option<String>, String, Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT name, email, role, teacher_id, student_id FROM accounts WHERE id = ?",
            [account_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()?;
    let Some((name, email, role_raw, teacher_id, student_id)) = row else {
        return Err(HandlerErr::ProfileNotFound);
    };
    let role = Role::parse(&role_raw).ok_or(HandlerErr::ProfileNotFound)?;

    let mut user = json!({
        "id": account_id,
        "name": name,
        "email": email,
        "role": role,
    });

    match role {
        Role::Admin => {}
        Role::Teacher => {
            let teacher_id = teacher_id.ok_or(HandlerErr::ProfileNotFound)?;
            let teacher: Option<(String, Option<String>)> = conn
                .query_row(
                    "SELECT name, title FROM teachers WHERE id = ?",
                    [&teacher_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let (teacher_name, title) = teacher.ok_or(HandlerErr::ProfileNotFound)?;
            user["teacher"] = json!({
                "id": teacher_id,
                "name": teacher_name,
                "title": title,
                "homeroomClasses": class_refs(
                    conn,
                    "SELECT id, name FROM classes WHERE homeroom_teacher_id = ? ORDER BY name",
                    &teacher_id,
                )?,
                "supervisedClasses": class_refs(
                    conn,
                    "SELECT id, name FROM classes WHERE supervisor_teacher_id = ? ORDER BY name",
                    &teacher_id,
                )?,
            });
        }
        Role::Student => {
            let student_id = student_id.ok_or(HandlerErr::ProfileNotFound)?;
            let student = conn
                .query_row(
                    "SELECT s.nis, s.nisn, s.name, s.email, s.phone, s.address, s.class_id, c.name
                     FROM students s LEFT JOIN classes c ON c.id = s.class_id
                     WHERE s.id = ?",
                    [&student_id],
                    |r| {
                        let class_id: Option<String> = r.get(6)?;
                        let class_name: Option<String> = r.get(7)?;
                        Ok(json!({
                            "id": &student_id,
                            "nis": r.get::<_, String>(0)?,
                            "nisn": r.get::<_, String>(1)?,
                            "name": r.get::<_, Option<String>>(2)?,
                            "email": r.get::<_, String>(3)?,
                            "phone": r.get::<_, String>(4)?,
                            "address": r.get::<_, Option<String>>(5)?,
                            "class": class_id.map(|id| json!({ "id": id, "name": class_name })),
                        }))
                    },
                )
                .optional()?;
            user["student"] = student.ok_or(HandlerErr::ProfileNotFound)?;
        }
    }
    Ok(user)
}

fn handle_me(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let (conn, caller) = authorize(state, req, ANY_ROLE)?;
    Ok(json!({ "user": load_profile(conn, &caller.account_id)? }))
}

fn handle_logout(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    // Tokens are stateless; the client discards its copy.
    let (_, caller) = authorize(state, req, ANY_ROLE)?;
    info!(account_id = %caller.account_id, "logout");
    Ok(json!({ "success": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Result<Value, HandlerErr>> {
    match req.method.as_str() {
        "auth.login" => Some(handle_login(state, &req.params)),
        "auth.bootstrapAdmin" => Some(handle_bootstrap_admin(state, &req.params)),
        "auth.me" => Some(handle_me(state, req)),
        "auth.logout" => Some(handle_logout(state, req)),
        _ => None,
    }
}
