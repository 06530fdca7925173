use chrono::{DateTime, Local, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

use crate::auth::Role;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::types::{AppState, Request};

pub const ANY_ROLE: &[Role] = &[Role::Admin, Role::Teacher, Role::Student];
pub const STAFF: &[Role] = &[Role::Admin, Role::Teacher];
pub const ADMIN_ONLY: &[Role] = &[Role::Admin];

/// Authenticated account behind a request.
#[derive(Debug, Clone)]
pub struct Caller {
    pub account_id: String,
    pub role: Role,
    pub student_id: Option<String>,
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state.db.as_ref().ok_or(HandlerErr::NoWorkspace)
}

/// Resolves the caller from the request token and applies the role check.
///
/// The role stored on the account wins over the one in the token: a token
/// minted before a role change no longer matches and is rejected.
pub fn authorize<'a>(
    state: &'a AppState,
    req: &Request,
    allowed: &[Role],
) -> Result<(&'a Connection, Caller), HandlerErr> {
    let conn = require_db(state)?;
    let token = req
        .token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(HandlerErr::Unauthenticated)?;
    let claims = state
        .tokens
        .verify(token, Utc::now().timestamp())
        .map_err(|_| HandlerErr::TokenInvalid)?;

    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT role, student_id FROM accounts WHERE id = ?",
            [&claims.sub],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((role_raw, student_id)) = row else {
        return Err(HandlerErr::ProfileNotFound);
    };
    if Role::parse(&role_raw) != Some(claims.role) {
        return Err(HandlerErr::TokenInvalid);
    }
    if !allowed.contains(&claims.role) {
        return Err(HandlerErr::Forbidden(format!(
            "{} may not call {}",
            claims.role.as_str(),
            req.method
        )));
    }
    Ok((
        conn,
        Caller {
            account_id: claims.sub,
            role: claims.role,
            student_id,
        },
    ))
}

/// Trimmed string param; absent, null and blank are all "missing".
pub fn required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    optional_str(params, key)?.ok_or_else(|| HandlerErr::BadParams(format!("missing {}", key)))
}

pub fn optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let s = s.trim();
            Ok(if s.is_empty() { None } else { Some(s.to_string()) })
        }
        Some(_) => Err(HandlerErr::BadParams(format!("{} must be a string", key))),
    }
}

/// Update semantics: `None` leaves the column alone, `Some(None)` clears it.
pub fn patch_str(params: &Value, key: &str) -> Result<Option<Option<String>>, HandlerErr> {
    if params.get(key).is_none() {
        return Ok(None);
    }
    optional_str(params, key).map(Some)
}

/// Like [`patch_str`] for columns that cannot be cleared.
pub fn patch_required_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match patch_str(params, key)? {
        None => Ok(None),
        Some(Some(v)) => Ok(Some(v)),
        Some(None) => Err(HandlerErr::BadParams(format!("{} must not be empty", key))),
    }
}

/// Accepts JSON booleans and the query-string spellings `"true"`/`"false"`.
pub fn optional_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) => match s.trim() {
            "true" | "1" => Ok(Some(true)),
            "false" | "0" => Ok(Some(false)),
            _ => Err(HandlerErr::BadParams(format!("{} must be boolean", key))),
        },
        Some(_) => Err(HandlerErr::BadParams(format!("{} must be boolean", key))),
    }
}

/// Positive integer capped at `max`; numeric strings are accepted.
pub fn optional_limit(params: &Value, key: &str, max: i64) -> Result<Option<i64>, HandlerErr> {
    let n = match params.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(_) => None,
    };
    match n {
        Some(n) if n > 0 => Ok(Some(n.min(max))),
        _ => Err(HandlerErr::BadParams(format!(
            "{} must be a positive integer",
            key
        ))),
    }
}

pub fn check_password(password: &str) -> Result<(), HandlerErr> {
    if password.chars().count() < crate::auth::MIN_PASSWORD_LEN {
        return Err(HandlerErr::BadParams(format!(
            "password must be at least {} characters",
            crate::auth::MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

/// Calendar day from `YYYY-MM-DD` or an RFC 3339 timestamp (local day).
pub fn parse_day(raw: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(d);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Local).date_naive())
        .map_err(|_| {
            HandlerErr::BadParams(format!(
                "{} must be YYYY-MM-DD or an RFC 3339 timestamp",
                key
            ))
        })
}

pub fn optional_day(params: &Value, key: &str) -> Result<Option<NaiveDate>, HandlerErr> {
    optional_str(params, key)?
        .map(|raw| parse_day(&raw, key))
        .transpose()
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Maps a UNIQUE violation to `DuplicateKey` naming the first column.
pub fn map_unique(e: rusqlite::Error) -> HandlerErr {
    match db::unique_violation(&e) {
        Some(cols) => HandlerErr::DuplicateKey {
            field: cols.into_iter().next().unwrap_or_default(),
        },
        None => e.into(),
    }
}

/// `table` is always a literal from this crate.
pub fn exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    let found: Option<i64> = conn
        .query_row(
            &format!("SELECT 1 FROM {} WHERE id = ?", table),
            [id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn count(conn: &Connection, sql: &str, id: &str) -> Result<i64, HandlerErr> {
    Ok(conn.query_row(sql, [id], |r| r.get(0))?)
}
