//! Per-day attendance ledgers for students and teachers.
//!
//! One record per (subject, date), enforced by the table's UNIQUE constraint.
//! Records are append-only; there is no correction path.

use crate::auth::Role;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    authorize, exists, new_id, now_rfc3339, optional_day, optional_str, parse_day, required_str,
    Caller, ANY_ROLE, STAFF,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;

pub const STUDENT_STATUSES: &[&str] = &["PRESENT", "EXCUSED", "SICK", "ABSENT", "LATE"];
pub const TEACHER_STATUSES: &[&str] = &["PRESENT", "ABSENT", "PRESENT_OUTSIDE_SCHEDULE"];

#[derive(Clone, Copy, Debug)]
enum Ledger {
    Student,
    Teacher,
}

impl Ledger {
    fn table(self) -> &'static str {
        match self {
            Self::Student => "student_attendance",
            Self::Teacher => "teacher_attendance",
        }
    }

    fn subject_table(self) -> &'static str {
        match self {
            Self::Student => "students",
            Self::Teacher => "teachers",
        }
    }

    fn subject_param(self) -> &'static str {
        match self {
            Self::Student => "studentId",
            Self::Teacher => "teacherId",
        }
    }

    fn subject_kind(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Teacher => "teacher",
        }
    }

    fn statuses(self) -> &'static [&'static str] {
        match self {
            Self::Student => STUDENT_STATUSES,
            Self::Teacher => TEACHER_STATUSES,
        }
    }
}

const STUDENT_RECORD_SELECT: &str = "SELECT a.id, a.student_id, a.date, a.status, a.note, a.recorded_at,
        s.nis, s.nisn, s.name, s.class_id, c.name
     FROM student_attendance a
     JOIN students s ON s.id = a.student_id
     LEFT JOIN classes c ON c.id = s.class_id";

const TEACHER_RECORD_SELECT: &str = "SELECT a.id, a.teacher_id, a.date, a.status, a.note, a.recorded_at,
        t.name, t.title
     FROM teacher_attendance a
     JOIN teachers t ON t.id = a.teacher_id";

fn student_record(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let student_id: String = r.get(1)?;
    let class_id: Option<String> = r.get(9)?;
    let class_name: Option<String> = r.get(10)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": &student_id,
        "date": r.get::<_, String>(2)?,
        "status": r.get::<_, String>(3)?,
        "note": r.get::<_, Option<String>>(4)?,
        "recordedAt": r.get::<_, String>(5)?,
        "student": {
            "id": student_id,
            "nis": r.get::<_, String>(6)?,
            "nisn": r.get::<_, String>(7)?,
            "name": r.get::<_, Option<String>>(8)?,
            "class": class_id.map(|id| json!({ "id": id, "name": class_name })),
        },
    }))
}

fn teacher_record(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let teacher_id: String = r.get(1)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "teacherId": &teacher_id,
        "date": r.get::<_, String>(2)?,
        "status": r.get::<_, String>(3)?,
        "note": r.get::<_, Option<String>>(4)?,
        "recordedAt": r.get::<_, String>(5)?,
        "teacher": {
            "id": teacher_id,
            "name": r.get::<_, String>(6)?,
            "title": r.get::<_, Option<String>>(7)?,
        },
    }))
}

fn load_record(conn: &Connection, ledger: Ledger, id: &str) -> Result<Value, HandlerErr> {
    let found = match ledger {
        Ledger::Student => conn
            .query_row(&format!("{} WHERE a.id = ?", STUDENT_RECORD_SELECT), [id], student_record)
            .optional()?,
        Ledger::Teacher => conn
            .query_row(&format!("{} WHERE a.id = ?", TEACHER_RECORD_SELECT), [id], teacher_record)
            .optional()?,
    };
    found.ok_or(HandlerErr::NotFound("attendance record"))
}

fn create_record(conn: &Connection, ledger: Ledger, params: &Value) -> Result<Value, HandlerErr> {
    let subject_id = required_str(params, ledger.subject_param())?;
    let date_raw = required_str(params, "date")?;
    let status = required_str(params, "status")?;
    let note = optional_str(params, "note")?;

    if !ledger.statuses().contains(&status.as_str()) {
        return Err(HandlerErr::InvalidStatus {
            status,
            allowed: ledger.statuses(),
        });
    }
    let date = parse_day(&date_raw, "date")?;
    if !exists(conn, ledger.subject_table(), &subject_id)? {
        return Err(HandlerErr::NotFound(ledger.subject_kind()));
    }

    let id = new_id();
    conn.execute(
        &format!(
            "INSERT INTO {}(id, {}_id, date, status, note, recorded_at) VALUES(?, ?, ?, ?, ?, ?)",
            ledger.table(),
            ledger.subject_kind()
        ),
        (
            &id,
            &subject_id,
            date.format("%Y-%m-%d").to_string(),
            &status,
            &note,
            now_rfc3339(),
        ),
    )
    .map_err(|e| match db::unique_violation(&e) {
        Some(_) => HandlerErr::DuplicateAttendance,
        None => HandlerErr::from(e),
    })?;

    info!(
        ledger = ledger.subject_kind(),
        record_id = %id,
        subject_id = %subject_id,
        date = %date,
        status = %status,
        "attendance recorded"
    );
    load_record(conn, ledger, &id)
}

fn list_student_records(
    conn: &Connection,
    caller: &Caller,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let date = optional_day(params, "date")?.map(|d| d.format("%Y-%m-%d").to_string());
    let mut student_id = optional_str(params, "studentId")?;
    let class_id = optional_str(params, "classId")?;

    if caller.role == Role::Student {
        let own = caller
            .student_id
            .clone()
            .ok_or(HandlerErr::ProfileNotFound)?;
        if student_id.as_ref().is_some_and(|s| *s != own) {
            return Err(HandlerErr::Forbidden(
                "students may only read their own attendance".into(),
            ));
        }
        student_id = Some(own);
    }

    let order = if class_id.is_some() {
        "s.name COLLATE NOCASE ASC, a.date DESC"
    } else {
        "a.date DESC, s.name COLLATE NOCASE ASC"
    };
    let mut stmt = conn.prepare(&format!(
        "{} WHERE (?1 IS NULL OR a.date = ?1)
           AND (?2 IS NULL OR a.student_id = ?2)
           AND (?3 IS NULL OR s.class_id = ?3)
         ORDER BY {}, a.recorded_at DESC",
        STUDENT_RECORD_SELECT, order
    ))?;
    let records = stmt
        .query_map((&date, &student_id, &class_id), student_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "records": records }))
}

fn list_teacher_records(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let date = optional_day(params, "date")?.map(|d| d.format("%Y-%m-%d").to_string());
    let teacher_id = optional_str(params, "teacherId")?;
    let mut stmt = conn.prepare(&format!(
        "{} WHERE (?1 IS NULL OR a.date = ?1) AND (?2 IS NULL OR a.teacher_id = ?2)
         ORDER BY a.date DESC, t.name COLLATE NOCASE ASC, a.recorded_at DESC",
        TEACHER_RECORD_SELECT
    ))?;
    let records = stmt
        .query_map((&date, &teacher_id), teacher_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "records": records }))
}

fn handle_create(state: &AppState, req: &Request, ledger: Ledger) -> Result<Value, HandlerErr> {
    let (conn, _) = authorize(state, req, STAFF)?;
    let record = create_record(conn, ledger, &req.params)?;
    state.relay.broadcast(
        "attendance-update",
        json!({ "type": format!("{}-attendance-created", ledger.subject_kind()), "payload": &record }),
    );
    Ok(json!({ "record": record }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Result<Value, HandlerErr>> {
    let state: &AppState = state;
    let result = match req.method.as_str() {
        "attendance.students.create" => handle_create(state, req, Ledger::Student),
        "attendance.teachers.create" => handle_create(state, req, Ledger::Teacher),
        "attendance.students.list" => authorize(state, req, ANY_ROLE)
            .and_then(|(c, caller)| list_student_records(c, &caller, &req.params)),
        "attendance.teachers.list" => {
            authorize(state, req, STAFF).and_then(|(c, _)| list_teacher_records(c, &req.params))
        }
        _ => return None,
    };
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Connection {
        let conn = db::open_in_memory().expect("db");
        conn.execute_batch(
            "INSERT INTO classes(id, name, created_at) VALUES('c1', 'X-1', 'now');
             INSERT INTO students(id, nis, nisn, email, phone, name, class_id, created_at)
               VALUES('s1', '1001', '9001', 'b@x', '0', 'Budi', 'c1', 'now'),
                     ('s2', '1002', '9002', 'a@x', '0', 'Ani', 'c1', 'now'),
                     ('s3', '1003', '9003', 'c@x', '0', 'Citra', NULL, 'now');
             INSERT INTO teachers(id, name, created_at) VALUES('t1', 'Bu Sari', 'now');",
        )
        .expect("seed");
        conn
    }

    fn admin() -> Caller {
        Caller {
            account_id: "acc".into(),
            role: Role::Admin,
            student_id: None,
        }
    }

    fn mark(conn: &Connection, student: &str, date: &str, status: &str) -> Result<Value, HandlerErr> {
        create_record(
            conn,
            Ledger::Student,
            &json!({ "studentId": student, "date": date, "status": status }),
        )
    }

    fn stored(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .expect("count")
    }

    #[test]
    fn second_record_for_the_same_day_is_a_duplicate() {
        let conn = seeded();
        mark(&conn, "s1", "2024-03-04", "PRESENT").expect("first");
        assert!(matches!(
            mark(&conn, "s1", "2024-03-04", "LATE"),
            Err(HandlerErr::DuplicateAttendance)
        ));
        mark(&conn, "s1", "2024-03-05", "LATE").expect("next day is fine");
        assert_eq!(stored(&conn, "student_attendance"), 2);
    }

    #[test]
    fn unknown_status_is_rejected_before_anything_is_stored() {
        let conn = seeded();
        match mark(&conn, "s1", "2024-03-04", "ALPHA") {
            Err(HandlerErr::InvalidStatus { status, allowed }) => {
                assert_eq!(status, "ALPHA");
                assert_eq!(allowed, STUDENT_STATUSES);
            }
            other => panic!("expected invalid status, got {:?}", other),
        }
        // Status is checked before the subject, so an unknown student still
        // reports the status problem.
        assert!(matches!(
            mark(&conn, "ghost", "2024-03-04", "ALPHA"),
            Err(HandlerErr::InvalidStatus { .. })
        ));
        assert_eq!(stored(&conn, "student_attendance"), 0);
    }

    #[test]
    fn ledgers_have_their_own_status_sets() {
        let conn = seeded();
        assert!(matches!(
            create_record(
                &conn,
                Ledger::Teacher,
                &json!({ "teacherId": "t1", "date": "2024-03-04", "status": "SICK" }),
            ),
            Err(HandlerErr::InvalidStatus { .. })
        ));
        let rec = create_record(
            &conn,
            Ledger::Teacher,
            &json!({ "teacherId": "t1", "date": "2024-03-04", "status": "PRESENT_OUTSIDE_SCHEDULE" }),
        )
        .expect("teacher record");
        assert_eq!(rec["teacher"]["name"], "Bu Sari");
    }

    #[test]
    fn unknown_subject_is_not_found() {
        let conn = seeded();
        assert!(matches!(
            mark(&conn, "ghost", "2024-03-04", "PRESENT"),
            Err(HandlerErr::NotFound("student"))
        ));
        assert!(matches!(
            mark(&conn, "s1", "tomorrow", "PRESENT"),
            Err(HandlerErr::BadParams(_))
        ));
    }

    #[test]
    fn class_listing_orders_by_name_then_newest_date() {
        let conn = seeded();
        mark(&conn, "s1", "2024-03-04", "PRESENT").expect("rec");
        mark(&conn, "s1", "2024-03-05", "SICK").expect("rec");
        mark(&conn, "s2", "2024-03-04", "ABSENT").expect("rec");
        mark(&conn, "s3", "2024-03-06", "PRESENT").expect("rec");

        let v = list_student_records(&conn, &admin(), &json!({ "classId": "c1" })).expect("list");
        let got: Vec<(String, String)> = v["records"]
            .as_array()
            .expect("records")
            .iter()
            .map(|r| {
                (
                    r["student"]["name"].as_str().unwrap_or_default().to_string(),
                    r["date"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        assert_eq!(
            got,
            vec![
                ("Ani".to_string(), "2024-03-04".to_string()),
                ("Budi".to_string(), "2024-03-05".to_string()),
                ("Budi".to_string(), "2024-03-04".to_string()),
            ]
        );

        let v = list_student_records(&conn, &admin(), &json!({})).expect("list");
        assert_eq!(v["records"][0]["date"], "2024-03-06");

        let v = list_student_records(&conn, &admin(), &json!({ "date": "2024-03-04" })).expect("list");
        assert_eq!(v["records"].as_array().map(|a| a.len()), Some(2));
    }

    #[test]
    fn students_only_see_their_own_records() {
        let conn = seeded();
        mark(&conn, "s1", "2024-03-04", "PRESENT").expect("rec");
        mark(&conn, "s2", "2024-03-04", "PRESENT").expect("rec");
        let me = Caller {
            account_id: "acc-s2".into(),
            role: Role::Student,
            student_id: Some("s2".into()),
        };
        let v = list_student_records(&conn, &me, &json!({})).expect("list");
        assert_eq!(v["records"].as_array().map(|a| a.len()), Some(1));
        assert_eq!(v["records"][0]["studentId"], "s2");
        assert!(matches!(
            list_student_records(&conn, &me, &json!({ "studentId": "s1" })),
            Err(HandlerErr::Forbidden(_))
        ));
    }
}
