use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::attendance::STUDENT_STATUSES;
use crate::ipc::helpers::{authorize, optional_day, today, ADMIN_ONLY};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, NaiveDate};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

const RECENT_LIMIT: i64 = 3;

/// Rounded share of `part` in `whole`; 0 when nothing was counted.
pub fn percentage(part: i64, whole: i64) -> i64 {
    if whole <= 0 {
        return 0;
    }
    (part as f64 * 100.0 / whole as f64).round() as i64
}

fn scalar(conn: &Connection, sql: &str) -> Result<i64, HandlerErr> {
    Ok(conn.query_row(sql, [], |r| r.get(0))?)
}

/// `[first day of month, first day of next month)`
fn month_bounds(day: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    let start = day.with_day(1)?;
    let next = if start.month() == 12 {
        NaiveDate::from_ymd_opt(start.year() + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(start.year(), start.month() + 1, 1)?
    };
    Some((start, next))
}

fn day_summary(conn: &Connection, table: &str, present: &[&str], day: &str) -> Result<Value, HandlerErr> {
    let mut stmt = conn.prepare(&format!(
        "SELECT status, COUNT(*) FROM {} WHERE date = ? GROUP BY status",
        table
    ))?;
    let (mut total, mut present_count) = (0i64, 0i64);
    let rows = stmt.query_map([day], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
    for row in rows {
        let (status, n) = row?;
        total += n;
        if present.contains(&status.as_str()) {
            present_count += n;
        }
    }
    Ok(json!({
        "percentage": percentage(present_count, total),
        "present": present_count,
        "total": total,
    }))
}

fn month_summary(conn: &Connection, day: NaiveDate) -> Result<Value, HandlerErr> {
    let (start, end) = month_bounds(day)
        .ok_or_else(|| HandlerErr::BadParams("date is out of range".into()))?;
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM student_attendance
         WHERE date >= ? AND date < ?
         GROUP BY status",
    )?;
    let counts = stmt
        .query_map(
            [start.format("%Y-%m-%d").to_string(), end.format("%Y-%m-%d").to_string()],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    let total: i64 = counts.iter().map(|(_, n)| n).sum();

    let mut by_status = Map::new();
    for status in STUDENT_STATUSES {
        let n = counts
            .iter()
            .find(|(s, _)| s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0);
        by_status.insert(
            (*status).to_string(),
            json!({ "count": n, "percentage": percentage(n, total) }),
        );
    }
    Ok(json!({
        "month": start.format("%Y-%m").to_string(),
        "total": total,
        "byStatus": by_status,
    }))
}

fn recent_students(conn: &Connection) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.nis, s.name, c.name, s.created_at
         FROM students s
         LEFT JOIN classes c ON c.id = s.class_id
         ORDER BY s.created_at DESC, s.rowid DESC
         LIMIT ?",
    )?;
    let rows = stmt
        .query_map([RECENT_LIMIT], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "nis": r.get::<_, String>(1)?,
                "name": r.get::<_, Option<String>>(2)?,
                "className": r.get::<_, Option<String>>(3)?,
                "createdAt": r.get::<_, String>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn recent_attendance(conn: &Connection) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT a.id, a.student_id, s.name, a.date, a.status, a.recorded_at
         FROM student_attendance a
         JOIN students s ON s.id = a.student_id
         ORDER BY a.recorded_at DESC, a.rowid DESC
         LIMIT ?",
    )?;
    let rows = stmt
        .query_map([RECENT_LIMIT], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": r.get::<_, Option<String>>(2)?,
                "date": r.get::<_, String>(3)?,
                "status": r.get::<_, String>(4)?,
                "recordedAt": r.get::<_, String>(5)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn class_distribution(conn: &Connection) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.name, (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id)
         FROM classes c
         ORDER BY c.name COLLATE NOCASE",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "studentCount": r.get::<_, i64>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn build(conn: &Connection, day: NaiveDate) -> Result<Value, HandlerErr> {
    let day_str = day.format("%Y-%m-%d").to_string();
    Ok(json!({
        "date": day_str,
        "totals": {
            "students": scalar(conn, "SELECT COUNT(*) FROM students")?,
            "teachers": scalar(conn, "SELECT COUNT(*) FROM teachers")?,
            "classes": scalar(conn, "SELECT COUNT(*) FROM classes")?,
        },
        "todayAttendance": day_summary(conn, "student_attendance", &["PRESENT"], &day_str)?,
        "todayTeacherAttendance": day_summary(
            conn,
            "teacher_attendance",
            &["PRESENT", "PRESENT_OUTSIDE_SCHEDULE"],
            &day_str,
        )?,
        "monthAttendance": month_summary(conn, day)?,
        "recentStudents": recent_students(conn)?,
        "recentAttendance": recent_attendance(conn)?,
        "classDistribution": class_distribution(conn)?,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Result<Value, HandlerErr>> {
    match req.method.as_str() {
        "dashboard.get" => Some(authorize(state, req, ADMIN_ONLY).and_then(|(conn, _)| {
            let day = optional_day(&req.params, "date")?.unwrap_or_else(today);
            build(conn, day)
        })),
        _ => None,
    }
}
