use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "school.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            title TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            homeroom_teacher_id TEXT,
            supervisor_teacher_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(homeroom_teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(supervisor_teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_homeroom ON classes(homeroom_teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_supervisor ON classes(supervisor_teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            nis TEXT NOT NULL UNIQUE,
            nisn TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE COLLATE NOCASE,
            phone TEXT NOT NULL,
            name TEXT,
            address TEXT,
            class_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    // Email stays nullable: student accounts log in by NIS. SQLite lets
    // several NULLs coexist under a UNIQUE constraint.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT UNIQUE COLLATE NOCASE,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL CHECK(role IN ('ADMIN', 'TEACHER', 'STUDENT')),
            teacher_id TEXT UNIQUE,
            student_id TEXT UNIQUE,
            created_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_assignments(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(teacher_id, subject_id, class_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_assignments_class ON subject_assignments(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_assignments_subject ON subject_assignments(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_attendance(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL,
            note TEXT,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_attendance_date ON student_attendance(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_attendance(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL,
            note TEXT,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            UNIQUE(teacher_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_attendance_date ON teacher_attendance(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            read INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(account_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_account ON notifications(account_id, read)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// Columns named by a failed UNIQUE constraint, without their table prefix.
///
/// Returns `None` for every other error so callers can fall through to the
/// generic database error path.
pub fn unique_violation(e: &rusqlite::Error) -> Option<Vec<String>> {
    let rusqlite::Error::SqliteFailure(code, Some(message)) = e else {
        return None;
    };
    if code.extended_code != rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE {
        return None;
    }
    let (_, columns) = message.split_once(": ")?;
    Some(
        columns
            .split(',')
            .map(|c| {
                let c = c.trim();
                c.rsplit_once('.').map(|(_, col)| col).unwrap_or(c).to_string()
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_names_the_offending_column() {
        let conn = open_in_memory().expect("open db");
        conn.execute(
            "INSERT INTO subjects(id, name, created_at) VALUES('a', 'Math', 'now')",
            [],
        )
        .expect("first insert");
        let e = conn
            .execute(
                "INSERT INTO subjects(id, name, created_at) VALUES('b', 'Math', 'now')",
                [],
            )
            .expect_err("duplicate insert must fail");
        assert_eq!(unique_violation(&e), Some(vec!["name".to_string()]));
    }

    #[test]
    fn unique_violation_lists_composite_columns() {
        let conn = open_in_memory().expect("open db");
        conn.execute(
            "INSERT INTO teachers(id, name, created_at) VALUES('t1', 'Budi', 'now')",
            [],
        )
        .expect("teacher");
        let insert = "INSERT INTO teacher_attendance(id, teacher_id, date, status, recorded_at)
                      VALUES(?, 't1', '2024-01-02', 'PRESENT', 'now')";
        conn.execute(insert, ["a1"]).expect("first record");
        let e = conn
            .execute(insert, ["a2"])
            .expect_err("second record for the same day must fail");
        assert_eq!(
            unique_violation(&e),
            Some(vec!["teacher_id".to_string(), "date".to_string()])
        );
    }

    #[test]
    fn account_emails_collide_regardless_of_case() {
        let conn = open_in_memory().expect("open db");
        let insert = "INSERT INTO accounts(id, name, email, password_hash, role, created_at)
                      VALUES(?, 'Budi', ?, 'x', 'TEACHER', 'now')";
        conn.execute(insert, ["a1", "Budi@school.id"]).expect("first account");
        let e = conn
            .execute(insert, ["a2", "budi@school.id"])
            .expect_err("case variant must collide");
        assert_eq!(unique_violation(&e), Some(vec!["email".to_string()]));
    }

    #[test]
    fn foreign_key_failure_is_not_a_unique_violation() {
        let conn = open_in_memory().expect("open db");
        let e = conn
            .execute(
                "INSERT INTO notifications(id, account_id, title, body, created_at)
                 VALUES('n1', 'missing', 't', 'b', 'now')",
                [],
            )
            .expect_err("dangling account must fail");
        assert_eq!(unique_violation(&e), None);
    }

    #[test]
    fn settings_json_roundtrip_overwrites() {
        let conn = open_in_memory().expect("open db");
        assert!(settings_get_json(&conn, "school").expect("get").is_none());
        settings_set_json(&conn, "school", &serde_json::json!({ "name": "A" })).expect("set");
        settings_set_json(&conn, "school", &serde_json::json!({ "name": "B" })).expect("set");
        let v = settings_get_json(&conn, "school").expect("get").expect("value");
        assert_eq!(v["name"], "B");
    }
}
