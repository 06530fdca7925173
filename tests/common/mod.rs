#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}-{}",
        prefix,
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub struct Sidecar {
    child: Child,
    pub stdin: ChildStdin,
    pub reader: BufReader<ChildStdout>,
    seq: u64,
}

impl Sidecar {
    pub fn spawn() -> Self {
        let exe = env!("CARGO_BIN_EXE_schoold");
        let mut child = Command::new(exe)
            .env("SCHOOLD_JWT_SECRET", "integration-test-secret")
            .env("TZ", "UTC")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn schoold");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            seq: 0,
        }
    }

    pub fn request(&mut self, method: &str, params: Value, token: Option<&str>) -> Value {
        self.seq += 1;
        let id = self.seq.to_string();
        let mut payload = json!({ "id": id, "method": method, "params": params });
        if let Some(t) = token {
            payload["token"] = json!(t);
        }
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");

        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        assert!(!line.trim().is_empty(), "empty response for {}", method);
        let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn ok(&mut self, method: &str, params: Value, token: Option<&str>) -> Value {
        let v = self.request(method, params, token);
        assert_eq!(v["ok"], true, "{} failed: {}", method, v);
        v["result"].clone()
    }

    pub fn err_code(&mut self, method: &str, params: Value, token: Option<&str>) -> String {
        let v = self.request(method, params, token);
        assert_eq!(v["ok"], false, "{} unexpectedly succeeded: {}", method, v);
        v["error"]["code"].as_str().unwrap_or_default().to_string()
    }

    /// Opens a fresh workspace and returns an administrator token.
    pub fn admin_session(&mut self, prefix: &str) -> (PathBuf, String) {
        let ws = temp_dir(prefix);
        self.ok("workspace.select", json!({ "path": ws.to_string_lossy() }), None);
        self.ok(
            "auth.bootstrapAdmin",
            json!({ "name": "Admin", "email": "admin@school.id", "password": "admin123" }),
            None,
        );
        let login = self.ok(
            "auth.login",
            json!({ "role": "ADMIN", "email": "admin@school.id", "password": "admin123" }),
            None,
        );
        let token = login["token"].as_str().expect("token").to_string();
        (ws, token)
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Creates a class and one student with a login; returns `(class_id, student_id)`.
pub fn seed_class_with_student(sc: &mut Sidecar, admin: &str, class: &str, nis: &str) -> (String, String) {
    let class = sc.ok("classes.create", json!({ "name": class }), Some(admin));
    let class_id = class["class"]["id"].as_str().expect("class id").to_string();
    let student = sc.ok(
        "students.create",
        json!({
            "nis": nis,
            "nisn": format!("00{}", nis),
            "email": format!("{}@student.school.id", nis),
            "phone": "081200000000",
            "name": format!("Student {}", nis),
            "classId": class_id,
            "password": "student123"
        }),
        Some(admin),
    );
    let student_id = student["student"]["id"].as_str().expect("student id").to_string();
    (class_id, student_id)
}

/// Logs in as a student by NIS and returns `(token, account_id)`.
pub fn student_login(sc: &mut Sidecar, nis: &str) -> (String, String) {
    let login = sc.ok(
        "auth.login",
        json!({ "role": "STUDENT", "nis": nis, "password": "student123" }),
        None,
    );
    (
        login["token"].as_str().expect("token").to_string(),
        login["user"]["id"].as_str().expect("account id").to_string(),
    )
}
