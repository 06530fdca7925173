mod common;

use common::{seed_class_with_student, student_login, Sidecar};
use serde_json::json;

const DAY: &str = "2026-03-02";

#[test]
fn one_record_per_student_per_day() {
    let mut sc = Sidecar::spawn();
    let (_ws, admin) = sc.admin_session("schoold-att-once");
    let (class_id, student_id) = seed_class_with_student(&mut sc, &admin, "X-1", "3001");

    let created = sc.ok(
        "attendance.students.create",
        json!({ "studentId": student_id, "date": DAY, "status": "PRESENT" }),
        Some(&admin),
    );
    assert_eq!(created["record"]["status"], "PRESENT");
    assert_eq!(created["record"]["date"], DAY);

    let listed = sc.ok(
        "attendance.students.list",
        json!({ "classId": class_id, "date": DAY }),
        Some(&admin),
    );
    assert_eq!(listed["records"].as_array().map(|a| a.len()), Some(1));

    // Same day given as a timestamp still collides.
    let again = sc.err_code(
        "attendance.students.create",
        json!({ "studentId": student_id, "date": format!("{}T12:00:00Z", DAY), "status": "LATE" }),
        Some(&admin),
    );
    assert_eq!(again, "duplicate_attendance");

    let listed = sc.ok(
        "attendance.students.list",
        json!({ "classId": class_id, "date": DAY }),
        Some(&admin),
    );
    assert_eq!(listed["records"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(listed["records"][0]["status"], "PRESENT");
}

#[test]
fn statuses_are_checked_per_ledger() {
    let mut sc = Sidecar::spawn();
    let (_ws, admin) = sc.admin_session("schoold-att-status");
    let (_class_id, student_id) = seed_class_with_student(&mut sc, &admin, "X-2", "3002");

    let bad = sc.request(
        "attendance.students.create",
        json!({ "studentId": student_id, "date": DAY, "status": "PRESENT_OUTSIDE_SCHEDULE" }),
        Some(&admin),
    );
    assert_eq!(bad["error"]["code"], "invalid_status");
    assert!(bad["error"]["details"]["allowed"]
        .as_array()
        .is_some_and(|a| a.iter().any(|s| s == "SICK")));

    let teacher = sc.ok(
        "teachers.create",
        json!({ "name": "Pak Joko", "email": "joko@school.id", "password": "joko1234" }),
        Some(&admin),
    );
    let teacher_id = teacher["teacher"]["id"].as_str().expect("teacher id").to_string();
    sc.ok(
        "attendance.teachers.create",
        json!({ "teacherId": teacher_id, "date": DAY, "status": "PRESENT_OUTSIDE_SCHEDULE" }),
        Some(&admin),
    );
    assert_eq!(
        sc.err_code(
            "attendance.teachers.create",
            json!({ "teacherId": teacher_id, "date": "2026-03-03", "status": "SICK" }),
            Some(&admin)
        ),
        "invalid_status"
    );
    assert_eq!(
        sc.err_code(
            "attendance.teachers.create",
            json!({ "teacherId": "ghost", "date": DAY, "status": "PRESENT" }),
            Some(&admin)
        ),
        "not_found"
    );
    assert_eq!(
        sc.err_code(
            "attendance.students.create",
            json!({ "studentId": student_id, "date": "02/03/2026", "status": "PRESENT" }),
            Some(&admin)
        ),
        "bad_params"
    );

    let listed = sc.ok(
        "attendance.teachers.list",
        json!({ "teacherId": teacher_id }),
        Some(&admin),
    );
    assert_eq!(listed["records"][0]["status"], "PRESENT_OUTSIDE_SCHEDULE");
}

#[test]
fn students_only_see_their_own_records() {
    let mut sc = Sidecar::spawn();
    let (_ws, admin) = sc.admin_session("schoold-att-scope");
    let (_c1, first) = seed_class_with_student(&mut sc, &admin, "XI-1", "3101");
    let (_c2, second) = seed_class_with_student(&mut sc, &admin, "XI-2", "3102");
    for id in [&first, &second] {
        sc.ok(
            "attendance.students.create",
            json!({ "studentId": id, "date": DAY, "status": "SICK" }),
            Some(&admin),
        );
    }

    let (token, _) = student_login(&mut sc, "3101");
    let own = sc.ok("attendance.students.list", json!({}), Some(&token));
    let records = own["records"].as_array().expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["studentId"], first.as_str());

    assert_eq!(
        sc.err_code(
            "attendance.students.list",
            json!({ "studentId": second }),
            Some(&token)
        ),
        "forbidden"
    );
    assert_eq!(
        sc.err_code(
            "attendance.students.create",
            json!({ "studentId": first, "date": "2026-03-03", "status": "PRESENT" }),
            Some(&token)
        ),
        "forbidden"
    );
    assert_eq!(
        sc.err_code("attendance.teachers.list", json!({}), Some(&token)),
        "forbidden"
    );
}
