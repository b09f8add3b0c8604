#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

pub const TERM: i64 = 1;
pub const YEAR: i64 = 2024;

pub fn temp_dir(prefix: &str) -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .expect("create temp dir")
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_examd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn examd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Sends a request that must fail and returns its error code.
pub fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

/// Selects `workspace` in the sidecar and opens a second connection for seeding.
pub fn open_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &Path,
) -> rusqlite::Connection {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let conn = rusqlite::Connection::open(workspace.join("examd.sqlite3")).expect("open db");
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .expect("busy timeout");
    conn
}

pub fn seed_grade(conn: &rusqlite::Connection, id: &str, name: &str, sort_order: i64) {
    conn.execute(
        "INSERT INTO grades(id, name, sort_order) VALUES(?, ?, ?)",
        (id, name, sort_order),
    )
    .expect("insert grade");
}

pub fn seed_stream(conn: &rusqlite::Connection, id: &str, grade_id: &str, name: &str, tutor: Option<&str>) {
    conn.execute(
        "INSERT INTO streams(id, grade_id, name, tutor_name) VALUES(?, ?, ?, ?)",
        (id, grade_id, name, tutor),
    )
    .expect("insert stream");
}

pub fn seed_subjects(conn: &rusqlite::Connection, grade_id: &str, subjects: &[(&str, &str)]) {
    for (i, (code, name)) in subjects.iter().enumerate() {
        conn.execute(
            "INSERT INTO grade_subjects(grade_id, code, name, sort_order) VALUES(?, ?, ?, ?)",
            (grade_id, code, name, i as i64),
        )
        .expect("insert subject");
    }
}

/// Student `id` (last name = id, first name "Test") enrolled for TERM/YEAR.
pub fn seed_student(
    conn: &rusqlite::Connection,
    id: &str,
    admission_no: Option<&str>,
    grade_id: &str,
    stream_id: Option<&str>,
) {
    conn.execute(
        "INSERT INTO students(id, admission_no, last_name, first_name, grade_id, stream_id, active)
         VALUES(?, ?, ?, 'Test', ?, ?, 1)",
        (id, admission_no, id, grade_id, stream_id),
    )
    .expect("insert student");
    seed_enrollment(conn, id, grade_id, stream_id, TERM, YEAR);
}

pub fn seed_enrollment(
    conn: &rusqlite::Connection,
    student_id: &str,
    grade_id: &str,
    stream_id: Option<&str>,
    term: i64,
    year: i64,
) {
    conn.execute(
        "INSERT INTO enrollments(id, student_id, grade_id, stream_id, term, year)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            format!("en-{}-{}-{}", student_id, term, year),
            student_id,
            grade_id,
            stream_id,
            term,
            year,
        ),
    )
    .expect("insert enrollment");
}

pub fn seed_exam(
    conn: &rusqlite::Connection,
    id: &str,
    exam_type: &str,
    grade_id: Option<&str>,
    created_at: &str,
) {
    conn.execute(
        "INSERT INTO exams(id, name, exam_type, term, year, grade_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (id, format!("Exam {}", id), exam_type, TERM, YEAR, grade_id, created_at),
    )
    .expect("insert exam");
}

pub fn enter_mark(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    student_id: &str,
    exam_id: &str,
    subject_code: &str,
    raw_mark: f64,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        &format!("m-{}-{}-{}", student_id, exam_id, subject_code),
        "marks.enter",
        json!({
            "studentId": student_id,
            "examId": exam_id,
            "subjectCode": subject_code,
            "rawMark": raw_mark,
        }),
    )
}

/// Finds the mark-list row of a student.
pub fn row_for<'a>(list: &'a serde_json::Value, student_id: &str) -> &'a serde_json::Value {
    list.get("rows")
        .and_then(|v| v.as_array())
        .expect("rows")
        .iter()
        .find(|r| r.get("studentId").and_then(|v| v.as_str()) == Some(student_id))
        .expect("row for student")
}

pub fn subject_mean<'a>(list: &'a serde_json::Value, code: &str) -> &'a serde_json::Value {
    list.get("subjectMeans")
        .and_then(|v| v.as_array())
        .expect("subjectMeans")
        .iter()
        .find(|m| m.get("code").and_then(|v| v.as_str()) == Some(code))
        .expect("subject mean")
}
