use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "examd.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // Other sidecars on the same workspace wait for the write lock instead of failing.
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS streams(
            id TEXT PRIMARY KEY,
            grade_id TEXT NOT NULL,
            name TEXT NOT NULL,
            tutor_name TEXT,
            FOREIGN KEY(grade_id) REFERENCES grades(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_streams_grade ON streams(grade_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            admission_no TEXT,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            grade_id TEXT,
            stream_id TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(grade_id) REFERENCES grades(id),
            FOREIGN KEY(stream_id) REFERENCES streams(id)
        )",
        [],
    )?;

    // One row per (student, term, year); exam results hang off this key so a
    // student moving streams between terms keeps both histories.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            grade_id TEXT NOT NULL,
            stream_id TEXT,
            term INTEGER NOT NULL,
            year INTEGER NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(grade_id) REFERENCES grades(id),
            FOREIGN KEY(stream_id) REFERENCES streams(id),
            UNIQUE(student_id, term, year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_grade ON enrollments(grade_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_stream ON enrollments(stream_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_subjects(
            grade_id TEXT NOT NULL,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(grade_id, code),
            FOREIGN KEY(grade_id) REFERENCES grades(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            exam_type TEXT NOT NULL,
            term INTEGER NOT NULL,
            year INTEGER NOT NULL,
            grade_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(grade_id) REFERENCES grades(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exams_term ON exams(year, term)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks_out_of(
            exam_id TEXT NOT NULL,
            subject_code TEXT NOT NULL,
            out_of REAL NOT NULL,
            PRIMARY KEY(exam_id, subject_code),
            FOREIGN KEY(exam_id) REFERENCES exams(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_results(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            exam_id TEXT NOT NULL,
            total_marks REAL NOT NULL DEFAULT 0,
            position INTEGER,
            stream_position INTEGER,
            updated_at TEXT,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            UNIQUE(enrollment_id, exam_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_results_exam ON exam_results(exam_id)",
        [],
    )?;

    // Absent row = subject not yet entered (distinct from a zero score).
    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_result_scores(
            result_id TEXT NOT NULL,
            subject_code TEXT NOT NULL,
            raw_mark REAL NOT NULL,
            score REAL NOT NULL,
            PRIMARY KEY(result_id, subject_code),
            FOREIGN KEY(result_id) REFERENCES exam_results(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS point_boundaries(
            id TEXT PRIMARY KEY,
            grade_id TEXT,
            sort_order INTEGER NOT NULL,
            min_marks REAL NOT NULL,
            max_marks REAL NOT NULL,
            label TEXT NOT NULL,
            FOREIGN KEY(grade_id) REFERENCES grades(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_point_boundaries_grade ON point_boundaries(grade_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS mean_records(
            scope_key TEXT NOT NULL,
            exam_id TEXT NOT NULL,
            subject_code TEXT NOT NULL,
            mean REAL NOT NULL,
            entries INTEGER NOT NULL,
            archived_at TEXT NOT NULL,
            PRIMARY KEY(scope_key, exam_id, subject_code),
            FOREIGN KEY(exam_id) REFERENCES exams(id)
        )",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
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

pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
