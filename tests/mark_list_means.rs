mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{
    enter_mark, open_workspace, request_ok, row_for, seed_exam, seed_grade, seed_stream,
    seed_student, seed_subjects, spawn_sidecar, subject_mean, temp_dir,
};

fn seed_two_exams(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    conn: &rusqlite::Connection,
) {
    seed_grade(conn, "g7", "Grade 7", 7);
    seed_stream(conn, "st-a", "g7", "7 East", Some("Mr. Otieno"));
    seed_stream(conn, "st-b", "g7", "7 West", None);
    seed_subjects(conn, "g7", &[("MAT", "Mathematics"), ("ENG", "English"), ("SCI", "Science")]);
    seed_student(conn, "s1", Some("A001"), "g7", Some("st-a"));
    seed_student(conn, "s2", Some("A002"), "g7", Some("st-a"));
    seed_student(conn, "s3", Some("A003"), "g7", Some("st-b"));
    seed_exam(conn, "e0", "opener", Some("g7"), "2024-01-10T08:00:00+00:00");
    seed_exam(conn, "e1", "mid_term", Some("g7"), "2024-02-10T08:00:00+00:00");

    let _ = request_ok(
        stdin,
        reader,
        "b1",
        "boundaries.set",
        json!({ "boundaries": [
            { "minMarks": 75, "maxMarks": 100, "label": "Exceeding Expectation" },
            { "minMarks": 50, "maxMarks": 74.99, "label": "Meeting Expectation" },
            { "minMarks": 25, "maxMarks": 49.99, "label": "Approaching Expectation" },
            { "minMarks": 0, "maxMarks": 24.99, "label": "Below Expectation" }
        ]}),
    );

    enter_mark(stdin, reader, "s1", "e0", "MAT", 50.0);
    enter_mark(stdin, reader, "s2", "e0", "MAT", 70.0);
    enter_mark(stdin, reader, "s1", "e0", "ENG", 60.0);

    enter_mark(stdin, reader, "s1", "e1", "MAT", 65.0);
    enter_mark(stdin, reader, "s2", "e1", "MAT", 70.0);
    enter_mark(stdin, reader, "s3", "e1", "MAT", 61.2);
    enter_mark(stdin, reader, "s1", "e1", "ENG", 70.0);
    enter_mark(stdin, reader, "s1", "e1", "SCI", 40.0);
}

#[test]
fn mark_list_reports_means_and_deviation_from_previous_exam() {
    let workspace = temp_dir("examd-mark-list");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let conn = open_workspace(&mut stdin, &mut reader, workspace.path());
    seed_two_exams(&mut stdin, &mut reader, &conn);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "reports.markList",
        json!({ "examId": "e0", "gradeId": "g7" }),
    );
    assert!(first.get("previousExam").expect("previousExam").is_null());
    assert_eq!(subject_mean(&first, "MAT").get("deviation"), Some(&json!("-")));
    assert_eq!(first.pointer("/totalMean/deviation"), Some(&json!("-")));

    let list = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.markList",
        json!({ "examId": "e1", "gradeId": "g7" }),
    );
    assert_eq!(list.pointer("/previousExam/id"), Some(&json!("e0")));

    let mat = subject_mean(&list, "MAT");
    assert_eq!(mat.get("mean").and_then(|v| v.as_f64()), Some(65.4));
    assert_eq!(mat.get("entries").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(mat.get("previousMean").and_then(|v| v.as_f64()), Some(60.0));
    assert_eq!(mat.get("deviation").and_then(|v| v.as_f64()), Some(5.4));
    assert_eq!(mat.get("level"), Some(&json!("Meeting Expectation")));

    let eng = subject_mean(&list, "ENG");
    assert_eq!(eng.get("deviation").and_then(|v| v.as_f64()), Some(10.0));

    // No Science marks in the opener: no baseline to compare against.
    let sci = subject_mean(&list, "SCI");
    assert_eq!(sci.get("deviation"), Some(&json!("-")));
    assert!(sci.get("previousMean").expect("previousMean").is_null());

    assert_eq!(list.pointer("/totalMean/mean").and_then(|v| v.as_f64()), Some(102.07));
    assert_eq!(list.pointer("/totalMean/previousMean").and_then(|v| v.as_f64()), Some(90.0));
    assert_eq!(list.pointer("/totalMean/deviation").and_then(|v| v.as_f64()), Some(12.07));

    let s1 = row_for(&list, "s1");
    assert_eq!(s1.get("totalMarks").and_then(|v| v.as_f64()), Some(175.0));
    assert_eq!(s1.get("average").and_then(|v| v.as_f64()), Some(58.33));
    assert_eq!(s1.get("level"), Some(&json!("Meeting Expectation")));
    assert_eq!(s1.get("position").and_then(|v| v.as_i64()), Some(1));

    let order: Vec<&str> = list
        .get("rows")
        .and_then(|v| v.as_array())
        .expect("rows")
        .iter()
        .map(|r| r.get("studentId").and_then(|v| v.as_str()).expect("id"))
        .collect();
    assert_eq!(order, vec!["s1", "s2", "s3"]);
}

#[test]
fn stream_scope_ranks_and_averages_within_the_stream() {
    let workspace = temp_dir("examd-mark-list-stream");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let conn = open_workspace(&mut stdin, &mut reader, workspace.path());
    seed_two_exams(&mut stdin, &mut reader, &conn);

    let list = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "reports.markList",
        json!({ "examId": "e1", "gradeId": "g7", "streamId": "st-a" }),
    );
    assert_eq!(list.pointer("/scope/tutorName"), Some(&json!("Mr. Otieno")));
    assert_eq!(list.pointer("/scope/streamName"), Some(&json!("7 East")));
    let rows = list.get("rows").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(row_for(&list, "s2").get("streamPosition").and_then(|v| v.as_i64()), Some(2));

    let mat = subject_mean(&list, "MAT");
    assert_eq!(mat.get("mean").and_then(|v| v.as_f64()), Some(67.5));
    assert_eq!(mat.get("deviation").and_then(|v| v.as_f64()), Some(7.5));

    let west = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.markList",
        json!({ "examId": "e1", "streamId": "st-b" }),
    );
    assert_eq!(row_for(&west, "s3").get("streamPosition").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(row_for(&west, "s3").get("position").and_then(|v| v.as_i64()), Some(3));
}

#[test]
fn archived_means_win_over_recomputing_the_previous_exam() {
    let workspace = temp_dir("examd-mean-archive");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let conn = open_workspace(&mut stdin, &mut reader, workspace.path());
    seed_two_exams(&mut stdin, &mut reader, &conn);

    let archived = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "means.archive",
        json!({ "examId": "e0", "gradeId": "g7" }),
    );
    assert_eq!(archived.get("scopeKey"), Some(&json!("grade:g7")));
    assert_eq!(archived.get("records").and_then(|v| v.as_i64()), Some(4));

    // A late opener mark would move the live English mean to 80.
    enter_mark(&mut stdin, &mut reader, "s2", "e0", "ENG", 100.0);

    let list = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.markList",
        json!({ "examId": "e1", "gradeId": "g7" }),
    );
    let eng = subject_mean(&list, "ENG");
    assert_eq!(eng.get("previousMean").and_then(|v| v.as_f64()), Some(60.0));
    assert_eq!(eng.get("deviation").and_then(|v| v.as_f64()), Some(10.0));
    assert_eq!(subject_mean(&list, "SCI").get("deviation"), Some(&json!("-")));
}

#[test]
fn result_messages_summarize_each_student() {
    let workspace = temp_dir("examd-result-messages");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let conn = open_workspace(&mut stdin, &mut reader, workspace.path());
    seed_two_exams(&mut stdin, &mut reader, &conn);

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "reports.resultMessages",
        json!({ "examId": "e1", "gradeId": "g7" }),
    );
    let messages = out.get("messages").and_then(|v| v.as_array()).expect("messages");
    assert_eq!(messages.len(), 3);
    let s1 = messages
        .iter()
        .find(|m| m.get("studentId").and_then(|v| v.as_str()) == Some("s1"))
        .and_then(|m| m.get("text").and_then(|v| v.as_str()))
        .expect("s1 message");
    assert!(s1.starts_with("s1, Test (A001)"), "{}", s1);
    assert!(s1.contains("MAT 65.00"), "{}", s1);
    assert!(s1.contains("Total 175.00 (Meeting Expectation)"), "{}", s1);
    assert!(s1.contains("Position 1/3"), "{}", s1);
}
