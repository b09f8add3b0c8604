mod test_support;

use serde_json::json;
use test_support::{
    enter_mark, open_workspace, request_err_code, request_ok, seed_exam, seed_grade,
    seed_student, seed_subjects, spawn_sidecar, temp_dir,
};

fn subject<'a>(report: &'a serde_json::Value, code: &str) -> &'a serde_json::Value {
    report
        .get("subjects")
        .and_then(|v| v.as_array())
        .expect("subjects")
        .iter()
        .find(|s| s.get("code").and_then(|v| v.as_str()) == Some(code))
        .expect("subject")
}

#[test]
fn combined_report_averages_mid_and_end_term_per_subject() {
    let workspace = temp_dir("examd-combined");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let conn = open_workspace(&mut stdin, &mut reader, workspace.path());
    seed_grade(&conn, "g8", "Grade 8", 8);
    seed_subjects(&conn, "g8", &[("MAT", "Mathematics"), ("ENG", "English"), ("SCI", "Science")]);
    seed_student(&conn, "s1", Some("B001"), "g8", None);
    seed_student(&conn, "s2", Some("B002"), "g8", None);
    seed_exam(&conn, "op", "opener", Some("g8"), "2024-01-10T08:00:00+00:00");
    seed_exam(&conn, "mid", "mid_term", Some("g8"), "2024-02-10T08:00:00+00:00");
    seed_exam(&conn, "end", "end_term", Some("g8"), "2024-03-20T08:00:00+00:00");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "b1",
        "boundaries.set",
        json!({ "gradeId": "g8", "boundaries": [
            { "minMarks": 80, "maxMarks": 100, "label": "A" },
            { "minMarks": 60, "maxMarks": 79.99, "label": "B" },
            { "minMarks": 0, "maxMarks": 59.99, "label": "C" }
        ]}),
    );

    enter_mark(&mut stdin, &mut reader, "s1", "mid", "MAT", 60.0);
    enter_mark(&mut stdin, &mut reader, "s1", "mid", "ENG", 50.0);
    enter_mark(&mut stdin, &mut reader, "s1", "end", "MAT", 80.0);
    enter_mark(&mut stdin, &mut reader, "s1", "end", "SCI", 90.0);

    for (id, exam) in [("1", "mid"), ("2", "end")] {
        let report = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "reports.combined",
            json!({ "studentId": "s1", "examId": exam }),
        );
        assert_eq!(report.pointer("/midTerm/exam/id"), Some(&json!("mid")));
        assert_eq!(report.pointer("/endTerm/exam/id"), Some(&json!("end")));

        let mat = subject(&report, "MAT");
        assert_eq!(mat.get("combined").and_then(|v| v.as_f64()), Some(70.0));
        assert_eq!(mat.get("level"), Some(&json!("B")));
        // Only one of the two exams has a mark: that value is used as is.
        let eng = subject(&report, "ENG");
        assert_eq!(eng.get("combined").and_then(|v| v.as_f64()), Some(50.0));
        assert!(eng.get("endTerm").expect("endTerm").is_null());
        assert_eq!(eng.get("level"), Some(&json!("C")));
        let sci = subject(&report, "SCI");
        assert_eq!(sci.get("combined").and_then(|v| v.as_f64()), Some(90.0));
        assert_eq!(sci.get("level"), Some(&json!("A")));

        assert_eq!(report.get("totalMarks").and_then(|v| v.as_f64()), Some(210.0));
        assert_eq!(report.get("average").and_then(|v| v.as_f64()), Some(70.0));
        assert_eq!(report.get("level"), Some(&json!("B")));
        assert_eq!(report.get("term").and_then(|v| v.as_i64()), Some(1));
        assert_eq!(report.get("year").and_then(|v| v.as_i64()), Some(2024));
    }

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "3",
        "reports.combined",
        json!({ "studentId": "s1", "examId": "op" }),
    );
    assert_eq!(code, "bad_params");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "4",
        "reports.combined",
        json!({ "studentId": "s2", "examId": "mid" }),
    );
    assert_eq!(code, "not_found");
}

#[test]
fn mean_standard_score_ranks_grades_by_total_mean() {
    let workspace = temp_dir("examd-mean-standard");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let conn = open_workspace(&mut stdin, &mut reader, workspace.path());
    for (id, name, order) in [("g7", "Grade 7", 7), ("g8", "Grade 8", 8), ("g9", "Grade 9", 9)] {
        seed_grade(&conn, id, name, order);
        seed_subjects(&conn, id, &[("MAT", "Mathematics")]);
    }
    seed_student(&conn, "s1", None, "g7", None);
    seed_student(&conn, "s3", None, "g7", None);
    seed_student(&conn, "s2", None, "g8", None);
    seed_student(&conn, "s4", None, "g9", None);
    seed_exam(&conn, "sw", "end_term", None, "2024-03-20T08:00:00+00:00");

    enter_mark(&mut stdin, &mut reader, "s1", "sw", "MAT", 50.0);
    // A zero total stays out of the total-mean denominator by default.
    enter_mark(&mut stdin, &mut reader, "s3", "sw", "MAT", 0.0);
    enter_mark(&mut stdin, &mut reader, "s2", "sw", "MAT", 80.0);

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "reports.meanStandardScore",
        json!({ "examId": "sw" }),
    );
    let grades: Vec<(String, f64, i64)> = out
        .get("grades")
        .and_then(|v| v.as_array())
        .expect("grades")
        .iter()
        .map(|g| {
            (
                g.get("gradeId").and_then(|v| v.as_str()).expect("gradeId").to_string(),
                g.get("mean").and_then(|v| v.as_f64()).expect("mean"),
                g.get("rank").and_then(|v| v.as_i64()).expect("rank"),
            )
        })
        .collect();
    assert_eq!(
        grades,
        vec![("g8".to_string(), 80.0, 1), ("g7".to_string(), 50.0, 2)]
    );

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "2",
        "reports.meanStandardScore",
        json!({ "examId": "nope" }),
    );
    assert_eq!(code, "not_found");
}
