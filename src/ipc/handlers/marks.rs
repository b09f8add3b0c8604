use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, optional_scope, required_str};
use crate::ipc::types::{AppState, Request};
use crate::results::{self, MarkEntry};
use serde_json::json;

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or("")
        .to_string()
}

fn raw_mark_param(v: &serde_json::Value) -> serde_json::Value {
    v.get("rawMark").cloned().unwrap_or(serde_json::Value::Null)
}

fn handle_marks_enter(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_code = match required_str(req, "subjectCode") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let entry = MarkEntry {
        student_id,
        exam_id,
        subject_code,
        raw_mark: raw_mark_param(&req.params),
    };

    match results::enter_mark(conn, &entry) {
        Ok((mark, recompute)) => ok(&req.id, json!({ "mark": mark, "recompute": recompute })),
        Err(e) => {
            if e.is_rejection() {
                tracing::warn!(
                    student_id = %entry.student_id,
                    subject_code = %entry.subject_code,
                    code = %e.code,
                    message = %e.message,
                    "rejected mark entry"
                );
            }
            calc_err(&req.id, e)
        }
    }
}

/// Valid entries are stored and invalid ones are listed; only a storage
/// failure fails the whole call.
fn handle_marks_bulk_enter(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(items) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "entries must be an array", None);
    };
    let entries: Vec<MarkEntry> = items
        .iter()
        .map(|item| MarkEntry {
            student_id: str_field(item, "studentId"),
            exam_id: exam_id.clone(),
            subject_code: str_field(item, "subjectCode"),
            raw_mark: raw_mark_param(item),
        })
        .collect();

    match results::enter_marks(conn, &exam_id, &entries) {
        Ok(outcome) => {
            tracing::info!(
                exam_id = %exam_id,
                stored = outcome.stored.len(),
                rejected = outcome.rejected.len(),
                "bulk mark entry"
            );
            ok(&req.id, json!(outcome))
        }
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_marks_clear(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_code = match required_str(req, "subjectCode") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match results::clear_mark(conn, &student_id, &exam_id, &subject_code) {
        Ok(recompute) => ok(&req.id, json!({ "cleared": true, "recompute": recompute })),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_exams_recompute(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match optional_scope(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match results::with_write_tx(conn, |tx| results::recompute_exam(tx, &exam_id, scope.as_ref())) {
        Ok(summary) => ok(&req.id, json!(summary)),
        Err(e) => calc_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.enter" => Some(handle_marks_enter(state, req)),
        "marks.bulkEnter" => Some(handle_marks_bulk_enter(state, req)),
        "marks.clear" => Some(handle_marks_clear(state, req)),
        "exams.recompute" => Some(handle_exams_recompute(state, req)),
        _ => None,
    }
}
