use crate::ipc::error::{calc_err, ok};
use crate::ipc::helpers::{db_conn, required_scope, required_str};
use crate::ipc::types::{AppState, Request};
use crate::report;
use crate::results;
use serde_json::json;

fn handle_mark_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match required_scope(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match report::build_mark_list(conn, &exam_id, &scope) {
        Ok(list) => ok(&req.id, json!(list)),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_combined(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    match report::build_combined_report(conn, &student_id, &exam_id) {
        Ok(r) => ok(&req.id, json!(r)),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_mean_standard_score(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match report::build_mean_standard_score(conn, &exam_id) {
        Ok(r) => ok(&req.id, json!(r)),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_means_archive(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match required_scope(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match results::archive_means(conn, &exam_id, &scope) {
        Ok(summary) => {
            tracing::info!(
                exam_id = %summary.exam_id,
                scope = %summary.scope_key,
                records = summary.records,
                "archived means"
            );
            ok(&req.id, json!(summary))
        }
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_result_messages(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match required_scope(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match report::build_mark_list(conn, &exam_id, &scope) {
        Ok(list) => ok(
            &req.id,
            json!({
                "examId": list.exam.id,
                "messages": report::result_messages(&list),
            }),
        ),
        Err(e) => calc_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.markList" => Some(handle_mark_list(state, req)),
        "reports.combined" => Some(handle_combined(state, req)),
        "reports.meanStandardScore" => Some(handle_mean_standard_score(state, req)),
        "reports.resultMessages" => Some(handle_result_messages(state, req)),
        "means.archive" => Some(handle_means_archive(state, req)),
        _ => None,
    }
}
