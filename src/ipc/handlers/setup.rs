use crate::calc::{self, CalcError, PointBoundary};
use crate::config;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::results;
use crate::store::{self, SubjectDef, TOTAL_MEAN_CODE};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

fn parse_subjects(req: &Request) -> Result<Vec<SubjectDef>, serde_json::Value> {
    let Some(items) = req.params.get("subjects").and_then(|v| v.as_array()) else {
        return Err(err(&req.id, "bad_params", "subjects must be an array", None));
    };
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let code = item
            .get("code")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or("");
        if code.is_empty() {
            return Err(err(
                &req.id,
                "bad_params",
                format!("subjects[{}].code must be a non-empty string", i),
                None,
            ));
        }
        if code == TOTAL_MEAN_CODE {
            return Err(err(
                &req.id,
                "bad_params",
                format!("subject code {} is reserved", TOTAL_MEAN_CODE),
                None,
            ));
        }
        if !seen.insert(code.to_string()) {
            return Err(err(
                &req.id,
                "bad_params",
                "duplicate subject code",
                Some(json!({ "code": code })),
            ));
        }
        let name = item
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(code);
        out.push(SubjectDef {
            code: code.to_string(),
            name: name.to_string(),
        });
    }
    Ok(out)
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = store::load_grade(conn, &grade_id) {
        return calc_err(&req.id, e);
    }
    match store::load_subjects(conn, &grade_id) {
        Ok(subjects) => ok(&req.id, json!({ "gradeId": grade_id, "subjects": subjects })),
        Err(e) => calc_err(&req.id, e),
    }
}

fn replace_subjects(conn: &Connection, grade_id: &str, subjects: &[SubjectDef]) -> Result<(), CalcError> {
    conn.execute("DELETE FROM grade_subjects WHERE grade_id = ?", [grade_id])
        .map_err(CalcError::write)?;
    let mut stmt = conn.prepare(
        "INSERT INTO grade_subjects(grade_id, code, name, sort_order) VALUES(?, ?, ?, ?)",
    )?;
    for (i, s) in subjects.iter().enumerate() {
        stmt.execute((grade_id, &s.code, &s.name, i as i64))
            .map_err(CalcError::write)?;
    }
    Ok(())
}

/// Replaces the subject registry of a grade. Totals only count registered
/// subjects, so every exam of the grade is recomputed in the same transaction.
fn handle_subjects_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subjects = match parse_subjects(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let outcome = results::with_write_tx(conn, |tx| {
        store::load_grade(tx, &grade_id)?;
        replace_subjects(tx, &grade_id, &subjects)?;
        results::recompute_all(tx, Some(grade_id.as_str()))
    });
    match outcome {
        Ok(recomputed) => {
            tracing::info!(grade_id = %grade_id, subjects = subjects.len(), "subject registry replaced");
            ok(
                &req.id,
                json!({ "gradeId": grade_id, "subjects": subjects, "recomputed": recomputed }),
            )
        }
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_boundaries_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let grade_id = match optional_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(g) = grade_id.as_deref() {
        if let Err(e) = store::load_grade(conn, g) {
            return calc_err(&req.id, e);
        }
    }

    let own = match store::load_own_boundaries(conn, grade_id.as_deref()) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let effective = match store::load_boundaries(conn, grade_id.as_deref()) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let inherited = grade_id.is_some() && own.is_empty();
    ok(
        &req.id,
        json!({
            "gradeId": grade_id,
            "boundaries": own,
            "effective": effective,
            "inheritsDefault": inherited,
            "issues": calc::boundary_issues(&effective),
        }),
    )
}

fn replace_boundaries(
    conn: &Connection,
    grade_id: Option<&str>,
    boundaries: &[PointBoundary],
) -> Result<(), CalcError> {
    match grade_id {
        Some(g) => conn.execute("DELETE FROM point_boundaries WHERE grade_id = ?", [g]),
        None => conn.execute("DELETE FROM point_boundaries WHERE grade_id IS NULL", []),
    }
    .map_err(CalcError::write)?;

    let mut stmt = conn.prepare(
        "INSERT INTO point_boundaries(id, grade_id, sort_order, min_marks, max_marks, label)
         VALUES(?, ?, ?, ?, ?, ?)",
    )?;
    for (i, b) in boundaries.iter().enumerate() {
        stmt.execute((
            Uuid::new_v4().to_string(),
            grade_id,
            i as i64,
            b.min_marks,
            b.max_marks,
            b.label.trim(),
        ))
        .map_err(CalcError::write)?;
    }
    Ok(())
}

/// Saves a boundary table. An empty table for a grade drops its override so
/// the default table applies again. Overlaps and gaps are saved but reported.
fn handle_boundaries_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let grade_id = match optional_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(raw) = req.params.get("boundaries").filter(|v| v.is_array()) else {
        return err(&req.id, "bad_params", "boundaries must be an array", None);
    };
    let boundaries: Vec<PointBoundary> = match serde_json::from_value(raw.clone()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", format!("invalid boundaries: {}", e), None),
    };
    if let Err(e) = calc::validate_boundaries(&boundaries) {
        return calc_err(&req.id, e);
    }

    let outcome = results::with_write_tx(conn, |tx| {
        if let Some(g) = grade_id.as_deref() {
            store::load_grade(tx, g)?;
        }
        replace_boundaries(tx, grade_id.as_deref(), &boundaries)
    });
    if let Err(e) = outcome {
        return calc_err(&req.id, e);
    }

    let effective = match store::load_boundaries(conn, grade_id.as_deref()) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let issues = calc::boundary_issues(&effective);
    if !issues.is_empty() {
        tracing::warn!(
            grade_id = grade_id.as_deref().unwrap_or("default"),
            issues = issues.len(),
            "boundary table has overlaps or gaps"
        );
    }
    ok(
        &req.id,
        json!({
            "gradeId": grade_id,
            "saved": boundaries.len(),
            "issues": issues,
        }),
    )
}

fn handle_marks_out_of_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam = match store::load_exam(conn, &exam_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let map = match store::load_marks_out_of(conn, &exam.id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let mut entries: Vec<(String, f64)> = map.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let entries: Vec<serde_json::Value> = entries
        .into_iter()
        .map(|(code, out_of)| json!({ "subjectCode": code, "outOf": out_of }))
        .collect();
    ok(
        &req.id,
        json!({
            "examId": exam.id,
            "defaultOutOf": calc::DEFAULT_MARKS_OUT_OF,
            "entries": entries,
        }),
    )
}

fn handle_marks_out_of_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
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
    let Some(out_of) = req.params.get("outOf").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "outOf must be a number", None);
    };

    match results::set_marks_out_of(conn, &exam_id, &subject_code, out_of) {
        Ok(update) => ok(&req.id, json!(update)),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_scoring_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let grade_id = match optional_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(g) = grade_id.as_deref() {
        if let Err(e) = store::load_grade(conn, g) {
            return calc_err(&req.id, e);
        }
    }
    match config::load_scoring_config(conn, grade_id.as_deref()) {
        Ok(cfg) => ok(&req.id, json!({ "gradeId": grade_id, "config": cfg })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Saves a scoring patch and recomputes every exam the change can affect.
fn handle_scoring_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let grade_id = match optional_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let outcome = results::with_write_tx(conn, |tx| {
        if let Some(g) = grade_id.as_deref() {
            store::load_grade(tx, g)?;
        }
        let cfg = config::update_scoring_config(tx, grade_id.as_deref(), patch)
            .map_err(|e| CalcError::new("db_update_failed", e.to_string()))?
            .map_err(CalcError::validation)?;
        let recomputed = results::recompute_all(tx, grade_id.as_deref())?;
        Ok((cfg, recomputed))
    });
    match outcome {
        Ok((cfg, recomputed)) => {
            tracing::info!(
                grade_id = grade_id.as_deref().unwrap_or("default"),
                aggregation = cfg.aggregation.as_str(),
                tie_break = cfg.tie_break.as_str(),
                "scoring settings updated"
            );
            ok(
                &req.id,
                json!({ "gradeId": grade_id, "config": cfg, "recomputed": recomputed }),
            )
        }
        Err(e) => calc_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.set" => Some(handle_subjects_set(state, req)),
        "boundaries.list" => Some(handle_boundaries_list(state, req)),
        "boundaries.set" => Some(handle_boundaries_set(state, req)),
        "marksOutOf.list" => Some(handle_marks_out_of_list(state, req)),
        "marksOutOf.set" => Some(handle_marks_out_of_set(state, req)),
        "scoring.get" => Some(handle_scoring_get(state, req)),
        "scoring.update" => Some(handle_scoring_update(state, req)),
        _ => None,
    }
}
