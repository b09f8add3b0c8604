use crate::calc::CalcError;
use crate::ipc::error::{calc_err, err};
use crate::ipc::types::{AppState, Request};
use crate::store::{self, Scope};
use rusqlite::Connection;

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Result<Option<String>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => match v.as_str().map(str::trim) {
            Some(s) if !s.is_empty() => Ok(Some(s.to_string())),
            _ => Err(err(
                &req.id,
                "bad_params",
                format!("{} must be a non-empty string", key),
                None,
            )),
        },
    }
}

/// Reads `gradeId` / `streamId` and checks they exist.
pub fn optional_scope(conn: &Connection, req: &Request) -> Result<Option<Scope>, serde_json::Value> {
    let grade_id = optional_str(req, "gradeId")?;
    let stream_id = optional_str(req, "streamId")?;
    store::resolve_scope(conn, grade_id.as_deref(), stream_id.as_deref())
        .map_err(|e| calc_err(&req.id, e))
}

pub fn required_scope(conn: &Connection, req: &Request) -> Result<Scope, serde_json::Value> {
    optional_scope(conn, req)?.ok_or_else(|| {
        calc_err(
            &req.id,
            CalcError::validation("missing gradeId or streamId"),
        )
    })
}
