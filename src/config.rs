use crate::calc::{AggregationPolicy, TieBreak};
use crate::db;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Map, Value};

const DEFAULT_KEY: &str = "scoring.default";

/// Per-grade scoring settings. Grade documents only hold the fields they
/// override; everything else comes from the workspace default document and
/// then the compiled-in defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringConfig {
    pub aggregation: AggregationPolicy,
    pub tie_break: TieBreak,
    /// Students with a zero total are left out of the total-mean denominator.
    pub total_mean_excludes_zero: bool,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            aggregation: AggregationPolicy::Sum,
            tie_break: TieBreak::StudentId,
            total_mean_excludes_zero: true,
        }
    }
}

pub fn settings_key(grade_id: Option<&str>) -> String {
    match grade_id {
        Some(g) => format!("scoring.grade.{}", g),
        None => DEFAULT_KEY.to_string(),
    }
}

pub fn merge_patch(config: &mut ScoringConfig, patch: &Map<String, Value>) -> Result<(), String> {
    for (k, v) in patch {
        match k.as_str() {
            "aggregation" => {
                let Some(policy) = v.as_str().and_then(AggregationPolicy::parse) else {
                    return Err("aggregation must be one of: sum, mean".to_string());
                };
                config.aggregation = policy;
            }
            "tieBreak" => {
                let Some(tie) = v.as_str().and_then(TieBreak::parse) else {
                    return Err("tieBreak must be one of: studentId, admissionNo".to_string());
                };
                config.tie_break = tie;
            }
            "totalMeanExcludesZero" => {
                let Some(b) = v.as_bool() else {
                    return Err("totalMeanExcludesZero must be a boolean".to_string());
                };
                config.total_mean_excludes_zero = b;
            }
            _ => return Err(format!("unknown scoring field: {}", k)),
        }
    }
    Ok(())
}

fn apply_saved(conn: &Connection, key: &str, config: &mut ScoringConfig) -> anyhow::Result<()> {
    if let Some(saved) = db::settings_get_json(conn, key)? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: a malformed historical value must not block scoring.
            if let Err(msg) = merge_patch(config, saved_obj) {
                tracing::warn!(key, %msg, "ignoring invalid saved scoring settings");
            }
        }
    }
    Ok(())
}

pub fn load_scoring_config(conn: &Connection, grade_id: Option<&str>) -> anyhow::Result<ScoringConfig> {
    let mut config = ScoringConfig::default();
    apply_saved(conn, DEFAULT_KEY, &mut config)?;
    if grade_id.is_some() {
        apply_saved(conn, &settings_key(grade_id), &mut config)?;
    }
    Ok(config)
}

/// Validates `patch` and folds it into the saved document for the scope.
pub fn update_scoring_config(
    conn: &Connection,
    grade_id: Option<&str>,
    patch: &Map<String, Value>,
) -> anyhow::Result<Result<ScoringConfig, String>> {
    let mut probe = load_scoring_config(conn, grade_id)?;
    if let Err(msg) = merge_patch(&mut probe, patch) {
        return Ok(Err(msg));
    }

    let key = settings_key(grade_id);
    let mut saved = db::settings_get_json(conn, &key)?
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    for (k, v) in patch {
        saved.insert(k.clone(), v.clone());
    }
    db::settings_set_json(conn, &key, &Value::Object(saved))?;
    Ok(Ok(probe))
}
