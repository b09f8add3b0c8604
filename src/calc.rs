use serde::{Deserialize, Serialize, Serializer};
use std::cmp::Ordering;

pub const DEFAULT_MARKS_OUT_OF: f64 = 100.0;

/// Half-up rounding to 2 decimals used for every stored or reported score:
/// `Int(100*x + 0.5) / 100`
pub fn round_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn write(e: rusqlite::Error) -> Self {
        Self::new("db_update_failed", e.to_string())
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_rejection(&self) -> bool {
        self.code == "bad_params" || self.code == "not_found"
    }
}

impl From<rusqlite::Error> for CalcError {
    fn from(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

impl std::fmt::Display for CalcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Reads a raw mark from a request payload. Numbers and numeric strings are
/// accepted; anything else is a validation failure.
pub fn parse_raw_mark(raw: &serde_json::Value) -> Result<f64, CalcError> {
    let parsed = match raw {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(CalcError::validation("raw mark must be numeric")
            .with_details(serde_json::json!({ "rawMark": raw }))),
    }
}

/// Converts a raw mark entered out of `out_of` into a 0-100 percentage.
pub fn normalize_mark(raw: f64, out_of: f64) -> Result<f64, CalcError> {
    if !out_of.is_finite() || out_of <= 0.0 {
        return Err(CalcError::validation("marks out of must be > 0")
            .with_details(serde_json::json!({ "outOf": out_of })));
    }
    if !raw.is_finite() {
        return Err(CalcError::validation("raw mark must be numeric"));
    }
    if raw < 0.0 {
        return Err(CalcError::validation("negative marks are not allowed")
            .with_details(serde_json::json!({ "rawMark": raw })));
    }
    if raw > out_of {
        return Err(CalcError::validation("raw mark exceeds marks out of")
            .with_details(serde_json::json!({ "rawMark": raw, "outOf": out_of })));
    }
    Ok(round_2_decimals((raw / out_of) * 100.0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AggregationPolicy {
    #[default]
    Sum,
    Mean,
}

impl AggregationPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sum" => Some(Self::Sum),
            "mean" | "average" => Some(Self::Mean),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Mean => "mean",
        }
    }
}

/// Combines one student's subject scores for an exam. `None` entries are
/// subjects not yet entered and never count as zero.
pub fn aggregate_scores<I>(scores: I, policy: AggregationPolicy) -> f64
where
    I: IntoIterator<Item = Option<f64>>,
{
    let mut sum = 0.0_f64;
    let mut count: usize = 0;
    for s in scores.into_iter().flatten() {
        sum += s;
        count += 1;
    }
    match policy {
        AggregationPolicy::Sum => round_2_decimals(sum),
        AggregationPolicy::Mean => {
            if count > 0 {
                round_2_decimals(sum / (count as f64))
            } else {
                0.0
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TieBreak {
    #[default]
    StudentId,
    AdmissionNo,
}

impl TieBreak {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "studentId" => Some(Self::StudentId),
            "admissionNo" => Some(Self::AdmissionNo),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StudentId => "studentId",
            Self::AdmissionNo => "admissionNo",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankCandidate {
    pub student_id: String,
    pub admission_no: Option<String>,
    pub total: f64,
}

fn tie_order(a: &RankCandidate, b: &RankCandidate, tie_break: TieBreak) -> Ordering {
    match tie_break {
        TieBreak::StudentId => a.student_id.cmp(&b.student_id),
        TieBreak::AdmissionNo => {
            // Missing admission numbers sort after present ones.
            let ka = (a.admission_no.is_none(), a.admission_no.as_deref());
            let kb = (b.admission_no.is_none(), b.admission_no.as_deref());
            ka.cmp(&kb).then_with(|| a.student_id.cmp(&b.student_id))
        }
    }
}

/// Positions `1..=N` aligned with `candidates`: descending total, ties broken
/// by `tie_break`, then input order.
pub fn rank_positions(candidates: &[RankCandidate], tie_break: TieBreak) -> Vec<i64> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&ia, &ib| {
        let a = &candidates[ia];
        let b = &candidates[ib];
        b.total
            .total_cmp(&a.total)
            .then_with(|| tie_order(a, b, tie_break))
            .then_with(|| ia.cmp(&ib))
    });

    let mut positions = vec![0_i64; candidates.len()];
    for (rank, idx) in order.into_iter().enumerate() {
        positions[idx] = (rank as i64) + 1;
    }
    positions
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointBoundary {
    pub min_marks: f64,
    pub max_marks: f64,
    pub label: String,
}

/// First boundary in table order with `min <= score <= max`.
pub fn resolve_performance_level(score: Option<f64>, boundaries: &[PointBoundary]) -> Option<&str> {
    let score = score?;
    boundaries
        .iter()
        .find(|b| b.min_marks <= score && score <= b.max_marks)
        .map(|b| b.label.as_str())
}

pub fn validate_boundaries(boundaries: &[PointBoundary]) -> Result<(), CalcError> {
    for (i, b) in boundaries.iter().enumerate() {
        if b.label.trim().is_empty() {
            return Err(CalcError::validation(format!("boundary {} has an empty label", i)));
        }
        let in_range = |v: f64| v.is_finite() && (0.0..=100.0).contains(&v);
        if !in_range(b.min_marks) || !in_range(b.max_marks) {
            return Err(CalcError::validation(format!(
                "boundary {} must lie within 0..100",
                i
            ))
            .with_details(serde_json::json!({ "minMarks": b.min_marks, "maxMarks": b.max_marks })));
        }
        if b.min_marks > b.max_marks {
            return Err(CalcError::validation(format!(
                "boundary {} has minMarks > maxMarks",
                i
            ))
            .with_details(serde_json::json!({ "minMarks": b.min_marks, "maxMarks": b.max_marks })));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BoundaryIssue {
    Overlap { first: String, second: String },
    /// Scores strictly between `from` and `to` resolve to no level.
    Gap { from: f64, to: f64 },
}

pub fn boundary_issues(boundaries: &[PointBoundary]) -> Vec<BoundaryIssue> {
    let mut issues = Vec::new();
    for (i, a) in boundaries.iter().enumerate() {
        for b in boundaries.iter().skip(i + 1) {
            if a.min_marks <= b.max_marks && b.min_marks <= a.max_marks {
                issues.push(BoundaryIssue::Overlap {
                    first: a.label.clone(),
                    second: b.label.clone(),
                });
            }
        }
    }

    let mut sorted: Vec<&PointBoundary> = boundaries.iter().collect();
    sorted.sort_by(|a, b| a.min_marks.total_cmp(&b.min_marks));
    let mut covered_to: Option<f64> = None;
    for b in sorted {
        match covered_to {
            None if b.min_marks > 0.0 => issues.push(BoundaryIssue::Gap {
                from: 0.0,
                to: b.min_marks,
            }),
            Some(c) if b.min_marks > c => issues.push(BoundaryIssue::Gap {
                from: c,
                to: b.min_marks,
            }),
            _ => {}
        }
        covered_to = Some(covered_to.map_or(b.max_marks, |c| c.max(b.max_marks)));
    }
    match covered_to {
        None => issues.push(BoundaryIssue::Gap { from: 0.0, to: 100.0 }),
        Some(c) if c < 100.0 => issues.push(BoundaryIssue::Gap { from: c, to: 100.0 }),
        _ => {}
    }
    issues
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeanSummary {
    pub mean: f64,
    pub entries: usize,
}

impl MeanSummary {
    pub fn has_data(&self) -> bool {
        self.entries > 0
    }
}

pub fn summarize_mean<I>(values: I) -> MeanSummary
where
    I: IntoIterator<Item = Option<f64>>,
{
    let mut sum = 0.0_f64;
    let mut entries: usize = 0;
    for v in values.into_iter().flatten() {
        sum += v;
        entries += 1;
    }
    let mean = if entries > 0 {
        round_2_decimals(sum / (entries as f64))
    } else {
        0.0
    };
    MeanSummary { mean, entries }
}

/// `meanOf`: mean of the present values, 0 when nothing is present.
pub fn mean_of<I>(values: I) -> f64
where
    I: IntoIterator<Item = Option<f64>>,
{
    summarize_mean(values).mean
}

/// Mean of per-student totals. With `exclude_zero` set, students whose total is
/// zero drop out of the denominator (subject means never do this).
pub fn total_mean(totals: &[f64], exclude_zero: bool) -> MeanSummary {
    summarize_mean(
        totals
            .iter()
            .map(|&t| if exclude_zero && t <= 0.0 { None } else { Some(t) }),
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Deviation {
    NoPrior,
    Change(f64),
}

impl Serialize for Deviation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Deviation::NoPrior => serializer.serialize_str("-"),
            Deviation::Change(v) => serializer.serialize_f64(*v),
        }
    }
}

pub fn deviation(current: f64, previous: Option<f64>) -> Deviation {
    match previous {
        Some(p) => Deviation::Change(round_2_decimals(current - p)),
        None => Deviation::NoPrior,
    }
}

/// Mid-term and end-term score for one subject merged into a single value.
pub fn combine_mid_end(mid: Option<f64>, end: Option<f64>) -> Option<f64> {
    match (mid, end) {
        (Some(m), Some(e)) => Some(round_2_decimals((m + e) / 2.0)),
        (Some(v), None) | (None, Some(v)) => Some(v),
        (None, None) => None,
    }
}
