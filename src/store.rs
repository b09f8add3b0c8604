use crate::calc::{CalcError, PointBoundary, DEFAULT_MARKS_OUT_OF};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamType {
    Weekly,
    Opener,
    MidTerm,
    EndTerm,
}

impl ExamType {
    /// Accepts the spellings the portals use: `mid_term`, `mid-term`, `Mid Term`, `midterm`.
    pub fn parse(s: &str) -> Option<Self> {
        let key: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "weekly" => Some(Self::Weekly),
            "opener" => Some(Self::Opener),
            "midterm" => Some(Self::MidTerm),
            "endterm" => Some(Self::EndTerm),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamRecord {
    pub id: String,
    pub name: String,
    pub exam_type: ExamType,
    pub term: i64,
    pub year: i64,
    pub grade_id: Option<String>,
    pub created_at: String,
    #[serde(skip)]
    pub rowid: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    pub id: String,
    pub name: String,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRecord {
    pub id: String,
    pub grade_id: String,
    pub name: String,
    pub tutor_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRecord {
    pub id: String,
    pub admission_no: Option<String>,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct EnrollmentRecord {
    pub id: String,
    pub grade_id: String,
    pub stream_id: Option<String>,
    pub term: i64,
    pub year: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectDef {
    pub code: String,
    pub name: String,
}

/// A ranking/means scope: a whole grade, or one stream inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Grade { grade_id: String },
    Stream { grade_id: String, stream_id: String },
}

impl Scope {
    pub fn grade_id(&self) -> &str {
        match self {
            Scope::Grade { grade_id } | Scope::Stream { grade_id, .. } => grade_id,
        }
    }

    pub fn stream_id(&self) -> Option<&str> {
        match self {
            Scope::Grade { .. } => None,
            Scope::Stream { stream_id, .. } => Some(stream_id),
        }
    }

    /// Key used for archived mean records.
    pub fn key(&self) -> String {
        match self {
            Scope::Grade { grade_id } => format!("grade:{}", grade_id),
            Scope::Stream { stream_id, .. } => format!("stream:{}", stream_id),
        }
    }

    fn enrollment_filter(&self) -> (&'static str, &str) {
        match self {
            Scope::Grade { grade_id } => ("en.grade_id = ?", grade_id),
            Scope::Stream { stream_id, .. } => ("en.stream_id = ?", stream_id),
        }
    }
}

/// One ExamResult row with its subject scores and the identity fields
/// reports need.
#[derive(Debug, Clone)]
pub struct ResultRow {
    pub result_id: String,
    pub student_id: String,
    pub admission_no: Option<String>,
    pub display_name: String,
    pub stream_id: Option<String>,
    pub total_marks: f64,
    pub position: Option<i64>,
    pub stream_position: Option<i64>,
    pub scores: BTreeMap<String, f64>,
}

impl ResultRow {
    pub fn score(&self, subject_code: &str) -> Option<f64> {
        self.scores.get(subject_code).copied()
    }
}

fn display_name(last: &str, first: &str) -> String {
    format!("{}, {}", last, first)
}

fn exam_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<(ExamRecord, String)> {
    let raw_type: String = r.get(2)?;
    Ok((
        ExamRecord {
            id: r.get(0)?,
            name: r.get(1)?,
            exam_type: ExamType::Weekly,
            term: r.get(3)?,
            year: r.get(4)?,
            grade_id: r.get(5)?,
            created_at: r.get(6)?,
            rowid: r.get(7)?,
        },
        raw_type,
    ))
}

fn resolve_exam_type(pair: (ExamRecord, String)) -> Result<ExamRecord, CalcError> {
    let (mut exam, raw_type) = pair;
    let Some(t) = ExamType::parse(&raw_type) else {
        return Err(CalcError::new("bad_data", "exam has an unknown type")
            .with_details(serde_json::json!({ "examId": exam.id, "examType": raw_type })));
    };
    exam.exam_type = t;
    Ok(exam)
}

const EXAM_COLUMNS: &str = "id, name, exam_type, term, year, grade_id, created_at, rowid";

pub fn load_exam(conn: &Connection, exam_id: &str) -> Result<ExamRecord, CalcError> {
    let sql = format!("SELECT {} FROM exams WHERE id = ?", EXAM_COLUMNS);
    let row = conn.query_row(&sql, [exam_id], exam_from_row).optional()?;
    let Some(pair) = row else {
        return Err(CalcError::not_found("exam not found")
            .with_details(serde_json::json!({ "examId": exam_id })));
    };
    resolve_exam_type(pair)
}

/// Exams sharing a term and year, oldest first.
pub fn load_term_exams(conn: &Connection, term: i64, year: i64) -> Result<Vec<ExamRecord>, CalcError> {
    let sql = format!(
        "SELECT {} FROM exams WHERE term = ? AND year = ? ORDER BY created_at, rowid",
        EXAM_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let pairs = stmt
        .query_map((term, year), exam_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    pairs.into_iter().map(resolve_exam_type).collect()
}

/// Most recent exam created before `exam` that has results or archived means
/// for `scope`.
pub fn find_previous_exam(
    conn: &Connection,
    exam: &ExamRecord,
    scope: &Scope,
) -> Result<Option<ExamRecord>, CalcError> {
    let (filter, filter_value) = scope.enrollment_filter();
    let sql = format!(
        "SELECT {cols} FROM exams e
         WHERE (e.created_at < ?1 OR (e.created_at = ?1 AND e.rowid < ?2))
           AND (
             EXISTS (
               SELECT 1 FROM exam_results r
               JOIN enrollments en ON en.id = r.enrollment_id
               WHERE r.exam_id = e.id AND {filter}
             )
             OR EXISTS (
               SELECT 1 FROM mean_records m
               WHERE m.exam_id = e.id AND m.scope_key = ?4
             )
           )
         ORDER BY e.created_at DESC, e.rowid DESC
         LIMIT 1",
        cols = EXAM_COLUMNS
            .split(", ")
            .map(|c| format!("e.{}", c))
            .collect::<Vec<_>>()
            .join(", "),
        filter = filter.replace('?', "?3"),
    );
    let row = conn
        .query_row(
            &sql,
            (&exam.created_at, exam.rowid, filter_value, scope.key()),
            exam_from_row,
        )
        .optional()?;
    row.map(resolve_exam_type).transpose()
}

pub fn load_grade(conn: &Connection, grade_id: &str) -> Result<GradeRecord, CalcError> {
    conn.query_row(
        "SELECT id, name, sort_order FROM grades WHERE id = ?",
        [grade_id],
        |r| {
            Ok(GradeRecord {
                id: r.get(0)?,
                name: r.get(1)?,
                sort_order: r.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| {
        CalcError::not_found("grade not found").with_details(serde_json::json!({ "gradeId": grade_id }))
    })
}

pub fn load_stream(conn: &Connection, stream_id: &str) -> Result<StreamRecord, CalcError> {
    conn.query_row(
        "SELECT id, grade_id, name, tutor_name FROM streams WHERE id = ?",
        [stream_id],
        |r| {
            Ok(StreamRecord {
                id: r.get(0)?,
                grade_id: r.get(1)?,
                name: r.get(2)?,
                tutor_name: r.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| {
        CalcError::not_found("stream not found")
            .with_details(serde_json::json!({ "streamId": stream_id }))
    })
}

/// Checks the ids exist and agree with each other.
pub fn resolve_scope(
    conn: &Connection,
    grade_id: Option<&str>,
    stream_id: Option<&str>,
) -> Result<Option<Scope>, CalcError> {
    match (grade_id, stream_id) {
        (None, None) => Ok(None),
        (grade_id, Some(stream_id)) => {
            let stream = load_stream(conn, stream_id)?;
            if let Some(g) = grade_id {
                if g != stream.grade_id {
                    return Err(CalcError::validation("stream does not belong to grade")
                        .with_details(serde_json::json!({ "gradeId": g, "streamId": stream_id })));
                }
            }
            Ok(Some(Scope::Stream {
                grade_id: stream.grade_id,
                stream_id: stream.id,
            }))
        }
        (Some(grade_id), None) => {
            let grade = load_grade(conn, grade_id)?;
            Ok(Some(Scope::Grade { grade_id: grade.id }))
        }
    }
}

pub fn load_student(conn: &Connection, student_id: &str) -> Result<StudentRecord, CalcError> {
    conn.query_row(
        "SELECT id, admission_no, last_name, first_name FROM students WHERE id = ?",
        [student_id],
        |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok(StudentRecord {
                id: r.get(0)?,
                admission_no: r.get(1)?,
                display_name: display_name(&last, &first),
            })
        },
    )
    .optional()?
    .ok_or_else(|| {
        CalcError::not_found("student not found")
            .with_details(serde_json::json!({ "studentId": student_id }))
    })
}

pub fn find_enrollment(
    conn: &Connection,
    student_id: &str,
    term: i64,
    year: i64,
) -> Result<EnrollmentRecord, CalcError> {
    conn.query_row(
        "SELECT id, grade_id, stream_id, term, year
         FROM enrollments
         WHERE student_id = ? AND term = ? AND year = ?",
        (student_id, term, year),
        |r| {
            Ok(EnrollmentRecord {
                id: r.get(0)?,
                grade_id: r.get(1)?,
                stream_id: r.get(2)?,
                term: r.get(3)?,
                year: r.get(4)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| {
        CalcError::not_found("student is not enrolled for the exam term")
            .with_details(serde_json::json!({ "studentId": student_id, "term": term, "year": year }))
    })
}

pub fn load_subjects(conn: &Connection, grade_id: &str) -> Result<Vec<SubjectDef>, CalcError> {
    let mut stmt = conn.prepare(
        "SELECT code, name FROM grade_subjects WHERE grade_id = ? ORDER BY sort_order, code",
    )?;
    let subjects = stmt
        .query_map([grade_id], |r| {
            Ok(SubjectDef {
                code: r.get(0)?,
                name: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(subjects)
}

pub fn marks_out_of(conn: &Connection, exam_id: &str, subject_code: &str) -> Result<f64, CalcError> {
    let v: Option<f64> = conn
        .query_row(
            "SELECT out_of FROM marks_out_of WHERE exam_id = ? AND subject_code = ?",
            (exam_id, subject_code),
            |r| r.get(0),
        )
        .optional()?;
    Ok(v.unwrap_or(DEFAULT_MARKS_OUT_OF))
}

pub fn load_marks_out_of(conn: &Connection, exam_id: &str) -> Result<HashMap<String, f64>, CalcError> {
    let mut stmt = conn.prepare("SELECT subject_code, out_of FROM marks_out_of WHERE exam_id = ?")?;
    let pairs = stmt
        .query_map([exam_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(pairs)
}

fn query_boundaries(conn: &Connection, grade_id: Option<&str>) -> Result<Vec<PointBoundary>, CalcError> {
    let (sql, bind): (&str, Vec<Value>) = match grade_id {
        Some(g) => (
            "SELECT min_marks, max_marks, label FROM point_boundaries
             WHERE grade_id = ? ORDER BY sort_order",
            vec![Value::Text(g.to_string())],
        ),
        None => (
            "SELECT min_marks, max_marks, label FROM point_boundaries
             WHERE grade_id IS NULL ORDER BY sort_order",
            Vec::new(),
        ),
    };
    let mut stmt = conn.prepare(sql)?;
    let boundaries = stmt
        .query_map(params_from_iter(bind), |r| {
            Ok(PointBoundary {
                min_marks: r.get(0)?,
                max_marks: r.get(1)?,
                label: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(boundaries)
}

/// Boundary table in effect for a grade: its own table when it has one, the
/// workspace default table otherwise. Never cached across calls.
pub fn load_boundaries(conn: &Connection, grade_id: Option<&str>) -> Result<Vec<PointBoundary>, CalcError> {
    if let Some(g) = grade_id {
        let own = query_boundaries(conn, Some(g))?;
        if !own.is_empty() {
            return Ok(own);
        }
    }
    query_boundaries(conn, None)
}

/// Boundaries stored for exactly this scope, without fallback.
pub fn load_own_boundaries(
    conn: &Connection,
    grade_id: Option<&str>,
) -> Result<Vec<PointBoundary>, CalcError> {
    query_boundaries(conn, grade_id)
}

const RESULT_COLUMNS: &str = "r.id, s.id, s.admission_no, s.last_name, s.first_name,
       en.stream_id, r.total_marks, r.position, r.stream_position";

fn result_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ResultRow> {
    let last: String = r.get(3)?;
    let first: String = r.get(4)?;
    Ok(ResultRow {
        result_id: r.get(0)?,
        student_id: r.get(1)?,
        admission_no: r.get(2)?,
        display_name: display_name(&last, &first),
        stream_id: r.get(5)?,
        total_marks: r.get(6)?,
        position: r.get(7)?,
        stream_position: r.get(8)?,
        scores: BTreeMap::new(),
    })
}

fn attach_scores(conn: &Connection, rows: &mut [ResultRow]) -> Result<(), CalcError> {
    if rows.is_empty() {
        return Ok(());
    }
    let placeholders = std::iter::repeat("?")
        .take(rows.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT result_id, subject_code, score FROM exam_result_scores WHERE result_id IN ({})",
        placeholders
    );
    let bind_values: Vec<Value> = rows
        .iter()
        .map(|r| Value::Text(r.result_id.clone()))
        .collect();
    let index: HashMap<String, usize> = rows
        .iter()
        .enumerate()
        .map(|(i, r)| (r.result_id.clone(), i))
        .collect();

    let mut stmt = conn.prepare(&sql)?;
    let scores = stmt.query_map(params_from_iter(bind_values), |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, f64>(2)?,
        ))
    })?;
    for score in scores {
        let (result_id, subject_code, value) = score?;
        if let Some(&i) = index.get(&result_id) {
            rows[i].scores.insert(subject_code, value);
        }
    }
    Ok(())
}

/// Every ExamResult row of `exam_id` whose enrollment falls inside `scope`,
/// ordered by student id.
pub fn load_result_rows(conn: &Connection, exam_id: &str, scope: &Scope) -> Result<Vec<ResultRow>, CalcError> {
    let (filter, filter_value) = scope.enrollment_filter();
    let sql = format!(
        "SELECT {}
         FROM exam_results r
         JOIN enrollments en ON en.id = r.enrollment_id
         JOIN students s ON s.id = en.student_id
         WHERE r.exam_id = ? AND {}
         ORDER BY s.id",
        RESULT_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map((exam_id, filter_value), result_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    attach_scores(conn, &mut rows)?;
    Ok(rows)
}

pub fn load_result_for_enrollment(
    conn: &Connection,
    exam_id: &str,
    enrollment_id: &str,
) -> Result<Option<ResultRow>, CalcError> {
    let sql = format!(
        "SELECT {}
         FROM exam_results r
         JOIN enrollments en ON en.id = r.enrollment_id
         JOIN students s ON s.id = en.student_id
         WHERE r.exam_id = ? AND r.enrollment_id = ?",
        RESULT_COLUMNS
    );
    let row = conn
        .query_row(&sql, (exam_id, enrollment_id), result_from_row)
        .optional()?;
    let Some(row) = row else {
        return Ok(None);
    };
    let mut rows = vec![row];
    attach_scores(conn, &mut rows)?;
    Ok(rows.pop())
}

/// Grades with at least one result row for the exam, in grade order.
pub fn grades_with_results(conn: &Connection, exam_id: &str) -> Result<Vec<GradeRecord>, CalcError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT g.id, g.name, g.sort_order
         FROM exam_results r
         JOIN enrollments en ON en.id = r.enrollment_id
         JOIN grades g ON g.id = en.grade_id
         WHERE r.exam_id = ?
         ORDER BY g.sort_order, g.name",
    )?;
    let grades = stmt
        .query_map([exam_id], |r| {
            Ok(GradeRecord {
                id: r.get(0)?,
                name: r.get(1)?,
                sort_order: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(grades)
}

#[derive(Debug, Clone)]
pub struct ArchivedMeans {
    pub total: Option<f64>,
    pub subjects: HashMap<String, f64>,
}

pub const TOTAL_MEAN_CODE: &str = "__total__";

/// Archived means of `exam_id` for `scope`; entries recorded with no data are
/// left out.
pub fn load_archived_means(
    conn: &Connection,
    exam_id: &str,
    scope: &Scope,
) -> Result<Option<ArchivedMeans>, CalcError> {
    let mut stmt = conn.prepare(
        "SELECT subject_code, mean, entries FROM mean_records WHERE scope_key = ? AND exam_id = ?",
    )?;
    let records = stmt
        .query_map((scope.key(), exam_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, f64>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    if records.is_empty() {
        return Ok(None);
    }

    let mut archived = ArchivedMeans {
        total: None,
        subjects: HashMap::new(),
    };
    for (code, mean, entries) in records {
        if entries <= 0 {
            continue;
        }
        if code == TOTAL_MEAN_CODE {
            archived.total = Some(mean);
        } else {
            archived.subjects.insert(code, mean);
        }
    }
    Ok(Some(archived))
}
