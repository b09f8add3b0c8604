use crate::calc::{self, CalcError, Deviation, MeanSummary, RankCandidate};
use crate::config::{self, ScoringConfig};
use crate::db;
use crate::store::{self, ExamRecord, ResultRow, Scope, SubjectDef, TOTAL_MEAN_CODE};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Runs `f` inside an IMMEDIATE transaction so concurrent writers on the same
/// workspace serialize on the database write lock. Any error rolls back.
pub fn with_write_tx<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T, CalcError>,
) -> Result<T, CalcError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;
    let out = f(&tx)?;
    tx.commit()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;
    Ok(out)
}

pub fn scoring_config(conn: &Connection, grade_id: &str) -> Result<ScoringConfig, CalcError> {
    config::load_scoring_config(conn, Some(grade_id))
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeSummary {
    pub exam_id: String,
    pub grades: Vec<String>,
    pub totals_updated: usize,
    pub ranked: usize,
    pub streams_ranked: usize,
}

fn candidates(rows: &[&ResultRow]) -> Vec<RankCandidate> {
    rows.iter()
        .map(|r| RankCandidate {
            student_id: r.student_id.clone(),
            admission_no: r.admission_no.clone(),
            total: r.total_marks,
        })
        .collect()
}

fn write_positions(
    conn: &Connection,
    rows: &[&ResultRow],
    positions: &[i64],
    column: &str,
) -> Result<(), CalcError> {
    let sql = format!("UPDATE exam_results SET {} = ? WHERE id = ?", column);
    let mut stmt = conn.prepare(&sql)?;
    for (row, pos) in rows.iter().zip(positions) {
        stmt.execute((pos, &row.result_id)).map_err(CalcError::write)?;
    }
    Ok(())
}

/// Re-derives totals and ranks for one grade of an exam. With a stream scope
/// only that stream's totals and stream positions are refreshed; grade-wide
/// positions are always re-ranked because any total change can move them.
fn recompute_grade(
    conn: &Connection,
    exam_id: &str,
    scope: &Scope,
    summary: &mut RecomputeSummary,
) -> Result<(), CalcError> {
    let grade_id = scope.grade_id();
    let cfg = scoring_config(conn, grade_id)?;
    let now = db::now_timestamp();

    let subjects = store::load_subjects(conn, grade_id)?;
    let grade_scope = Scope::Grade {
        grade_id: grade_id.to_string(),
    };
    let mut rows = store::load_result_rows(conn, exam_id, &grade_scope)?;

    {
        let mut stmt =
            conn.prepare("UPDATE exam_results SET total_marks = ?, updated_at = ? WHERE id = ?")?;
        for row in rows.iter_mut() {
            if let Some(stream_id) = scope.stream_id() {
                if row.stream_id.as_deref() != Some(stream_id) {
                    continue;
                }
            }
            // Only registered subjects count towards the total.
            row.total_marks = calc::aggregate_scores(
                subjects.iter().map(|s| row.score(&s.code)),
                cfg.aggregation,
            );
            stmt.execute((row.total_marks, &now, &row.result_id))
                .map_err(CalcError::write)?;
            summary.totals_updated += 1;
        }
    }

    let all: Vec<&ResultRow> = rows.iter().collect();
    let positions = calc::rank_positions(&candidates(&all), cfg.tie_break);
    write_positions(conn, &all, &positions, "position")?;
    summary.ranked += all.len();

    let mut by_stream: HashMap<Option<&str>, Vec<&ResultRow>> = HashMap::new();
    for row in &rows {
        by_stream.entry(row.stream_id.as_deref()).or_default().push(row);
    }
    for (stream_id, members) in by_stream {
        if let Some(only) = scope.stream_id() {
            if stream_id != Some(only) {
                continue;
            }
        }
        if stream_id.is_none() {
            // Rows without a stream have no stream ranking.
            let mut stmt =
                conn.prepare("UPDATE exam_results SET stream_position = NULL WHERE id = ?")?;
            for row in &members {
                stmt.execute([&row.result_id]).map_err(CalcError::write)?;
            }
            continue;
        }
        let positions = calc::rank_positions(&candidates(&members), cfg.tie_break);
        write_positions(conn, &members, &positions, "stream_position")?;
        summary.streams_ranked += 1;
    }

    summary.grades.push(grade_id.to_string());
    Ok(())
}

/// recomputeExam: with no scope, every grade holding results for the exam.
/// Callers run this inside [`with_write_tx`].
pub fn recompute_exam(
    conn: &Connection,
    exam_id: &str,
    scope: Option<&Scope>,
) -> Result<RecomputeSummary, CalcError> {
    let exam = store::load_exam(conn, exam_id)?;
    let mut summary = RecomputeSummary {
        exam_id: exam.id.clone(),
        ..Default::default()
    };

    match scope {
        Some(scope) => recompute_grade(conn, &exam.id, scope, &mut summary)?,
        None => {
            for grade in store::grades_with_results(conn, &exam.id)? {
                let scope = Scope::Grade { grade_id: grade.id };
                recompute_grade(conn, &exam.id, &scope, &mut summary)?;
            }
        }
    }

    tracing::info!(
        exam_id = %summary.exam_id,
        grades = summary.grades.len(),
        totals = summary.totals_updated,
        ranked = summary.ranked,
        "recomputed exam"
    );
    Ok(summary)
}

#[derive(Debug, Clone)]
pub struct MarkEntry {
    pub student_id: String,
    pub exam_id: String,
    pub subject_code: String,
    pub raw_mark: serde_json::Value,
}

/// A mark that passed every check and is ready to persist.
#[derive(Debug, Clone)]
struct PreparedMark {
    exam_id: String,
    enrollment_id: String,
    grade_id: String,
    subject_code: String,
    raw_mark: f64,
    score: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMark {
    pub result_id: String,
    pub student_id: String,
    pub subject_code: String,
    pub raw_mark: f64,
    pub score: f64,
}

fn require_id<'a>(value: &'a str, field: &str) -> Result<&'a str, CalcError> {
    let v = value.trim();
    if v.is_empty() {
        return Err(CalcError::validation(format!("missing {}", field)));
    }
    Ok(v)
}

fn prepare_mark(
    conn: &Connection,
    exam: &ExamRecord,
    entry: &MarkEntry,
    subjects_cache: &mut HashMap<String, Vec<SubjectDef>>,
) -> Result<PreparedMark, CalcError> {
    let student_id = require_id(&entry.student_id, "studentId")?;
    let subject_code = require_id(&entry.subject_code, "subjectCode")?;
    let raw_mark = calc::parse_raw_mark(&entry.raw_mark)?;

    store::load_student(conn, student_id)?;
    let enrollment = store::find_enrollment(conn, student_id, exam.term, exam.year)?;
    if let Some(exam_grade) = exam.grade_id.as_deref() {
        if exam_grade != enrollment.grade_id {
            return Err(CalcError::validation("student is not in the exam's grade")
                .with_details(serde_json::json!({
                    "studentId": student_id,
                    "examGradeId": exam_grade,
                    "studentGradeId": enrollment.grade_id,
                })));
        }
    }

    if !subjects_cache.contains_key(&enrollment.grade_id) {
        let subjects = store::load_subjects(conn, &enrollment.grade_id)?;
        subjects_cache.insert(enrollment.grade_id.clone(), subjects);
    }
    let registered = subjects_cache
        .get(&enrollment.grade_id)
        .map(|subjects| subjects.iter().any(|s| s.code == subject_code))
        .unwrap_or(false);
    if !registered {
        return Err(CalcError::validation("subject is not registered for the grade")
            .with_details(serde_json::json!({
                "subjectCode": subject_code,
                "gradeId": enrollment.grade_id,
            })));
    }

    let out_of = store::marks_out_of(conn, &exam.id, subject_code)?;
    let score = calc::normalize_mark(raw_mark, out_of)?;

    Ok(PreparedMark {
        exam_id: exam.id.clone(),
        enrollment_id: enrollment.id,
        grade_id: enrollment.grade_id,
        subject_code: subject_code.to_string(),
        raw_mark,
        score,
    })
}

fn ensure_result_row(conn: &Connection, exam_id: &str, enrollment_id: &str) -> Result<String, CalcError> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM exam_results WHERE enrollment_id = ? AND exam_id = ?",
            (enrollment_id, exam_id),
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO exam_results(id, enrollment_id, exam_id, total_marks, position, stream_position, updated_at)
         VALUES(?, ?, ?, 0, NULL, NULL, ?)",
        (&id, enrollment_id, exam_id, db::now_timestamp()),
    )
    .map_err(CalcError::write)?;
    Ok(id)
}

fn persist_mark(conn: &Connection, mark: &PreparedMark) -> Result<String, CalcError> {
    let result_id = ensure_result_row(conn, &mark.exam_id, &mark.enrollment_id)?;
    conn.execute(
        "INSERT INTO exam_result_scores(result_id, subject_code, raw_mark, score)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(result_id, subject_code) DO UPDATE SET
           raw_mark = excluded.raw_mark,
           score = excluded.score",
        (&result_id, &mark.subject_code, mark.raw_mark, mark.score),
    )
    .map_err(CalcError::write)?;
    Ok(result_id)
}

fn recompute_grades(
    conn: &Connection,
    exam_id: &str,
    grades: BTreeSet<String>,
) -> Result<RecomputeSummary, CalcError> {
    let mut summary = RecomputeSummary {
        exam_id: exam_id.to_string(),
        ..Default::default()
    };
    for grade_id in grades {
        recompute_grade(conn, exam_id, &Scope::Grade { grade_id }, &mut summary)?;
    }
    Ok(summary)
}

/// Validates, normalizes and stores one mark, then recomputes the grade.
/// Nothing is written when validation fails.
pub fn enter_mark(conn: &Connection, entry: &MarkEntry) -> Result<(StoredMark, RecomputeSummary), CalcError> {
    let exam_id = require_id(&entry.exam_id, "examId")?;
    with_write_tx(conn, |tx| {
        let exam = store::load_exam(tx, exam_id)?;
        let mut cache = HashMap::new();
        let mark = prepare_mark(tx, &exam, entry, &mut cache)?;
        let result_id = persist_mark(tx, &mark)?;
        let summary = recompute_grades(tx, &exam.id, BTreeSet::from([mark.grade_id.clone()]))?;
        Ok((
            StoredMark {
                result_id,
                student_id: entry.student_id.trim().to_string(),
                subject_code: mark.subject_code,
                raw_mark: mark.raw_mark,
                score: mark.score,
            },
            summary,
        ))
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedMark {
    pub index: usize,
    pub student_id: String,
    pub subject_code: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOutcome {
    pub stored: Vec<StoredMark>,
    pub rejected: Vec<RejectedMark>,
    pub recompute: RecomputeSummary,
}

/// Stores every valid entry and reports the rest. All writes and the single
/// recompute share one transaction; a storage failure undoes the batch.
pub fn enter_marks(conn: &Connection, exam_id: &str, entries: &[MarkEntry]) -> Result<BulkOutcome, CalcError> {
    let exam_id = require_id(exam_id, "examId")?;
    with_write_tx(conn, |tx| {
        let exam = store::load_exam(tx, exam_id)?;
        let mut cache = HashMap::new();
        let mut stored = Vec::new();
        let mut rejected = Vec::new();
        let mut grades = BTreeSet::new();

        for (index, entry) in entries.iter().enumerate() {
            match prepare_mark(tx, &exam, entry, &mut cache) {
                Ok(mark) => {
                    let result_id = persist_mark(tx, &mark)?;
                    grades.insert(mark.grade_id.clone());
                    stored.push(StoredMark {
                        result_id,
                        student_id: entry.student_id.trim().to_string(),
                        subject_code: mark.subject_code,
                        raw_mark: mark.raw_mark,
                        score: mark.score,
                    });
                }
                Err(e) if e.is_rejection() => {
                    tracing::warn!(index, code = %e.code, message = %e.message, "rejected mark entry");
                    rejected.push(RejectedMark {
                        index,
                        student_id: entry.student_id.clone(),
                        subject_code: entry.subject_code.clone(),
                        code: e.code,
                        message: e.message,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let recompute = recompute_grades(tx, &exam.id, grades)?;
        Ok(BulkOutcome {
            stored,
            rejected,
            recompute,
        })
    })
}

/// Makes a subject "not yet entered" again for one student.
pub fn clear_mark(
    conn: &Connection,
    student_id: &str,
    exam_id: &str,
    subject_code: &str,
) -> Result<RecomputeSummary, CalcError> {
    let student_id = require_id(student_id, "studentId")?;
    let exam_id = require_id(exam_id, "examId")?;
    let subject_code = require_id(subject_code, "subjectCode")?;
    with_write_tx(conn, |tx| {
        let exam = store::load_exam(tx, exam_id)?;
        store::load_student(tx, student_id)?;
        let enrollment = store::find_enrollment(tx, student_id, exam.term, exam.year)?;
        let Some(row) = store::load_result_for_enrollment(tx, &exam.id, &enrollment.id)? else {
            return Err(CalcError::not_found("no result row for student and exam"));
        };
        if row.score(subject_code).is_none() {
            return Err(CalcError::not_found("no mark entered for subject")
                .with_details(serde_json::json!({ "subjectCode": subject_code })));
        }
        tx.execute(
            "DELETE FROM exam_result_scores WHERE result_id = ? AND subject_code = ?",
            (&row.result_id, subject_code),
        )
        .map_err(CalcError::write)?;
        recompute_grades(tx, &exam.id, BTreeSet::from([enrollment.grade_id]))
    })
}

#[derive(Debug, Clone)]
pub struct ScopeMeans {
    pub subjects: Vec<(String, MeanSummary)>,
    pub total: MeanSummary,
}

impl ScopeMeans {
    pub fn subject(&self, code: &str) -> Option<MeanSummary> {
        self.subjects
            .iter()
            .find(|(c, _)| c == code)
            .map(|(_, m)| *m)
    }
}

pub fn compute_means(rows: &[ResultRow], subjects: &[SubjectDef], cfg: &ScoringConfig) -> ScopeMeans {
    let subjects = subjects
        .iter()
        .map(|s| {
            let summary = calc::summarize_mean(rows.iter().map(|r| r.score(&s.code)));
            (s.code.clone(), summary)
        })
        .collect();
    let totals: Vec<f64> = rows.iter().map(|r| r.total_marks).collect();
    ScopeMeans {
        subjects,
        total: calc::total_mean(&totals, cfg.total_mean_excludes_zero),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeanLine {
    pub mean: f64,
    pub entries: usize,
    pub previous_mean: Option<f64>,
    pub deviation: Deviation,
}

#[derive(Debug, Clone)]
pub struct PreviousMeans {
    pub exam: ExamRecord,
    pub total: Option<f64>,
    pub subjects: HashMap<String, f64>,
}

/// Means of the most recent earlier exam for the scope: the archived record
/// when one exists, otherwise recomputed from that exam's rows.
pub fn previous_means(
    conn: &Connection,
    exam: &ExamRecord,
    scope: &Scope,
    subjects: &[SubjectDef],
    cfg: &ScoringConfig,
) -> Result<Option<PreviousMeans>, CalcError> {
    let Some(prev) = store::find_previous_exam(conn, exam, scope)? else {
        return Ok(None);
    };
    if let Some(archived) = store::load_archived_means(conn, &prev.id, scope)? {
        return Ok(Some(PreviousMeans {
            exam: prev,
            total: archived.total,
            subjects: archived.subjects,
        }));
    }

    let rows = store::load_result_rows(conn, &prev.id, scope)?;
    let means = compute_means(&rows, subjects, cfg);
    Ok(Some(PreviousMeans {
        exam: prev,
        total: means.total.has_data().then_some(means.total.mean),
        subjects: means
            .subjects
            .into_iter()
            .filter(|(_, m)| m.has_data())
            .map(|(c, m)| (c, m.mean))
            .collect(),
    }))
}

pub fn mean_line(current: MeanSummary, previous: Option<f64>) -> MeanLine {
    MeanLine {
        mean: current.mean,
        entries: current.entries,
        previous_mean: previous,
        deviation: calc::deviation(current.mean, previous),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveSummary {
    pub exam_id: String,
    pub scope_key: String,
    pub records: usize,
}

/// Snapshots the current means of an exam scope as PreviousMeanRecords.
pub fn archive_means(conn: &Connection, exam_id: &str, scope: &Scope) -> Result<ArchiveSummary, CalcError> {
    with_write_tx(conn, |tx| {
        let exam = store::load_exam(tx, exam_id)?;
        let subjects = store::load_subjects(tx, scope.grade_id())?;
        let cfg = scoring_config(tx, scope.grade_id())?;
        let rows = store::load_result_rows(tx, &exam.id, scope)?;
        let means = compute_means(&rows, &subjects, &cfg);

        let now = db::now_timestamp();
        let key = scope.key();
        tx.execute(
            "DELETE FROM mean_records WHERE scope_key = ? AND exam_id = ?",
            (&key, &exam.id),
        )
        .map_err(CalcError::write)?;
        let mut stmt = tx.prepare(
            "INSERT INTO mean_records(scope_key, exam_id, subject_code, mean, entries, archived_at)
             VALUES(?, ?, ?, ?, ?, ?)",
        )?;
        let mut records = 0;
        for (code, summary) in means
            .subjects
            .iter()
            .map(|(c, m)| (c.as_str(), m))
            .chain(std::iter::once((TOTAL_MEAN_CODE, &means.total)))
        {
            stmt.execute((&key, &exam.id, code, summary.mean, summary.entries as i64, &now))
                .map_err(CalcError::write)?;
            records += 1;
        }

        Ok(ArchiveSummary {
            exam_id: exam.id,
            scope_key: key,
            records,
        })
    })
}

/// Re-derives every (exam, grade) pair holding results, optionally limited to
/// one grade. Used after settings that change totals or ranks.
pub fn recompute_all(conn: &Connection, grade_id: Option<&str>) -> Result<Vec<RecomputeSummary>, CalcError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT r.exam_id, en.grade_id
         FROM exam_results r
         JOIN enrollments en ON en.id = r.enrollment_id
         WHERE ?1 IS NULL OR en.grade_id = ?1
         ORDER BY r.exam_id, en.grade_id",
    )?;
    let pairs = stmt
        .query_map([grade_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut by_exam: Vec<(String, BTreeSet<String>)> = Vec::new();
    for (exam_id, grade) in pairs {
        match by_exam.last_mut() {
            Some((last, grades)) if *last == exam_id => {
                grades.insert(grade);
            }
            _ => by_exam.push((exam_id, BTreeSet::from([grade]))),
        }
    }

    by_exam
        .into_iter()
        .map(|(exam_id, grades)| recompute_grades(conn, &exam_id, grades))
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarksOutOfUpdate {
    pub exam_id: String,
    pub subject_code: String,
    pub out_of: f64,
    pub renormalized: usize,
    pub recompute: RecomputeSummary,
}

/// Changes the maximum raw mark for an (exam, subject) and re-normalizes the
/// stored raw marks against it. Fails without writing when a stored raw mark
/// exceeds the new maximum.
pub fn set_marks_out_of(
    conn: &Connection,
    exam_id: &str,
    subject_code: &str,
    out_of: f64,
) -> Result<MarksOutOfUpdate, CalcError> {
    let subject_code = require_id(subject_code, "subjectCode")?;
    if !out_of.is_finite() || out_of <= 0.0 {
        return Err(CalcError::validation("outOf must be > 0")
            .with_details(serde_json::json!({ "outOf": out_of })));
    }
    with_write_tx(conn, |tx| {
        let exam = store::load_exam(tx, exam_id)?;

        let mut stmt = tx.prepare(
            "SELECT sc.result_id, sc.raw_mark, en.grade_id
             FROM exam_result_scores sc
             JOIN exam_results r ON r.id = sc.result_id
             JOIN enrollments en ON en.id = r.enrollment_id
             WHERE r.exam_id = ? AND sc.subject_code = ?",
        )?;
        let stored = stmt
            .query_map((&exam.id, subject_code), |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, f64>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut rescored = Vec::with_capacity(stored.len());
        let mut grades = BTreeSet::new();
        for (result_id, raw_mark, grade_id) in stored {
            let score = calc::normalize_mark(raw_mark, out_of).map_err(|e| {
                e.with_details(serde_json::json!({
                    "resultId": result_id,
                    "rawMark": raw_mark,
                    "outOf": out_of,
                }))
            })?;
            rescored.push((result_id, score));
            grades.insert(grade_id);
        }

        tx.execute(
            "INSERT INTO marks_out_of(exam_id, subject_code, out_of) VALUES(?, ?, ?)
             ON CONFLICT(exam_id, subject_code) DO UPDATE SET out_of = excluded.out_of",
            (&exam.id, subject_code, out_of),
        )
        .map_err(CalcError::write)?;
        let mut update = tx.prepare(
            "UPDATE exam_result_scores SET score = ? WHERE result_id = ? AND subject_code = ?",
        )?;
        for (result_id, score) in &rescored {
            update
                .execute((score, result_id, subject_code))
                .map_err(CalcError::write)?;
        }

        let recompute = recompute_grades(tx, &exam.id, grades)?;
        Ok(MarksOutOfUpdate {
            exam_id: exam.id,
            subject_code: subject_code.to_string(),
            out_of,
            renormalized: rescored.len(),
            recompute,
        })
    })
}
