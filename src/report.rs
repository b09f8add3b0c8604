use crate::calc::{self, CalcError, PointBoundary};
use crate::config::ScoringConfig;
use crate::results::{self, MeanLine};
use crate::store::{self, ExamRecord, ExamType, ResultRow, Scope, SubjectDef};
use rusqlite::Connection;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeSummary {
    pub grade_id: String,
    pub grade_name: String,
    pub stream_id: Option<String>,
    pub stream_name: Option<String>,
    pub tutor_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectCell {
    pub code: String,
    pub score: Option<f64>,
    pub level: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkListRow {
    pub student_id: String,
    pub admission_no: Option<String>,
    pub display_name: String,
    pub stream_id: Option<String>,
    pub subjects: Vec<SubjectCell>,
    pub total_marks: f64,
    /// Mean of the registered subjects present; the overall level is resolved on it.
    pub average: f64,
    pub level: Option<String>,
    pub position: Option<i64>,
    pub stream_position: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectMeanLine {
    pub code: String,
    pub name: String,
    #[serde(flatten)]
    pub line: MeanLine,
    pub level: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkList {
    pub exam: ExamRecord,
    pub scope: ScopeSummary,
    pub config: ScoringConfig,
    pub subjects: Vec<SubjectDef>,
    pub rows: Vec<MarkListRow>,
    pub subject_means: Vec<SubjectMeanLine>,
    pub total_mean: MeanLine,
    pub previous_exam: Option<ExamRecord>,
}

fn level_of(score: Option<f64>, boundaries: &[PointBoundary]) -> Option<String> {
    calc::resolve_performance_level(score, boundaries).map(str::to_string)
}

fn scope_summary(conn: &Connection, scope: &Scope) -> Result<ScopeSummary, CalcError> {
    let grade = store::load_grade(conn, scope.grade_id())?;
    let stream = match scope.stream_id() {
        Some(id) => Some(store::load_stream(conn, id)?),
        None => None,
    };
    Ok(ScopeSummary {
        grade_id: grade.id,
        grade_name: grade.name,
        stream_id: stream.as_ref().map(|s| s.id.clone()),
        stream_name: stream.as_ref().map(|s| s.name.clone()),
        tutor_name: stream.and_then(|s| s.tutor_name),
    })
}

fn subject_cells(row: &ResultRow, subjects: &[SubjectDef], boundaries: &[PointBoundary]) -> Vec<SubjectCell> {
    subjects
        .iter()
        .map(|s| {
            let score = row.score(&s.code);
            SubjectCell {
                code: s.code.clone(),
                score,
                level: level_of(score, boundaries),
            }
        })
        .collect()
}

/// getMarkList: rows ordered by grade position (stream position for a stream
/// scope) with levels, scope means and deviation from the previous exam.
pub fn build_mark_list(conn: &Connection, exam_id: &str, scope: &Scope) -> Result<MarkList, CalcError> {
    let exam = store::load_exam(conn, exam_id)?;
    if let Some(exam_grade) = exam.grade_id.as_deref() {
        if exam_grade != scope.grade_id() {
            return Err(CalcError::validation("exam does not cover the requested grade")
                .with_details(serde_json::json!({ "examId": exam.id, "gradeId": scope.grade_id() })));
        }
    }
    let scope_info = scope_summary(conn, scope)?;
    let subjects = store::load_subjects(conn, scope.grade_id())?;
    let boundaries = store::load_boundaries(conn, Some(scope.grade_id()))?;
    let cfg = results::scoring_config(conn, scope.grade_id())?;

    let mut rows = store::load_result_rows(conn, &exam.id, scope)?;
    let rank_of = |r: &ResultRow| match scope {
        Scope::Grade { .. } => r.position,
        Scope::Stream { .. } => r.stream_position,
    };
    // Unranked rows (never recomputed) go last; ties keep student id order.
    rows.sort_by_key(|r| (rank_of(r).is_none(), rank_of(r)));

    let means = results::compute_means(&rows, &subjects, &cfg);
    let previous = results::previous_means(conn, &exam, scope, &subjects, &cfg)?;

    let subject_means = subjects
        .iter()
        .map(|s| {
            let current = means.subject(&s.code).unwrap_or(calc::MeanSummary {
                mean: 0.0,
                entries: 0,
            });
            let prev = previous.as_ref().and_then(|p| p.subjects.get(&s.code).copied());
            SubjectMeanLine {
                code: s.code.clone(),
                name: s.name.clone(),
                line: results::mean_line(current, prev),
                level: current
                    .has_data()
                    .then(|| level_of(Some(current.mean), &boundaries))
                    .flatten(),
            }
        })
        .collect();
    let total_mean = results::mean_line(means.total, previous.as_ref().and_then(|p| p.total));

    let out_rows = rows
        .iter()
        .map(|r| {
            let summary = calc::summarize_mean(subjects.iter().map(|s| r.score(&s.code)));
            let average = summary.mean;
            MarkListRow {
                student_id: r.student_id.clone(),
                admission_no: r.admission_no.clone(),
                display_name: r.display_name.clone(),
                stream_id: r.stream_id.clone(),
                subjects: subject_cells(r, &subjects, &boundaries),
                total_marks: r.total_marks,
                average,
                level: summary
                    .has_data()
                    .then(|| level_of(Some(average), &boundaries))
                    .flatten(),
                position: r.position,
                stream_position: r.stream_position,
            }
        })
        .collect();

    Ok(MarkList {
        exam,
        scope: scope_info,
        config: cfg,
        subjects,
        rows: out_rows,
        subject_means,
        total_mean,
        previous_exam: previous.map(|p| p.exam),
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedSubject {
    pub code: String,
    pub name: String,
    pub mid_term: Option<f64>,
    pub end_term: Option<f64>,
    pub combined: Option<f64>,
    pub level: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamStanding {
    pub exam: ExamRecord,
    pub total_marks: Option<f64>,
    pub position: Option<i64>,
    pub stream_position: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedReport {
    pub student_id: String,
    pub admission_no: Option<String>,
    pub display_name: String,
    pub scope: ScopeSummary,
    pub term: i64,
    pub year: i64,
    pub mid_term: Option<ExamStanding>,
    pub end_term: Option<ExamStanding>,
    pub subjects: Vec<CombinedSubject>,
    pub total_marks: f64,
    pub average: f64,
    pub level: Option<String>,
}

fn partner_type(t: ExamType) -> Option<ExamType> {
    match t {
        ExamType::MidTerm => Some(ExamType::EndTerm),
        ExamType::EndTerm => Some(ExamType::MidTerm),
        ExamType::Weekly | ExamType::Opener => None,
    }
}

fn standing(exam: ExamRecord, row: Option<&ResultRow>) -> ExamStanding {
    ExamStanding {
        exam,
        total_marks: row.map(|r| r.total_marks),
        position: row.and_then(|r| r.position),
        stream_position: row.and_then(|r| r.stream_position),
    }
}

/// getCombinedReport: the student's mid-term and end-term of the same term
/// merged subject by subject.
pub fn build_combined_report(
    conn: &Connection,
    student_id: &str,
    exam_id: &str,
) -> Result<CombinedReport, CalcError> {
    let exam = store::load_exam(conn, exam_id)?;
    let Some(wanted) = partner_type(exam.exam_type) else {
        return Err(CalcError::validation("combined reports need a mid-term or end-term exam")
            .with_details(serde_json::json!({ "examId": exam.id, "examType": exam.exam_type })));
    };
    let student = store::load_student(conn, student_id)?;
    let enrollment = store::find_enrollment(conn, &student.id, exam.term, exam.year)?;

    let grade_fits = |e: &ExamRecord| {
        e.grade_id
            .as_deref()
            .map(|g| g == enrollment.grade_id)
            .unwrap_or(true)
    };
    // Latest partner exam of the same term that covers the student's grade.
    let partner = store::load_term_exams(conn, exam.term, exam.year)?
        .into_iter()
        .filter(|e| e.exam_type == wanted && e.id != exam.id && grade_fits(e))
        .last();

    let exam_type = exam.exam_type;
    let (mid_exam, end_exam) = match exam_type {
        ExamType::MidTerm => (Some(exam), partner),
        _ => (partner, Some(exam)),
    };
    let mid_row = match &mid_exam {
        Some(e) => store::load_result_for_enrollment(conn, &e.id, &enrollment.id)?,
        None => None,
    };
    let end_row = match &end_exam {
        Some(e) => store::load_result_for_enrollment(conn, &e.id, &enrollment.id)?,
        None => None,
    };
    if mid_row.is_none() && end_row.is_none() {
        return Err(CalcError::not_found("no results for student in the term's exams")
            .with_details(serde_json::json!({ "studentId": student.id, "examId": exam_id })));
    }

    let scope = match &enrollment.stream_id {
        Some(stream_id) => Scope::Stream {
            grade_id: enrollment.grade_id.clone(),
            stream_id: stream_id.clone(),
        },
        None => Scope::Grade {
            grade_id: enrollment.grade_id.clone(),
        },
    };
    let scope_info = scope_summary(conn, &scope)?;
    let subjects = store::load_subjects(conn, &enrollment.grade_id)?;
    let boundaries = store::load_boundaries(conn, Some(&enrollment.grade_id))?;
    let cfg = results::scoring_config(conn, &enrollment.grade_id)?;

    let combined_subjects: Vec<CombinedSubject> = subjects
        .iter()
        .map(|s| {
            let mid = mid_row.as_ref().and_then(|r| r.score(&s.code));
            let end = end_row.as_ref().and_then(|r| r.score(&s.code));
            let combined = calc::combine_mid_end(mid, end);
            CombinedSubject {
                code: s.code.clone(),
                name: s.name.clone(),
                mid_term: mid,
                end_term: end,
                combined,
                level: level_of(combined, &boundaries),
            }
        })
        .collect();

    let total_marks =
        calc::aggregate_scores(combined_subjects.iter().map(|s| s.combined), cfg.aggregation);
    let average = calc::mean_of(combined_subjects.iter().map(|s| s.combined));
    let any_combined = combined_subjects.iter().any(|s| s.combined.is_some());

    Ok(CombinedReport {
        student_id: student.id,
        admission_no: student.admission_no,
        display_name: student.display_name,
        scope: scope_info,
        term: enrollment.term,
        year: enrollment.year,
        mid_term: mid_exam.map(|e| standing(e, mid_row.as_ref())),
        end_term: end_exam.map(|e| standing(e, end_row.as_ref())),
        subjects: combined_subjects,
        total_marks,
        average,
        level: any_combined
            .then(|| level_of(Some(average), &boundaries))
            .flatten(),
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeMeanScore {
    pub grade_id: String,
    pub grade_name: String,
    pub mean: f64,
    pub entries: usize,
    pub rank: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeanStandardScore {
    pub exam: ExamRecord,
    pub grades: Vec<GradeMeanScore>,
}

/// getMeanStandardScore: every grade's total mean for the exam, highest first.
pub fn build_mean_standard_score(conn: &Connection, exam_id: &str) -> Result<MeanStandardScore, CalcError> {
    let exam = store::load_exam(conn, exam_id)?;
    let grades = match exam.grade_id.as_deref() {
        Some(g) => vec![store::load_grade(conn, g)?],
        None => store::grades_with_results(conn, &exam.id)?,
    };

    let mut scored: Vec<(store::GradeRecord, calc::MeanSummary)> = Vec::new();
    for grade in grades {
        let cfg = results::scoring_config(conn, &grade.id)?;
        let scope = Scope::Grade {
            grade_id: grade.id.clone(),
        };
        let rows = store::load_result_rows(conn, &exam.id, &scope)?;
        let totals: Vec<f64> = rows.iter().map(|r| r.total_marks).collect();
        scored.push((grade, calc::total_mean(&totals, cfg.total_mean_excludes_zero)));
    }
    scored.sort_by(|(ga, a), (gb, b)| {
        b.mean
            .total_cmp(&a.mean)
            .then_with(|| ga.sort_order.cmp(&gb.sort_order))
            .then_with(|| ga.name.cmp(&gb.name))
    });

    let grades = scored
        .into_iter()
        .enumerate()
        .map(|(i, (grade, mean))| GradeMeanScore {
            grade_id: grade.id,
            grade_name: grade.name,
            mean: mean.mean,
            entries: mean.entries,
            rank: (i as i64) + 1,
        })
        .collect();
    Ok(MeanStandardScore { exam, grades })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub student_id: String,
    pub admission_no: Option<String>,
    pub text: String,
}

fn format_score(v: f64) -> String {
    format!("{:.2}", v)
}

/// One plain-text line per student for the SMS dispatcher.
pub fn result_messages(list: &MarkList) -> Vec<ResultMessage> {
    let out_of = list.rows.len();
    list.rows
        .iter()
        .map(|r| {
            let subjects = r
                .subjects
                .iter()
                .filter_map(|c| c.score.map(|s| format!("{} {}", c.code, format_score(s))))
                .collect::<Vec<_>>()
                .join(", ");
            let rank = match list.scope.stream_id {
                Some(_) => r.stream_position,
                None => r.position,
            };
            let position = rank
                .map(|p| format!("{}/{}", p, out_of))
                .unwrap_or_else(|| "-".to_string());
            let text = format!(
                "{} ({}) {} T{} {}: {}. Total {} ({}). Position {}.",
                r.display_name,
                r.admission_no.as_deref().unwrap_or("-"),
                list.exam.name,
                list.exam.term,
                list.exam.year,
                if subjects.is_empty() { "-" } else { subjects.as_str() },
                format_score(r.total_marks),
                r.level.as_deref().unwrap_or("-"),
                position
            );
            ResultMessage {
                student_id: r.student_id.clone(),
                admission_no: r.admission_no.clone(),
                text,
            }
        })
        .collect()
}
