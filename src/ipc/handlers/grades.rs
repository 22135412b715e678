use crate::ipc::handlers::exams::get_exam;
use crate::ipc::helpers::{
    now_ts, optional_str, required_f64, required_str, run, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

struct GradeRow {
    id: String,
    exam_table_id: String,
    student_id: String,
    score: f64,
    observations: String,
    subject_name: Option<String>,
    recorded_by: String,
    recorded_at: String,
    updated_by: Option<String>,
    updated_at: Option<String>,
}

const GRADE_COLUMNS: &str = "id, exam_table_id, student_id, score, observations,
     subject_name, recorded_by, recorded_at, updated_by, updated_at";

fn row_to_grade(r: &rusqlite::Row<'_>) -> rusqlite::Result<GradeRow> {
    Ok(GradeRow {
        id: r.get(0)?,
        exam_table_id: r.get(1)?,
        student_id: r.get(2)?,
        score: r.get(3)?,
        observations: r.get(4)?,
        subject_name: r.get(5)?,
        recorded_by: r.get(6)?,
        recorded_at: r.get(7)?,
        updated_by: r.get(8)?,
        updated_at: r.get(9)?,
    })
}

impl GradeRow {
    /// Who last set the current value, and when. For a never-edited record
    /// that is the original recorder.
    fn last_editor(&self) -> (String, String) {
        (
            self.updated_by.clone().unwrap_or_else(|| self.recorded_by.clone()),
            self.updated_at.clone().unwrap_or_else(|| self.recorded_at.clone()),
        )
    }

    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "examTableId": self.exam_table_id,
            "studentId": self.student_id,
            "score": self.score,
            "observations": self.observations,
            "subjectName": self.subject_name,
            "recordedBy": self.recorded_by,
            "recordedAt": self.recorded_at,
            "updatedBy": self.updated_by,
            "updatedAt": self.updated_at,
        })
    }
}

fn student_exists(conn: &Connection, uid: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM users WHERE id = ?", [uid], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

fn get_grade_for_pair(
    conn: &Connection,
    exam_id: &str,
    student_id: &str,
) -> Result<Option<GradeRow>, HandlerErr> {
    conn.query_row(
        &format!(
            "SELECT {} FROM grades WHERE exam_table_id = ? AND student_id = ?",
            GRADE_COLUMNS
        ),
        (exam_id, student_id),
        |r| row_to_grade(r),
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn grade_history(conn: &Connection, grade_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT score, observations, updated_by, updated_at
             FROM grade_history WHERE grade_id = ? ORDER BY seq",
        )
        .map_err(HandlerErr::query)?;
    stmt.query_map([grade_id], |r| {
        Ok(json!({
            "score": r.get::<_, f64>(0)?,
            "observations": r.get::<_, String>(1)?,
            "updatedBy": r.get::<_, String>(2)?,
            "updatedAt": r.get::<_, String>(3)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::query)
}

/// Record or revise a grade. A revision snapshots the pre-update values onto
/// the end of the history log and overwrites the current fields, all inside
/// one transaction so no snapshot can be lost to an interleaved edit.
fn grades_record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examTableId")?;
    let student_id = required_str(params, "studentId")?;
    let score = required_f64(params, "score")?;
    let observations = optional_str(params, "observations").unwrap_or_default();
    let editor_id = required_str(params, "editorId")?;
    let subject_name = optional_str(params, "subjectName");

    if !(0.0..=10.0).contains(&score) {
        return Err(HandlerErr::bad_params("score must be between 0 and 10"));
    }
    if get_exam(conn, &exam_id)?.is_none() {
        return Err(HandlerErr::not_found("exam not found"));
    }
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    let ts = now_ts();
    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;

    let grade_id = match get_grade_for_pair(&tx, &exam_id, &student_id)? {
        Some(existing) => {
            let (prev_by, prev_at) = existing.last_editor();
            tx.execute(
                "INSERT INTO grade_history(grade_id, seq, score, observations, updated_by, updated_at)
                 VALUES(?, (SELECT COALESCE(MAX(seq) + 1, 0) FROM grade_history WHERE grade_id = ?),
                        ?, ?, ?, ?)",
                (
                    &existing.id,
                    &existing.id,
                    existing.score,
                    &existing.observations,
                    &prev_by,
                    &prev_at,
                ),
            )
            .map_err(|e| HandlerErr::update(e, "grade_history"))?;

            tx.execute(
                "UPDATE grades SET score = ?, observations = ?,
                     subject_name = COALESCE(?, subject_name),
                     updated_by = ?, updated_at = ?
                 WHERE id = ?",
                (score, &observations, &subject_name, &editor_id, &ts, &existing.id),
            )
            .map_err(|e| HandlerErr::update(e, "grades"))?;
            existing.id
        }
        None => {
            let grade_id = format!("grade_{}_{}", exam_id, student_id);
            tx.execute(
                "INSERT INTO grades(id, exam_table_id, student_id, score, observations,
                     subject_name, recorded_by, recorded_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &grade_id,
                    &exam_id,
                    &student_id,
                    score,
                    &observations,
                    &subject_name,
                    &editor_id,
                    &ts,
                ),
            )
            .map_err(|e| HandlerErr::update(e, "grades"))?;
            grade_id
        }
    };

    tx.commit().map_err(HandlerErr::commit)?;
    Ok(json!({ "gradeId": grade_id }))
}

fn grades_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examTableId")?;
    let student_id = required_str(params, "studentId")?;
    let grade = get_grade_for_pair(conn, &exam_id, &student_id)?
        .ok_or_else(|| HandlerErr::not_found("grade not found"))?;
    let history = grade_history(conn, &grade.id)?;

    let mut out = grade.to_json();
    out["history"] = json!(history);
    Ok(out)
}

fn list_grades(conn: &Connection, sql: &str, binds: &[&str]) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::query)?;
    let grades = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| row_to_grade(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "grades": grades.iter().map(|g| g.to_json()).collect::<Vec<_>>() }))
}

fn grades_list_by_exam(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examTableId")?;
    list_grades(
        conn,
        &format!(
            "SELECT {} FROM grades WHERE exam_table_id = ? ORDER BY student_id",
            GRADE_COLUMNS
        ),
        &[&exam_id],
    )
}

fn grades_list_by_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let mut stmt = conn
        .prepare(
            "SELECT g.id, g.exam_table_id, g.student_id, g.score, g.observations,
                    COALESCE(g.subject_name, e.subject_name, e.subject_id),
                    g.recorded_by, g.recorded_at, g.updated_by, g.updated_at
             FROM grades g
             LEFT JOIN exam_tables e ON e.id = g.exam_table_id
             WHERE g.student_id = ?
             ORDER BY g.recorded_at",
        )
        .map_err(HandlerErr::query)?;
    let grades = stmt
        .query_map([&student_id], |r| row_to_grade(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "grades": grades.iter().map(|g| g.to_json()).collect::<Vec<_>>() }))
}

fn grades_list_all(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    list_grades(
        conn,
        &format!("SELECT {} FROM grades ORDER BY recorded_at", GRADE_COLUMNS),
        &[],
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let op = match req.method.as_str() {
        "grades.record" => grades_record,
        "grades.get" => grades_get,
        "grades.listByExam" => grades_list_by_exam,
        "grades.listByStudent" => grades_list_by_student,
        "grades.listAll" => grades_list_all,
        _ => return None,
    };
    Some(run(state, req, op))
}
