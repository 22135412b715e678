use crate::ipc::helpers::{
    now_local, now_ts, optional_i64, optional_str, required_str, run, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::status::{self, ExamStatus};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub struct ExamRow {
    pub id: String,
    pub subject_id: String,
    pub subject_name: Option<String>,
    pub teacher_id: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub room: String,
    pub max_students: i64,
    pub cancelled: bool,
    pub confirmed_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

const EXAM_COLUMNS: &str = "e.id, e.subject_id, e.subject_name, e.teacher_id, e.date,
     e.start_time, e.end_time, e.room, e.max_students, e.cancelled,
     (SELECT COUNT(*) FROM reservations r
       WHERE r.exam_table_id = e.id AND r.status = 'confirmed'),
     e.created_at, e.updated_at";

fn row_to_exam(r: &rusqlite::Row<'_>) -> rusqlite::Result<ExamRow> {
    Ok(ExamRow {
        id: r.get(0)?,
        subject_id: r.get(1)?,
        subject_name: r.get(2)?,
        teacher_id: r.get(3)?,
        date: r.get(4)?,
        start_time: r.get(5)?,
        end_time: r.get(6)?,
        room: r.get(7)?,
        max_students: r.get(8)?,
        cancelled: r.get::<_, i64>(9)? != 0,
        confirmed_count: r.get(10)?,
        created_at: r.get(11)?,
        updated_at: r.get(12)?,
    })
}

impl ExamRow {
    pub fn derived_status(&self) -> ExamStatus {
        status::derive_status(
            self.cancelled,
            &self.date,
            &self.start_time,
            &self.end_time,
            now_local(),
        )
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "subjectId": self.subject_id,
            "subjectName": self.subject_name,
            "teacherId": self.teacher_id,
            "date": self.date,
            "startTime": self.start_time,
            "endTime": self.end_time,
            "room": self.room,
            "maxStudents": self.max_students,
            "status": self.derived_status().as_str(),
            "confirmedCount": self.confirmed_count,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
        })
    }
}

pub fn get_exam(conn: &Connection, exam_id: &str) -> Result<Option<ExamRow>, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM exam_tables e WHERE e.id = ?", EXAM_COLUMNS),
        [exam_id],
        |r| row_to_exam(r),
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn list_exams(conn: &Connection, sql: &str, binds: &[&str]) -> Result<Vec<ExamRow>, HandlerErr> {
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::query)?;
    stmt.query_map(rusqlite::params_from_iter(binds.iter()), |r| row_to_exam(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)
}

fn exams_json(exams: &[ExamRow]) -> serde_json::Value {
    json!({ "exams": exams.iter().map(|e| e.to_json()).collect::<Vec<_>>() })
}

fn validate_window(date: &str, start: &str, end: &str) -> Result<(), HandlerErr> {
    if status::parse_exam_date(date).is_none() {
        return Err(HandlerErr::bad_params("date must be YYYY-MM-DD"));
    }
    if status::parse_time_of_day(start).is_none() || status::parse_time_of_day(end).is_none() {
        return Err(HandlerErr::bad_params("startTime/endTime must be HH:MM"));
    }
    Ok(())
}

fn exams_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = required_str(params, "subjectId")?;
    let teacher_id = required_str(params, "teacherId")?;
    let date = required_str(params, "date")?;
    let start_time = required_str(params, "startTime")?;
    let end_time = required_str(params, "endTime")?;
    let room = required_str(params, "room")?;
    let max_students = optional_i64(params, "maxStudents").unwrap_or(30);

    validate_window(&date, &start_time, &end_time)?;
    if max_students < 1 {
        return Err(HandlerErr::bad_params("maxStudents must be at least 1"));
    }

    // Denormalized subject name, resolved at create time like the portal did.
    let subject_name = match optional_str(params, "subjectName") {
        Some(n) => Some(n),
        None => conn
            .query_row("SELECT name FROM subjects WHERE id = ?", [&subject_id], |r| {
                r.get::<_, String>(0)
            })
            .optional()
            .map_err(HandlerErr::query)?,
    };

    let id = format!("exam_{}", Uuid::new_v4());
    let ts = now_ts();
    conn.execute(
        "INSERT INTO exam_tables(id, subject_id, subject_name, teacher_id, date,
             start_time, end_time, room, max_students, cancelled, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        (
            &id,
            &subject_id,
            &subject_name,
            &teacher_id,
            &date,
            &start_time,
            &end_time,
            &room,
            &max_students,
            &ts,
            &ts,
        ),
    )
    .map_err(|e| HandlerErr::update(e, "exam_tables"))?;

    Ok(json!({ "examTableId": id }))
}

fn exams_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examTableId")?;
    let existing = get_exam(conn, &exam_id)?.ok_or_else(|| HandlerErr::not_found("exam not found"))?;

    let date = optional_str(params, "date").unwrap_or_else(|| existing.date.clone());
    let start_time = optional_str(params, "startTime").unwrap_or_else(|| existing.start_time.clone());
    let end_time = optional_str(params, "endTime").unwrap_or_else(|| existing.end_time.clone());
    validate_window(&date, &start_time, &end_time)?;

    let subject_id = optional_str(params, "subjectId").unwrap_or(existing.subject_id);
    let subject_name = optional_str(params, "subjectName").or(existing.subject_name);
    let room = optional_str(params, "room").unwrap_or(existing.room);
    let max_students = optional_i64(params, "maxStudents").unwrap_or(existing.max_students);
    if max_students < 1 {
        return Err(HandlerErr::bad_params("maxStudents must be at least 1"));
    }

    conn.execute(
        "UPDATE exam_tables SET subject_id = ?, subject_name = ?, date = ?, start_time = ?,
             end_time = ?, room = ?, max_students = ?, updated_at = ?
         WHERE id = ?",
        (
            &subject_id,
            &subject_name,
            &date,
            &start_time,
            &end_time,
            &room,
            &max_students,
            now_ts(),
            &exam_id,
        ),
    )
    .map_err(|e| HandlerErr::update(e, "exam_tables"))?;

    let exam = get_exam(conn, &exam_id)?.ok_or_else(|| HandlerErr::not_found("exam not found"))?;
    Ok(exam.to_json())
}

// "Deleting" an exam table is a cancellation; the override is sticky and no
// automatic transition ever leaves it.
fn exams_cancel(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examTableId")?;
    let changed = conn
        .execute(
            "UPDATE exam_tables SET cancelled = 1, updated_at = ? WHERE id = ?",
            (now_ts(), &exam_id),
        )
        .map_err(|e| HandlerErr::update(e, "exam_tables"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("exam not found"));
    }
    Ok(json!({ "examTableId": exam_id, "status": ExamStatus::Cancelled.as_str() }))
}

fn exams_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examTableId")?;
    let exam = get_exam(conn, &exam_id)?.ok_or_else(|| HandlerErr::not_found("exam not found"))?;
    Ok(exam.to_json())
}

fn exams_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exams = list_exams(
        conn,
        &format!(
            "SELECT {} FROM exam_tables e ORDER BY e.date, e.start_time",
            EXAM_COLUMNS
        ),
        &[],
    )?;
    Ok(exams_json(&exams))
}

fn exams_list_by_teacher(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = required_str(params, "teacherId")?;
    let exams = list_exams(
        conn,
        &format!(
            "SELECT {} FROM exam_tables e WHERE e.teacher_id = ? ORDER BY e.date, e.start_time",
            EXAM_COLUMNS
        ),
        &[&teacher_id],
    )?;
    Ok(exams_json(&exams))
}

fn exams_list_by_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let exams = list_exams(
        conn,
        &format!(
            "SELECT {} FROM exam_tables e
             JOIN reservations r ON r.exam_table_id = e.id
             WHERE r.student_id = ? AND r.status = 'confirmed'
             ORDER BY e.date, e.start_time",
            EXAM_COLUMNS
        ),
        &[&student_id],
    )?;
    Ok(exams_json(&exams))
}

// Open slots are the ones a student could still sit: derived status scheduled
// or in progress. Capacity is reported, not enforced.
fn exams_list_available(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exams = list_exams(
        conn,
        &format!(
            "SELECT {} FROM exam_tables e ORDER BY e.date, e.start_time",
            EXAM_COLUMNS
        ),
        &[],
    )?;
    let open: Vec<ExamRow> = exams
        .into_iter()
        .filter(|e| {
            matches!(
                e.derived_status(),
                ExamStatus::Scheduled | ExamStatus::InProgress
            )
        })
        .collect();
    Ok(exams_json(&open))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let op = match req.method.as_str() {
        "exams.create" => exams_create,
        "exams.update" => exams_update,
        "exams.cancel" => exams_cancel,
        "exams.get" => exams_get,
        "exams.list" => exams_list,
        "exams.listByTeacher" => exams_list_by_teacher,
        "exams.listByStudent" => exams_list_by_student,
        "exams.listAvailable" => exams_list_available,
        _ => return None,
    };
    Some(run(state, req, op))
}
