use crate::ipc::handlers::exams::get_exam;
use crate::ipc::helpers::{now_ts, required_str, run, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn reservation_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "examTableId": r.get::<_, String>(1)?,
        "studentId": r.get::<_, String>(2)?,
        "status": r.get::<_, String>(3)?,
        "createdAt": r.get::<_, String>(4)?,
        "cancelledAt": r.get::<_, Option<String>>(5)?,
    }))
}

fn user_exists(conn: &Connection, uid: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM users WHERE id = ?", [uid], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

/// Admission is one conditional write keyed by the deterministic pair id:
/// a fresh pair inserts confirmed, a previously cancelled pair flips back to
/// confirmed, and an existing confirmed pair changes nothing. Zero affected
/// rows therefore means a duplicate, with no read between check and write.
fn reservations_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examTableId")?;
    let student_id = required_str(params, "studentId")?;

    if get_exam(conn, &exam_id)?.is_none() {
        return Err(HandlerErr::not_found("exam not found"));
    }
    if !user_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    let reservation_id = format!("res_{}_{}", exam_id, student_id);
    let changed = conn
        .execute(
            "INSERT INTO reservations(id, exam_table_id, student_id, status, created_at, cancelled_at)
             VALUES(?, ?, ?, 'confirmed', ?, NULL)
             ON CONFLICT(id) DO UPDATE SET
               status = 'confirmed',
               created_at = excluded.created_at,
               cancelled_at = NULL
             WHERE reservations.status = 'cancelled'",
            (&reservation_id, &exam_id, &student_id, now_ts()),
        )
        .map_err(|e| HandlerErr::update(e, "reservations"))?;

    if changed == 0 {
        return Err(HandlerErr {
            code: "duplicate_reservation",
            message: "a confirmed reservation already exists for this exam".to_string(),
            details: Some(json!({ "reservationId": reservation_id })),
        });
    }

    Ok(json!({ "reservationId": reservation_id }))
}

fn reservations_cancel(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let reservation_id = required_str(params, "reservationId")?;
    let changed = conn
        .execute(
            "UPDATE reservations SET status = 'cancelled', cancelled_at = ? WHERE id = ?",
            (now_ts(), &reservation_id),
        )
        .map_err(|e| HandlerErr::update(e, "reservations"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("reservation not found"));
    }
    Ok(json!({ "reservationId": reservation_id, "status": "cancelled" }))
}

fn reservations_list_by_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, exam_table_id, student_id, status, created_at, cancelled_at
             FROM reservations
             WHERE student_id = ? AND status = 'confirmed'
             ORDER BY created_at",
        )
        .map_err(HandlerErr::query)?;
    let reservations = stmt
        .query_map([&student_id], reservation_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "reservations": reservations }))
}

fn reservations_list_by_exam(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examTableId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, exam_table_id, student_id, status, created_at, cancelled_at
             FROM reservations
             WHERE exam_table_id = ? AND status = 'confirmed'
             ORDER BY created_at",
        )
        .map_err(HandlerErr::query)?;
    let reservations = stmt
        .query_map([&exam_id], reservation_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "reservations": reservations }))
}

fn reservations_list_students(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examTableId")?;
    let mut stmt = conn
        .prepare(
            "SELECT student_id FROM reservations
             WHERE exam_table_id = ? AND status = 'confirmed'
             ORDER BY created_at",
        )
        .map_err(HandlerErr::query)?;
    let students = stmt
        .query_map([&exam_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "studentIds": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let op = match req.method.as_str() {
        "reservations.create" => reservations_create,
        "reservations.cancel" => reservations_cancel,
        "reservations.listByStudent" => reservations_list_by_student,
        "reservations.listByExam" => reservations_list_by_exam,
        "reservations.listStudents" => reservations_list_students,
        _ => return None,
    };
    Some(run(state, req, op))
}
