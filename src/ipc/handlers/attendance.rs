use crate::ipc::handlers::exams::get_exam;
use crate::ipc::helpers::{now_ts, required_str, run, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const ATTENDANCE_STATUSES: [&str; 3] = ["present", "absent", "justified"];

struct AttendanceRow {
    id: String,
    exam_table_id: String,
    student_id: String,
    status: String,
    recorded_by: String,
    recorded_at: String,
    updated_by: Option<String>,
    updated_at: Option<String>,
}

const ATTENDANCE_COLUMNS: &str =
    "id, exam_table_id, student_id, status, recorded_by, recorded_at, updated_by, updated_at";

fn row_to_attendance(r: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRow> {
    Ok(AttendanceRow {
        id: r.get(0)?,
        exam_table_id: r.get(1)?,
        student_id: r.get(2)?,
        status: r.get(3)?,
        recorded_by: r.get(4)?,
        recorded_at: r.get(5)?,
        updated_by: r.get(6)?,
        updated_at: r.get(7)?,
    })
}

impl AttendanceRow {
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
            "status": self.status,
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

fn get_attendance_for_pair(
    conn: &Connection,
    exam_id: &str,
    student_id: &str,
) -> Result<Option<AttendanceRow>, HandlerErr> {
    conn.query_row(
        &format!(
            "SELECT {} FROM attendance WHERE exam_table_id = ? AND student_id = ?",
            ATTENDANCE_COLUMNS
        ),
        (exam_id, student_id),
        |r| row_to_attendance(r),
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn attendance_history(
    conn: &Connection,
    attendance_id: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT status, updated_by, updated_at
             FROM attendance_history WHERE attendance_id = ? ORDER BY seq",
        )
        .map_err(HandlerErr::query)?;
    stmt.query_map([attendance_id], |r| {
        Ok(json!({
            "status": r.get::<_, String>(0)?,
            "updatedBy": r.get::<_, String>(1)?,
            "updatedAt": r.get::<_, String>(2)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::query)
}

/// Same append-before-overwrite contract as grades, with the attendance enum
/// in place of a score.
fn attendance_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examTableId")?;
    let student_id = required_str(params, "studentId")?;
    let status = required_str(params, "status")?;
    let editor_id = required_str(params, "editorId")?;

    if !ATTENDANCE_STATUSES.contains(&status.as_str()) {
        return Err(HandlerErr::bad_params(
            "status must be present, absent or justified",
        ));
    }
    if get_exam(conn, &exam_id)?.is_none() {
        return Err(HandlerErr::not_found("exam not found"));
    }
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    let ts = now_ts();
    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;

    let attendance_id = match get_attendance_for_pair(&tx, &exam_id, &student_id)? {
        Some(existing) => {
            let (prev_by, prev_at) = existing.last_editor();
            tx.execute(
                "INSERT INTO attendance_history(attendance_id, seq, status, updated_by, updated_at)
                 VALUES(?, (SELECT COALESCE(MAX(seq) + 1, 0) FROM attendance_history WHERE attendance_id = ?),
                        ?, ?, ?)",
                (&existing.id, &existing.id, &existing.status, &prev_by, &prev_at),
            )
            .map_err(|e| HandlerErr::update(e, "attendance_history"))?;

            tx.execute(
                "UPDATE attendance SET status = ?, updated_by = ?, updated_at = ? WHERE id = ?",
                (&status, &editor_id, &ts, &existing.id),
            )
            .map_err(|e| HandlerErr::update(e, "attendance"))?;
            existing.id
        }
        None => {
            let attendance_id = format!("att_{}_{}", exam_id, student_id);
            tx.execute(
                "INSERT INTO attendance(id, exam_table_id, student_id, status, recorded_by, recorded_at)
                 VALUES(?, ?, ?, ?, ?, ?)",
                (&attendance_id, &exam_id, &student_id, &status, &editor_id, &ts),
            )
            .map_err(|e| HandlerErr::update(e, "attendance"))?;
            attendance_id
        }
    };

    tx.commit().map_err(HandlerErr::commit)?;
    Ok(json!({ "attendanceId": attendance_id }))
}

fn attendance_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examTableId")?;
    let student_id = required_str(params, "studentId")?;
    let record = get_attendance_for_pair(conn, &exam_id, &student_id)?
        .ok_or_else(|| HandlerErr::not_found("attendance record not found"))?;
    let history = attendance_history(conn, &record.id)?;

    let mut out = record.to_json();
    out["history"] = json!(history);
    Ok(out)
}

fn list_attendance(
    conn: &Connection,
    sql: &str,
    binds: &[&str],
) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::query)?;
    let records = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            row_to_attendance(r)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "attendance": records.iter().map(|a| a.to_json()).collect::<Vec<_>>() }))
}

fn attendance_list_by_exam(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examTableId")?;
    list_attendance(
        conn,
        &format!(
            "SELECT {} FROM attendance WHERE exam_table_id = ? ORDER BY student_id",
            ATTENDANCE_COLUMNS
        ),
        &[&exam_id],
    )
}

fn attendance_list_by_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    list_attendance(
        conn,
        &format!(
            "SELECT {} FROM attendance WHERE student_id = ? ORDER BY recorded_at",
            ATTENDANCE_COLUMNS
        ),
        &[&student_id],
    )
}

fn attendance_list_all(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    list_attendance(
        conn,
        &format!(
            "SELECT {} FROM attendance ORDER BY recorded_at",
            ATTENDANCE_COLUMNS
        ),
        &[],
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let op = match req.method.as_str() {
        "attendance.record" => attendance_record,
        "attendance.get" => attendance_get,
        "attendance.listByExam" => attendance_list_by_exam,
        "attendance.listByStudent" => attendance_list_by_student,
        "attendance.listAll" => attendance_list_all,
        _ => return None,
    };
    Some(run(state, req, op))
}
