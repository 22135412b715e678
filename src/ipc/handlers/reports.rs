use crate::ipc::handlers::exams::get_exam;
use crate::ipc::helpers::{required_str, run, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::status::round2;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn reports_exam_statistics(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let total_exams: i64 = conn
        .query_row("SELECT COUNT(*) FROM exam_tables", [], |r| r.get(0))
        .map_err(HandlerErr::query)?;
    let (total_grades, score_sum): (i64, f64) = conn
        .query_row(
            "SELECT COUNT(*), COALESCE(SUM(score), 0) FROM grades",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(HandlerErr::query)?;
    let average_score = if total_grades > 0 {
        round2(score_sum / total_grades as f64)
    } else {
        0.0
    };

    Ok(json!({
        "totalExams": total_exams,
        "totalGrades": total_grades,
        "averageScore": average_score,
    }))
}

/// Labeled rows for the reservation certificate; the renderer consumes them
/// in the given order and adds no data of its own.
fn reports_reservation_certificate_model(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let reservation_id = required_str(params, "reservationId")?;
    let (exam_id, student_id, created_at): (String, String, String) = conn
        .query_row(
            "SELECT exam_table_id, student_id, created_at
             FROM reservations WHERE id = ? AND status = 'confirmed'",
            [&reservation_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("confirmed reservation not found"))?;

    let exam = get_exam(conn, &exam_id)?.ok_or_else(|| HandlerErr::not_found("exam not found"))?;
    let (name, surname, dni, email, course): (String, String, Option<String>, String, Option<String>) =
        conn.query_row(
            "SELECT name, surname, dni, email, course FROM users WHERE id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;

    let subject = exam
        .subject_name
        .clone()
        .unwrap_or_else(|| exam.subject_id.clone());
    let student_rows = vec![
        json!({ "label": "Nombre", "value": format!("{} {}", name, surname) }),
        json!({ "label": "DNI", "value": dni.unwrap_or_else(|| "N/A".to_string()) }),
        json!({ "label": "Email", "value": email }),
        json!({ "label": "Curso", "value": course.unwrap_or_else(|| "N/A".to_string()) }),
    ];
    let exam_rows = vec![
        json!({ "label": "Materia", "value": subject }),
        json!({ "label": "Fecha", "value": exam.date }),
        json!({ "label": "Horario", "value": format!("{} - {}", exam.start_time, exam.end_time) }),
        json!({ "label": "Aula", "value": exam.room }),
    ];

    Ok(json!({
        "title": "Comprobante de Reserva",
        "reservationId": reservation_id,
        "reservedAt": created_at,
        "student": student_rows,
        "exam": exam_rows,
    }))
}

fn reports_exam_roster_model(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examTableId")?;
    let exam = get_exam(conn, &exam_id)?.ok_or_else(|| HandlerErr::not_found("exam not found"))?;

    let mut stmt = conn
        .prepare(
            "SELECT u.surname, u.name, u.dni, g.score, g.observations, a.status
             FROM reservations r
             JOIN users u ON u.id = r.student_id
             LEFT JOIN grades g ON g.exam_table_id = r.exam_table_id AND g.student_id = r.student_id
             LEFT JOIN attendance a ON a.exam_table_id = r.exam_table_id AND a.student_id = r.student_id
             WHERE r.exam_table_id = ? AND r.status = 'confirmed'
             ORDER BY u.surname, u.name",
        )
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([&exam_id], |r| {
            let surname: String = r.get(0)?;
            let name: String = r.get(1)?;
            let dni: Option<String> = r.get(2)?;
            let score: Option<f64> = r.get(3)?;
            let observations: Option<String> = r.get(4)?;
            let att_status: Option<String> = r.get(5)?;
            Ok(json!([
                format!("{}, {}", surname, name),
                dni.unwrap_or_default(),
                score.map(|s| s.to_string()).unwrap_or_default(),
                observations.unwrap_or_default(),
                att_status.unwrap_or_default(),
            ]))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    Ok(json!({
        "title": "Acta de Mesa de Examen",
        "exam": exam.to_json(),
        "columns": ["Estudiante", "DNI", "Nota", "Observaciones", "Asistencia"],
        "rows": rows,
    }))
}

fn reports_grades_csv_export(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examTableId")?;
    if get_exam(conn, &exam_id)?.is_none() {
        return Err(HandlerErr::not_found("exam not found"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT student_id, score, observations, recorded_by, recorded_at
             FROM grades WHERE exam_table_id = ? ORDER BY student_id",
        )
        .map_err(HandlerErr::query)?;
    let lines = stmt
        .query_map([&exam_id], |r| {
            let student_id: String = r.get(0)?;
            let score: f64 = r.get(1)?;
            let observations: String = r.get(2)?;
            let recorded_by: String = r.get(3)?;
            let recorded_at: String = r.get(4)?;
            Ok(format!(
                "{},{},{},{},{}",
                csv_quote(&student_id),
                score,
                csv_quote(&observations),
                csv_quote(&recorded_by),
                csv_quote(&recorded_at),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut text = String::from("studentId,score,observations,recordedBy,recordedAt\n");
    for line in &lines {
        text.push_str(line);
        text.push('\n');
    }

    Ok(json!({ "examTableId": exam_id, "rowCount": lines.len(), "csv": text }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let op = match req.method.as_str() {
        "reports.examStatistics" => reports_exam_statistics,
        "reports.reservationCertificateModel" => reports_reservation_certificate_model,
        "reports.examRosterModel" => reports_exam_roster_model,
        "reports.gradesCsvExport" => reports_grades_csv_export,
        _ => return None,
    };
    Some(run(state, req, op))
}
