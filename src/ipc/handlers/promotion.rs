use crate::ipc::helpers::{now_ts, optional_str, required_str, run, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::status::round2;
use rusqlite::Connection;
use serde_json::json;

const COURSES: [&str; 6] = [
    "1° Año", "2° Año", "3° Año", "4° Año", "5° Año", "6° Año",
];
const GRADUATED: &str = "Egresado";
const PROMOTION_MIN_AVERAGE: f64 = 6.0;

fn next_course(current: &str) -> &'static str {
    match COURSES.iter().position(|c| *c == current) {
        Some(i) if i + 1 < COURSES.len() => COURSES[i + 1],
        _ => GRADUATED,
    }
}

fn student_average(conn: &Connection, student_id: &str) -> Result<(f64, i64), HandlerErr> {
    let (sum, count): (f64, i64) = conn
        .query_row(
            "SELECT COALESCE(SUM(score), 0), COUNT(*) FROM grades WHERE student_id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(HandlerErr::query)?;
    if count == 0 {
        return Ok((0.0, 0));
    }
    Ok((round2(sum / count as f64), count))
}

fn promotion_student_average(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let (average, count) = student_average(conn, &student_id)?;
    Ok(json!({ "studentId": student_id, "average": average, "gradeCount": count }))
}

fn promotion_promote_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let new_course = required_str(params, "newCourse")?;
    let academic_year = required_str(params, "academicYear")?;

    let ts = now_ts();
    let changed = conn
        .execute(
            "UPDATE users SET previous_course = course, course = ?, academic_year = ?,
                 promoted_at = ?, updated_at = ?
             WHERE id = ? AND role = 'student'",
            (&new_course, &academic_year, &ts, &ts, &student_id),
        )
        .map_err(|e| HandlerErr::update(e, "users"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("student not found"));
    }
    Ok(json!({ "studentId": student_id, "course": new_course }))
}

/// Promote a whole course in one transaction. Automatic mode promotes only
/// students whose grade average reaches the minimum; manual mode promotes
/// exactly the selected ids.
fn promotion_promote_course(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let current_course = required_str(params, "currentCourse")?;
    let academic_year = required_str(params, "academicYear")?;
    let mode = optional_str(params, "mode").unwrap_or_else(|| "automatic".to_string());
    if mode != "automatic" && mode != "manual" {
        return Err(HandlerErr::bad_params("mode must be automatic or manual"));
    }
    let selected: Vec<String> = params
        .get("selectedStudentIds")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    if mode == "manual" && selected.is_empty() {
        return Err(HandlerErr::bad_params("manual mode needs selectedStudentIds"));
    }

    let target = next_course(&current_course);
    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;

    let student_ids: Vec<String> = {
        let mut stmt = tx
            .prepare(
                "SELECT id FROM users
                 WHERE role = 'student' AND status = 'validated' AND course = ?
                 ORDER BY surname, name",
            )
            .map_err(HandlerErr::query)?;
        stmt.query_map([&current_course], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?
    };

    let mut promoted = 0i64;
    let mut failed = 0i64;
    let ts = now_ts();
    for student_id in student_ids {
        if mode == "manual" && !selected.contains(&student_id) {
            continue;
        }
        if mode == "automatic" {
            let (average, _) = student_average(&tx, &student_id)?;
            if average < PROMOTION_MIN_AVERAGE {
                failed += 1;
                continue;
            }
        }
        tx.execute(
            "UPDATE users SET previous_course = course, course = ?, academic_year = ?,
                 promoted_at = ?, updated_at = ?
             WHERE id = ?",
            (target, &academic_year, &ts, &ts, &student_id),
        )
        .map_err(|e| HandlerErr::update(e, "users"))?;
        promoted += 1;
    }

    tx.commit().map_err(HandlerErr::commit)?;
    Ok(json!({ "promoted": promoted, "failed": failed, "nextCourse": target }))
}

fn promotion_list_by_course(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course = required_str(params, "course")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, name, surname, dni, course, academic_year
             FROM users
             WHERE role = 'student' AND status = 'validated' AND course = ?
             ORDER BY surname, name",
        )
        .map_err(HandlerErr::query)?;
    let students = stmt
        .query_map([&course], |r| {
            Ok(json!({
                "uid": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "surname": r.get::<_, String>(2)?,
                "dni": r.get::<_, Option<String>>(3)?,
                "course": r.get::<_, Option<String>>(4)?,
                "academicYear": r.get::<_, Option<String>>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let op = match req.method.as_str() {
        "promotion.studentAverage" => promotion_student_average,
        "promotion.promoteStudent" => promotion_promote_student,
        "promotion.promoteCourse" => promotion_promote_course,
        "promotion.listByCourse" => promotion_list_by_course,
        _ => return None,
    };
    Some(run(state, req, op))
}
