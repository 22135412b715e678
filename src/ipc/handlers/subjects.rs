use crate::ipc::helpers::{now_ts, optional_i64, optional_str, required_str, run, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn subject_json(
    id: String,
    name: String,
    code: Option<String>,
    year: Option<i64>,
    division: Option<String>,
    created_at: String,
) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "code": code,
        "year": year,
        "division": division,
        "createdAt": created_at,
    })
}

fn subjects_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let code = optional_str(params, "code");
    let year = optional_i64(params, "year");
    let division = optional_str(params, "division");
    if name.trim().is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }

    let id = format!("subject_{}", Uuid::new_v4());
    conn.execute(
        "INSERT INTO subjects(id, name, code, year, division, created_at) VALUES(?, ?, ?, ?, ?, ?)",
        (&id, name.trim(), &code, &year, &division, now_ts()),
    )
    .map_err(|e| HandlerErr::update(e, "subjects"))?;

    Ok(json!({ "subjectId": id }))
}

fn subjects_list(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name, code, year, division, created_at FROM subjects ORDER BY name")
        .map_err(HandlerErr::query)?;
    let subjects = stmt
        .query_map([], |r| {
            Ok(subject_json(
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "subjects": subjects }))
}

fn subjects_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "subjectId")?;
    conn.query_row(
        "SELECT id, name, code, year, division, created_at FROM subjects WHERE id = ?",
        [&id],
        |r| {
            Ok(subject_json(
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
            ))
        },
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("subject not found"))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let op = match req.method.as_str() {
        "subjects.create" => subjects_create,
        "subjects.list" => subjects_list,
        "subjects.get" => subjects_get,
        _ => return None,
    };
    Some(run(state, req, op))
}
