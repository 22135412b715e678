use crate::ipc::helpers::{
    now_ts, optional_str, required_str, run, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const ROLES: [&str; 4] = ["student", "teacher", "preceptor", "admin"];
const STATUSES: [&str; 4] = ["pending", "validated", "rejected", "inactive"];

struct UserRow {
    id: String,
    email: String,
    name: String,
    surname: String,
    role: String,
    status: String,
    dni: Option<String>,
    course: Option<String>,
    academic_year: Option<String>,
    previous_course: Option<String>,
    promoted_at: Option<String>,
    validated_by: Option<String>,
    validated_at: Option<String>,
    created_at: String,
    updated_at: String,
}

const USER_COLUMNS: &str = "id, email, name, surname, role, status, dni, course,
     academic_year, previous_course, promoted_at, validated_by, validated_at,
     created_at, updated_at";

fn row_to_user(r: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: r.get(0)?,
        email: r.get(1)?,
        name: r.get(2)?,
        surname: r.get(3)?,
        role: r.get(4)?,
        status: r.get(5)?,
        dni: r.get(6)?,
        course: r.get(7)?,
        academic_year: r.get(8)?,
        previous_course: r.get(9)?,
        promoted_at: r.get(10)?,
        validated_by: r.get(11)?,
        validated_at: r.get(12)?,
        created_at: r.get(13)?,
        updated_at: r.get(14)?,
    })
}

impl UserRow {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "uid": self.id,
            "email": self.email,
            "name": self.name,
            "surname": self.surname,
            "displayName": format!("{} {}", self.name, self.surname).trim().to_string(),
            "role": self.role,
            "status": self.status,
            "dni": self.dni,
            "course": self.course,
            "academicYear": self.academic_year,
            "previousCourse": self.previous_course,
            "promotedAt": self.promoted_at,
            "validatedBy": self.validated_by,
            "validatedAt": self.validated_at,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
        })
    }
}

fn get_user(conn: &Connection, uid: &str) -> Result<Option<UserRow>, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS),
        [uid],
        |r| row_to_user(r),
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn valid_dni(dni: &str) -> bool {
    (7..=8).contains(&dni.len()) && dni.chars().all(|c| c.is_ascii_digit())
}

fn map_user_insert_err(e: rusqlite::Error) -> HandlerErr {
    if let rusqlite::Error::SqliteFailure(_, Some(ref msg)) = e {
        if msg.contains("users.email") {
            return HandlerErr {
                code: "email_in_use",
                message: "email already registered".to_string(),
                details: None,
            };
        }
    }
    HandlerErr::update(e, "users")
}

fn auth_signup(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let uid = required_str(params, "uid")?;
    let email = required_str(params, "email")?;
    let name = required_str(params, "name")?;
    let surname = required_str(params, "surname")?;
    let dni = required_str(params, "dni")?;
    let course = required_str(params, "course")?;

    if !email.contains('@') {
        return Err(HandlerErr::bad_params("invalid email"));
    }
    if name.trim().len() < 2 || surname.trim().len() < 2 {
        return Err(HandlerErr::bad_params("name and surname need at least 2 characters"));
    }
    if !valid_dni(&dni) {
        return Err(HandlerErr::bad_params("dni must be 7-8 digits"));
    }

    let ts = now_ts();
    conn.execute(
        "INSERT INTO users(id, email, name, surname, role, status, dni, course, created_at, updated_at)
         VALUES(?, ?, ?, ?, 'student', 'pending', ?, ?, ?, ?)",
        (&uid, &email, &name, &surname, &dni, &course, &ts, &ts),
    )
    .map_err(map_user_insert_err)?;

    let user = get_user(conn, &uid)?.ok_or_else(|| HandlerErr::not_found("user not found"))?;
    Ok(user.to_json())
}

fn auth_session_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let uid = required_str(params, "uid")?;
    let user = get_user(conn, &uid)?.ok_or_else(|| HandlerErr::not_found("user not found"))?;

    match user.status.as_str() {
        "pending" => Err(HandlerErr {
            code: "account_pending",
            message: "account awaiting administrative validation".to_string(),
            details: None,
        }),
        "rejected" => Err(HandlerErr {
            code: "account_rejected",
            message: "registration request was rejected".to_string(),
            details: None,
        }),
        "inactive" => Err(HandlerErr {
            code: "account_inactive",
            message: "account has been deactivated".to_string(),
            details: None,
        }),
        _ => Ok(user.to_json()),
    }
}

fn users_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let role = optional_str(params, "role");
    let status = optional_str(params, "status");
    if let Some(ref r) = role {
        if !ROLES.contains(&r.as_str()) {
            return Err(HandlerErr::bad_params("unknown role"));
        }
    }
    if let Some(ref s) = status {
        if !STATUSES.contains(&s.as_str()) {
            return Err(HandlerErr::bad_params("unknown status"));
        }
    }

    let mut sql = format!("SELECT {} FROM users", USER_COLUMNS);
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<String> = Vec::new();
    if let Some(r) = role {
        clauses.push("role = ?");
        binds.push(r);
    }
    if let Some(s) = status {
        clauses.push("status = ?");
        binds.push(s);
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY surname, name");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let users = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| row_to_user(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    Ok(json!({ "users": users.iter().map(|u| u.to_json()).collect::<Vec<_>>() }))
}

fn users_list_pending(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    users_list(conn, &json!({ "status": "pending" }))
}

fn users_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let uid = required_str(params, "uid")?;
    let user = get_user(conn, &uid)?.ok_or_else(|| HandlerErr::not_found("user not found"))?;
    Ok(user.to_json())
}

fn users_create_staff(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let role = required_str(params, "role")?;
    let email = required_str(params, "email")?;
    let name = required_str(params, "name")?;
    let surname = required_str(params, "surname")?;

    if role != "teacher" && role != "preceptor" {
        return Err(HandlerErr::bad_params("role must be teacher or preceptor"));
    }
    if !email.contains('@') {
        return Err(HandlerErr::bad_params("invalid email"));
    }
    if name.trim().len() < 2 || surname.trim().len() < 2 {
        return Err(HandlerErr::bad_params("name and surname need at least 2 characters"));
    }

    let uid = format!("{}_{}", role, Uuid::new_v4());
    let ts = now_ts();
    conn.execute(
        "INSERT INTO users(id, email, name, surname, role, status, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 'validated', ?, ?)",
        (&uid, &email, &name, &surname, &role, &ts, &ts),
    )
    .map_err(map_user_insert_err)?;

    Ok(json!({ "uid": uid }))
}

fn users_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let uid = required_str(params, "uid")?;
    if get_user(conn, &uid)?.is_none() {
        return Err(HandlerErr::not_found("user not found"));
    }

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<String> = Vec::new();
    if let Some(v) = optional_str(params, "name") {
        sets.push("name = ?");
        binds.push(v);
    }
    if let Some(v) = optional_str(params, "surname") {
        sets.push("surname = ?");
        binds.push(v);
    }
    if let Some(v) = optional_str(params, "email") {
        if !v.contains('@') {
            return Err(HandlerErr::bad_params("invalid email"));
        }
        sets.push("email = ?");
        binds.push(v);
    }
    if let Some(v) = optional_str(params, "dni") {
        if !valid_dni(&v) {
            return Err(HandlerErr::bad_params("dni must be 7-8 digits"));
        }
        sets.push("dni = ?");
        binds.push(v);
    }
    if let Some(v) = optional_str(params, "course") {
        sets.push("course = ?");
        binds.push(v);
    }
    if sets.is_empty() {
        return Err(HandlerErr::bad_params("no updatable fields given"));
    }

    sets.push("updated_at = ?");
    binds.push(now_ts());
    binds.push(uid.clone());

    let sql = format!("UPDATE users SET {} WHERE id = ?", sets.join(", "));
    conn.execute(&sql, rusqlite::params_from_iter(binds.iter()))
        .map_err(map_user_insert_err)?;

    let user = get_user(conn, &uid)?.ok_or_else(|| HandlerErr::not_found("user not found"))?;
    Ok(user.to_json())
}

fn set_user_status(
    conn: &Connection,
    uid: &str,
    status: &str,
    validated_by: Option<&str>,
) -> Result<serde_json::Value, HandlerErr> {
    let ts = now_ts();
    let changed = if let Some(by) = validated_by {
        conn.execute(
            "UPDATE users SET status = ?, validated_by = ?, validated_at = ?, updated_at = ? WHERE id = ?",
            (status, by, &ts, &ts, uid),
        )
    } else {
        conn.execute(
            "UPDATE users SET status = ?, updated_at = ? WHERE id = ?",
            (status, &ts, uid),
        )
    }
    .map_err(|e| HandlerErr::update(e, "users"))?;

    if changed == 0 {
        return Err(HandlerErr::not_found("user not found"));
    }
    Ok(json!({ "uid": uid, "status": status }))
}

fn users_validate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let uid = required_str(params, "uid")?;
    let validated_by = required_str(params, "validatedBy")?;
    set_user_status(conn, &uid, "validated", Some(&validated_by))
}

fn users_reject(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let uid = required_str(params, "uid")?;
    set_user_status(conn, &uid, "rejected", None)
}

// Users are never hard-deleted; deactivation is a status transition.
fn users_deactivate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let uid = required_str(params, "uid")?;
    set_user_status(conn, &uid, "inactive", None)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let op = match req.method.as_str() {
        "auth.signup" => auth_signup,
        "auth.sessionOpen" => auth_session_open,
        "users.list" => users_list,
        "users.listPending" => users_list_pending,
        "users.get" => users_get,
        "users.createStaff" => users_create_staff,
        "users.update" => users_update,
        "users.validate" => users_validate,
        "users.reject" => users_reject,
        "users.deactivate" => users_deactivate,
        _ => return None,
    };
    Some(run(state, req, op))
}
