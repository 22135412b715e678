use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_portal() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_exambookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn exambookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value["error"]["code"]
        .as_str()
        .expect("error code")
        .to_string()
}

fn signup_params(uid: &str, email: &str) -> serde_json::Value {
    json!({
        "uid": uid,
        "email": email,
        "name": "Ana",
        "surname": "Gomez",
        "dni": "1234567",
        "course": "5° Año"
    })
}

#[test]
fn signup_is_gated_until_validated() {
    let workspace = temp_dir("exambook-user-gate");
    let (_child, mut stdin, mut reader) = spawn_portal();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.signup",
        signup_params("stu1", "stu1@school.test"),
    );
    assert_eq!(created["status"].as_str(), Some("pending"));
    assert_eq!(created["role"].as_str(), Some("student"));

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "3",
        "auth.sessionOpen",
        json!({ "uid": "stu1" }),
    );
    assert_eq!(code, "account_pending");

    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "users.validate",
        json!({ "uid": "stu1", "validatedBy": "admin1" }),
    );
    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "auth.sessionOpen",
        json!({ "uid": "stu1" }),
    );
    assert_eq!(opened["status"].as_str(), Some("validated"));
    assert_eq!(opened["validatedBy"].as_str(), Some("admin1"));
    assert!(opened["validatedAt"].as_str().is_some());
}

#[test]
fn rejected_and_deactivated_accounts_cannot_open_sessions() {
    let workspace = temp_dir("exambook-user-reject");
    let (_child, mut stdin, mut reader) = spawn_portal();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.signup",
        signup_params("stu2", "stu2@school.test"),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "users.reject",
        json!({ "uid": "stu2" }),
    );
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "4",
            "auth.sessionOpen",
            json!({ "uid": "stu2" })
        ),
        "account_rejected"
    );

    let staff = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "users.createStaff",
        json!({ "role": "teacher", "email": "prof@school.test", "name": "Luis", "surname": "Perez" }),
    );
    let teacher_uid = staff["uid"].as_str().expect("uid").to_string();
    // Staff accounts start validated and can open a session immediately.
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "auth.sessionOpen",
        json!({ "uid": teacher_uid }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "users.deactivate",
        json!({ "uid": teacher_uid }),
    );
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "8",
            "auth.sessionOpen",
            json!({ "uid": teacher_uid })
        ),
        "account_inactive"
    );
}

#[test]
fn duplicate_email_and_bad_dni_are_rejected() {
    let workspace = temp_dir("exambook-user-dupes");
    let (_child, mut stdin, mut reader) = spawn_portal();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.signup",
        signup_params("stu3", "taken@school.test"),
    );
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "3",
            "auth.signup",
            signup_params("stu4", "taken@school.test")
        ),
        "email_in_use"
    );

    let mut bad_dni = signup_params("stu5", "stu5@school.test");
    bad_dni["dni"] = json!("12AB");
    assert_eq!(
        request_err_code(&mut stdin, &mut reader, "4", "auth.signup", bad_dni),
        "bad_params"
    );

    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "5",
            "users.createStaff",
            json!({ "role": "admin", "email": "a@school.test", "name": "Ad", "surname": "Min" })
        ),
        "bad_params"
    );
}

#[test]
fn listing_filters_by_role_and_status() {
    let workspace = temp_dir("exambook-user-list");
    let (_child, mut stdin, mut reader) = spawn_portal();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.signup",
        signup_params("stu6", "stu6@school.test"),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.signup",
        signup_params("stu7", "stu7@school.test"),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "users.validate",
        json!({ "uid": "stu6", "validatedBy": "admin1" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "users.createStaff",
        json!({ "role": "preceptor", "email": "prec@school.test", "name": "Mia", "surname": "Ruiz" }),
    );

    let pending = request_ok(&mut stdin, &mut reader, "6", "users.listPending", json!({}));
    let pending_uids: Vec<&str> = pending["users"]
        .as_array()
        .expect("users array")
        .iter()
        .filter_map(|u| u["uid"].as_str())
        .collect();
    assert_eq!(pending_uids, vec!["stu7"]);

    let students = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "users.list",
        json!({ "role": "student", "status": "validated" }),
    );
    assert_eq!(students["users"].as_array().map(|a| a.len()), Some(1));

    let everyone = request_ok(&mut stdin, &mut reader, "8", "users.list", json!({}));
    assert_eq!(everyone["users"].as_array().map(|a| a.len()), Some(3));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "users.update",
        json!({ "uid": "stu6", "course": "6° Año", "surname": "Gomez Diaz" }),
    );
    assert_eq!(updated["course"].as_str(), Some("6° Año"));
    assert_eq!(updated["surname"].as_str(), Some("Gomez Diaz"));
}

#[test]
fn store_methods_require_a_workspace() {
    let (_child, mut stdin, mut reader) = spawn_portal();
    assert_eq!(
        request_err_code(&mut stdin, &mut reader, "1", "users.list", json!({})),
        "no_workspace"
    );
    assert_eq!(
        request_err_code(&mut stdin, &mut reader, "2", "exams.zap", json!({})),
        "not_implemented"
    );
}
