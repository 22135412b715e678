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

fn day_offset(days: i64) -> String {
    (chrono::Local::now().date_naive() + chrono::Duration::days(days))
        .format("%Y-%m-%d")
        .to_string()
}

fn create_exam(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    date: &str,
    start: &str,
    end: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "exams.create",
        json!({
            "subjectId": "math5",
            "subjectName": "Matemática",
            "teacherId": "teacher_1",
            "date": date,
            "startTime": start,
            "endTime": end,
            "room": "Aula 3",
            "maxStudents": 30
        }),
    );
    created["examTableId"].as_str().expect("exam id").to_string()
}

#[test]
fn status_is_derived_from_the_clock() {
    let workspace = temp_dir("exambook-status");
    let (_child, mut stdin, mut reader) = spawn_portal();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let past = create_exam(&mut stdin, &mut reader, "2", &day_offset(-1), "08:00", "10:00");
    let running = create_exam(&mut stdin, &mut reader, "3", &day_offset(0), "00:00", "23:59");
    let upcoming = create_exam(&mut stdin, &mut reader, "4", &day_offset(1), "08:00", "10:00");

    for (rid, exam_id, expected) in [
        ("5", &past, "completed"),
        ("6", &running, "in_progress"),
        ("7", &upcoming, "scheduled"),
    ] {
        let exam = request_ok(
            &mut stdin,
            &mut reader,
            rid,
            "exams.get",
            json!({ "examTableId": exam_id }),
        );
        assert_eq!(exam["status"].as_str(), Some(expected), "exam {}", exam_id);
    }
}

#[test]
fn cancellation_is_sticky_and_hides_the_exam_from_open_listings() {
    let workspace = temp_dir("exambook-cancel");
    let (_child, mut stdin, mut reader) = spawn_portal();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let past = create_exam(&mut stdin, &mut reader, "2", &day_offset(-1), "08:00", "10:00");
    let upcoming = create_exam(&mut stdin, &mut reader, "3", &day_offset(1), "08:00", "10:00");
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "exams.cancel",
        json!({ "examTableId": upcoming }),
    );

    let cancelled = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "exams.get",
        json!({ "examTableId": upcoming }),
    );
    assert_eq!(cancelled["status"].as_str(), Some("cancelled"));

    // Neither the finished nor the cancelled exam is open for reservation.
    let available = request_ok(&mut stdin, &mut reader, "6", "exams.listAvailable", json!({}));
    assert_eq!(available["exams"].as_array().map(|a| a.len()), Some(0));

    let all = request_ok(&mut stdin, &mut reader, "7", "exams.list", json!({}));
    assert_eq!(all["exams"].as_array().map(|a| a.len()), Some(2));
    let _ = past;
}

#[test]
fn updates_keep_the_window_valid_and_bump_updated_at() {
    let workspace = temp_dir("exambook-update");
    let (_child, mut stdin, mut reader) = spawn_portal();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let exam_id = create_exam(&mut stdin, &mut reader, "2", &day_offset(1), "08:00", "10:00");
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "exams.update",
        json!({ "examTableId": exam_id, "room": "Aula 7", "maxStudents": 12 }),
    );
    assert_eq!(updated["room"].as_str(), Some("Aula 7"));
    assert_eq!(updated["maxStudents"].as_i64(), Some(12));
    assert_eq!(updated["startTime"].as_str(), Some("08:00"));

    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "4",
            "exams.update",
            json!({ "examTableId": exam_id, "startTime": "8am" })
        ),
        "bad_params"
    );
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "5",
            "exams.get",
            json!({ "examTableId": "exam_missing" })
        ),
        "not_found"
    );
}

#[test]
fn teacher_listing_only_returns_that_teachers_exams() {
    let workspace = temp_dir("exambook-teacher-list");
    let (_child, mut stdin, mut reader) = spawn_portal();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    create_exam(&mut stdin, &mut reader, "2", &day_offset(1), "08:00", "10:00");
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "exams.create",
        json!({
            "subjectId": "hist4",
            "subjectName": "Historia",
            "teacherId": "teacher_2",
            "date": day_offset(2),
            "startTime": "10:00",
            "endTime": "12:00",
            "room": "Aula 1"
        }),
    );

    let mine = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "exams.listByTeacher",
        json!({ "teacherId": "teacher_2" }),
    );
    let exams = mine["exams"].as_array().expect("exams array");
    assert_eq!(exams.len(), 1);
    assert_eq!(exams[0]["subjectName"].as_str(), Some("Historia"));
    assert_eq!(exams[0]["maxStudents"].as_i64(), Some(30));
}
