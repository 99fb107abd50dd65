#![allow(dead_code)]

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
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

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_datesyncd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn datesyncd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
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

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "expected ok response for {}: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(json!({}))
}

pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "expected error response for {}: {}",
        method,
        value
    );
    value.get("error").cloned().unwrap_or(json!({}))
}

/// Unix instant for a `YYYY-MM-DD` date and `HH:MM:SS` time, UTC, matching
/// how the engine combines policy times with calendar dates.
pub fn ts(date: &str, time: &str) -> i64 {
    let d = NaiveDate::parse_from_str(date, "%Y-%m-%d").expect("date");
    let t = NaiveTime::parse_from_str(time, "%H:%M:%S").expect("time");
    NaiveDateTime::new(d, t).and_utc().timestamp()
}

/// Opens the workspace store the sidecar created via workspace.select.
pub fn workspace_db(workspace: &Path) -> Connection {
    Connection::open(workspace.join("datesync.sqlite3")).expect("open workspace db")
}

/// Creates an external student-records database with the canonical
/// assessments and extensions tables.
pub fn create_external_db(path: &Path) -> Connection {
    let conn = Connection::open(path).expect("create external db");
    conn.execute_batch(
        "CREATE TABLE assessments(
            id INTEGER PRIMARY KEY,
            assessment_idcode TEXT,
            assessment_name TEXT,
            assessment_duedate TEXT,
            assessment_duetime TEXT,
            assessment_feedbackdate TEXT,
            assessment_feedbacktime TEXT,
            assessment_markscheme_code TEXT,
            assessment_changebymoodle INTEGER NOT NULL DEFAULT 0,
            assessment_changebydw INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE student_extensions(
            id INTEGER PRIMARY KEY,
            student_code TEXT,
            assessment_idcode TEXT,
            student_ext_duedate TEXT,
            student_ext_duetime TEXT,
            student_fbdue_date TEXT,
            student_fbdue_time TEXT,
            assessment_changebydw INTEGER NOT NULL DEFAULT 0
        );",
    )
    .expect("create external tables");
    conn
}

pub fn insert_assessment(
    conn: &Connection,
    idcode: &str,
    due_date: &str,
    due_time: &str,
    feedback_date: &str,
    feedback_time: &str,
) {
    conn.execute(
        "INSERT INTO assessments(
            assessment_idcode, assessment_name, assessment_duedate,
            assessment_duetime, assessment_feedbackdate, assessment_feedbacktime,
            assessment_markscheme_code)
         VALUES(?, ?, ?, ?, ?, ?, 'MS1')",
        (
            idcode,
            format!("Assessment {}", idcode),
            due_date,
            due_time,
            feedback_date,
            feedback_time,
        ),
    )
    .expect("insert assessment");
}

pub fn insert_extension(
    conn: &Connection,
    student_code: &str,
    idcode: &str,
    ext_due_date: &str,
    ext_due_time: &str,
) {
    conn.execute(
        "INSERT INTO student_extensions(
            student_code, assessment_idcode, student_ext_duedate,
            student_ext_duetime, student_fbdue_date, student_fbdue_time)
         VALUES(?, ?, ?, ?, '', '')",
        (student_code, idcode, ext_due_date, ext_due_time),
    )
    .expect("insert extension");
}

pub fn insert_assignment(
    conn: &Connection,
    id: &str,
    link_code: &str,
    due_at: i64,
    grading_due_at: Option<i64>,
) {
    conn.execute(
        "INSERT INTO assignments(id, course_id, link_code, name, due_at, grading_due_at, cutoff_at)
         VALUES(?, 'course-1', ?, ?, ?, ?, NULL)",
        (
            id,
            link_code,
            format!("Assignment {}", id),
            due_at,
            grading_due_at,
        ),
    )
    .expect("insert assignment");
}

pub fn insert_quiz(conn: &Connection, id: &str, link_code: &str, due_at: i64) {
    conn.execute(
        "INSERT INTO quizzes(id, course_id, link_code, name, due_at)
         VALUES(?, 'course-1', ?, ?, ?)",
        (id, link_code, format!("Quiz {}", id), due_at),
    )
    .expect("insert quiz");
}

pub fn insert_user(conn: &Connection, id: &str, username: &str) {
    conn.execute("INSERT INTO users(id, username) VALUES(?, ?)", (id, username))
        .expect("insert user");
}

/// Points the sidecar's datesync settings at the given external database.
pub fn configure_external(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    ext_path: &Path,
) {
    let _ = request_ok(
        stdin,
        reader,
        id,
        "setup.update",
        json!({
            "section": "datesync",
            "patch": {
                "dbType": "sqlite",
                "dbName": ext_path.to_string_lossy(),
                "assessmentsTable": "assessments",
                "extensionsTable": "student_extensions"
            }
        }),
    );
}
