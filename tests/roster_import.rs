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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_portald");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn portald");
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
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

#[test]
fn csv_roster_creates_students_and_logins() {
    let workspace = temp_dir("portald-roster");
    let first = workspace.join("roster-v1.csv");
    std::fs::write(
        &first,
        "name,email,roll_number,course,semester,attendance,behavior_score\n\
         Asha Rao,asha@uni.edu,BCA001,BCA,3,92,88\n\
         Broken Row,broken@uni.edu,BCA002,,3,90,80\n\
         Ben  Das,ben@uni.edu,BCA003,BCA,3,70,75\n",
    )
    .expect("write roster v1");
    let second = workspace.join("roster-v2.csv");
    std::fs::write(
        &second,
        "Name,Email,Roll_Number,Course,Semester,Attendance,Behavior_Score,Leaderboard_Points\n\
         Asha Rao,ASHA@uni.edu,BCA001,BCA,3,50,88,40\n\
         Ben  Das,ben@uni.edu,BCA003,BCA,4,70,75,\n",
    )
    .expect("write roster v2");
    let empty = workspace.join("empty.csv");
    std::fs::write(&empty, "").expect("write empty csv");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "accounts.create",
        json!({ "role": "admin", "username": "Admin", "email": "admin@uni.edu", "password": "admin-pass" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.login",
        json!({ "email": "admin@uni.edu", "password": "admin-pass", "role": "admin" }),
    );

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "roster.importStudents",
        json!({ "path": first.to_string_lossy() }),
    );
    assert_eq!(
        summary,
        json!({ "inserted": 2, "updated": 0, "accountsCreated": 2, "skipped": [2] })
    );

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "roster.importStudents",
        json!({ "path": second.to_string_lossy() }),
    );
    assert_eq!(
        summary,
        json!({ "inserted": 0, "updated": 2, "accountsCreated": 0, "skipped": [] })
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.list",
        json!({ "search": "asha" }),
    );
    assert_eq!(listed["students"][0]["attendance"].as_i64(), Some(50));
    assert_eq!(listed["students"][0]["leaderboardPoints"].as_i64(), Some(40));

    let missing = request(
        &mut stdin,
        &mut reader,
        "7",
        "roster.importStudents",
        json!({ "path": workspace.join("nope.csv").to_string_lossy() }),
    );
    assert_eq!(error_code(&missing), "io_failed");
    let headless = request(
        &mut stdin,
        &mut reader,
        "8",
        "roster.importStudents",
        json!({ "path": empty.to_string_lossy() }),
    );
    assert_eq!(error_code(&headless), "import_failed");

    let users = workspace.join("users.csv");
    std::fs::write(
        &users,
        "username,password,email\n\
         kiran,kiran-pass,kiran@uni.edu\n\
         nopass,,nopass@uni.edu\n",
    )
    .expect("write users csv");
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "roster.importUsers",
        json!({ "path": users.to_string_lossy() }),
    );
    assert_eq!(summary["inserted"].as_i64(), Some(1));
    assert_eq!(summary["skipped"], json!([2]));

    let bulk = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "accounts.bulkUpsert",
        json!({ "users": [
            { "username": "kiran", "password": "kiran-pass-2", "email": "kiran@uni.edu" },
            { "username": "lena", "password": "lena-pass", "email": "lena@uni.edu" },
            { "username": "half" }
        ] }),
    );
    assert_eq!(bulk["inserted"].as_i64(), Some(1));
    assert_eq!(bulk["updated"].as_i64(), Some(1));
    assert_eq!(bulk["skipped"], json!([3]));

    let _ = request_ok(&mut stdin, &mut reader, "11", "auth.logout", json!({}));

    // Imported students sign in with the roll-number password.
    let login = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "auth.login",
        json!({ "email": "ben@uni.edu", "password": "BCA003@123", "role": "student" }),
    );
    assert_eq!(login["cookie"]["name"].as_str(), Some("ben_das"));
    assert_eq!(login["cookie"]["studentData"]["semester"].as_i64(), Some(4));

    let denied = request(
        &mut stdin,
        &mut reader,
        "13",
        "roster.importStudents",
        json!({ "path": first.to_string_lossy() }),
    );
    assert_eq!(error_code(&denied), "forbidden");

    let _ = request_ok(&mut stdin, &mut reader, "14", "auth.logout", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "auth.login",
        json!({ "email": "kiran@uni.edu", "password": "kiran-pass-2", "role": "student" }),
    );

    drop(stdin);
    let _ = child.wait();
}
