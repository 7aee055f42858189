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

fn names(list: &serde_json::Value) -> Vec<String> {
    list.as_array()
        .expect("array")
        .iter()
        .filter_map(|s| s["name"].as_str().map(str::to_string))
        .collect()
}

#[test]
fn roster_reports_and_leaderboard() {
    let workspace = temp_dir("portald-reports");
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

    let mut ids = Vec::new();
    for (i, (name, email, roll, course, att, beh, points)) in [
        ("Asha", "asha@uni.edu", "BCA001", "BCA", 90, 80, Some(120)),
        ("Ben", "ben@uni.edu", "BCA002", "BCA", 60, 90, Some(80)),
        ("Cara", "cara@uni.edu", "MBA001", "MBA", 84, 64, None),
    ]
    .into_iter()
    .enumerate()
    {
        let mut body = json!({
            "name": name,
            "email": email,
            "rollNumber": roll,
            "course": course,
            "semester": 4,
            "attendance": att,
            "behaviorScore": beh
        });
        if let Some(p) = points {
            body["leaderboardPoints"] = json!(p);
        }
        let res = request_ok(&mut stdin, &mut reader, &format!("s{}", i), "students.create", body);
        ids.push(res["studentId"].as_str().expect("studentId").to_string());
    }
    let (asha, ben, cara) = (ids[0].clone(), ids[1].clone(), ids[2].clone());

    let missing = request(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "name": "Dev", "email": "dev@uni.edu", "rollNumber": "X1", "course": "BCA", "semester": 1, "attendance": 70 }),
    );
    assert_eq!(error_code(&missing), "bad_params");
    let semester = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.create",
        json!({ "name": "Dev", "email": "dev@uni.edu", "rollNumber": "X1", "course": "BCA", "semester": 13, "attendance": 70, "behaviorScore": 70 }),
    );
    assert_eq!(error_code(&semester), "bad_params");
    let dup = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.create",
        json!({ "name": "Asha Two", "email": "ASHA@uni.edu", "rollNumber": "BCA099", "course": "BCA", "semester": 1, "attendance": 70, "behaviorScore": 70 }),
    );
    assert_eq!(error_code(&dup), "conflict");

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.list",
        json!({ "sortField": "attendance", "sortDirection": "desc" }),
    );
    assert_eq!(names(&listed["students"]), vec!["Asha", "Cara", "Ben"]);
    assert_eq!(listed["total"].as_i64(), Some(3));
    let listed = request_ok(&mut stdin, &mut reader, "8", "students.list", json!({ "search": "be" }));
    assert_eq!(names(&listed["students"]), vec!["Ben"]);
    let listed = request_ok(&mut stdin, &mut reader, "9", "students.list", json!({ "course": "MBA" }));
    assert_eq!(names(&listed["students"]), vec!["Cara"]);
    let bad_sort = request(&mut stdin, &mut reader, "10", "students.list", json!({ "sortField": "shoeSize" }));
    assert_eq!(error_code(&bad_sort), "bad_params");

    let courses = request_ok(&mut stdin, &mut reader, "11", "students.courses", json!({}));
    assert_eq!(courses["courses"], json!(["BCA", "MBA"]));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "students.update",
        json!({ "studentId": cara, "patch": { "leaderboardPoints": 150 } }),
    );
    assert_eq!(updated["student"]["leaderboardPoints"].as_i64(), Some(150));
    assert_eq!(updated["student"]["attendance"].as_i64(), Some(84));
    let clash = request(
        &mut stdin,
        &mut reader,
        "13",
        "students.update",
        json!({ "studentId": cara, "patch": { "email": "ben@uni.edu" } }),
    );
    assert_eq!(error_code(&clash), "conflict");
    let unknown = request(
        &mut stdin,
        &mut reader,
        "14",
        "students.update",
        json!({ "studentId": cara, "patch": { "nickname": "C" } }),
    );
    assert_eq!(error_code(&unknown), "bad_params");

    let traits = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "traits.update",
        json!({ "studentId": asha, "patch": { "openness": 85 } }),
    );
    assert_eq!(traits["traits"]["openness"].as_i64(), Some(85));
    assert_eq!(traits["traits"]["neuroticism"].as_i64(), Some(50));
    let bad_trait = request(
        &mut stdin,
        &mut reader,
        "16",
        "traits.update",
        json!({ "studentId": asha, "patch": { "charisma": 3 } }),
    );
    assert_eq!(error_code(&bad_trait), "bad_params");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "incidents.create",
        json!({ "studentId": ben, "type": "Disruption", "description": "left lab early", "severity": "Major" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "incidents.create",
        json!({
            "studentId": asha,
            "type": "Late",
            "description": "late to exam",
            "severity": "Minor",
            "incidentDate": "2000-01-15"
        }),
    );
    let bad_date = request(
        &mut stdin,
        &mut reader,
        "19",
        "incidents.create",
        json!({ "studentId": asha, "type": "Late", "description": "x", "severity": "Minor", "incidentDate": "15/01/2000" }),
    );
    assert_eq!(error_code(&bad_date), "bad_params");
    let ghost = request(
        &mut stdin,
        &mut reader,
        "20",
        "incidents.create",
        json!({ "studentId": "ghost", "type": "Late", "description": "x", "severity": "Minor" }),
    );
    assert_eq!(error_code(&ghost), "not_found");

    let week = request_ok(&mut stdin, &mut reader, "21", "incidents.list", json!({ "period": "week" }));
    let rows = week["incidents"].as_array().expect("incidents");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["studentName"].as_str(), Some("Ben"));
    assert_eq!(rows[0]["action"].as_str(), Some("Counselor referral"));
    let all_time = request_ok(
        &mut stdin,
        &mut reader,
        "22",
        "incidents.list",
        json!({ "period": "custom", "customDate": "1999-12-01" }),
    );
    assert_eq!(all_time["incidents"].as_array().map(|a| a.len()), Some(2));
    assert_eq!(all_time["incidents"][1]["action"].as_str(), Some("Verbal warning"));

    let overview = request_ok(&mut stdin, &mut reader, "23", "reports.overview", json!({ "period": "week" }));
    assert_eq!(
        overview["overview"],
        json!({ "totalStudents": 3, "averageAttendance": 78, "averageBehavior": 78, "totalIncidents": 1 })
    );
    let one = request_ok(
        &mut stdin,
        &mut reader,
        "24",
        "reports.overview",
        json!({ "studentId": asha, "period": "custom", "customDate": "1999-12-01" }),
    );
    assert_eq!(
        one["overview"],
        json!({ "totalStudents": 1, "averageAttendance": 90, "averageBehavior": 80, "totalIncidents": 1 })
    );

    let perf = request_ok(&mut stdin, &mut reader, "25", "reports.performance", json!({}));
    assert_eq!(perf["studentCount"].as_i64(), Some(3));
    assert_eq!(perf["metrics"][0], json!({ "name": "On-Time Attendance", "value": 78 }));
    assert_eq!(perf["metrics"][1], json!({ "name": "Class Participation", "value": 75 }));

    let summary = request_ok(&mut stdin, &mut reader, "26", "reports.adminSummary", json!({}));
    assert_eq!(summary["summary"]["atRiskCount"].as_i64(), Some(2));
    assert_eq!(summary["summary"]["incidentCount"].as_i64(), Some(2));
    assert_eq!(summary["summary"]["courses"], json!(["BCA", "MBA"]));
    let at_risk = summary["atRiskStudentIds"].as_array().expect("ids");
    assert!(at_risk.contains(&json!(ben)));
    assert!(at_risk.contains(&json!(cara)));

    let top = request_ok(&mut stdin, &mut reader, "27", "leaderboard.top", json!({ "limit": 2 }));
    let entries = top["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["name"].as_str(), Some("Cara"));
    assert_eq!(entries[0]["rank"].as_i64(), Some(1));
    assert_eq!(entries[1]["points"].as_i64(), Some(120));
    let board = request_ok(&mut stdin, &mut reader, "28", "leaderboard.summary", json!({}));
    assert_eq!(
        board,
        json!({ "topPoints": 150, "totalPoints": 350, "averagePoints": 117, "participantCount": 3 })
    );

    let _ = request_ok(&mut stdin, &mut reader, "29", "students.delete", json!({ "studentId": ben }));
    let gone = request(&mut stdin, &mut reader, "30", "students.get", json!({ "studentId": ben }));
    assert_eq!(error_code(&gone), "not_found");
    let all_time = request_ok(
        &mut stdin,
        &mut reader,
        "31",
        "incidents.list",
        json!({ "period": "custom", "customDate": "1999-12-01" }),
    );
    assert_eq!(all_time["incidents"].as_array().map(|a| a.len()), Some(1));

    let detail = request_ok(&mut stdin, &mut reader, "32", "students.get", json!({ "studentId": asha }));
    assert_eq!(detail["student"]["academicScore"].as_i64(), Some(80));
    assert_eq!(detail["traits"]["openness"].as_i64(), Some(85));
    assert_eq!(detail["incidents"].as_array().map(|a| a.len()), Some(1));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "33",
        "accounts.create",
        json!({ "role": "student", "username": "Asha", "email": "asha@uni.edu", "password": "asha-pass" }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "34", "auth.logout", json!({}));
    let login = request_ok(
        &mut stdin,
        &mut reader,
        "35",
        "auth.login",
        json!({ "email": "asha@uni.edu", "password": "asha-pass", "role": "student" }),
    );
    assert_eq!(login["cookie"]["studentData"]["rollNumber"].as_str(), Some("BCA001"));

    let me = request_ok(&mut stdin, &mut reader, "36", "students.me", json!({}));
    assert_eq!(me["student"]["id"].as_str(), Some(asha.as_str()));
    let other = request(&mut stdin, &mut reader, "37", "students.get", json!({ "studentId": cara }));
    assert_eq!(error_code(&other), "forbidden");
    let listing = request(&mut stdin, &mut reader, "38", "students.list", json!({}));
    assert_eq!(error_code(&listing), "forbidden");
    let own = request_ok(&mut stdin, &mut reader, "39", "reports.overview", json!({ "studentId": cara }));
    assert_eq!(own["overview"]["totalStudents"].as_i64(), Some(1));
    assert_eq!(own["overview"]["averageAttendance"].as_i64(), Some(90));
    let _ = request_ok(&mut stdin, &mut reader, "40", "leaderboard.top", json!({}));
    let board = request(&mut stdin, &mut reader, "41", "leaderboard.summary", json!({}));
    assert_eq!(error_code(&board), "forbidden");

    drop(stdin);
    let _ = child.wait();
}
