use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};

pub const DB_FILE: &str = "portal.sqlite3";
pub const MATERIALS_DIR: &str = "materials";

/// Timestamp format used for every `*_at` column; sorts lexically.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn db_path(workspace: &Path) -> PathBuf {
    workspace.join(DB_FILE)
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    std::fs::create_dir_all(workspace.join(MATERIALS_DIR))?;
    let conn = Connection::open(db_path(workspace))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts(
            id TEXT PRIMARY KEY,
            role TEXT NOT NULL,
            username TEXT NOT NULL,
            email TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            department TEXT,
            phone_number TEXT,
            reset_code_hash TEXT,
            reset_expires_at TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(role, email)
        )",
        [],
    )?;
    ensure_accounts_reset_attempts(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_accounts_email ON accounts(email)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            sid TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            role TEXT NOT NULL,
            email TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            last_validated_at TEXT,
            FOREIGN KEY(account_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_account ON sessions(account_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS profiles(
            account_id TEXT PRIMARY KEY,
            bio TEXT,
            avatar_url TEXT,
            updated_at TEXT,
            FOREIGN KEY(account_id) REFERENCES accounts(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            roll_number TEXT NOT NULL,
            course TEXT NOT NULL,
            semester INTEGER NOT NULL,
            attendance INTEGER NOT NULL,
            behavior_score INTEGER NOT NULL,
            academic_score INTEGER NOT NULL DEFAULT 80,
            participation_score INTEGER NOT NULL DEFAULT 75,
            avatar_url TEXT,
            leaderboard_points INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    ensure_students_cgpa(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_course ON students(course)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS personality_traits(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL UNIQUE,
            openness INTEGER NOT NULL DEFAULT 70,
            conscientiousness INTEGER NOT NULL DEFAULT 70,
            extraversion INTEGER NOT NULL DEFAULT 70,
            agreeableness INTEGER NOT NULL DEFAULT 70,
            neuroticism INTEGER NOT NULL DEFAULT 50,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS behavioral_incidents(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            incident_date TEXT NOT NULL,
            type TEXT NOT NULL,
            description TEXT NOT NULL,
            severity TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_incidents_student ON behavioral_incidents(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_incidents_date ON behavioral_incidents(incident_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            type TEXT NOT NULL,
            recipient_role TEXT,
            recipient_id TEXT,
            student_id TEXT,
            read INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_role ON notifications(recipient_role)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_recipient ON notifications(recipient_id)",
        [],
    )?;
    // Shared rows a user cleared from their own list.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS notification_dismissals(
            notification_id TEXT NOT NULL,
            user_email TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY(notification_id, user_email)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teaching_materials(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            file_url TEXT NOT NULL,
            file_type TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            course TEXT,
            uploaded_by TEXT NOT NULL,
            shared_with_all INTEGER NOT NULL DEFAULT 0,
            shared_with_course TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    ensure_materials_sha256(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_materials_course ON teaching_materials(course)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_materials(
            id TEXT PRIMARY KEY,
            material_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(material_id) REFERENCES teaching_materials(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(material_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_materials_student ON student_materials(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS calendar_events(
            id TEXT PRIMARY KEY,
            owner_email TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            course TEXT,
            color TEXT NOT NULL,
            event_date TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_calendar_owner_date ON calendar_events(owner_email, event_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS todos(
            id TEXT PRIMARY KEY,
            owner_email TEXT NOT NULL,
            title TEXT NOT NULL,
            due_date TEXT,
            course TEXT,
            color TEXT NOT NULL,
            completed INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_todos_owner ON todos(owner_email)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

// Workspaces created before cgpa tracking lack the column.
fn ensure_students_cgpa(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "cgpa")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN cgpa REAL", [])?;
    Ok(())
}

fn ensure_accounts_reset_attempts(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "accounts", "reset_attempts")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE accounts ADD COLUMN reset_attempts INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn ensure_materials_sha256(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "teaching_materials", "sha256")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE teaching_materials ADD COLUMN sha256 TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, text),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_workspace(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ))
    }

    #[test]
    fn open_db_is_idempotent_and_creates_material_store() {
        let ws = temp_workspace("portald-db-open");
        let conn = open_db(&ws).expect("first open");
        drop(conn);
        let conn = open_db(&ws).expect("second open");
        assert!(ws.join(MATERIALS_DIR).is_dir());
        assert!(table_has_column(&conn, "students", "cgpa").expect("pragma"));
        assert!(table_has_column(&conn, "teaching_materials", "sha256").expect("pragma"));
        assert!(table_has_column(&conn, "accounts", "reset_attempts").expect("pragma"));
    }

    #[test]
    fn settings_roundtrip_overwrites_existing_key() {
        let ws = temp_workspace("portald-db-settings");
        let conn = open_db(&ws).expect("open");
        assert!(settings_get_json(&conn, "portal.config").expect("get").is_none());
        settings_set_json(&conn, "portal.config", &json!({ "a": 1 })).expect("set");
        settings_set_json(&conn, "portal.config", &json!({ "a": 2 })).expect("set again");
        let v = settings_get_json(&conn, "portal.config").expect("get").expect("some");
        assert_eq!(v["a"], 2);
    }
}
