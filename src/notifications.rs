//! Portal notifications.
//!
//! A notification reaches a user when it is addressed to their role, to
//! everyone (`recipient_role = 'all'`), or to their email directly.
//! Clearing a shared row only hides it for the user who cleared it.

use crate::session::Role;
use rusqlite::{Connection, Row};
use serde::Serialize;
use uuid::Uuid;

pub const KINDS: [&str; 4] = ["info", "success", "warning", "error"];
pub const ALL_RECIPIENTS: &str = "all";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub recipient_role: Option<String>,
    pub recipient_id: Option<String>,
    pub student_id: Option<String>,
    pub read: bool,
    pub created_at: String,
}

pub fn visible_to(n: &Notification, role: Role, email: &str) -> bool {
    match n.recipient_role.as_deref() {
        Some(r) if r == role.as_str() || r == ALL_RECIPIENTS => return true,
        _ => {}
    }
    n.recipient_id
        .as_deref()
        .map(|id| id.eq_ignore_ascii_case(email))
        .unwrap_or(false)
}

/// SQL form of [`visible_to`] minus the caller's dismissals; binds
/// `?1` = role, `?2` = email.
const VISIBLE_WHERE: &str =
    "(recipient_role = ?1 OR recipient_role = 'all' OR lower(recipient_id) = lower(?2))
     AND id NOT IN (SELECT notification_id FROM notification_dismissals
                    WHERE user_email = lower(?2))";

fn from_row(r: &Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: r.get(0)?,
        title: r.get(1)?,
        message: r.get(2)?,
        kind: r.get(3)?,
        recipient_role: r.get(4)?,
        recipient_id: r.get(5)?,
        student_id: r.get(6)?,
        read: r.get::<_, i64>(7)? != 0,
        created_at: r.get(8)?,
    })
}

pub struct NewNotification<'a> {
    pub title: &'a str,
    pub message: &'a str,
    pub kind: &'a str,
    pub recipient_role: Option<&'a str>,
    pub recipient_id: Option<&'a str>,
    pub student_id: Option<&'a str>,
}

pub fn insert(conn: &Connection, n: &NewNotification<'_>, now: &str) -> rusqlite::Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO notifications(id, title, message, type, recipient_role, recipient_id,
                                   student_id, read, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 0, ?)",
        rusqlite::params![
            id,
            n.title,
            n.message,
            n.kind,
            n.recipient_role,
            n.recipient_id,
            n.student_id,
            now
        ],
    )?;
    Ok(id)
}

/// Newest first.
pub fn list_visible(conn: &Connection, role: Role, email: &str) -> rusqlite::Result<Vec<Notification>> {
    let sql = format!(
        "SELECT id, title, message, type, recipient_role, recipient_id, student_id, read, created_at
         FROM notifications
         WHERE {}
         ORDER BY created_at DESC, rowid DESC",
        VISIBLE_WHERE
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((role.as_str(), email), from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter(|n| visible_to(n, role, email))
        .collect())
}

/// Returns false when the notification does not exist or is not visible.
pub fn mark_read(conn: &Connection, id: &str, role: Role, email: &str) -> rusqlite::Result<bool> {
    let sql = format!(
        "UPDATE notifications SET read = 1 WHERE id = ?3 AND {}",
        VISIBLE_WHERE
    );
    Ok(conn.execute(&sql, (role.as_str(), email, id))? > 0)
}

pub fn mark_all_read(conn: &Connection, role: Role, email: &str) -> rusqlite::Result<usize> {
    let sql = format!(
        "UPDATE notifications SET read = 1 WHERE read = 0 AND {}",
        VISIBLE_WHERE
    );
    conn.execute(&sql, (role.as_str(), email))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Cleared {
    pub deleted: usize,
    pub dismissed: usize,
}

/// Unread notifications are never cleared. Read rows addressed only to the
/// caller are deleted; read rows that others can see are dismissed for the
/// caller alone.
pub fn clear_read(conn: &Connection, role: Role, email: &str) -> rusqlite::Result<Cleared> {
    let sql = format!(
        "INSERT OR IGNORE INTO notification_dismissals(notification_id, user_email, created_at)
         SELECT id, lower(?2), ?3 FROM notifications
         WHERE read = 1 AND recipient_role IS NOT NULL AND {}",
        VISIBLE_WHERE
    );
    let dismissed = conn.execute(&sql, (role.as_str(), email, crate::db::now_rfc3339()))?;
    let deleted = conn.execute(
        "DELETE FROM notifications
         WHERE read = 1 AND recipient_role IS NULL AND lower(recipient_id) = lower(?1)",
        [email],
    )?;
    Ok(Cleared { deleted, dismissed })
}

/// Drops dismissals whose notification no longer exists.
pub fn prune_dismissals(conn: &Connection) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM notification_dismissals
         WHERE notification_id NOT IN (SELECT id FROM notifications)",
        [],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(role: Option<&str>, id: Option<&str>) -> Notification {
        Notification {
            id: "n1".into(),
            title: "t".into(),
            message: "m".into(),
            kind: "info".into(),
            recipient_role: role.map(str::to_string),
            recipient_id: id.map(str::to_string),
            student_id: None,
            read: false,
            created_at: String::new(),
        }
    }

    #[test]
    fn visibility_by_role_broadcast_or_direct_address() {
        assert!(visible_to(&n(Some("teacher"), None), Role::Teacher, "t@uni.edu"));
        assert!(!visible_to(&n(Some("teacher"), None), Role::Student, "s@uni.edu"));
        assert!(visible_to(&n(Some("all"), None), Role::Student, "s@uni.edu"));
        assert!(visible_to(&n(None, Some("S@Uni.edu")), Role::Student, "s@uni.edu"));
        assert!(!visible_to(&n(Some("admin"), Some("x@uni.edu")), Role::Student, "s@uni.edu"));
        assert!(!visible_to(&n(None, None), Role::Admin, "a@uni.edu"));
    }

    #[test]
    fn kind_serializes_as_type() {
        let v = serde_json::to_value(n(Some("all"), None)).unwrap();
        assert_eq!(v["type"], "info");
        assert_eq!(v["recipientRole"], "all");
    }

    fn temp_conn() -> Connection {
        let ws = std::env::temp_dir().join(format!("portald-notif-{}", Uuid::new_v4()));
        crate::db::open_db(&ws).expect("open db")
    }

    fn send(conn: &Connection, title: &str, role: Option<&str>, id: Option<&str>) -> String {
        insert(
            conn,
            &NewNotification {
                title,
                message: "m",
                kind: "info",
                recipient_role: role,
                recipient_id: id,
                student_id: None,
            },
            &crate::db::now_rfc3339(),
        )
        .expect("insert")
    }

    fn titles(conn: &Connection, role: Role, email: &str) -> Vec<String> {
        list_visible(conn, role, email)
            .expect("list")
            .into_iter()
            .map(|n| n.title)
            .collect()
    }

    #[test]
    fn clearing_a_broadcast_hides_it_only_for_the_caller() {
        let conn = temp_conn();
        send(&conn, "Campus closed", Some("all"), None);
        send(&conn, "Fee reminder", None, Some("s@uni.edu"));
        let staff = send(&conn, "Staff meeting", Some("teacher"), None);

        assert_eq!(mark_all_read(&conn, Role::Student, "S@uni.edu").unwrap(), 2);
        let cleared = clear_read(&conn, Role::Student, "S@uni.edu").unwrap();
        assert_eq!(cleared, Cleared { deleted: 1, dismissed: 1 });
        assert!(titles(&conn, Role::Student, "s@uni.edu").is_empty());
        assert_eq!(
            clear_read(&conn, Role::Student, "s@uni.edu").unwrap(),
            Cleared { deleted: 0, dismissed: 0 }
        );

        // Other users still have the shared row.
        assert_eq!(
            titles(&conn, Role::Teacher, "t@uni.edu"),
            vec!["Staff meeting", "Campus closed"]
        );
        assert_eq!(titles(&conn, Role::Admin, "a@uni.edu"), vec!["Campus closed"]);
        assert!(!mark_read(&conn, &staff, Role::Student, "s@uni.edu").unwrap());

        conn.execute("DELETE FROM notifications", []).unwrap();
        assert_eq!(prune_dismissals(&conn).unwrap(), 1);
    }
}
