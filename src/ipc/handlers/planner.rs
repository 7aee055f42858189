use crate::db;
use crate::ipc::helpers::{
    db_err, get_opt_str, get_required_str, require_db, require_session, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::json;
use uuid::Uuid;

const DEFAULT_EVENT_COLOR: &str = "#4285F4";
const DEFAULT_TODO_COLOR: &str = "#000000";

fn parse_date(raw: &str, key: &str) -> Result<String, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

fn opt_date(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    get_opt_str(params, key)
        .map(|d| parse_date(&d, key))
        .transpose()
}

fn today() -> String {
    Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

fn owner(state: &AppState) -> Result<(&Connection, String), HandlerErr> {
    let conn = require_db(state)?;
    let cookie = require_session(state)?;
    Ok((conn, cookie.email.to_lowercase()))
}

const EVENT_COLUMNS: &str = "id, title, description, course, color, event_date, created_at";

fn event_json(r: &Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "title": r.get::<_, String>(1)?,
        "description": r.get::<_, Option<String>>(2)?,
        "course": r.get::<_, Option<String>>(3)?,
        "color": r.get::<_, String>(4)?,
        "date": r.get::<_, String>(5)?,
        "createdAt": r.get::<_, String>(6)?,
    }))
}

fn handle_calendar_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let (conn, email) = owner(state)?;
    let date = opt_date(&req.params, "date")?;
    let sql = format!(
        "SELECT {} FROM calendar_events
         WHERE owner_email = ?1 AND (?2 IS NULL OR event_date = ?2)
         ORDER BY event_date, created_at",
        EVENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(db_err("db_query_failed"))?;
    let events = stmt
        .query_map(params![email, date], event_json)
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "events": events }))
}

fn handle_calendar_upcoming(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let (conn, email) = owner(state)?;
    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_i64())
        .filter(|n| *n > 0)
        .unwrap_or(20);
    let sql = format!(
        "SELECT {} FROM calendar_events
         WHERE owner_email = ? AND event_date >= ?
         ORDER BY event_date, created_at
         LIMIT ?",
        EVENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(db_err("db_query_failed"))?;
    let events = stmt
        .query_map(params![email, today(), limit], event_json)
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "events": events }))
}

fn handle_calendar_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let (conn, email) = owner(state)?;
    let title = get_required_str(&req.params, "title")?;
    let date = parse_date(&get_required_str(&req.params, "date")?, "date")?;
    let color = get_opt_str(&req.params, "color").unwrap_or_else(|| DEFAULT_EVENT_COLOR.to_string());
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO calendar_events(id, owner_email, title, description, course, color, event_date, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            email,
            title,
            get_opt_str(&req.params, "description"),
            get_opt_str(&req.params, "course"),
            color,
            date,
            db::now_rfc3339()
        ],
    )
    .map_err(db_err("db_insert_failed"))?;
    Ok(json!({ "eventId": id }))
}

fn handle_calendar_update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let (conn, email) = owner(state)?;
    let event_id = get_required_str(&req.params, "eventId")?;
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing patch"));
    };

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM calendar_events WHERE id = ? AND owner_email = ?",
            (&event_id, &email),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("event not found"));
    }

    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<Option<String>> = Vec::new();
    for (k, v) in patch {
        let text = match v {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            _ => return Err(HandlerErr::bad_params(format!("{} must be a string", k))),
        };
        let (set, required) = match k.as_str() {
            "title" => ("title = ?", true),
            "color" => ("color = ?", true),
            "date" => ("event_date = ?", true),
            "description" => ("description = ?", false),
            "course" => ("course = ?", false),
            other => return Err(HandlerErr::bad_params(format!("unknown event field: {}", other))),
        };
        if required && text.is_none() {
            return Err(HandlerErr::bad_params(format!("{} must not be empty", k)));
        }
        let text = match (k.as_str(), text) {
            ("date", Some(d)) => Some(parse_date(&d, "date")?),
            (_, t) => t,
        };
        sets.push(set);
        values.push(text);
    }
    if sets.is_empty() {
        return Ok(json!({ "updated": false }));
    }

    let sql = format!("UPDATE calendar_events SET {} WHERE id = ?", sets.join(", "));
    values.push(Some(event_id));
    conn.execute(&sql, rusqlite::params_from_iter(values.iter()))
        .map_err(db_err("db_update_failed"))?;
    Ok(json!({ "updated": true }))
}

fn handle_calendar_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let (conn, email) = owner(state)?;
    let event_id = get_required_str(&req.params, "eventId")?;
    let n = conn
        .execute(
            "DELETE FROM calendar_events WHERE id = ? AND owner_email = ?",
            (&event_id, &email),
        )
        .map_err(db_err("db_delete_failed"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("event not found"));
    }
    Ok(json!({ "deleted": true }))
}

fn todo_json(r: &Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "title": r.get::<_, String>(1)?,
        "dueDate": r.get::<_, Option<String>>(2)?,
        "course": r.get::<_, Option<String>>(3)?,
        "color": r.get::<_, String>(4)?,
        "completed": r.get::<_, i64>(5)? != 0,
        "createdAt": r.get::<_, String>(6)?,
    }))
}

fn handle_todos_list(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let (conn, email) = owner(state)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, title, due_date, course, color, completed, created_at
             FROM todos WHERE owner_email = ?
             ORDER BY due_date IS NULL, due_date, created_at",
        )
        .map_err(db_err("db_query_failed"))?;
    let todos = stmt
        .query_map([&email], todo_json)
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    let (completed, pending): (Vec<_>, Vec<_>) = todos
        .into_iter()
        .partition(|t| t["completed"].as_bool().unwrap_or(false));
    Ok(json!({ "pending": pending, "completed": completed }))
}

fn handle_todos_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let (conn, email) = owner(state)?;
    let title = get_required_str(&req.params, "title")?;
    let due = opt_date(&req.params, "dueDate")?;
    let course = get_opt_str(&req.params, "course");
    let color = get_opt_str(&req.params, "color").unwrap_or_else(|| DEFAULT_TODO_COLOR.to_string());
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO todos(id, owner_email, title, due_date, course, color, completed, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 0, ?)",
        params![id, email, title, due, course, color, db::now_rfc3339()],
    )
    .map_err(db_err("db_insert_failed"))?;
    Ok(json!({ "todoId": id }))
}

fn handle_todos_toggle(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let (conn, email) = owner(state)?;
    let todo_id = get_required_str(&req.params, "todoId")?;
    let n = conn
        .execute(
            "UPDATE todos SET completed = 1 - completed WHERE id = ? AND owner_email = ?",
            (&todo_id, &email),
        )
        .map_err(db_err("db_update_failed"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("todo not found"));
    }
    let completed: i64 = conn
        .query_row("SELECT completed FROM todos WHERE id = ?", [&todo_id], |r| {
            r.get(0)
        })
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "completed": completed != 0 }))
}

fn handle_todos_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let (conn, email) = owner(state)?;
    let todo_id = get_required_str(&req.params, "todoId")?;
    let n = conn
        .execute(
            "DELETE FROM todos WHERE id = ? AND owner_email = ?",
            (&todo_id, &email),
        )
        .map_err(db_err("db_delete_failed"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("todo not found"));
    }
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "calendar.list" => handle_calendar_list(state, req),
        "calendar.upcoming" => handle_calendar_upcoming(state, req),
        "calendar.create" => handle_calendar_create(state, req),
        "calendar.update" => handle_calendar_update(state, req),
        "calendar.delete" => handle_calendar_delete(state, req),
        "todos.list" => handle_todos_list(state),
        "todos.create" => handle_todos_create(state, req),
        "todos.toggle" => handle_todos_toggle(state, req),
        "todos.delete" => handle_todos_delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
