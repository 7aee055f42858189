use crate::config::PortalConfig;
use crate::ipc::error::{err, ok};
use crate::ipc::types::AppState;
use crate::session::{Role, SessionCookie};
use crate::students::{self, Student};
use rusqlite::Connection;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

/// `.map_err(db_err("db_query_failed"))`
pub fn db_err<E: std::fmt::Display>(code: &'static str) -> impl Fn(E) -> HandlerErr {
    move |e| HandlerErr::new(code, e.to_string())
}

pub fn respond(id: &str, result: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => e.response(id),
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_opt_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn get_str_list(params: &serde_json::Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| HandlerErr::bad_params(format!("{} must be strings", key)))
            })
            .collect(),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be an array", key))),
    }
}

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn require_session(state: &AppState) -> Result<&SessionCookie, HandlerErr> {
    state
        .session
        .as_ref()
        .ok_or_else(|| HandlerErr::new("unauthenticated", "sign in first"))
}

pub fn require_role<'a>(state: &'a AppState, roles: &[Role]) -> Result<&'a SessionCookie, HandlerErr> {
    let cookie = require_session(state)?;
    if !roles.contains(&cookie.role) {
        return Err(HandlerErr::new(
            "forbidden",
            format!("not allowed for role {}", cookie.role.as_str()),
        ));
    }
    Ok(cookie)
}

pub fn require_staff(state: &AppState) -> Result<&SessionCookie, HandlerErr> {
    require_role(state, &[Role::Teacher, Role::Admin])
}

pub fn require_admin(state: &AppState) -> Result<&SessionCookie, HandlerErr> {
    require_role(state, &[Role::Admin])
}

pub fn config(conn: &Connection) -> Result<PortalConfig, HandlerErr> {
    PortalConfig::load(conn).map_err(db_err("db_query_failed"))
}

/// Student row behind a student session (matched by email).
pub fn session_student(conn: &Connection, cookie: &SessionCookie) -> Result<Student, HandlerErr> {
    students::find_by_email(conn, &cookie.email)
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("no student record for this account"))
}

pub fn to_json<T: serde::Serialize>(v: T) -> Result<serde_json::Value, HandlerErr> {
    serde_json::to_value(v).map_err(|e| HandlerErr::new("io_failed", e.to_string()))
}
