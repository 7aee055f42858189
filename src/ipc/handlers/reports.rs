use crate::incidents;
use crate::ipc::handlers::incidents::period_start;
use crate::ipc::helpers::{
    config, db_err, get_opt_i64, get_opt_str, require_admin, require_db, require_session,
    require_staff, respond, session_student, to_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::reports;
use crate::session::Role;
use crate::students::{self, Student};
use rusqlite::Connection;
use serde_json::json;

enum Scope {
    One(Student),
    Roster(Vec<Student>),
}

impl Scope {
    fn students(&self) -> &[Student] {
        match self {
            Scope::One(s) => std::slice::from_ref(s),
            Scope::Roster(rows) => rows,
        }
    }

    fn student_id(&self) -> Option<&str> {
        match self {
            Scope::One(s) => Some(s.id.as_str()),
            Scope::Roster(_) => None,
        }
    }
}

/// The caller for a student session, otherwise one student by
/// `studentId` or the whole roster.
fn resolve_scope(state: &AppState, conn: &Connection, params: &serde_json::Value) -> Result<Scope, HandlerErr> {
    let cookie = require_session(state)?;
    if cookie.role == Role::Student {
        return Ok(Scope::One(session_student(conn, cookie)?));
    }
    match get_opt_str(params, "studentId") {
        Some(id) => students::get_student(conn, &id)
            .map_err(db_err("db_query_failed"))?
            .map(Scope::One)
            .ok_or_else(|| HandlerErr::not_found("student not found")),
        None => students::list_all(conn)
            .map(Scope::Roster)
            .map_err(db_err("db_query_failed")),
    }
}

fn handle_overview(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let scope = resolve_scope(state, conn, &req.params)?;
    let since = period_start(&req.params)?;
    let incident_count = incidents::count_since(conn, scope.student_id(), &since)
        .map_err(db_err("db_query_failed"))?;
    let stats = reports::overview(scope.students(), incident_count);
    Ok(json!({ "since": since, "overview": to_json(stats)? }))
}

fn handle_performance(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let scope = resolve_scope(state, conn, &req.params)?;
    Ok(json!({
        "studentCount": scope.students().len(),
        "metrics": to_json(reports::performance(scope.students()))?,
    }))
}

fn handle_admin_summary(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_admin(state)?;
    let cfg = config(conn)?;
    let rows = students::list_all(conn).map_err(db_err("db_query_failed"))?;
    let incident_count =
        incidents::count_since(conn, None, "").map_err(db_err("db_query_failed"))?;
    let summary = reports::admin_summary(
        &rows,
        incident_count,
        cfg.at_risk_attendance_below,
        cfg.at_risk_behavior_below,
    );
    let at_risk: Vec<&str> = rows
        .iter()
        .filter(|s| {
            reports::is_at_risk(s, cfg.at_risk_attendance_below, cfg.at_risk_behavior_below)
        })
        .map(|s| s.id.as_str())
        .collect();
    Ok(json!({ "summary": to_json(summary)?, "atRiskStudentIds": at_risk }))
}

fn handle_leaderboard_top(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_session(state)?;
    let limit = match get_opt_i64(&req.params, "limit")? {
        Some(n) if n > 0 => n,
        Some(_) => return Err(HandlerErr::bad_params("limit must be positive")),
        None => config(conn)?.leaderboard_limit,
    };
    let rows = students::list_all(conn).map_err(db_err("db_query_failed"))?;
    let entries = reports::leaderboard(&rows, limit as usize);
    Ok(json!({ "entries": to_json(entries)? }))
}

fn handle_leaderboard_summary(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_staff(state)?;
    let rows = students::list_all(conn).map_err(db_err("db_query_failed"))?;
    to_json(reports::leaderboard_summary(&rows))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "reports.overview" => handle_overview(state, req),
        "reports.performance" => handle_performance(state, req),
        "reports.adminSummary" => handle_admin_summary(state),
        "leaderboard.top" => handle_leaderboard_top(state, req),
        "leaderboard.summary" => handle_leaderboard_summary(state),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
