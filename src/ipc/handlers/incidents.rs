use crate::db;
use crate::incidents::{self, NewIncident};
use crate::ipc::helpers::{
    config, db_err, get_opt_i64, get_opt_str, get_required_str, require_admin, require_db,
    require_session, require_staff, respond, session_student, to_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::reports::Period;
use crate::session::Role;
use crate::students;
use chrono::Utc;
use serde_json::json;

pub(crate) fn period_start(params: &serde_json::Value) -> Result<String, HandlerErr> {
    let name = get_opt_str(params, "period");
    let custom = get_opt_str(params, "customDate");
    let period = Period::parse(name.as_deref(), custom.as_deref()).map_err(HandlerErr::bad_params)?;
    Ok(period
        .start(Utc::now().date_naive())
        .format("%Y-%m-%d")
        .to_string())
}

fn handle_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_staff(state)?;
    let incident: NewIncident = serde_json::from_value(req.params.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid incident: {}", e)))?;
    incident.validate().map_err(HandlerErr::bad_params)?;
    if students::get_student(conn, &incident.student_id)
        .map_err(db_err("db_query_failed"))?
        .is_none()
    {
        return Err(HandlerErr::not_found("student not found"));
    }
    let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
    let id = incidents::insert(conn, &incident, &today, &db::now_rfc3339())
        .map_err(db_err("db_insert_failed"))?;
    tracing::info!(incident_id = %id, student_id = %incident.student_id, "incident recorded");
    Ok(json!({ "incidentId": id }))
}

fn handle_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let cookie = require_session(state)?;
    let student_id = if cookie.role == Role::Student {
        Some(session_student(conn, cookie)?.id)
    } else {
        get_opt_str(&req.params, "studentId")
    };
    let since = period_start(&req.params)?;
    let limit = match get_opt_i64(&req.params, "limit")? {
        Some(n) if n > 0 => n,
        Some(_) => return Err(HandlerErr::bad_params("limit must be positive")),
        None => config(conn)?.incident_list_limit,
    };
    let rows = incidents::list_since(conn, student_id.as_deref(), &since, limit)
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "since": since, "incidents": to_json(rows)? }))
}

fn handle_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_admin(state)?;
    let incident_id = get_required_str(&req.params, "incidentId")?;
    if !incidents::delete(conn, &incident_id).map_err(db_err("db_delete_failed"))? {
        return Err(HandlerErr::not_found("incident not found"));
    }
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "incidents.create" => handle_create(state, req),
        "incidents.list" => handle_list(state, req),
        "incidents.delete" => handle_delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
