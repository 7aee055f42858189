use crate::db;
use crate::incidents;
use crate::ipc::helpers::{
    config, db_err, get_opt_str, get_required_str, require_admin, require_db, require_session,
    require_staff, respond, session_student, to_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::notifications::{self, NewNotification, ALL_RECIPIENTS};
use crate::session::Role;
use crate::students::{self, NewStudent, SortField, StudentQuery};
use serde_json::json;

fn handle_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_staff(state)?;
    let sort = match get_opt_str(&req.params, "sortField") {
        Some(f) => SortField::parse(&f)
            .ok_or_else(|| HandlerErr::bad_params(format!("unknown sortField: {}", f)))?,
        None => SortField::Name,
    };
    let descending = match get_opt_str(&req.params, "sortDirection").as_deref() {
        None | Some("asc") => false,
        Some("desc") => true,
        Some(other) => {
            return Err(HandlerErr::bad_params(format!(
                "sortDirection must be asc or desc, got {}",
                other
            )))
        }
    };
    let query = StudentQuery {
        search: get_opt_str(&req.params, "search"),
        course: get_opt_str(&req.params, "course"),
        sort,
        descending,
    };
    let all = students::list_all(conn).map_err(db_err("db_query_failed"))?;
    let total = all.len();
    let rows = query.apply(all);
    Ok(json!({ "students": to_json(rows)?, "total": total }))
}

/// Student record with traits and recent incidents. Students may only
/// read their own record.
fn student_detail(
    conn: &rusqlite::Connection,
    student: students::Student,
) -> Result<serde_json::Value, HandlerErr> {
    let limit = config(conn)?.incident_list_limit;
    let traits = students::get_traits(conn, &student.id).map_err(db_err("db_query_failed"))?;
    let incidents = incidents::list_since(conn, Some(student.id.as_str()), "", limit)
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({
        "student": to_json(student)?,
        "traits": to_json(traits)?,
        "incidents": to_json(incidents)?,
    }))
}

fn handle_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let cookie = require_session(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let student = students::get_student(conn, &student_id)
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;
    if cookie.role == Role::Student && !student.email.eq_ignore_ascii_case(&cookie.email) {
        return Err(HandlerErr::new("forbidden", "students may only view their own record"));
    }
    student_detail(conn, student)
}

fn handle_me(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let cookie = require_session(state)?;
    let student = session_student(conn, cookie)?;
    student_detail(conn, student)
}

fn parse_new_student(params: &serde_json::Value) -> Result<NewStudent, HandlerErr> {
    let s: NewStudent = serde_json::from_value(params.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid student: {}", e)))?;
    s.validate().map_err(HandlerErr::bad_params)?;
    Ok(s)
}

fn handle_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_staff(state)?;
    let s = parse_new_student(&req.params)?;
    if students::find_by_email(conn, &s.email)
        .map_err(db_err("db_query_failed"))?
        .is_some()
    {
        return Err(HandlerErr::new(
            "conflict",
            format!("a student with email {} already exists", s.email.trim()),
        ));
    }

    let now = db::now_rfc3339();
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let student_id = students::insert_student(&tx, &s, &now).map_err(db_err("db_insert_failed"))?;
    let message = format!("{} has been added to {}", s.name.trim(), s.course.trim());
    notifications::insert(
        &tx,
        &NewNotification {
            title: "New Student Added",
            message: &message,
            kind: "info",
            recipient_role: Some(ALL_RECIPIENTS),
            recipient_id: None,
            student_id: Some(&student_id),
        },
        &now,
    )
    .map_err(db_err("db_insert_failed"))?;
    tx.commit().map_err(db_err("db_tx_failed"))?;

    tracing::info!(student_id = %student_id, "student created");
    Ok(json!({ "studentId": student_id }))
}

fn handle_update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_staff(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let patch = req
        .params
        .get("patch")
        .ok_or_else(|| HandlerErr::bad_params("missing patch"))?;
    let existing = students::get_student(conn, &student_id)
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;
    let next = NewStudent::from(&existing)
        .patched(patch)
        .map_err(HandlerErr::bad_params)?;
    if !next.email.trim().eq_ignore_ascii_case(&existing.email) {
        if let Some(other) = students::find_by_email(conn, &next.email).map_err(db_err("db_query_failed"))? {
            if other.id != existing.id {
                return Err(HandlerErr::new("conflict", "email already in use"));
            }
        }
    }
    students::update_student(conn, &student_id, &next, &db::now_rfc3339())
        .map_err(db_err("db_update_failed"))?;
    let updated = students::get_student(conn, &student_id).map_err(db_err("db_query_failed"))?;
    Ok(json!({ "student": to_json(updated)? }))
}

fn handle_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_admin(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let n = students::delete_cascade(&tx, &student_id).map_err(db_err("db_delete_failed"))?;
    tx.commit().map_err(db_err("db_tx_failed"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("student not found"));
    }
    tracing::info!(student_id = %student_id, "student deleted");
    Ok(json!({ "deleted": true }))
}

fn handle_courses(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_session(state)?;
    let courses = students::courses(conn).map_err(db_err("db_query_failed"))?;
    Ok(json!({ "courses": courses }))
}

fn handle_traits_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let cookie = require_session(state)?;
    let student_id = match get_opt_str(&req.params, "studentId") {
        Some(id) if cookie.role.is_staff() => id,
        _ if cookie.role == Role::Student => session_student(conn, cookie)?.id,
        _ => return Err(HandlerErr::bad_params("missing studentId")),
    };
    let traits = students::get_traits(conn, &student_id)
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("no traits recorded for student"))?;
    Ok(json!({ "traits": to_json(traits)? }))
}

fn handle_traits_update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_staff(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing patch"));
    };
    if students::get_student(conn, &student_id)
        .map_err(db_err("db_query_failed"))?
        .is_none()
    {
        return Err(HandlerErr::not_found("student not found"));
    }
    let mut values: Vec<(&str, i64)> = Vec::new();
    for (k, v) in patch {
        let n = v
            .as_i64()
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", k)))?;
        values.push((k.as_str(), n));
    }
    students::update_traits(conn, &student_id, &values, &db::now_rfc3339())
        .map_err(HandlerErr::bad_params)?;
    let traits = students::get_traits(conn, &student_id).map_err(db_err("db_query_failed"))?;
    Ok(json!({ "traits": to_json(traits)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => handle_list(state, req),
        "students.get" => handle_get(state, req),
        "students.me" => handle_me(state),
        "students.create" => handle_create(state, req),
        "students.update" => handle_update(state, req),
        "students.delete" => handle_delete(state, req),
        "students.courses" => handle_courses(state),
        "traits.get" => handle_traits_get(state, req),
        "traits.update" => handle_traits_update(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
