use crate::access::{self, NewMaterial, SharingMode};
use crate::db;
use crate::ipc::helpers::{
    config, db_err, get_opt_str, get_required_str, get_str_list, require_db, require_session,
    require_staff, respond, session_student, to_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::session::{Role, SessionCookie};
use crate::storage;
use crate::students::{self, Student};
use rusqlite::Connection;
use serde_json::json;
use std::path::{Path, PathBuf};

fn parse_mode(params: &serde_json::Value, mode_key: &str) -> Result<SharingMode, HandlerErr> {
    let mode = get_required_str(params, mode_key)?;
    let course = get_opt_str(params, "sharedWithCourse").or_else(|| get_opt_str(params, "course"));
    let ids = get_str_list(params, "studentIds")?;
    SharingMode::parse(&mode, course.as_deref(), &ids).map_err(|e| HandlerErr::bad_params(e.to_string()))
}

/// Every id in a `specific` share must name an existing student.
fn check_students_exist(conn: &Connection, mode: &SharingMode) -> Result<(), HandlerErr> {
    let SharingMode::Specific(ids) = mode else {
        return Ok(());
    };
    let mut missing = Vec::new();
    for id in ids {
        if students::get_student(conn, id)
            .map_err(db_err("db_query_failed"))?
            .is_none()
        {
            missing.push(id.clone());
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(HandlerErr::not_found("unknown student ids").with_details(json!({ "missing": missing })))
    }
}

/// The student whose access is being resolved: a student session always
/// resolves to itself, staff name one with `studentId`.
fn target_student(
    conn: &Connection,
    cookie: &SessionCookie,
    params: &serde_json::Value,
) -> Result<Student, HandlerErr> {
    if cookie.role == Role::Student {
        return session_student(conn, cookie);
    }
    let student_id = get_required_str(params, "studentId")?;
    students::get_student(conn, &student_id)
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("student not found"))
}

/// Inserts the material row and its sharing links in one transaction. When
/// that fails the stored file is removed again unless another row uses it.
fn record_upload(
    conn: &Connection,
    workspace: &Path,
    material: &NewMaterial<'_>,
    mode: &SharingMode,
    now: &str,
) -> Result<String, HandlerErr> {
    let result: Result<String, HandlerErr> = (|| {
        let tx = conn
            .unchecked_transaction()
            .map_err(db_err("db_tx_failed"))?;
        let material_id =
            access::insert_material(&tx, material, now).map_err(db_err("db_insert_failed"))?;
        mode.apply(&tx, &material_id, now)
            .map_err(db_err("db_update_failed"))?;
        tx.commit().map_err(db_err("db_tx_failed"))?;
        Ok(material_id)
    })();

    if let Err(e) = &result {
        match storage::remove_if_unreferenced(conn, workspace, material.file_url) {
            Ok(removed) => tracing::warn!(code = e.code, removed, "material upload rolled back"),
            Err(cleanup) => {
                tracing::warn!(error = %cleanup, file_url = material.file_url, "orphaned material file left behind")
            }
        }
    }
    result
}

fn handle_upload(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let cookie = require_staff(state)?;
    let Some(workspace) = state.workspace.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let source = PathBuf::from(get_required_str(&req.params, "sourcePath")?);
    let name = get_opt_str(&req.params, "name").unwrap_or_else(|| {
        source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "Untitled".to_string())
    });
    let description = get_opt_str(&req.params, "description");
    let course = get_opt_str(&req.params, "course");
    let mode = parse_mode(&req.params, "sharingMode")?;
    check_students_exist(conn, &mode)?;

    let max_bytes = config(conn)?.max_material_bytes;
    let stored = storage::store_material_file(workspace, &source, max_bytes)
        .map_err(|e| HandlerErr::new("io_failed", format!("{e:?}")))?;

    let now = db::now_rfc3339();
    let material_id = record_upload(
        conn,
        workspace,
        &NewMaterial {
            name: &name,
            description: description.as_deref(),
            file_url: &stored.file_url,
            file_type: stored.mime,
            file_size: stored.size as i64,
            sha256: &stored.sha256,
            course: course.as_deref(),
            uploaded_by: &cookie.email,
        },
        &mode,
        &now,
    )?;

    tracing::info!(material_id = %material_id, sharing = %mode.describe(), "material uploaded");
    let material = access::get_material(conn, &material_id).map_err(db_err("db_query_failed"))?;
    Ok(json!({
        "material": to_json(material)?,
        "sharing": mode.describe(),
    }))
}

fn handle_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_staff(state)?;
    let course = get_opt_str(&req.params, "course");
    let rows = access::list_materials(conn, course.as_deref()).map_err(db_err("db_query_failed"))?;
    Ok(json!({ "materials": to_json(rows)? }))
}

fn handle_accessible(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let cookie = require_session(state)?;
    let student = target_student(conn, cookie, &req.params)?;
    let mut rows = access::accessible_materials(conn, &student.id, &student.course)
        .map_err(db_err("db_query_failed"))?;
    if let Some(course) = get_opt_str(&req.params, "course") {
        rows.retain(|m| m.course.as_deref() == Some(course.as_str()));
    }
    Ok(json!({ "studentId": student.id, "materials": to_json(rows)? }))
}

fn handle_check_access(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let cookie = require_session(state)?;
    let material_id = get_required_str(&req.params, "materialId")?;
    let student = target_student(conn, cookie, &req.params)?;
    let has_access = access::check_access(conn, &material_id, &student.id, &student.course)
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "hasAccess": has_access }))
}

fn handle_share(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_staff(state)?;
    let material_id = get_required_str(&req.params, "materialId")?;
    if access::get_material(conn, &material_id)
        .map_err(db_err("db_query_failed"))?
        .is_none()
    {
        return Err(HandlerErr::not_found("material not found"));
    }
    let mode = parse_mode(&req.params, "mode")?;
    check_students_exist(conn, &mode)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    mode.apply(&tx, &material_id, &db::now_rfc3339())
        .map_err(db_err("db_update_failed"))?;
    tx.commit().map_err(db_err("db_tx_failed"))?;

    let linked = access::linked_students(conn, &material_id).map_err(db_err("db_query_failed"))?;
    tracing::info!(material_id = %material_id, sharing = %mode.describe(), "material shared");
    Ok(json!({
        "sharing": mode.describe(),
        "linkedStudentIds": linked,
    }))
}

fn handle_open(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let cookie = require_session(state)?;
    let Some(workspace) = state.workspace.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let material_id = get_required_str(&req.params, "materialId")?;
    let material = access::get_material(conn, &material_id)
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("material not found"))?;
    if cookie.role == Role::Student {
        let student = session_student(conn, cookie)?;
        let allowed = access::check_access(conn, &material_id, &student.id, &student.course)
            .map_err(db_err("db_query_failed"))?;
        if !allowed {
            return Err(HandlerErr::new("forbidden", "material is not shared with you"));
        }
    }
    let path = storage::resolve(workspace, &material.file_url);
    if !path.is_file() {
        return Err(HandlerErr::new("io_failed", "stored file is missing"));
    }
    Ok(json!({
        "path": path.to_string_lossy(),
        "name": material.name,
        "fileType": material.file_type,
    }))
}

fn handle_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_staff(state)?;
    let Some(workspace) = state.workspace.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let material_id = get_required_str(&req.params, "materialId")?;
    let material = access::get_material(conn, &material_id)
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("material not found"))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    access::delete_material(&tx, &material_id).map_err(db_err("db_delete_failed"))?;
    tx.commit().map_err(db_err("db_tx_failed"))?;

    let file_removed = match storage::remove_if_unreferenced(conn, workspace, &material.file_url) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "failed to remove stored material file");
            false
        }
    };
    Ok(json!({ "deleted": true, "fileRemoved": file_removed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "materials.upload" => handle_upload(state, req),
        "materials.list" => handle_list(state, req),
        "materials.accessible" => handle_accessible(state, req),
        "materials.checkAccess" => handle_check_access(state, req),
        "materials.share" => handle_share(state, req),
        "materials.open" => handle_open(state, req),
        "materials.delete" => handle_delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
