use crate::db;
use crate::ipc::helpers::{
    db_err, get_opt_str, require_db, require_session, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::session::{self, avatar_for};
use rusqlite::OptionalExtension;
use serde_json::json;

fn session_account(state: &AppState) -> Result<session::Account, HandlerErr> {
    let conn = require_db(state)?;
    let cookie = require_session(state)?;
    session::find_account(conn, &cookie.email, cookie.role)
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("account not found"))
}

fn handle_get(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let account = session_account(state)?;
    let row: Option<(Option<String>, Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT bio, avatar_url, updated_at FROM profiles WHERE account_id = ?",
            [&account.id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let (bio, avatar_url, updated_at) = row.unwrap_or((None, None, None));
    Ok(json!({
        "accountId": account.id,
        "username": account.username,
        "email": account.email,
        "role": account.role,
        "department": account.department,
        "phoneNumber": account.phone_number,
        "bio": bio,
        "avatarUrl": avatar_url.unwrap_or_else(|| avatar_for(&account.username)),
        "updatedAt": updated_at,
    }))
}

fn handle_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let account = session_account(state)?;
    let bio = req.params.get("bio").and_then(|v| v.as_str()).map(str::trim);
    let avatar_url = get_opt_str(&req.params, "avatarUrl");
    let username = match req.params.get("username") {
        None | Some(serde_json::Value::Null) => None,
        Some(_) => Some(
            get_opt_str(&req.params, "username")
                .ok_or_else(|| HandlerErr::bad_params("username must not be empty"))?,
        ),
    };
    let department = get_opt_str(&req.params, "department");
    let phone = get_opt_str(&req.params, "phoneNumber");

    let conn = require_db(state)?;
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    session::update_account_details(
        &tx,
        &account.id,
        username.as_deref(),
        department.as_deref(),
        phone.as_deref(),
    )
    .map_err(db_err("db_update_failed"))?;
    tx.execute(
        "INSERT INTO profiles(account_id, bio, avatar_url, updated_at) VALUES(?1, ?2, ?3, ?4)
         ON CONFLICT(account_id) DO UPDATE SET
            bio = COALESCE(?2, bio),
            avatar_url = COALESCE(?3, avatar_url),
            updated_at = ?4",
        (&account.id, bio, avatar_url.as_deref(), db::now_rfc3339()),
    )
    .map_err(db_err("db_update_failed"))?;
    tx.commit().map_err(db_err("db_tx_failed"))?;

    let profile = handle_get(state)?;
    if let Some(cookie) = state.session.as_mut() {
        if let Some(name) = profile["username"].as_str() {
            cookie.name = name.to_string();
        }
        if let Some(url) = profile["avatarUrl"].as_str() {
            cookie.avatar = Some(url.to_string());
        }
    }
    Ok(profile)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "profile.get" => handle_get(state),
        "profile.update" => handle_update(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
