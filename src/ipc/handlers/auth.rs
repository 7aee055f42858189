use crate::ipc::helpers::{
    config, db_err, get_opt_str, get_required_str, require_admin, require_db, respond, to_json,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::roster::{self, Parsed, UserRow};
use crate::session::{self, NewAccount, Role, SessionCookie, SessionError};
use chrono::Utc;
use serde_json::json;

fn session_err(e: SessionError) -> HandlerErr {
    match e {
        SessionError::InvalidCredentials => HandlerErr::new("invalid_credentials", e.to_string()),
        SessionError::InvalidResetCode => HandlerErr::new("invalid_credentials", e.to_string()),
        SessionError::WeakPassword(_) => HandlerErr::bad_params(e.to_string()),
        SessionError::Hash(_) => HandlerErr::new("io_failed", e.to_string()),
        SessionError::OutOfRange(_) => HandlerErr::new("config_invalid", e.to_string()),
        SessionError::Db(e) => HandlerErr::new("db_query_failed", e.to_string()),
    }
}

fn get_role(params: &serde_json::Value) -> Result<Role, HandlerErr> {
    let raw = get_required_str(params, "role")?;
    Role::parse(&raw).ok_or_else(|| HandlerErr::bad_params(format!("unknown role: {}", raw)))
}

fn handle_login(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_str(&req.params, "email")?;
    let password = req
        .params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;
    let role = get_role(&req.params)?;
    let now = Utc::now();

    let conn = require_db(state)?;
    let ttl = config(conn)?.session_ttl_hours;
    let cookie = session::login(conn, &email, password, role, ttl, now).map_err(session_err)?;

    state.session = Some(cookie.clone());
    state.last_validated = Some(now);
    Ok(json!({ "cookie": cookie, "cookieValue": cookie.encode() }))
}

/// Adopts a cookie the client kept from an earlier run, provided its
/// session id is still valid server-side.
fn handle_restore(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let cookie = match req.params.get("cookie") {
        Some(serde_json::Value::String(raw)) => SessionCookie::decode(raw),
        Some(v @ serde_json::Value::Object(_)) => SessionCookie::decode(&v.to_string()),
        _ => return Err(HandlerErr::bad_params("missing cookie")),
    };
    let Some(cookie) = cookie else {
        return Ok(json!({ "restored": false }));
    };

    let now = Utc::now();
    let conn = require_db(state)?;
    let record = session::validate_session(conn, &cookie.session_id, now)
        .map_err(db_err("db_query_failed"))?;
    match record {
        Some(r) if r.role == cookie.role && r.email.eq_ignore_ascii_case(&cookie.email) => {
            state.session = Some(cookie.clone());
            state.last_validated = Some(now);
            Ok(json!({ "restored": true, "cookie": cookie, "expiresAt": r.expires_at }))
        }
        _ => {
            tracing::info!("stored cookie rejected");
            state.sign_out();
            Ok(json!({ "restored": false }))
        }
    }
}

fn handle_validate_session(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let held = state.session.as_ref().map(|c| c.session_id.clone());
    let sid = get_opt_str(&req.params, "sessionId")
        .or(held.clone())
        .ok_or_else(|| HandlerErr::bad_params("missing sessionId"))?;
    let now = Utc::now();
    let conn = require_db(state)?;
    let record =
        session::validate_session(conn, &sid, now).map_err(db_err("db_query_failed"))?;
    let is_held = held.as_deref() == Some(sid.as_str());
    match record {
        Some(r) => {
            if is_held {
                state.last_validated = Some(now);
            }
            Ok(json!({ "valid": true, "expiresAt": r.expires_at }))
        }
        None => {
            if is_held {
                state.sign_out();
            }
            Ok(json!({ "valid": false }))
        }
    }
}

fn handle_logout(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    let revoked = match (state.db.as_ref(), state.session.as_ref()) {
        (Some(conn), Some(cookie)) => session::revoke_session(conn, &cookie.session_id)
            .map_err(db_err("db_delete_failed"))?,
        _ => false,
    };
    state.sign_out();
    Ok(json!({ "signedOut": true, "revoked": revoked }))
}

fn handle_whoami(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({ "cookie": state.session }))
}

/// Anonymous callers get the same answer whether or not the account exists;
/// the code goes to the outbox log. An admin session gets it back directly.
fn handle_request_reset(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_str(&req.params, "email")?;
    let role = get_role(&req.params)?;
    let conn = require_db(state)?;
    let ttl = config(conn)?.reset_code_ttl_minutes;
    let code = session::request_reset(conn, &email, role, ttl, Utc::now()).map_err(session_err)?;
    let by_admin = state
        .session
        .as_ref()
        .map(|c| c.role == Role::Admin)
        .unwrap_or(false);

    let mut out = json!({ "requested": true });
    match code {
        Some(code) if by_admin => {
            tracing::info!(role = role.as_str(), "password reset issued by admin");
            out["code"] = json!(code);
        }
        Some(code) => {
            tracing::info!(
                target: "portald::outbox",
                email = %email,
                role = role.as_str(),
                code = %code,
                "password reset code"
            );
        }
        None => tracing::debug!(role = role.as_str(), "password reset for unknown account"),
    }
    Ok(out)
}

fn handle_verify_reset(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_str(&req.params, "email")?;
    let role = get_role(&req.params)?;
    let code = get_required_str(&req.params, "code")?;
    let conn = require_db(state)?;
    let found = session::verify_reset_code(conn, &email, role, &code, Utc::now())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "valid": found.is_some() }))
}

fn handle_reset_password(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_str(&req.params, "email")?;
    let role = get_role(&req.params)?;
    let code = get_required_str(&req.params, "code")?;
    let new_password = req
        .params
        .get("newPassword")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing newPassword"))?;
    {
        let conn = require_db(state)?;
        let tx = conn
            .unchecked_transaction()
            .map_err(db_err("db_tx_failed"))?;
        let outcome = session::reset_password(&tx, &email, role, &code, new_password, Utc::now());
        // A wrong code still counts against the attempt limit.
        if matches!(outcome, Ok(()) | Err(SessionError::InvalidResetCode)) {
            tx.commit().map_err(db_err("db_tx_failed"))?;
        }
        outcome.map_err(session_err)?;
    }

    let signed_in_here = state
        .session
        .as_ref()
        .map(|c| c.role == role && c.email.eq_ignore_ascii_case(&email))
        .unwrap_or(false);
    if signed_in_here {
        state.sign_out();
    }
    Ok(json!({ "reset": true }))
}

fn handle_accounts_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let role = get_role(&req.params)?;
    let bootstrap = role == Role::Admin
        && !session::admin_exists(conn).map_err(db_err("db_query_failed"))?;
    if !bootstrap {
        require_admin(state)?;
    }

    let username = get_required_str(&req.params, "username")?;
    let email = get_required_str(&req.params, "email")?;
    let password = req
        .params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;
    session::check_password_strength(password).map_err(session_err)?;
    if session::find_account(conn, &email, role)
        .map_err(db_err("db_query_failed"))?
        .is_some()
    {
        return Err(HandlerErr::new(
            "conflict",
            format!("a {} account already exists for {}", role.as_str(), email),
        ));
    }

    let department = get_opt_str(&req.params, "department");
    let phone = get_opt_str(&req.params, "phoneNumber");
    let (account_id, _) = session::upsert_account(
        conn,
        &NewAccount {
            role,
            username: &username,
            email: &email,
            password,
            department: department.as_deref(),
            phone_number: phone.as_deref(),
        },
    )
    .map_err(session_err)?;
    tracing::info!(role = role.as_str(), bootstrap, "account created");
    Ok(json!({ "accountId": account_id, "bootstrap": bootstrap }))
}

fn handle_accounts_list(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_admin(state)?;
    let accounts = session::list_accounts(conn).map_err(db_err("db_query_failed"))?;
    Ok(json!({ "accounts": to_json(accounts)? }))
}

fn handle_accounts_bulk_upsert(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_admin(state)?;
    let Some(items) = req.params.get("users").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing users"));
    };

    let mut parsed = Parsed {
        rows: Vec::new(),
        skipped: Vec::new(),
    };
    for (i, item) in items.iter().enumerate() {
        let field = |k: &str| get_opt_str(item, k);
        match (field("username"), field("password"), field("email")) {
            (Some(username), Some(password), Some(email)) => parsed.rows.push(UserRow {
                username,
                password,
                email,
            }),
            _ => parsed.skipped.push(i + 1),
        }
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let summary = roster::apply_users(&tx, &parsed).map_err(db_err("db_insert_failed"))?;
    tx.commit().map_err(db_err("db_tx_failed"))?;
    to_json(summary)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "auth.login" => handle_login(state, req),
        "auth.restore" => handle_restore(state, req),
        "auth.validateSession" => handle_validate_session(state, req),
        "auth.logout" => handle_logout(state),
        "auth.whoami" => handle_whoami(state),
        "auth.requestPasswordReset" => handle_request_reset(state, req),
        "auth.verifyResetCode" => handle_verify_reset(state, req),
        "auth.resetPassword" => handle_reset_password(state, req),
        "accounts.create" => handle_accounts_create(state, req),
        "accounts.list" => handle_accounts_list(state),
        "accounts.bulkUpsert" => handle_accounts_bulk_upsert(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
