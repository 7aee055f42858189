use super::handlers;
use super::types::{AppState, Request};
use crate::config::PortalConfig;
use crate::ipc::error::err;
use crate::session;
use chrono::{DateTime, Utc};

enum Revalidation {
    NotDue,
    Valid,
    Invalid,
}

/// Periodic server-side check of the held session id. An invalid session
/// signs the user out before the request is dispatched.
fn revalidate(state: &mut AppState, now: DateTime<Utc>) {
    let outcome = {
        let (Some(conn), Some(cookie)) = (state.db.as_ref(), state.session.as_ref()) else {
            return;
        };
        let interval = PortalConfig::load(conn)
            .map(|c| c.revalidate_interval_secs)
            .unwrap_or_else(|_| PortalConfig::default().revalidate_interval_secs);
        if !session::revalidation_due(state.last_validated, now, interval) {
            Revalidation::NotDue
        } else {
            match session::validate_session(conn, &cookie.session_id, now) {
                Ok(Some(_)) => Revalidation::Valid,
                Ok(None) => Revalidation::Invalid,
                Err(e) => {
                    tracing::warn!(error = %e, "session revalidation failed; keeping session");
                    Revalidation::NotDue
                }
            }
        }
    };
    match outcome {
        Revalidation::NotDue => {}
        Revalidation::Valid => state.last_validated = Some(now),
        Revalidation::Invalid => {
            tracing::info!("session no longer valid; signing out");
            state.sign_out();
        }
    }
}

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    let _span = tracing::debug_span!("request", id = %req.id, method = %req.method).entered();
    revalidate(state, Utc::now());

    if let Some(resp) = handlers::core::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::auth::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::students::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::incidents::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::materials::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::notifications::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::reports::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::planner::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::profile::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::roster::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::backup::try_handle(state, &req) {
        return resp;
    }

    tracing::debug!(method = %req.method, "unknown method");
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
