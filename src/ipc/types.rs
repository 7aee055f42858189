use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Deserialize;

use crate::session::SessionCookie;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// The signed-in user's cookie, if any.
    pub session: Option<SessionCookie>,
    pub last_validated: Option<DateTime<Utc>>,
}

impl AppState {
    pub fn sign_out(&mut self) {
        self.session = None;
        self.last_validated = None;
    }
}
