//! Login, server-side sessions and the client session cookie.
//!
//! The client keeps a [`SessionCookie`] (a JSON blob) and periodically asks
//! the sidecar whether the embedded session id is still valid. Sessions live
//! in the `sessions` table with a fixed expiry.

use crate::students::{self, Student};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "student" => Some(Role::Student),
            "teacher" => Some(Role::Teacher),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
        }
    }

    pub fn is_staff(self) -> bool {
        matches!(self, Role::Teacher | Role::Admin)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl std::str::FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::parse(s).ok_or_else(|| UnknownRole(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid credentials. Please check your email and password.")]
    InvalidCredentials,
    #[error("invalid or expired reset code")]
    InvalidResetCode,
    #[error("password must be at least {0} characters")]
    WeakPassword(usize),
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("{0} is out of range")]
    OutOfRange(&'static str),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

pub const MIN_PASSWORD_LEN: usize = 6;

/// Wrong guesses allowed before a reset code is discarded.
pub const MAX_RESET_ATTEMPTS: i64 = 5;

pub fn check_password_strength(password: &str) -> Result<(), SessionError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(SessionError::WeakPassword(MIN_PASSWORD_LEN));
    }
    Ok(())
}

/// Client-held session blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCookie {
    pub role: Role,
    pub name: String,
    pub avatar: Option<String>,
    pub email: String,
    pub id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_data: Option<serde_json::Value>,
}

impl SessionCookie {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Malformed cookies are treated as absent.
    pub fn decode(raw: &str) -> Option<Self> {
        match serde_json::from_str(raw) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!(error = %e, "discarding malformed session cookie");
                None
            }
        }
    }
}

/// Deterministic per-role user id: `{role}_{email with non-alphanumerics as '_'}`.
pub fn user_id_for(email: &str, role: Role) -> String {
    let cleaned: String = email
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}_{}", role.as_str(), cleaned)
}

pub fn avatar_for(username: &str) -> String {
    format!(
        "https://api.dicebear.com/7.x/initials/svg?seed={}",
        username.replace(' ', "%20")
    )
}

pub fn hash_password(password: &str) -> Result<String, SessionError> {
    let salt = SaltString::encode_b64(Uuid::new_v4().as_bytes())
        .map_err(|e| SessionError::Hash(e.to_string()))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| SessionError::Hash(e.to_string()))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

fn sha256_hex(s: &str) -> String {
    hex::encode(Sha256::digest(s.as_bytes()))
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn offset(
    now: DateTime<Utc>,
    delta: Option<TimeDelta>,
    what: &'static str,
) -> Result<DateTime<Utc>, SessionError> {
    delta
        .and_then(|d| now.checked_add_signed(d))
        .ok_or(SessionError::OutOfRange(what))
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub role: Role,
    pub username: String,
    pub email: String,
    pub department: Option<String>,
    pub phone_number: Option<String>,
    pub created_at: String,
    #[serde(skip)]
    password_hash: String,
}

const ACCOUNT_COLUMNS: &str =
    "id, role, username, email, department, phone_number, created_at, password_hash";

fn account_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let raw: String = r.get(1)?;
    let role = raw.parse::<Role>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Account {
        id: r.get(0)?,
        role,
        username: r.get(2)?,
        email: r.get(3)?,
        department: r.get(4)?,
        phone_number: r.get(5)?,
        created_at: r.get(6)?,
        password_hash: r.get(7)?,
    })
}

pub fn find_account(conn: &Connection, email: &str, role: Role) -> rusqlite::Result<Option<Account>> {
    let sql = format!(
        "SELECT {} FROM accounts WHERE lower(email) = lower(?) AND role = ?",
        ACCOUNT_COLUMNS
    );
    conn.query_row(&sql, (email.trim(), role.as_str()), account_from_row)
        .optional()
}

pub fn list_accounts(conn: &Connection) -> rusqlite::Result<Vec<Account>> {
    let sql = format!(
        "SELECT {} FROM accounts ORDER BY role, username COLLATE NOCASE",
        ACCOUNT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], account_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn admin_exists(conn: &Connection) -> rusqlite::Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM accounts WHERE role = 'admin'",
        [],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

pub struct NewAccount<'a> {
    pub role: Role,
    pub username: &'a str,
    pub email: &'a str,
    pub password: &'a str,
    pub department: Option<&'a str>,
    pub phone_number: Option<&'a str>,
}

/// Insert or replace credentials for `(role, email)`. Returns (account_id, inserted).
pub fn upsert_account(conn: &Connection, a: &NewAccount<'_>) -> Result<(String, bool), SessionError> {
    let hash = hash_password(a.password)?;
    if let Some(existing) = find_account(conn, a.email, a.role)? {
        conn.execute(
            "UPDATE accounts SET username = ?, password_hash = ?,
                department = COALESCE(?, department), phone_number = COALESCE(?, phone_number)
             WHERE id = ?",
            (a.username, &hash, a.department, a.phone_number, &existing.id),
        )?;
        return Ok((existing.id, false));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO accounts(id, role, username, email, password_hash, department, phone_number, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            a.role.as_str(),
            a.username,
            a.email.trim(),
            hash,
            a.department,
            a.phone_number,
            ts(Utc::now())
        ],
    )?;
    Ok((id, true))
}

/// Self-service contact details; `None` keeps the stored value.
pub fn update_account_details(
    conn: &Connection,
    account_id: &str,
    username: Option<&str>,
    department: Option<&str>,
    phone_number: Option<&str>,
) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "UPDATE accounts SET username = COALESCE(?, username),
            department = COALESCE(?, department), phone_number = COALESCE(?, phone_number)
         WHERE id = ?",
        (username, department, phone_number, account_id),
    )?;
    Ok(n > 0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub account_id: String,
    pub role: Role,
    pub email: String,
    pub expires_at: String,
}

pub fn create_session(
    conn: &Connection,
    account: &Account,
    ttl_hours: i64,
    now: DateTime<Utc>,
) -> Result<SessionRecord, SessionError> {
    let expires = offset(now, TimeDelta::try_hours(ttl_hours), "sessionTtlHours")?;
    let sid = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sessions(sid, account_id, role, email, created_at, expires_at, last_validated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            sid,
            account.id,
            account.role.as_str(),
            account.email,
            ts(now),
            ts(expires),
            ts(now)
        ],
    )?;
    Ok(SessionRecord {
        session_id: sid,
        account_id: account.id.clone(),
        role: account.role,
        email: account.email.clone(),
        expires_at: ts(expires),
    })
}

/// Valid iff the row exists and `now` is before its expiry. Touches
/// `last_validated_at` on success.
pub fn validate_session(
    conn: &Connection,
    sid: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<Option<SessionRecord>> {
    let row: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT account_id, role, email, expires_at FROM sessions WHERE sid = ?",
            [sid],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((account_id, role, email, expires_at)) = row else {
        return Ok(None);
    };
    let Some(role) = Role::parse(&role) else {
        return Ok(None);
    };
    match parse_ts(&expires_at) {
        Some(exp) if now < exp => {}
        _ => return Ok(None),
    }
    conn.execute(
        "UPDATE sessions SET last_validated_at = ? WHERE sid = ?",
        (ts(now), sid),
    )?;
    Ok(Some(SessionRecord {
        session_id: sid.to_string(),
        account_id,
        role,
        email,
        expires_at,
    }))
}

pub fn revoke_session(conn: &Connection, sid: &str) -> rusqlite::Result<bool> {
    Ok(conn.execute("DELETE FROM sessions WHERE sid = ?", [sid])? > 0)
}

pub fn revoke_account_sessions(conn: &Connection, account_id: &str) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM sessions WHERE account_id = ?", [account_id])
}

pub fn purge_expired(conn: &Connection, now: DateTime<Utc>) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM sessions WHERE expires_at <= ?", [ts(now)])
}

/// Whether the periodic check should run again. An interval too large to
/// represent never comes due.
pub fn revalidation_due(last: Option<DateTime<Utc>>, now: DateTime<Utc>, interval_secs: i64) -> bool {
    match (last, TimeDelta::try_seconds(interval_secs)) {
        (None, _) => true,
        (Some(t), Some(interval)) => now.signed_duration_since(t) >= interval,
        (Some(_), None) => false,
    }
}

/// Verifies credentials, opens a session and builds the client cookie.
pub fn login(
    conn: &Connection,
    email: &str,
    password: &str,
    role: Role,
    ttl_hours: i64,
    now: DateTime<Utc>,
) -> Result<SessionCookie, SessionError> {
    let Some(account) = find_account(conn, email, role)? else {
        tracing::info!(role = role.as_str(), "login rejected: unknown account");
        return Err(SessionError::InvalidCredentials);
    };
    if !verify_password(password, &account.password_hash) {
        tracing::info!(role = role.as_str(), "login rejected: bad password");
        return Err(SessionError::InvalidCredentials);
    }

    let session = create_session(conn, &account, ttl_hours, now)?;
    let student_data = if role == Role::Student {
        students::find_by_email(conn, &account.email)?
            .map(|s: Student| serde_json::to_value(s).unwrap_or(serde_json::Value::Null))
    } else {
        None
    };
    let profile_avatar: Option<String> = conn
        .query_row(
            "SELECT avatar_url FROM profiles WHERE account_id = ?",
            [&account.id],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    tracing::info!(role = role.as_str(), "login succeeded");

    Ok(SessionCookie {
        role,
        name: account.username.clone(),
        avatar: Some(profile_avatar.unwrap_or_else(|| avatar_for(&account.username))),
        email: account.email.clone(),
        id: user_id_for(&account.email, role),
        session_id: session.session_id,
        student_data,
    })
}

/// Issues a 6-digit reset code for a known account; `None` for unknown emails.
/// A new code replaces the previous one and restarts the attempt count.
pub fn request_reset(
    conn: &Connection,
    email: &str,
    role: Role,
    ttl_minutes: i64,
    now: DateTime<Utc>,
) -> Result<Option<String>, SessionError> {
    let expires = offset(now, TimeDelta::try_minutes(ttl_minutes), "resetCodeTtlMinutes")?;
    let Some(account) = find_account(conn, email, role)? else {
        return Ok(None);
    };
    let code = format!("{:06}", Uuid::new_v4().as_u128() % 1_000_000);
    conn.execute(
        "UPDATE accounts SET reset_code_hash = ?, reset_expires_at = ?, reset_attempts = 0
         WHERE id = ?",
        (sha256_hex(&code), ts(expires), &account.id),
    )?;
    Ok(Some(code))
}

pub fn verify_reset_code(
    conn: &Connection,
    email: &str,
    role: Role,
    code: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<Option<String>> {
    let row: Option<(String, Option<String>, Option<String>, i64)> = conn
        .query_row(
            "SELECT id, reset_code_hash, reset_expires_at, reset_attempts FROM accounts
             WHERE lower(email) = lower(?) AND role = ?",
            (email.trim(), role.as_str()),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((id, Some(hash), Some(expires), attempts)) = row else {
        return Ok(None);
    };
    let fresh = parse_ts(&expires).map(|e| now < e).unwrap_or(false);
    if fresh && attempts < MAX_RESET_ATTEMPTS && hash == sha256_hex(code.trim()) {
        return Ok(Some(id));
    }

    let attempts = attempts + 1;
    if attempts >= MAX_RESET_ATTEMPTS {
        conn.execute(
            "UPDATE accounts SET reset_code_hash = NULL, reset_expires_at = NULL,
                reset_attempts = ?
             WHERE id = ?",
            (attempts, &id),
        )?;
        tracing::info!(attempts, "reset code discarded after repeated failures");
    } else {
        conn.execute(
            "UPDATE accounts SET reset_attempts = ? WHERE id = ?",
            (attempts, &id),
        )?;
    }
    Ok(None)
}

/// Consumes the reset code, stores the new password and ends every open
/// session of the account.
pub fn reset_password(
    conn: &Connection,
    email: &str,
    role: Role,
    code: &str,
    new_password: &str,
    now: DateTime<Utc>,
) -> Result<(), SessionError> {
    check_password_strength(new_password)?;
    let Some(account_id) = verify_reset_code(conn, email, role, code, now)? else {
        return Err(SessionError::InvalidResetCode);
    };
    let hash = hash_password(new_password)?;
    conn.execute(
        "UPDATE accounts SET password_hash = ?, reset_code_hash = NULL, reset_expires_at = NULL,
            reset_attempts = 0
         WHERE id = ?",
        (hash, &account_id),
    )?;
    let revoked = revoke_account_sessions(conn, &account_id)?;
    tracing::info!(revoked, "password reset; sessions revoked");
    Ok(())
}
