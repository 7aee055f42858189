use crate::session::{self, NewAccount, Role, SessionError};
use crate::students::{self, NewStudent, DEFAULT_ACADEMIC_SCORE, DEFAULT_CGPA, DEFAULT_PARTICIPATION_SCORE};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Read;

#[derive(Debug, thiserror::Error)]
pub enum RosterError {
    #[error("failed to read roster: {0}")]
    Csv(#[from] csv::Error),
    #[error("roster has no header row")]
    NoHeader,
    #[error(transparent)]
    Account(#[from] SessionError),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub rows: Vec<T>,
    /// 1-based data row numbers that were dropped.
    pub skipped: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRow {
    pub username: String,
    pub password: String,
    pub email: String,
}

struct Table {
    headers: HashMap<String, usize>,
    records: Vec<csv::StringRecord>,
}

impl Table {
    fn read<R: Read>(input: R) -> Result<Self, RosterError> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(input);
        let headers: HashMap<String, usize> = rdr
            .headers()?
            .iter()
            .enumerate()
            .map(|(i, h)| (h.trim().to_lowercase(), i))
            .collect();
        if headers.is_empty() {
            return Err(RosterError::NoHeader);
        }
        let records = rdr
            .records()
            .filter(|r| match r {
                Ok(rec) => rec.iter().any(|v| !v.is_empty()),
                Err(_) => true,
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { headers, records })
    }

    fn field<'r>(&self, rec: &'r csv::StringRecord, name: &str) -> Option<&'r str> {
        let idx = *self.headers.get(name)?;
        rec.get(idx).filter(|v| !v.is_empty())
    }
}

fn num<T: std::str::FromStr>(v: Option<&str>) -> Option<T> {
    v.and_then(|s| s.parse::<T>().ok())
}

/// Rows missing any required column (or with unparseable numbers) are skipped.
pub fn parse_students<R: Read>(input: R) -> Result<Parsed<NewStudent>, RosterError> {
    let table = Table::read(input)?;
    let mut rows = Vec::new();
    let mut skipped = Vec::new();
    for (i, rec) in table.records.iter().enumerate() {
        let f = |name: &str| table.field(rec, name);
        let parsed = (|| {
            let s = NewStudent {
                name: f("name")?.to_string(),
                email: f("email")?.to_string(),
                roll_number: f("roll_number")?.to_string(),
                course: f("course")?.to_string(),
                semester: num(f("semester"))?,
                attendance: num(f("attendance"))?,
                behavior_score: num(f("behavior_score"))?,
                academic_score: Some(num(f("academic_score")).unwrap_or(DEFAULT_ACADEMIC_SCORE)),
                participation_score: Some(
                    num(f("participation_score")).unwrap_or(DEFAULT_PARTICIPATION_SCORE),
                ),
                avatar_url: f("avatar_url").map(str::to_string),
                leaderboard_points: Some(num(f("leaderboard_points")).unwrap_or(0)),
                cgpa: Some(num(f("cgpa")).unwrap_or(DEFAULT_CGPA)),
            };
            s.validate().ok().map(|_| s)
        })();
        match parsed {
            Some(s) => rows.push(s),
            None => {
                tracing::warn!(row = i + 1, "skipping roster row with missing required fields");
                skipped.push(i + 1);
            }
        }
    }
    Ok(Parsed { rows, skipped })
}

pub fn parse_users<R: Read>(input: R) -> Result<Parsed<UserRow>, RosterError> {
    let table = Table::read(input)?;
    let mut rows = Vec::new();
    let mut skipped = Vec::new();
    for (i, rec) in table.records.iter().enumerate() {
        match (
            table.field(rec, "username"),
            table.field(rec, "password"),
            table.field(rec, "email"),
        ) {
            (Some(u), Some(p), Some(e)) => rows.push(UserRow {
                username: u.to_string(),
                password: p.to_string(),
                email: e.to_string(),
            }),
            _ => {
                tracing::warn!(row = i + 1, "skipping user row with missing required fields");
                skipped.push(i + 1);
            }
        }
    }
    Ok(Parsed { rows, skipped })
}

pub fn default_password(roll_number: &str) -> String {
    format!("{}@123", roll_number)
}

pub fn default_username(name: &str) -> String {
    name.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub inserted: usize,
    pub updated: usize,
    pub accounts_created: usize,
    pub skipped: Vec<usize>,
}

/// Upserts students by email and creates a student login for any email
/// that lacks one. Run inside a transaction.
pub fn apply_students(
    conn: &Connection,
    parsed: &Parsed<NewStudent>,
    now: &str,
) -> Result<ImportSummary, RosterError> {
    let mut summary = ImportSummary {
        skipped: parsed.skipped.clone(),
        ..ImportSummary::default()
    };
    for s in &parsed.rows {
        if session::find_account(conn, &s.email, Role::Student)?.is_none() {
            let username = default_username(&s.name);
            let password = default_password(&s.roll_number);
            session::upsert_account(
                conn,
                &NewAccount {
                    role: Role::Student,
                    username: &username,
                    email: &s.email,
                    password: &password,
                    department: None,
                    phone_number: None,
                },
            )?;
            summary.accounts_created += 1;
        }
        let (_, inserted) = students::upsert_by_email(conn, s, now)?;
        if inserted {
            summary.inserted += 1;
        } else {
            summary.updated += 1;
        }
    }
    Ok(summary)
}

pub fn apply_users(conn: &Connection, parsed: &Parsed<UserRow>) -> Result<ImportSummary, RosterError> {
    let mut summary = ImportSummary {
        skipped: parsed.skipped.clone(),
        ..ImportSummary::default()
    };
    for u in &parsed.rows {
        let (_, inserted) = session::upsert_account(
            conn,
            &NewAccount {
                role: Role::Student,
                username: &u.username,
                email: &u.email,
                password: &u.password,
                department: None,
                phone_number: None,
            },
        )?;
        if inserted {
            summary.inserted += 1;
        } else {
            summary.updated += 1;
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn student_headers_are_case_insensitive_and_defaults_fill_in() {
        let csv = "Name,Email,Roll_Number,Course,Semester,Attendance,Behavior_Score,CGPA\n\
                   Asha Rao,asha@uni.edu,BCA-25-001,BCA,3,92,88,\n\
                   \n\
                   No Course,nc@uni.edu,BCA-25-002,,3,92,88,3.4\n\
                   Bad Number,bn@uni.edu,BCA-25-003,BCA,three,92,88,\n";
        let parsed = parse_students(csv.as_bytes()).unwrap();
        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.skipped, vec![2, 3]);
        let s = &parsed.rows[0];
        assert_eq!(s.roll_number, "BCA-25-001");
        assert_eq!(s.academic_score, Some(80));
        assert_eq!(s.participation_score, Some(75));
        assert_eq!(s.leaderboard_points, Some(0));
        assert_eq!(s.cgpa, Some(3.0));
    }

    #[test]
    fn user_rows_require_all_three_fields() {
        let csv = "username,password,email\nasha,pw123456,asha@uni.edu\nben,,ben@uni.edu\n";
        let parsed = parse_users(csv.as_bytes()).unwrap();
        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.rows[0].username, "asha");
        assert_eq!(parsed.skipped, vec![2]);
    }

    #[test]
    fn default_credentials_follow_roster_fields() {
        assert_eq!(default_password("BCA-25-001"), "BCA-25-001@123");
        assert_eq!(default_username("  Asha   Maria Rao "), "asha_maria_rao");
    }
}
