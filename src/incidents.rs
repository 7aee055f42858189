use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: String,
    pub student_id: String,
    pub incident_date: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub severity: String,
    pub created_at: String,
    /// Joined from `students`; "Unknown Student" when the row is gone.
    pub student_name: String,
    pub action: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewIncident {
    pub student_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub severity: String,
    /// `YYYY-MM-DD`; defaults to today.
    #[serde(default)]
    pub incident_date: Option<String>,
}

impl NewIncident {
    pub fn validate(&self) -> Result<(), String> {
        for (label, v) in [
            ("type", &self.kind),
            ("description", &self.description),
            ("severity", &self.severity),
        ] {
            if v.trim().is_empty() {
                return Err(format!("{} must not be empty", label));
            }
        }
        if let Some(d) = &self.incident_date {
            chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d")
                .map_err(|_| "incidentDate must be YYYY-MM-DD".to_string())?;
        }
        Ok(())
    }
}

fn from_row(r: &Row<'_>) -> rusqlite::Result<Incident> {
    let severity: String = r.get(5)?;
    Ok(Incident {
        id: r.get(0)?,
        student_id: r.get(1)?,
        incident_date: r.get(2)?,
        kind: r.get(3)?,
        description: r.get(4)?,
        action: crate::reports::incident_action(&severity),
        severity,
        created_at: r.get(6)?,
        student_name: r
            .get::<_, Option<String>>(7)?
            .unwrap_or_else(|| "Unknown Student".to_string()),
    })
}

pub fn insert(conn: &Connection, n: &NewIncident, today: &str, now: &str) -> rusqlite::Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO behavioral_incidents(id, student_id, incident_date, type, description, severity, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            n.student_id,
            n.incident_date.as_deref().unwrap_or(today),
            n.kind.trim(),
            n.description.trim(),
            n.severity.trim(),
            now
        ],
    )?;
    Ok(id)
}

/// Incidents dated on or after `since`, newest first.
pub fn list_since(
    conn: &Connection,
    student_id: Option<&str>,
    since: &str,
    limit: i64,
) -> rusqlite::Result<Vec<Incident>> {
    let mut stmt = conn.prepare(
        "SELECT i.id, i.student_id, i.incident_date, i.type, i.description, i.severity,
                i.created_at, s.name
         FROM behavioral_incidents i
         LEFT JOIN students s ON s.id = i.student_id
         WHERE i.incident_date >= ?1 AND (?2 IS NULL OR i.student_id = ?2)
         ORDER BY i.incident_date DESC, i.created_at DESC
         LIMIT ?3",
    )?;
    let rows = stmt
        .query_map((since, student_id, limit), from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count_since(conn: &Connection, student_id: Option<&str>, since: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM behavioral_incidents
         WHERE incident_date >= ?1 AND (?2 IS NULL OR student_id = ?2)",
        (since, student_id),
        |r| r.get(0),
    )
}

pub fn delete(conn: &Connection, incident_id: &str) -> rusqlite::Result<bool> {
    Ok(conn.execute(
        "DELETE FROM behavioral_incidents WHERE id = ?",
        [incident_id],
    )? > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incident(severity: &str, date: Option<&str>) -> NewIncident {
        NewIncident {
            student_id: "s1".into(),
            kind: "Disruption".into(),
            description: "Talking during exam".into(),
            severity: severity.into(),
            incident_date: date.map(str::to_string),
        }
    }

    #[test]
    fn validation_checks_required_text_and_date() {
        assert!(incident("Major", Some("2026-03-02")).validate().is_ok());
        assert!(incident("  ", None).validate().is_err());
        assert!(incident("Minor", Some("02/03/2026")).validate().is_err());
    }
}
