use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Material {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub file_url: String,
    pub file_type: String,
    pub file_size: i64,
    pub sha256: Option<String>,
    pub course: Option<String>,
    pub uploaded_by: String,
    pub shared_with_all: bool,
    pub shared_with_course: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Material {
    pub fn flags(&self) -> SharingFlags<'_> {
        SharingFlags {
            shared_with_all: self.shared_with_all,
            shared_with_course: self.shared_with_course.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharingFlags<'a> {
    pub shared_with_all: bool,
    pub shared_with_course: Option<&'a str>,
}

impl SharingFlags<'_> {
    fn matches_course(&self, student_course: &str) -> bool {
        match self.shared_with_course {
            Some(c) if !c.is_empty() => c == student_course,
            _ => false,
        }
    }
}

/// A student sees a material when any of the three sharing conditions holds.
pub fn student_can_access(
    flags: SharingFlags<'_>,
    material_id: &str,
    student_course: &str,
    explicit_ids: &HashSet<String>,
) -> bool {
    flags.shared_with_all
        || flags.matches_course(student_course)
        || explicit_ids.contains(material_id)
}

/// Keeps input order.
pub fn filter_accessible(
    materials: Vec<Material>,
    student_course: &str,
    explicit_ids: &HashSet<String>,
) -> Vec<Material> {
    materials
        .into_iter()
        .filter(|m| student_can_access(m.flags(), &m.id, student_course, explicit_ids))
        .collect()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SharingError {
    #[error("unknown sharing mode: {0}")]
    UnknownMode(String),
    #[error("a course is required to share with a course")]
    MissingCourse,
    #[error("select at least one student to share with")]
    NoStudents,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharingMode {
    All,
    Course(String),
    Specific(Vec<String>),
}

impl SharingMode {
    pub fn parse(
        mode: &str,
        course: Option<&str>,
        student_ids: &[String],
    ) -> Result<Self, SharingError> {
        match mode {
            "all" => Ok(SharingMode::All),
            "course" => {
                let c = course.map(str::trim).unwrap_or("");
                if c.is_empty() {
                    return Err(SharingError::MissingCourse);
                }
                Ok(SharingMode::Course(c.to_string()))
            }
            "specific" => {
                let mut seen = HashSet::new();
                let ids: Vec<String> = student_ids
                    .iter()
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .filter(|s| seen.insert(s.to_string()))
                    .map(str::to_string)
                    .collect();
                if ids.is_empty() {
                    return Err(SharingError::NoStudents);
                }
                Ok(SharingMode::Specific(ids))
            }
            other => Err(SharingError::UnknownMode(other.to_string())),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            SharingMode::All => "Shared with all students".to_string(),
            SharingMode::Course(c) => format!("Shared with students in {}", c),
            SharingMode::Specific(ids) => {
                format!("Shared with {} selected student(s)", ids.len())
            }
        }
    }

    /// Writes the material flags and, for `Specific`, replaces the explicit
    /// link set. `All` and `Course` leave existing links alone.
    /// Callers wrap this in a transaction.
    pub fn apply(&self, conn: &Connection, material_id: &str, now: &str) -> rusqlite::Result<()> {
        let (all, course): (bool, Option<&str>) = match self {
            SharingMode::All => (true, None),
            SharingMode::Course(c) => (false, Some(c.as_str())),
            SharingMode::Specific(_) => (false, None),
        };
        conn.execute(
            "UPDATE teaching_materials
             SET shared_with_all = ?, shared_with_course = ?, updated_at = ?
             WHERE id = ?",
            (all as i64, course, now, material_id),
        )?;

        if let SharingMode::Specific(ids) = self {
            conn.execute(
                "DELETE FROM student_materials WHERE material_id = ?",
                [material_id],
            )?;
            let mut ins = conn.prepare(
                "INSERT INTO student_materials(id, material_id, student_id, created_at)
                 VALUES(?, ?, ?, ?)",
            )?;
            for sid in ids {
                ins.execute((Uuid::new_v4().to_string(), material_id, sid, now))?;
            }
        }
        Ok(())
    }
}

pub const MATERIAL_COLUMNS: &str = "id, name, description, file_url, file_type, file_size, sha256,
     course, uploaded_by, shared_with_all, shared_with_course, created_at, updated_at";

pub fn material_from_row(r: &Row<'_>) -> rusqlite::Result<Material> {
    Ok(Material {
        id: r.get(0)?,
        name: r.get(1)?,
        description: r.get(2)?,
        file_url: r.get(3)?,
        file_type: r.get(4)?,
        file_size: r.get(5)?,
        sha256: r.get(6)?,
        course: r.get(7)?,
        uploaded_by: r.get(8)?,
        shared_with_all: r.get::<_, i64>(9)? != 0,
        shared_with_course: r.get(10)?,
        created_at: r.get(11)?,
        updated_at: r.get(12)?,
    })
}

/// Newest first; `course` narrows to materials tagged with that course.
pub fn list_materials(conn: &Connection, course: Option<&str>) -> rusqlite::Result<Vec<Material>> {
    let sql = format!(
        "SELECT {} FROM teaching_materials
         WHERE (?1 IS NULL OR course = ?1)
         ORDER BY created_at DESC, rowid DESC",
        MATERIAL_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([course], material_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_material(conn: &Connection, material_id: &str) -> rusqlite::Result<Option<Material>> {
    let sql = format!(
        "SELECT {} FROM teaching_materials WHERE id = ?",
        MATERIAL_COLUMNS
    );
    conn.query_row(&sql, [material_id], material_from_row)
        .optional()
}

pub fn explicit_share_set(conn: &Connection, student_id: &str) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT material_id FROM student_materials WHERE student_id = ?")?;
    let ids = stmt
        .query_map([student_id], |r| r.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(ids)
}

pub fn accessible_materials(
    conn: &Connection,
    student_id: &str,
    student_course: &str,
) -> rusqlite::Result<Vec<Material>> {
    let all = list_materials(conn, None)?;
    if all.is_empty() {
        return Ok(all);
    }
    let explicit = explicit_share_set(conn, student_id)?;
    let kept = filter_accessible(all, student_course, &explicit);
    tracing::debug!(student_id, count = kept.len(), "resolved accessible materials");
    Ok(kept)
}

/// Single-material check: missing material means no access.
pub fn check_access(
    conn: &Connection,
    material_id: &str,
    student_id: &str,
    student_course: &str,
) -> rusqlite::Result<bool> {
    let Some(material) = get_material(conn, material_id)? else {
        return Ok(false);
    };
    let flags = material.flags();
    if flags.shared_with_all || flags.matches_course(student_course) {
        return Ok(true);
    }
    let linked: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM student_materials WHERE material_id = ? AND student_id = ?",
            (material_id, student_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(linked.is_some())
}

pub struct NewMaterial<'a> {
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub file_url: &'a str,
    pub file_type: &'a str,
    pub file_size: i64,
    pub sha256: &'a str,
    pub course: Option<&'a str>,
    pub uploaded_by: &'a str,
}

/// Inserts an unshared material row; callers apply a [`SharingMode`] next.
pub fn insert_material(conn: &Connection, m: &NewMaterial<'_>, now: &str) -> rusqlite::Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teaching_materials(
            id, name, description, file_url, file_type, file_size, sha256, course,
            uploaded_by, shared_with_all, shared_with_course, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?, ?)",
        rusqlite::params![
            id,
            m.name,
            m.description,
            m.file_url,
            m.file_type,
            m.file_size,
            m.sha256,
            m.course,
            m.uploaded_by,
            now,
            now
        ],
    )?;
    Ok(id)
}

pub fn linked_students(conn: &Connection, material_id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT student_id FROM student_materials WHERE material_id = ? ORDER BY created_at, student_id",
    )?;
    let ids = stmt
        .query_map([material_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Removes the material and its links. Run inside a transaction.
pub fn delete_material(conn: &Connection, material_id: &str) -> rusqlite::Result<bool> {
    conn.execute(
        "DELETE FROM student_materials WHERE material_id = ?",
        [material_id],
    )?;
    Ok(conn.execute("DELETE FROM teaching_materials WHERE id = ?", [material_id])? > 0)
}
