use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

pub const DEFAULT_ACADEMIC_SCORE: i64 = 80;
pub const DEFAULT_PARTICIPATION_SCORE: i64 = 75;
pub const DEFAULT_CGPA: f64 = 3.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub name: String,
    pub email: String,
    pub roll_number: String,
    pub course: String,
    pub semester: i64,
    pub attendance: i64,
    pub behavior_score: i64,
    pub academic_score: i64,
    pub participation_score: i64,
    pub avatar_url: Option<String>,
    pub leaderboard_points: Option<i64>,
    pub cgpa: Option<f64>,
    pub created_at: String,
    pub updated_at: String,
}

pub const STUDENT_COLUMNS: &str = "id, name, email, roll_number, course, semester, attendance,
     behavior_score, academic_score, participation_score, avatar_url, leaderboard_points, cgpa,
     created_at, updated_at";

pub fn student_from_row(r: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: r.get(0)?,
        name: r.get(1)?,
        email: r.get(2)?,
        roll_number: r.get(3)?,
        course: r.get(4)?,
        semester: r.get(5)?,
        attendance: r.get(6)?,
        behavior_score: r.get(7)?,
        academic_score: r.get(8)?,
        participation_score: r.get(9)?,
        avatar_url: r.get(10)?,
        leaderboard_points: r.get(11)?,
        cgpa: r.get(12)?,
        created_at: r.get(13)?,
        updated_at: r.get(14)?,
    })
}

/// Input for create/update/upsert. Unset optional scores take the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStudent {
    pub name: String,
    pub email: String,
    pub roll_number: String,
    pub course: String,
    pub semester: i64,
    pub attendance: i64,
    pub behavior_score: i64,
    #[serde(default)]
    pub academic_score: Option<i64>,
    #[serde(default)]
    pub participation_score: Option<i64>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub leaderboard_points: Option<i64>,
    #[serde(default)]
    pub cgpa: Option<f64>,
}

impl NewStudent {
    pub fn validate(&self) -> Result<(), String> {
        for (label, v) in [
            ("name", &self.name),
            ("email", &self.email),
            ("rollNumber", &self.roll_number),
            ("course", &self.course),
        ] {
            if v.trim().is_empty() {
                return Err(format!("{} must not be empty", label));
            }
        }
        if !(1..=12).contains(&self.semester) {
            return Err("semester must be between 1 and 12".to_string());
        }
        for (label, v) in [
            ("attendance", self.attendance),
            ("behaviorScore", self.behavior_score),
        ] {
            if !(0..=100).contains(&v) {
                return Err(format!("{} must be between 0 and 100", label));
            }
        }
        Ok(())
    }

    /// Applies a partial camelCase patch; unknown keys are rejected.
    pub fn patched(&self, patch: &serde_json::Value) -> Result<Self, String> {
        let mut merged = serde_json::to_value(self).map_err(|e| e.to_string())?;
        let (Some(dst), Some(src)) = (merged.as_object_mut(), patch.as_object()) else {
            return Err("patch must be an object".to_string());
        };
        for (k, v) in src {
            if !dst.contains_key(k) {
                return Err(format!("unknown student field: {}", k));
            }
            dst.insert(k.clone(), v.clone());
        }
        let next: Self = serde_json::from_value(merged).map_err(|e| e.to_string())?;
        next.validate()?;
        Ok(next)
    }
}

impl From<&Student> for NewStudent {
    fn from(s: &Student) -> Self {
        Self {
            name: s.name.clone(),
            email: s.email.clone(),
            roll_number: s.roll_number.clone(),
            course: s.course.clone(),
            semester: s.semester,
            attendance: s.attendance,
            behavior_score: s.behavior_score,
            academic_score: Some(s.academic_score),
            participation_score: Some(s.participation_score),
            avatar_url: s.avatar_url.clone(),
            leaderboard_points: s.leaderboard_points,
            cgpa: s.cgpa,
        }
    }
}

pub fn get_student(conn: &Connection, student_id: &str) -> rusqlite::Result<Option<Student>> {
    let sql = format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS);
    conn.query_row(&sql, [student_id], student_from_row).optional()
}

pub fn find_by_email(conn: &Connection, email: &str) -> rusqlite::Result<Option<Student>> {
    let sql = format!(
        "SELECT {} FROM students WHERE lower(email) = lower(?)",
        STUDENT_COLUMNS
    );
    conn.query_row(&sql, [email], student_from_row).optional()
}

/// Inserts the student row plus default personality traits. Run inside a transaction.
pub fn insert_student(conn: &Connection, s: &NewStudent, now: &str) -> rusqlite::Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(
            id, name, email, roll_number, course, semester, attendance, behavior_score,
            academic_score, participation_score, avatar_url, leaderboard_points, cgpa,
            created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            s.name.trim(),
            s.email.trim(),
            s.roll_number.trim(),
            s.course.trim(),
            s.semester,
            s.attendance,
            s.behavior_score,
            s.academic_score.unwrap_or(DEFAULT_ACADEMIC_SCORE),
            s.participation_score.unwrap_or(DEFAULT_PARTICIPATION_SCORE),
            s.avatar_url,
            s.leaderboard_points.unwrap_or(0),
            s.cgpa.unwrap_or(DEFAULT_CGPA),
            now,
            now
        ],
    )?;
    insert_default_traits(conn, &id, now)?;
    Ok(id)
}

pub fn insert_default_traits(conn: &Connection, student_id: &str, now: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO personality_traits(id, student_id, created_at, updated_at)
         VALUES(?, ?, ?, ?)",
        (Uuid::new_v4().to_string(), student_id, now, now),
    )?;
    Ok(())
}

pub fn update_student(conn: &Connection, student_id: &str, s: &NewStudent, now: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE students SET
            name = ?, email = ?, roll_number = ?, course = ?, semester = ?, attendance = ?,
            behavior_score = ?, academic_score = ?, participation_score = ?,
            avatar_url = ?, leaderboard_points = ?, cgpa = ?, updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            s.name.trim(),
            s.email.trim(),
            s.roll_number.trim(),
            s.course.trim(),
            s.semester,
            s.attendance,
            s.behavior_score,
            s.academic_score.unwrap_or(DEFAULT_ACADEMIC_SCORE),
            s.participation_score.unwrap_or(DEFAULT_PARTICIPATION_SCORE),
            s.avatar_url,
            s.leaderboard_points.unwrap_or(0),
            s.cgpa.unwrap_or(DEFAULT_CGPA),
            now,
            student_id
        ],
    )
}

/// Upsert keyed on email. Returns (student_id, inserted).
pub fn upsert_by_email(conn: &Connection, s: &NewStudent, now: &str) -> rusqlite::Result<(String, bool)> {
    if let Some(existing) = find_by_email(conn, &s.email)? {
        update_student(conn, &existing.id, s, now)?;
        return Ok((existing.id, false));
    }
    Ok((insert_student(conn, s, now)?, true))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Name,
    RollNumber,
    Course,
    Semester,
    Attendance,
    BehaviorScore,
    AcademicScore,
    ParticipationScore,
    LeaderboardPoints,
}

impl SortField {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "name" => SortField::Name,
            "rollNumber" => SortField::RollNumber,
            "course" => SortField::Course,
            "semester" => SortField::Semester,
            "attendance" => SortField::Attendance,
            "behaviorScore" => SortField::BehaviorScore,
            "academicScore" => SortField::AcademicScore,
            "participationScore" => SortField::ParticipationScore,
            "leaderboardPoints" => SortField::LeaderboardPoints,
            _ => return None,
        })
    }

    fn compare(self, a: &Student, b: &Student) -> Ordering {
        match self {
            SortField::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
            SortField::RollNumber => a
                .roll_number
                .to_lowercase()
                .cmp(&b.roll_number.to_lowercase()),
            SortField::Course => a.course.to_lowercase().cmp(&b.course.to_lowercase()),
            SortField::Semester => a.semester.cmp(&b.semester),
            SortField::Attendance => a.attendance.cmp(&b.attendance),
            SortField::BehaviorScore => a.behavior_score.cmp(&b.behavior_score),
            SortField::AcademicScore => a.academic_score.cmp(&b.academic_score),
            SortField::ParticipationScore => a.participation_score.cmp(&b.participation_score),
            SortField::LeaderboardPoints => a
                .leaderboard_points
                .unwrap_or(0)
                .cmp(&b.leaderboard_points.unwrap_or(0)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StudentQuery {
    pub search: Option<String>,
    pub course: Option<String>,
    pub sort: SortField,
    pub descending: bool,
}

impl Default for StudentQuery {
    fn default() -> Self {
        Self {
            search: None,
            course: None,
            sort: SortField::Name,
            descending: false,
        }
    }
}

impl StudentQuery {
    pub fn matches(&self, s: &Student) -> bool {
        let search_ok = match self.search.as_deref().map(str::trim) {
            Some(q) if !q.is_empty() => {
                let q = q.to_lowercase();
                s.name.to_lowercase().contains(&q) || s.roll_number.to_lowercase().contains(&q)
            }
            _ => true,
        };
        let course_ok = match self.course.as_deref() {
            None | Some("All") | Some("") => true,
            Some(c) => s.course == c,
        };
        search_ok && course_ok
    }

    pub fn apply(&self, mut students: Vec<Student>) -> Vec<Student> {
        students.retain(|s| self.matches(s));
        // Stable sort; ties keep name order from the query.
        students.sort_by(|a, b| {
            let o = self.sort.compare(a, b);
            if self.descending {
                o.reverse()
            } else {
                o
            }
        });
        students
    }
}

pub fn list_all(conn: &Connection) -> rusqlite::Result<Vec<Student>> {
    let sql = format!(
        "SELECT {} FROM students ORDER BY name COLLATE NOCASE, id",
        STUDENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn courses(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT course FROM students WHERE course <> '' ORDER BY course",
    )?;
    let rows = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalityTraits {
    pub student_id: String,
    pub openness: i64,
    pub conscientiousness: i64,
    pub extraversion: i64,
    pub agreeableness: i64,
    pub neuroticism: i64,
    pub updated_at: String,
}

pub const TRAIT_FIELDS: [&str; 5] = [
    "openness",
    "conscientiousness",
    "extraversion",
    "agreeableness",
    "neuroticism",
];

pub fn get_traits(conn: &Connection, student_id: &str) -> rusqlite::Result<Option<PersonalityTraits>> {
    conn.query_row(
        "SELECT student_id, openness, conscientiousness, extraversion, agreeableness,
                neuroticism, updated_at
         FROM personality_traits WHERE student_id = ?",
        [student_id],
        |r| {
            Ok(PersonalityTraits {
                student_id: r.get(0)?,
                openness: r.get(1)?,
                conscientiousness: r.get(2)?,
                extraversion: r.get(3)?,
                agreeableness: r.get(4)?,
                neuroticism: r.get(5)?,
                updated_at: r.get(6)?,
            })
        },
    )
    .optional()
}

/// Writes the given trait values (each 0..=100), creating the default row
/// first when it is missing.
pub fn update_traits(
    conn: &Connection,
    student_id: &str,
    values: &[(&str, i64)],
    now: &str,
) -> Result<(), String> {
    for (field, v) in values {
        if !TRAIT_FIELDS.contains(field) {
            return Err(format!("unknown trait: {}", field));
        }
        if !(0..=100).contains(v) {
            return Err(format!("{} must be between 0 and 100", field));
        }
    }
    insert_default_traits(conn, student_id, now).map_err(|e| e.to_string())?;
    for (field, v) in values {
        // Field names come from TRAIT_FIELDS only.
        let sql = format!(
            "UPDATE personality_traits SET {} = ?, updated_at = ? WHERE student_id = ?",
            field
        );
        conn.execute(&sql, (v, now, student_id))
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// Deletes a student and everything that references it, in dependency order.
/// Run inside a transaction.
pub fn delete_cascade(conn: &Connection, student_id: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM student_materials WHERE student_id = ?",
        [student_id],
    )?;
    conn.execute(
        "DELETE FROM behavioral_incidents WHERE student_id = ?",
        [student_id],
    )?;
    conn.execute(
        "DELETE FROM personality_traits WHERE student_id = ?",
        [student_id],
    )?;
    conn.execute(
        "DELETE FROM notifications WHERE student_id = ?",
        [student_id],
    )?;
    crate::notifications::prune_dismissals(conn)?;
    conn.execute("DELETE FROM students WHERE id = ?", [student_id])
}
