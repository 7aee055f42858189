use crate::students::Student;
use chrono::{Datelike, Months, NaiveDate};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Week,
    Month,
    Semester,
    Year,
    Custom(NaiveDate),
}

impl Period {
    /// Unknown period names fall back to `semester`; `custom` needs a
    /// `YYYY-MM-DD` date.
    pub fn parse(name: Option<&str>, custom_date: Option<&str>) -> Result<Self, String> {
        match name.unwrap_or("semester") {
            "week" => Ok(Period::Week),
            "month" => Ok(Period::Month),
            "year" => Ok(Period::Year),
            "custom" => {
                let raw = custom_date.ok_or_else(|| "customDate is required".to_string())?;
                NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                    .map(Period::Custom)
                    .map_err(|_| "customDate must be YYYY-MM-DD".to_string())
            }
            _ => Ok(Period::Semester),
        }
    }

    pub fn start(self, today: NaiveDate) -> NaiveDate {
        match self {
            Period::Week => {
                today - chrono::Duration::days(today.weekday().num_days_from_monday() as i64)
            }
            Period::Month => today.with_day(1).unwrap_or(today),
            Period::Semester => today.checked_sub_months(Months::new(6)).unwrap_or(today),
            Period::Year => today.checked_sub_months(Months::new(12)).unwrap_or(today),
            Period::Custom(d) => d,
        }
    }
}

fn rounded_mean(total: i64, n: usize) -> i64 {
    if n == 0 {
        return 0;
    }
    (total as f64 / n as f64).round() as i64
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewStats {
    pub total_students: usize,
    pub average_attendance: i64,
    pub average_behavior: i64,
    pub total_incidents: i64,
}

pub fn overview(students: &[Student], incident_count: i64) -> OverviewStats {
    let n = students.len();
    OverviewStats {
        total_students: n,
        average_attendance: rounded_mean(students.iter().map(|s| s.attendance).sum(), n),
        average_behavior: rounded_mean(students.iter().map(|s| s.behavior_score).sum(), n),
        total_incidents: incident_count,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub name: &'static str,
    pub value: i64,
}

pub fn performance(students: &[Student]) -> Vec<Metric> {
    let n = students.len();
    let mean = |f: fn(&Student) -> i64| rounded_mean(students.iter().map(f).sum(), n);
    vec![
        Metric {
            name: "On-Time Attendance",
            value: mean(|s| s.attendance),
        },
        Metric {
            name: "Class Participation",
            value: mean(|s| s.participation_score),
        },
        Metric {
            name: "Behavior Score",
            value: mean(|s| s.behavior_score),
        },
        Metric {
            name: "Academic Performance",
            value: mean(|s| s.academic_score),
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminSummary {
    pub total_students: usize,
    pub at_risk_count: usize,
    pub average_attendance: i64,
    pub incident_count: i64,
    pub courses: Vec<String>,
}

pub fn is_at_risk(s: &Student, attendance_below: i64, behavior_below: i64) -> bool {
    s.attendance < attendance_below || s.behavior_score < behavior_below
}

pub fn admin_summary(
    students: &[Student],
    incident_count: i64,
    attendance_below: i64,
    behavior_below: i64,
) -> AdminSummary {
    let mut courses: Vec<String> = students.iter().map(|s| s.course.clone()).collect();
    courses.sort();
    courses.dedup();
    AdminSummary {
        total_students: students.len(),
        at_risk_count: students
            .iter()
            .filter(|s| is_at_risk(s, attendance_below, behavior_below))
            .count(),
        average_attendance: rounded_mean(
            students.iter().map(|s| s.attendance).sum(),
            students.len(),
        ),
        incident_count,
        courses,
    }
}

/// Recommended follow-up shown next to an incident.
pub fn incident_action(severity: &str) -> &'static str {
    if severity == "Major" {
        "Counselor referral"
    } else {
        "Verbal warning"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub student_id: String,
    pub name: String,
    pub course: String,
    pub avatar_url: Option<String>,
    pub points: i64,
}

/// Highest points first, ties broken by name.
pub fn leaderboard(students: &[Student], limit: usize) -> Vec<LeaderboardEntry> {
    let mut sorted: Vec<&Student> = students.iter().collect();
    sorted.sort_by(|a, b| {
        b.leaderboard_points
            .unwrap_or(0)
            .cmp(&a.leaderboard_points.unwrap_or(0))
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
    sorted
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(i, s)| LeaderboardEntry {
            rank: i + 1,
            student_id: s.id.clone(),
            name: s.name.clone(),
            course: s.course.clone(),
            avatar_url: s.avatar_url.clone(),
            points: s.leaderboard_points.unwrap_or(0),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardSummary {
    pub top_points: i64,
    pub total_points: i64,
    pub average_points: i64,
    pub participant_count: usize,
}

pub fn leaderboard_summary(students: &[Student]) -> LeaderboardSummary {
    let points: Vec<i64> = students
        .iter()
        .map(|s| s.leaderboard_points.unwrap_or(0))
        .collect();
    let total: i64 = points.iter().sum();
    LeaderboardSummary {
        top_points: points.iter().copied().max().unwrap_or(0),
        total_points: total,
        average_points: rounded_mean(total, points.len()),
        participant_count: points.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(name: &str, attendance: i64, behavior: i64, points: Option<i64>) -> Student {
        Student {
            id: format!("id-{}", name),
            name: name.to_string(),
            email: format!("{}@uni.edu", name),
            roll_number: name.to_string(),
            course: if attendance > 80 { "BCA" } else { "MBA" }.to_string(),
            semester: 2,
            attendance,
            behavior_score: behavior,
            academic_score: 81,
            participation_score: 74,
            avatar_url: None,
            leaderboard_points: points,
            cgpa: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn period_start_dates() {
        let today = d(2026, 10, 22); // Thursday
        assert_eq!(Period::Week.start(today), d(2026, 10, 19));
        assert_eq!(Period::Month.start(today), d(2026, 10, 1));
        assert_eq!(Period::Semester.start(today), d(2026, 4, 22));
        assert_eq!(Period::Year.start(today), d(2025, 10, 22));
        assert_eq!(
            Period::parse(Some("custom"), Some("2026-01-05")).unwrap().start(today),
            d(2026, 1, 5)
        );
        assert_eq!(Period::parse(Some("bogus"), None).unwrap(), Period::Semester);
        assert!(Period::parse(Some("custom"), Some("05/01/2026")).is_err());
    }

    #[test]
    fn overview_rounds_means_and_handles_empty() {
        let rows = vec![s("a", 90, 80, None), s("b", 75, 71, None)];
        let o = overview(&rows, 3);
        assert_eq!(o.total_students, 2);
        assert_eq!(o.average_attendance, 83); // 82.5 rounds up
        assert_eq!(o.average_behavior, 76); // 75.5
        assert_eq!(o.total_incidents, 3);
        assert_eq!(overview(&[], 0).average_attendance, 0);
    }

    #[test]
    fn admin_summary_counts_at_risk_on_either_threshold() {
        let rows = vec![
            s("ok", 90, 90, None),
            s("low-att", 74, 90, None),
            s("low-beh", 90, 69, None),
            s("edge", 75, 70, None),
        ];
        let sum = admin_summary(&rows, 0, 75, 70);
        assert_eq!(sum.at_risk_count, 2);
        assert_eq!(sum.courses, vec!["BCA".to_string(), "MBA".to_string()]);
    }

    #[test]
    fn leaderboard_orders_by_points_then_name() {
        let rows = vec![
            s("cara", 90, 90, Some(40)),
            s("abe", 90, 90, Some(40)),
            s("dev", 90, 90, None),
            s("bo", 90, 90, Some(90)),
        ];
        let top = leaderboard(&rows, 3);
        let names: Vec<&str> = top.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["bo", "abe", "cara"]);
        assert_eq!(top[0].rank, 1);
        let sum = leaderboard_summary(&rows);
        assert_eq!(sum.total_points, 170);
        assert_eq!(sum.top_points, 90);
        assert_eq!(sum.average_points, 43); // 42.5
    }

    #[test]
    fn major_incidents_get_counselor_referral() {
        assert_eq!(incident_action("Major"), "Counselor referral");
        assert_eq!(incident_action("Minor"), "Verbal warning");
    }
}
