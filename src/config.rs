use crate::db;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

pub const CONFIG_KEY: &str = "portal.config";

/// Workspace-level knobs stored in the `settings` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortalConfig {
    pub session_ttl_hours: i64,
    pub revalidate_interval_secs: i64,
    pub reset_code_ttl_minutes: i64,
    pub leaderboard_limit: i64,
    pub incident_list_limit: i64,
    pub at_risk_attendance_below: i64,
    pub at_risk_behavior_below: i64,
    pub max_material_bytes: u64,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            session_ttl_hours: 7 * 24,
            revalidate_interval_secs: 5 * 60,
            reset_code_ttl_minutes: 30,
            leaderboard_limit: 10,
            incident_list_limit: 10,
            at_risk_attendance_below: 75,
            at_risk_behavior_below: 70,
            max_material_bytes: 50 * 1024 * 1024,
        }
    }
}

impl PortalConfig {
    pub fn load(conn: &Connection) -> anyhow::Result<Self> {
        match db::settings_get_json(conn, CONFIG_KEY)? {
            Some(v) => Ok(serde_json::from_value(v)?),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, conn: &Connection) -> anyhow::Result<()> {
        db::settings_set_json(conn, CONFIG_KEY, &serde_json::to_value(self)?)
    }

    /// Merge a partial camelCase patch over the current values.
    pub fn patched(&self, patch: &serde_json::Value) -> anyhow::Result<Self> {
        let mut merged = serde_json::to_value(self)?;
        let (Some(dst), Some(src)) = (merged.as_object_mut(), patch.as_object()) else {
            anyhow::bail!("config patch must be an object");
        };
        for (k, v) in src {
            if !dst.contains_key(k) {
                anyhow::bail!("unknown config key: {}", k);
            }
            dst.insert(k.clone(), v.clone());
        }
        let next: Self = serde_json::from_value(merged)?;
        next.validate()?;
        Ok(next)
    }

    fn validate(&self) -> anyhow::Result<()> {
        check_range("sessionTtlHours", self.session_ttl_hours, 1, MAX_SESSION_TTL_HOURS)?;
        check_range(
            "revalidateIntervalSecs",
            self.revalidate_interval_secs,
            1,
            MAX_REVALIDATE_INTERVAL_SECS,
        )?;
        check_range(
            "resetCodeTtlMinutes",
            self.reset_code_ttl_minutes,
            1,
            MAX_RESET_CODE_TTL_MINUTES,
        )?;
        check_range("leaderboardLimit", self.leaderboard_limit, 1, MAX_LIST_LIMIT)?;
        check_range("incidentListLimit", self.incident_list_limit, 1, MAX_LIST_LIMIT)?;
        check_range("atRiskAttendanceBelow", self.at_risk_attendance_below, 0, 100)?;
        check_range("atRiskBehaviorBelow", self.at_risk_behavior_below, 0, 100)?;
        if self.max_material_bytes == 0 {
            anyhow::bail!("maxMaterialBytes must be positive");
        }
        Ok(())
    }
}

pub const MAX_SESSION_TTL_HOURS: i64 = 365 * 24;
pub const MAX_REVALIDATE_INTERVAL_SECS: i64 = 24 * 60 * 60;
pub const MAX_RESET_CODE_TTL_MINUTES: i64 = 24 * 60;
pub const MAX_LIST_LIMIT: i64 = 1000;

fn check_range(key: &str, value: i64, min: i64, max: i64) -> anyhow::Result<()> {
    if value < min || value > max {
        anyhow::bail!("{} must be between {} and {}, got {}", key, min, max, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let cfg: PortalConfig = serde_json::from_value(json!({ "leaderboardLimit": 5 })).unwrap();
        assert_eq!(cfg.leaderboard_limit, 5);
        assert_eq!(cfg.revalidate_interval_secs, 300);
        assert_eq!(cfg.session_ttl_hours, 168);
    }

    #[test]
    fn patch_rejects_unknown_and_invalid_values() {
        let base = PortalConfig::default();
        assert!(base.patched(&json!({ "nope": 1 })).is_err());
        assert!(base.patched(&json!({ "sessionTtlHours": 0 })).is_err());
        let next = base.patched(&json!({ "atRiskAttendanceBelow": 80 })).unwrap();
        assert_eq!(next.at_risk_attendance_below, 80);
        assert_eq!(next.at_risk_behavior_below, 70);
    }

    #[test]
    fn patch_rejects_values_past_the_upper_bounds() {
        let base = PortalConfig::default();
        for patch in [
            json!({ "sessionTtlHours": MAX_SESSION_TTL_HOURS + 1 }),
            json!({ "resetCodeTtlMinutes": 9_000_000_000_000_000_000_i64 }),
            json!({ "revalidateIntervalSecs": i64::MAX }),
            json!({ "leaderboardLimit": MAX_LIST_LIMIT + 1 }),
            json!({ "atRiskAttendanceBelow": 101 }),
            json!({ "maxMaterialBytes": 0 }),
        ] {
            assert!(base.patched(&patch).is_err(), "accepted {patch}");
        }
        let edge = base
            .patched(&json!({
                "sessionTtlHours": MAX_SESSION_TTL_HOURS,
                "resetCodeTtlMinutes": MAX_RESET_CODE_TTL_MINUTES,
            }))
            .unwrap();
        assert_eq!(edge.session_ttl_hours, MAX_SESSION_TTL_HOURS);
    }
}
